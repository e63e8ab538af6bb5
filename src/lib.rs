//! winecell - run Windows programs under Wine inside a bubblewrap sandbox.
//!
//! A launch sees an empty root filesystem with the host's system directories
//! bound read-only, a private `/dev`, `/proc`, `/tmp` and home directory, and
//! nothing else unless asked for: networking, PulseAudio, a persistent
//! `~/.wine` and arbitrary extra paths are all opt-in. Graphical programs can
//! be given a nested X11 display (nxagent, Xephyr, Xnest, Xvfb or xpra) so
//! they cannot reach the host's X server.
//!
//! # Platform Requirements
//!
//! - Linux with unprivileged user namespaces
//! - bubblewrap 0.8.0 or later (`--disable-userns`)
//! - Wine, unless running with `--no-wine`
//!
//! # Example
//!
//! ```no_run
//! use winecell::display::X11Mode;
//! use winecell::sandbox::{HostContext, LaunchConfig};
//! use winecell::system::CancelToken;
//!
//! fn main() -> miette::Result<()> {
//!     let config = LaunchConfig::new("notepad.exe").with_x11(X11Mode::Auto);
//!     let cancel = CancelToken::new();
//!     cancel.install_interrupt_handler().expect("handler");
//!
//!     let code = winecell::launcher::run(&config, &HostContext::from_process(), &cancel)?;
//!     std::process::exit(code);
//! }
//! ```

pub mod display;
pub mod error;
pub mod launcher;
pub mod pty;
pub mod sandbox;
pub mod system;

// Re-export commonly used types
pub use error::{Error, Result};
pub use sandbox::{CompiledCommand, LaunchConfig, MountPlan};
