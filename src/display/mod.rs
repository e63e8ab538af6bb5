//! Nested X11 displays.
//!
//! A display session moves through
//! `Unstarted -> Starting -> Ready -> Stopping -> Stopped`, or ends in
//! `Failed` when starting goes wrong. The backend doing the actual work is
//! one of:
//!
//! - the host display (no process, reuses `$DISPLAY`)
//! - a simple nested server: nxagent, Xephyr, Xnest or Xvfb
//! - xpra, which needs a server, a client and a private temporary directory
//!
//! Every backend creates its Unix socket at `/tmp/.X11-unix/X<N>`; readiness
//! is observed by polling for that socket. Waits have no upper bound and only
//! end early on a keyboard interrupt.
//!
//! # Scoped acquisition
//!
//! [`DisplaySession::start`] returns a [`DisplayGuard`] whose `Drop` stops the
//! backend exactly once. When starting fails, whatever was already set up is
//! torn down before the error is returned.

mod backends;
mod xpra;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

pub use backends::{HostBackend, NestedServer, SimpleBackend, create_backend};
pub use xpra::XpraBackend;

use crate::error::{ConfigError, DisplayError};
use crate::system::CancelToken;

/// Directory holding the X11 Unix sockets.
pub const X11_UNIX_DIR: &str = "/tmp/.X11-unix";

/// Interval between readiness polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Backends tried, in order, for `--x11`.
pub const AUTO_DETECT_ORDER: &[BackendKind] =
    &[BackendKind::Nxagent, BackendKind::Xephyr, BackendKind::Xnest];

/// Display selection as requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X11Mode {
    /// No display at all.
    None,
    /// First available user-visible nested server.
    Auto,
    /// The host display, unprotected.
    Host,
    /// X2Go nxagent.
    Nxagent,
    /// Xephyr.
    Xephyr,
    /// Xnest.
    Xnest,
    /// xpra (experimental).
    Xpra,
    /// Xvfb, invisible.
    Xvfb,
}

impl X11Mode {
    /// Resolves the mode to a concrete backend, probing the host for `Auto`.
    ///
    /// # Errors
    ///
    /// Returns `DisplayError::NoNestedBackend` if `Auto` finds nothing.
    pub fn resolve(self) -> Result<Option<BackendKind>, DisplayError> {
        self.resolve_with(|command| which::which(command).is_ok())
    }

    /// Like [`X11Mode::resolve`] with an injected availability check.
    ///
    /// # Errors
    ///
    /// Returns `DisplayError::NoNestedBackend` if `Auto` finds nothing.
    pub fn resolve_with(
        self,
        is_available: impl Fn(&str) -> bool,
    ) -> Result<Option<BackendKind>, DisplayError> {
        let kind = match self {
            X11Mode::None => return Ok(None),
            X11Mode::Auto => detect_nested_backend(is_available)?,
            X11Mode::Host => BackendKind::Host,
            X11Mode::Nxagent => BackendKind::Nxagent,
            X11Mode::Xephyr => BackendKind::Xephyr,
            X11Mode::Xnest => BackendKind::Xnest,
            X11Mode::Xpra => BackendKind::Xpra,
            X11Mode::Xvfb => BackendKind::Xvfb,
        };
        Ok(Some(kind))
    }
}

/// A concrete display backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Host pass-through.
    Host,
    /// X2Go nxagent.
    Nxagent,
    /// Xephyr.
    Xephyr,
    /// Xnest.
    Xnest,
    /// xpra.
    Xpra,
    /// Xvfb.
    Xvfb,
}

impl BackendKind {
    /// Executable started for this backend; `None` for the host display.
    #[must_use]
    pub fn command(self) -> Option<&'static str> {
        match self {
            BackendKind::Host => None,
            BackendKind::Nxagent => Some("nxagent"),
            BackendKind::Xephyr => Some("Xephyr"),
            BackendKind::Xnest => Some("Xnest"),
            BackendKind::Xpra => Some("xpra"),
            BackendKind::Xvfb => Some("Xvfb"),
        }
    }

    /// Lowest display number handed to this backend.
    ///
    /// xpra warns about display numbers below 10.
    #[must_use]
    pub fn minimum_display(self) -> u32 {
        match self {
            BackendKind::Xpra => 10,
            _ => 0,
        }
    }
}

/// Picks the first available backend of [`AUTO_DETECT_ORDER`].
///
/// # Errors
///
/// Returns `DisplayError::NoNestedBackend` if none is available.
pub fn detect_nested_backend(
    is_available: impl Fn(&str) -> bool,
) -> Result<BackendKind, DisplayError> {
    for kind in AUTO_DETECT_ORDER {
        if let Some(command) = kind.command().filter(|c| is_available(c)) {
            info!("Using {command} for nested X11.");
            return Ok(*kind);
        }
    }

    Err(DisplayError::NoNestedBackend {
        candidates: AUTO_DETECT_ORDER
            .iter()
            .filter_map(|kind| kind.command())
            .map(str::to_string)
            .collect(),
    })
}

/// Screen size of a nested display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Geometry {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidGeometry {
            value: value.to_string(),
        };
        let (width, height) = value.split_once('x').ok_or_else(invalid)?;
        let width = width.parse::<u32>().map_err(|_| invalid())?;
        let height = height.parse::<u32>().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

/// An X11 display number and where its socket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Display {
    number: u32,
    socket_dir: PathBuf,
}

impl X11Display {
    /// Display `:number` with its socket in [`X11_UNIX_DIR`].
    #[must_use]
    pub fn new(number: u32) -> Self {
        Self::in_dir(number, X11_UNIX_DIR)
    }

    /// Display `:number` with its socket in `socket_dir`.
    #[must_use]
    pub fn in_dir(number: u32, socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            number,
            socket_dir: socket_dir.into(),
        }
    }

    /// The display number.
    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Path of the display's Unix socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("X{}", self.number))
    }

    /// Whether the socket exists.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.socket_path().exists()
    }
}

impl fmt::Display for X11Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.number)
    }
}

/// Display number of the host display from a `$DISPLAY` value.
///
/// Accepts `:N` and `:N.S`; anything else yields `0`.
#[must_use]
pub fn host_display_number(display_var: Option<&str>) -> u32 {
    display_var
        .and_then(|value| value.strip_prefix(':'))
        .and_then(|rest| rest.split('.').next())
        .and_then(|number| number.parse().ok())
        .unwrap_or(0)
}

/// Display numbers whose socket exists in `socket_dir`.
///
/// # Errors
///
/// Returns `DisplayError::Io` if the directory exists but cannot be read.
pub fn used_display_numbers(socket_dir: &Path) -> Result<BTreeSet<u32>, DisplayError> {
    let entries = match std::fs::read_dir(socket_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => {
            return Err(DisplayError::Io {
                context: format!("reading {}", socket_dir.display()),
                source: e,
            });
        }
    };

    Ok(entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix('X'))
                .and_then(|number| number.parse().ok())
        })
        .collect())
}

/// Smallest number `>= minimum` not contained in `used`.
#[must_use]
pub fn smallest_unused(used: &BTreeSet<u32>, minimum: u32) -> u32 {
    (minimum..)
        .find(|candidate| !used.contains(candidate))
        .unwrap_or(minimum)
}

/// Allocates a free display number for a nested backend.
///
/// Two concurrent launches may pick the same number; there is no locking.
///
/// # Errors
///
/// Returns `DisplayError::Io` if the socket directory cannot be read.
pub fn find_unused_display(socket_dir: &Path, minimum: u32) -> Result<u32, DisplayError> {
    let used = used_display_numbers(socket_dir)?;
    let number = smallest_unused(&used, minimum);
    debug!(?used, minimum, number, "Allocated display number");
    Ok(number)
}

/// Polls `ready` every `interval` until it holds.
///
/// # Errors
///
/// Returns `DisplayError::Interrupted` once `cancel` is raised.
pub fn wait_until(
    cancel: &CancelToken,
    interval: Duration,
    mut ready: impl FnMut() -> bool,
) -> Result<(), DisplayError> {
    loop {
        if cancel.is_cancelled() {
            return Err(DisplayError::Interrupted);
        }
        if ready() {
            return Ok(());
        }
        thread::sleep(interval);
    }
}

/// Start/stop/probe capability shared by all backends.
pub trait DisplayBackend: fmt::Debug {
    /// Human-readable backend name, used in logs.
    fn name(&self) -> &str;

    /// Launches the backend processes for `display`.
    ///
    /// May block for backend-specific handshakes. Must leave everything it
    /// created reachable for [`DisplayBackend::stop`], even on error.
    ///
    /// # Errors
    ///
    /// Returns `DisplayError::BinaryMissing` if the executable does not exist.
    fn start(&mut self, display: &X11Display, cancel: &CancelToken) -> Result<(), DisplayError>;

    /// Whether `display` accepts clients.
    fn probe_ready(&self, display: &X11Display) -> bool;

    /// Terminates whatever [`DisplayBackend::start`] launched.
    ///
    /// # Errors
    ///
    /// Returns an error if signalling a process fails.
    fn stop(&mut self) -> Result<(), DisplayError>;
}

/// Lifecycle state of a display session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    /// Not started yet.
    Unstarted,
    /// Backend launched, waiting for readiness.
    Starting,
    /// Socket is accepting clients.
    Ready,
    /// Backend is being torn down.
    Stopping,
    /// Backend is gone.
    Stopped,
    /// Starting failed; partial resources were released.
    Failed,
}

/// One display allocation and the backend serving it.
#[derive(Debug)]
pub struct DisplaySession {
    display: X11Display,
    backend: Box<dyn DisplayBackend>,
    state: DisplayState,
    poll_interval: Duration,
}

impl DisplaySession {
    /// Creates an unstarted session.
    #[must_use]
    pub fn new(display: X11Display, backend: Box<dyn DisplayBackend>) -> Self {
        Self {
            display,
            backend,
            state: DisplayState::Unstarted,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Overrides the readiness poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DisplayState {
        self.state
    }

    /// The display being served.
    #[must_use]
    pub fn display(&self) -> &X11Display {
        &self.display
    }

    /// Starts the backend and blocks until the display is ready.
    ///
    /// # Errors
    ///
    /// Returns the backend's start error, or `DisplayError::Interrupted`.
    /// In both cases the backend has already been stopped.
    #[instrument(skip_all, fields(backend = self.backend.name(), display = %self.display))]
    pub fn start(mut self, cancel: &CancelToken) -> Result<DisplayGuard, DisplayError> {
        info!("Starting nested X11...");
        self.state = DisplayState::Starting;

        let started = self
            .backend
            .start(&self.display, cancel)
            .and_then(|()| {
                let backend = &self.backend;
                let display = &self.display;
                wait_until(cancel, self.poll_interval, || backend.probe_ready(display))
            });

        if let Err(e) = started {
            if let Err(stop_error) = self.backend.stop() {
                warn!(error = %stop_error, "Cleanup after failed start failed");
            }
            self.state = DisplayState::Failed;
            return Err(e);
        }

        self.state = DisplayState::Ready;
        info!("Nested X11 ready.");
        Ok(DisplayGuard { session: self })
    }

    fn shutdown(&mut self) {
        if self.state != DisplayState::Ready {
            return;
        }
        info!("Shutting down nested X11...");
        self.state = DisplayState::Stopping;
        if let Err(e) = self.backend.stop() {
            warn!(error = %e, "Failed to stop display backend");
        }
        self.state = DisplayState::Stopped;
        info!("Nested X11 gone.");
    }
}

/// A ready display; dropping it stops the backend.
#[derive(Debug)]
pub struct DisplayGuard {
    session: DisplaySession,
}

impl DisplayGuard {
    /// The display being served.
    #[must_use]
    pub fn display(&self) -> &X11Display {
        self.session.display()
    }

    /// Current state of the underlying session.
    #[must_use]
    pub fn state(&self) -> DisplayState {
        self.session.state()
    }

    /// Stops the backend now instead of on drop.
    pub fn release(mut self) -> DisplayState {
        self.session.shutdown();
        self.session.state()
    }
}

impl Drop for DisplayGuard {
    fn drop(&mut self) {
        self.session.shutdown();
    }
}
