//! Error types for winecell.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Every error knows the process exit code it maps to, see [`Error::exit_code`].

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Exit code used when a required external binary is missing.
pub const EXIT_MISSING_BINARY: i32 = 127;

/// Exit code used for fatal errors, including missing required host paths.
pub const EXIT_FAILURE: i32 = 1;

/// Exit code offset for termination by signal.
pub const EXIT_SIGNAL_BASE: i32 = 128;

/// Exit code after a keyboard interrupt (`128 + SIGINT`).
pub const EXIT_INTERRUPTED: i32 = EXIT_SIGNAL_BASE + libc::SIGINT;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Malformed user-supplied configuration
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// Mount plan could not be built
    #[error(transparent)]
    #[diagnostic(transparent)]
    Mount(#[from] MountError),

    /// Namespace engine or another required binary is unusable
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),

    /// Nested display could not be started or stopped
    #[error(transparent)]
    #[diagnostic(transparent)]
    Display(#[from] DisplayError),

    /// Pseudo-terminal relay failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Relay(#[from] RelayError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(winecell::io))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the process exit code this error maps to.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Engine(EngineError::MissingBinary { .. })
            | Error::Display(DisplayError::NoNestedBackend { .. })
            | Error::Display(DisplayError::BinaryMissing { .. })
            | Error::Relay(RelayError::BinaryMissing { .. }) => EXIT_MISSING_BINARY,
            Error::Display(DisplayError::Interrupted) => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        }
    }
}

/// Errors in user-supplied configuration values.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A bind token did not look like `PATH:ro` or `PATH:rw`
    #[error("Value {value:?} does not match pattern \"PATH:{{ro,rw}}\"")]
    #[diagnostic(
        code(winecell::config::access_spec),
        help("Append \":ro\" for a read-only or \":rw\" for a read-write bind")
    )]
    InvalidAccessSpec { value: String },

    /// A geometry did not look like `WIDTHxHEIGHT`
    #[error("Value {value:?} does not match pattern \"WIDTHxHEIGHT\"")]
    #[diagnostic(code(winecell::config::geometry), help("Example: 1024x768"))]
    InvalidGeometry { value: String },
}

/// Errors raised while building the mount plan.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// A required bind source is absent on the host
    #[error("Path {} does not exist on the host, aborting", path.display())]
    #[diagnostic(
        code(winecell::mount::missing_path),
        help("Create the path or drop the corresponding bind")
    )]
    MissingRequiredPath { path: PathBuf },

    /// The persistent-state directory could not be created
    #[error("Failed to create directory {}", path.display())]
    #[diagnostic(code(winecell::mount::create_dir))]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to the namespace engine and other external binaries.
#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    /// Binary not found on the search path
    #[error("Command {command:?} is not available, aborting")]
    #[diagnostic(code(winecell::engine::missing_binary), help("Install {command} and retry"))]
    MissingBinary { command: String },

    /// The engine lacks a flag we depend on
    #[error("Command {command:?} does not support {flag}")]
    #[diagnostic(
        code(winecell::engine::unsupported),
        help("bubblewrap >= 0.8.0 is required for --disable-userns")
    )]
    Unsupported { command: String, flag: String },

    /// Probing the engine failed
    #[error("Failed to probe {command:?}")]
    #[diagnostic(code(winecell::engine::probe))]
    Probe {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to nested display servers.
#[derive(Error, Debug, Diagnostic)]
pub enum DisplayError {
    /// None of the auto-detectable nested servers is installed
    #[error("Neither {} is available, please install, aborting", candidates.join(" nor "))]
    #[diagnostic(code(winecell::display::no_backend))]
    NoNestedBackend { candidates: Vec<String> },

    /// The backend executable could not be found at launch
    #[error("Command {command:?} is not available, aborting")]
    #[diagnostic(code(winecell::display::missing_binary))]
    BinaryMissing { command: String },

    /// The backend process could not be spawned
    #[error("Failed to start {command:?}")]
    #[diagnostic(code(winecell::display::spawn))]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Scanning the socket directory or preparing backend files failed
    #[error("Display I/O failed: {context}")]
    #[diagnostic(code(winecell::display::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Delivering a signal to a backend process failed
    #[error("Failed to signal {command:?}")]
    #[diagnostic(code(winecell::display::signal))]
    Signal {
        command: String,
        #[source]
        source: nix::Error,
    },

    /// A keyboard interrupt arrived while waiting on the backend
    #[error("Interrupted while waiting for the display")]
    #[diagnostic(code(winecell::display::interrupted))]
    Interrupted,
}

/// Errors raised by the pseudo-terminal relay.
#[derive(Error, Debug, Diagnostic)]
pub enum RelayError {
    /// The command vector was empty
    #[error("Nothing to run")]
    #[diagnostic(code(winecell::relay::empty))]
    EmptyCommand,

    /// The first argument could not be executed because it does not exist
    #[error("Command {command:?} is not available, aborting")]
    #[diagnostic(code(winecell::relay::missing_binary))]
    BinaryMissing { command: String },

    /// Allocating the pseudo-terminal pair failed
    #[error("Failed to allocate a pseudo-terminal")]
    #[diagnostic(code(winecell::relay::openpty))]
    OpenPty(#[source] nix::Error),

    /// Reading or changing terminal attributes failed
    #[error("Terminal control failed: {context}")]
    #[diagnostic(code(winecell::relay::termios))]
    Terminal {
        context: String,
        #[source]
        source: nix::Error,
    },

    /// Spawning or waiting for the child failed
    #[error("Process I/O failed: {context}")]
    #[diagnostic(code(winecell::relay::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
