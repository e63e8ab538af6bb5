//! Configuration for sandboxed launches.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::display::{Geometry, X11Mode};
use crate::error::ConfigError;

/// Access granted to a bind-mounted host path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// `ro`
    ReadOnly,
    /// `rw`
    ReadWrite,
}

impl AccessMode {
    /// Returns the token used on the command line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "ro",
            AccessMode::ReadWrite => "rw",
        }
    }
}

/// A `PATH:{ro,rw}` token as given to `--dotwine` and `--pass`.
///
/// The token is split at the last colon, so the path itself may contain colons.
///
/// # Example
///
/// ```
/// use winecell::sandbox::{AccessMode, BindSpec};
///
/// let spec: BindSpec = "/srv/games:ro".parse().unwrap();
/// assert_eq!(spec.path.to_str(), Some("/srv/games"));
/// assert_eq!(spec.access, AccessMode::ReadOnly);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// Host path, as given (not yet absolutized).
    pub path: PathBuf,
    /// Requested access.
    pub access: AccessMode,
}

impl BindSpec {
    /// Creates a bind spec from parts.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, access: AccessMode) -> Self {
        Self {
            path: path.into(),
            access,
        }
    }
}

impl FromStr for BindSpec {
    type Err = ConfigError;

    fn from_str(candidate: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidAccessSpec {
            value: candidate.to_string(),
        };

        let (path, access) = candidate.rsplit_once(':').ok_or_else(invalid)?;
        let access = match access {
            "ro" => AccessMode::ReadOnly,
            "rw" => AccessMode::ReadWrite,
            _ => return Err(invalid()),
        };
        if path.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(path, access))
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.access.as_str())
    }
}

/// Everything that describes one sandboxed launch.
///
/// Use the builder methods to customize the launch.
///
/// # Example
///
/// ```
/// use winecell::display::X11Mode;
/// use winecell::sandbox::LaunchConfig;
///
/// let config = LaunchConfig::new("notepad.exe")
///     .with_x11(X11Mode::Xephyr)
///     .with_network(true)
///     .with_retry(true);
/// assert_eq!(config.program.as_deref(), Some("notepad.exe"));
/// ```
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Program to run; `None` only makes sense together with `configure`.
    pub program: Option<String>,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// Nested display selection.
    pub x11: X11Mode,

    /// Screen geometry for nested displays.
    pub geometry: Geometry,

    /// Share the host network namespace.
    pub network: bool,

    /// Expose the PulseAudio socket.
    pub pulseaudio: bool,

    /// Host directory to use for `~/.wine`; tmpfs when `None`.
    pub dotwine: Option<BindSpec>,

    /// Additional host paths bound at the same location.
    pub extra_binds: Vec<BindSpec>,

    /// Force running `winecfg` before the program.
    pub configure: bool,

    /// Run the program through `wine`.
    pub with_wine: bool,

    /// Run the program a second time on non-zero exit.
    pub retry: bool,

    /// Relay the session through a pseudo-terminal.
    pub pty: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            x11: X11Mode::None,
            geometry: Geometry::default(),
            network: false,
            pulseaudio: false,
            dotwine: None,
            extra_binds: Vec::new(),
            configure: false,
            with_wine: true,
            retry: false,
            pty: true,
        }
    }
}

impl LaunchConfig {
    /// Creates a configuration running `program` with default settings.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    /// Sets the program arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the display mode.
    #[must_use]
    pub fn with_x11(mut self, mode: X11Mode) -> Self {
        self.x11 = mode;
        self
    }

    /// Sets the nested display geometry.
    #[must_use]
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Enables or disables networking.
    #[must_use]
    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network = enabled;
        self
    }

    /// Enables or disables sound.
    #[must_use]
    pub fn with_pulseaudio(mut self, enabled: bool) -> Self {
        self.pulseaudio = enabled;
        self
    }

    /// Uses a host directory for `~/.wine`.
    #[must_use]
    pub fn with_dotwine(mut self, spec: BindSpec) -> Self {
        self.dotwine = Some(spec);
        self
    }

    /// Adds one extra bind.
    #[must_use]
    pub fn with_extra_bind(mut self, spec: BindSpec) -> Self {
        self.extra_binds.push(spec);
        self
    }

    /// Forces the configuration step.
    #[must_use]
    pub fn with_configure(mut self, enabled: bool) -> Self {
        self.configure = enabled;
        self
    }

    /// Runs the program with or without Wine.
    #[must_use]
    pub fn with_wine(mut self, enabled: bool) -> Self {
        self.with_wine = enabled;
        self
    }

    /// Enables or disables the second attempt.
    #[must_use]
    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.retry = enabled;
        self
    }

    /// Enables or disables the pseudo-terminal relay.
    #[must_use]
    pub fn with_pty(mut self, enabled: bool) -> Self {
        self.pty = enabled;
        self
    }
}
