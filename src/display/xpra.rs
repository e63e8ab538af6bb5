//! xpra: a headless server and a client window, talking through a private
//! socket.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::sys::signal::Signal;
use tempfile::TempDir;
use tracing::{debug, warn};

use super::backends::{spawn, terminate};
use super::{DisplayBackend, Geometry, POLL_INTERVAL, X11Display, wait_until};
use crate::error::DisplayError;
use crate::system::CancelToken;

const SOCKET_NAME: &str = "xpra-socket";
const XVFB_WRAPPER_NAME: &str = "xpra-xvfb.sh";
const SESSIONS_DIR_NAME: &str = "xpra-sessions";

/// Xvfb as started by the xpra server. MIT-SHM is off because it crashes
/// nested servers when windows move near screen edges.
const XVFB_WRAPPER: &str = r#"#! /usr/bin/env bash
set -e
args=(
    +extension GLX
    +extension Composite
    -extension MIT-SHM
    -screen 0 8192x4096x24+32
    -nolisten tcp
    -noreset
    -dpi 96
    "$@"
)
PS4='# '
set -x
exec Xvfb "${args[@]}"
"#;

/// Server options; everything that could leak host resources is off.
const SERVER_OPTIONS: &[&str] = &[
    "--attach=no",
    "--bandwidth-limit=0",
    "--bell=no",
    "--clipboard=no",
    "--daemon=no",
    "--dbus-launch=",
    "--dbus-proxy=no",
    "--file-transfer=no",
    "--html=off",
    "--http-scripts=off",
    "--microphone=off",
    "--min-quality=100",
    "--open-files=no",
    "--open-url=no",
    "--printing=no",
    "--proxy-start-sessions=no",
    "--pulseaudio=no",
    "--quality=100",
    "--speaker=off",
    "--start-new-commands=no",
    "--systemd-run=no",
    "--use-display=no",
    "--video-scaling=0",
    "--webcam=no",
    "--xsettings=no",
];

/// Files inside the private directory.
#[derive(Debug, Clone)]
struct XpraPaths {
    socket: PathBuf,
    xvfb_wrapper: PathBuf,
    sessions: PathBuf,
}

impl XpraPaths {
    fn in_dir(dir: &Path) -> Self {
        Self {
            socket: dir.join(SOCKET_NAME),
            xvfb_wrapper: dir.join(XVFB_WRAPPER_NAME),
            sessions: dir.join(SESSIONS_DIR_NAME),
        }
    }
}

/// xpra server plus client.
///
/// The private directory is created on start and removed on stop, also when
/// starting fails half-way.
#[derive(Debug)]
pub struct XpraBackend {
    command: String,
    private_parent: Option<PathBuf>,
    poll_interval: Duration,
    tempdir: Option<TempDir>,
    server: Option<Child>,
    client: Option<Child>,
}

impl XpraBackend {
    /// Creates a backend running `xpra` from the search path.
    ///
    /// The geometry is fixed by the virtual framebuffer, so it is ignored.
    #[must_use]
    pub fn new(_geometry: Geometry) -> Self {
        Self {
            command: "xpra".to_string(),
            private_parent: None,
            poll_interval: POLL_INTERVAL,
            tempdir: None,
            server: None,
            client: None,
        }
    }

    /// Uses a different executable.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Creates the private directory below `parent` instead of the system
    /// temporary directory.
    #[must_use]
    pub fn with_private_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.private_parent = Some(parent.into());
        self
    }

    /// Overrides the handshake poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The private directory while the backend is running.
    #[must_use]
    pub fn private_dir(&self) -> Option<&Path> {
        self.tempdir.as_ref().map(TempDir::path)
    }

    fn server_args(paths: &XpraPaths, display: &X11Display) -> Vec<String> {
        let mut args = vec!["start".to_string()];
        args.extend(SERVER_OPTIONS.iter().map(|option| (*option).to_string()));
        args.push(format!("--bind={}", paths.socket.display()));
        args.push(format!("--sessions-dir={}", paths.sessions.display()));
        args.push(format!("--xvfb={}", paths.xvfb_wrapper.display()));
        args.push(display.to_string());
        args
    }

    fn client_args(paths: &XpraPaths) -> Vec<String> {
        vec![
            "attach".to_string(),
            format!("--sessions-dir={}", paths.sessions.display()),
            paths.socket.display().to_string(),
        ]
    }

    fn create_private_dir(&self) -> Result<TempDir, DisplayError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("winecell-xpra-");
        let created = match &self.private_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        created.map_err(|e| DisplayError::Io {
            context: "creating private directory for xpra".to_string(),
            source: e,
        })
    }

    fn accepts_connections(&self, socket: &Path) -> bool {
        Command::new(&self.command)
            .arg("id")
            .arg(socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }
}

fn write_xvfb_wrapper(path: &Path) -> Result<(), DisplayError> {
    let io_error = |source| DisplayError::Io {
        context: format!("writing {}", path.display()),
        source,
    };
    fs::write(path, XVFB_WRAPPER).map_err(io_error)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_error)
}

impl DisplayBackend for XpraBackend {
    fn name(&self) -> &str {
        "xpra"
    }

    fn start(&mut self, display: &X11Display, cancel: &CancelToken) -> Result<(), DisplayError> {
        let tempdir = self.create_private_dir()?;
        let paths = XpraPaths::in_dir(tempdir.path());
        self.tempdir = Some(tempdir);

        write_xvfb_wrapper(&paths.xvfb_wrapper)?;

        let server_args = Self::server_args(&paths, display);
        debug!(args = ?server_args, "Spawning xpra server");
        self.server = Some(spawn(&self.command, &server_args, |_| {})?);

        wait_until(cancel, self.poll_interval, || paths.socket.exists())?;
        wait_until(cancel, self.poll_interval, || {
            self.accepts_connections(&paths.socket)
        })?;

        let client_args = Self::client_args(&paths);
        debug!(args = ?client_args, "Spawning xpra client");
        self.client = Some(spawn(&self.command, &client_args, |cmd| {
            cmd.env_remove("SSH_AUTH_SOCK");
        })?);

        Ok(())
    }

    fn probe_ready(&self, display: &X11Display) -> bool {
        display.is_available()
    }

    fn stop(&mut self) -> Result<(), DisplayError> {
        let mut first_error = None;

        // SIGINT makes xpra print a backtrace, SIGTERM does not.
        for child in [self.client.take(), self.server.take()].into_iter().flatten() {
            if let Err(e) = terminate(child, &self.command, Signal::SIGTERM) {
                first_error.get_or_insert(e);
            }
        }

        if let Some(tempdir) = self.tempdir.take() {
            let path = tempdir.path().to_path_buf();
            if let Err(e) = tempdir.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove private directory");
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
