use std::io;
use std::process::{Child, Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info};

use super::{BackendKind, DisplayBackend, Geometry, X11Display, XpraBackend};
use crate::error::DisplayError;
use crate::system::CancelToken;

/// Creates the backend for `kind`.
#[must_use]
pub fn create_backend(kind: BackendKind, geometry: Geometry) -> Box<dyn DisplayBackend> {
    match kind {
        BackendKind::Host => Box::new(HostBackend),
        BackendKind::Nxagent => Box::new(SimpleBackend::new(NestedServer::Nxagent, geometry)),
        BackendKind::Xephyr => Box::new(SimpleBackend::new(NestedServer::Xephyr, geometry)),
        BackendKind::Xnest => Box::new(SimpleBackend::new(NestedServer::Xnest, geometry)),
        BackendKind::Xvfb => Box::new(SimpleBackend::new(NestedServer::Xvfb, geometry)),
        BackendKind::Xpra => Box::new(XpraBackend::new(geometry)),
    }
}

/// The host display, shared as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

impl DisplayBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn start(&mut self, _display: &X11Display, _cancel: &CancelToken) -> Result<(), DisplayError> {
        Ok(())
    }

    fn probe_ready(&self, _display: &X11Display) -> bool {
        true
    }

    fn stop(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// Nested X servers that run as a single process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedServer {
    /// `nxagent`
    Nxagent,
    /// `Xephyr`
    Xephyr,
    /// `Xnest`
    Xnest,
    /// `Xvfb`
    Xvfb,
}

impl NestedServer {
    /// Default executable name.
    #[must_use]
    pub fn command(self) -> &'static str {
        match self {
            NestedServer::Nxagent => "nxagent",
            NestedServer::Xephyr => "Xephyr",
            NestedServer::Xnest => "Xnest",
            NestedServer::Xvfb => "Xvfb",
        }
    }

    /// Server arguments; the display argument always comes last.
    #[must_use]
    pub fn arguments(self, geometry: Geometry, display: &X11Display) -> Vec<String> {
        let mut args: Vec<String> = match self {
            NestedServer::Nxagent => ["-nolisten", "tcp", "-ac", "-noshmem", "-R"]
                .map(String::from)
                .to_vec(),
            NestedServer::Xephyr => vec![
                "-screen".to_string(),
                geometry.to_string(),
                "-extension".to_string(),
                "MIT-SHM".to_string(),
            ],
            NestedServer::Xnest => vec!["-geometry".to_string(), geometry.to_string()],
            NestedServer::Xvfb => vec![
                "-screen".to_string(),
                "0".to_string(),
                format!("{geometry}x24"),
                "-extension".to_string(),
                "MIT-SHM".to_string(),
            ],
        };
        args.push(display.to_string());
        args
    }
}

/// Runs one nested server process, stopped with SIGINT.
#[derive(Debug)]
pub struct SimpleBackend {
    server: NestedServer,
    geometry: Geometry,
    command: String,
    process: Option<Child>,
}

impl SimpleBackend {
    /// Creates a backend running the server's default executable.
    #[must_use]
    pub fn new(server: NestedServer, geometry: Geometry) -> Self {
        Self {
            server,
            geometry,
            command: server.command().to_string(),
            process: None,
        }
    }

    /// Uses a different executable, e.g. an absolute path.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// The full command line, program first.
    #[must_use]
    pub fn argv(&self, display: &X11Display) -> Vec<String> {
        let mut argv = vec![self.command.clone()];
        argv.extend(self.server.arguments(self.geometry, display));
        argv
    }
}

impl DisplayBackend for SimpleBackend {
    fn name(&self) -> &str {
        self.server.command()
    }

    fn start(&mut self, display: &X11Display, _cancel: &CancelToken) -> Result<(), DisplayError> {
        let argv = self.argv(display);
        debug!(?argv, "Spawning nested X server");
        let child = spawn(&self.command, &argv[1..], |_| {})?;
        self.process = Some(child);
        Ok(())
    }

    fn probe_ready(&self, display: &X11Display) -> bool {
        display.is_available()
    }

    fn stop(&mut self) -> Result<(), DisplayError> {
        if let Some(child) = self.process.take() {
            terminate(child, &self.command, Signal::SIGINT)?;
        }
        Ok(())
    }
}

/// Spawns `command` with `args`, mapping a missing executable to
/// `DisplayError::BinaryMissing`.
pub(super) fn spawn(
    command: &str,
    args: &[String],
    customize: impl FnOnce(&mut Command),
) -> Result<Child, DisplayError> {
    let mut cmd = Command::new(command);
    cmd.args(args).stdin(Stdio::null());
    customize(&mut cmd);

    cmd.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => DisplayError::BinaryMissing {
            command: command.to_string(),
        },
        _ => DisplayError::Spawn {
            command: command.to_string(),
            source: e,
        },
    })
}

/// Sends `sig` to `child` and reaps it. A process that already exited is fine.
pub(super) fn terminate(mut child: Child, command: &str, sig: Signal) -> Result<(), DisplayError> {
    let pid = Pid::from_raw(child.id() as i32);
    info!(pid = child.id(), signal = %sig, "Stopping {command}");

    match signal::kill(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            return Err(DisplayError::Signal {
                command: command.to_string(),
                source: e,
            });
        }
    }

    let status = child.wait().map_err(|e| DisplayError::Io {
        context: format!("waiting for {command}"),
        source: e,
    })?;
    debug!(%status, "{command} exited");
    Ok(())
}
