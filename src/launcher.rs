//! Runs one sandboxed launch from start to finish.
//!
//! Order matters: the display is chosen and numbered before the mount plan
//! is built, because the plan binds the display socket. The plan is
//! complete and the command printed before the display backend starts, and
//! the backend is ready before the engine runs.

use std::io;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::display::{
    BackendKind, DisplayGuard, DisplaySession, X11_UNIX_DIR, X11Display, create_backend,
    find_unused_display, host_display_number,
};
use crate::error::{EXIT_INTERRUPTED, RelayError, Result};
use crate::pty::{PtyRelay, exit_code_from_status, forward_interrupt};
use crate::sandbox::{
    CompiledCommand, HostContext, LaunchConfig, Payload, PlanDiagnostic, PlanRequest, RealFs,
    build_mount_plan, compile, needs_configure,
};
use crate::system::{self, CancelToken};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Prefix of generated sandbox hostnames.
pub const HOSTNAME_PREFIX: &str = "winecell-";

/// Generates a random hostname such as `winecell-1f0e8c2b9a4d`.
#[must_use]
pub fn generate_hostname() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{HOSTNAME_PREFIX}{}", &id[..12])
}

/// Picks the display for `backend`.
///
/// The host display is read from `$DISPLAY`; nested displays get the
/// smallest free number in `socket_dir`.
///
/// # Errors
///
/// Returns an error if `socket_dir` cannot be scanned.
pub fn allocate_display(
    backend: BackendKind,
    ctx: &HostContext,
    socket_dir: &Path,
) -> Result<X11Display> {
    let number = match backend {
        BackendKind::Host => host_display_number(ctx.var("DISPLAY")),
        nested => find_unused_display(socket_dir, nested.minimum_display())?,
    };
    Ok(X11Display::in_dir(number, socket_dir))
}

/// Runs `config` and returns the process exit code.
///
/// # Errors
///
/// Returns an error for everything that prevents the program from running;
/// [`crate::Error::exit_code`] maps it to an exit code. A program that runs
/// and fails is not an error.
#[instrument(skip_all, fields(program = config.program.as_deref().unwrap_or("true")))]
pub fn run(config: &LaunchConfig, ctx: &HostContext, cancel: &CancelToken) -> Result<i32> {
    let backend = config.x11.resolve()?;
    let display = backend
        .map(|kind| allocate_display(kind, ctx, Path::new(X11_UNIX_DIR)))
        .transpose()?;
    if let Some(chosen) = &display {
        info!("Using display \"{chosen}\"...");
    }

    system::check_all(config.with_wine)?;

    let request = PlanRequest::from_config(config, display.clone(), generate_hostname());
    let plan = build_mount_plan(&request, ctx, &RealFs)?;
    for diagnostic in &plan.diagnostics {
        if let PlanDiagnostic::DroppedMount { target } = diagnostic {
            info!("Path {} does not exist on the host, not mounting", target.display());
        }
    }

    let payload = Payload {
        program: config.program.clone(),
        args: config.args.clone(),
        with_wine: config.with_wine,
        configure: needs_configure(
            config.configure,
            display.is_some(),
            config.with_wine,
            config.dotwine.is_none(),
            plan.state_dir_created,
        ),
        retry: config.retry,
    };
    let command = compile(&plan, &payload, ctx);
    command.announce_to(&mut io::stderr().lock())?;

    let session = match (backend, display) {
        (Some(kind), Some(chosen)) => Some(DisplaySession::new(
            chosen,
            create_backend(kind, config.geometry),
        )),
        _ => None,
    };
    launch(&command, session, config.pty, cancel)
}

/// Starts the display, runs `command` and tears the display down again.
///
/// An interrupt seen before the display starts or before the command runs
/// skips the remaining steps. Any interrupt yields [`EXIT_INTERRUPTED`].
///
/// # Errors
///
/// Returns display start failures and [`execute`] errors.
pub fn launch(
    command: &CompiledCommand,
    session: Option<DisplaySession>,
    pty: bool,
    cancel: &CancelToken,
) -> Result<i32> {
    if cancel.is_cancelled() {
        warn!("Interrupted before start");
        return Ok(EXIT_INTERRUPTED);
    }

    let guard: Option<DisplayGuard> = session.map(|s| s.start(cancel)).transpose()?;
    if cancel.is_cancelled() {
        warn!("Interrupted before launch");
        return Ok(EXIT_INTERRUPTED);
    }

    let exit_code = execute(command, pty, cancel)?;
    drop(guard);

    if cancel.is_cancelled() {
        warn!("Interrupted");
        return Ok(EXIT_INTERRUPTED);
    }
    Ok(exit_code)
}

/// Runs the compiled command, through the relay if `pty` is set.
///
/// Without the relay the command shares our terminal; a raised `cancel`
/// is forwarded to it as SIGINT once.
///
/// # Errors
///
/// Returns `RelayError::BinaryMissing` if the engine cannot be executed.
pub fn execute(command: &CompiledCommand, pty: bool, cancel: &CancelToken) -> Result<i32> {
    if cancel.is_cancelled() {
        return Ok(EXIT_INTERRUPTED);
    }
    let argv = command.to_argv();

    if pty {
        let code = PtyRelay::new(argv).with_cancel(cancel.clone()).run()?;
        return Ok(code);
    }

    let (program, args) = argv.split_first().ok_or(RelayError::EmptyCommand)?;
    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RelayError::BinaryMissing {
                command: program.clone(),
            },
            _ => RelayError::Io {
                context: format!("running {program}"),
                source: e,
            },
        })?;

    let mut interrupt_forwarded = false;
    loop {
        let status = child.try_wait().map_err(|e| RelayError::Io {
            context: format!("waiting for {program}"),
            source: e,
        })?;
        if let Some(status) = status {
            return Ok(exit_code_from_status(status));
        }

        if !interrupt_forwarded && cancel.is_cancelled() {
            forward_interrupt(&child);
            interrupt_forwarded = true;
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use tempfile::TempDir;

    use crate::display::DisplayBackend;
    use crate::error::DisplayError;

    #[derive(Debug, Default)]
    struct CountingBackend {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl DisplayBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        fn start(&mut self, _display: &X11Display, _cancel: &CancelToken) -> std::result::Result<(), DisplayError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn probe_ready(&self, _display: &X11Display) -> bool {
            true
        }

        fn stop(&mut self) -> std::result::Result<(), DisplayError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn shell(script: &str) -> CompiledCommand {
        let mut command = CompiledCommand::default();
        command.add(["sh", "-c", script]);
        command
    }

    /// Children inherit an ignored SIGINT when the tests run in the background.
    #[allow(unsafe_code)]
    fn restore_default_sigint() {
        use nix::sys::signal::{SigHandler, Signal, signal};
        // SAFETY: installs the default disposition, no handler code runs.
        unsafe { signal(Signal::SIGINT, SigHandler::SigDfl) }.expect("reset SIGINT");
    }

    fn session_for(backend: CountingBackend) -> DisplaySession {
        DisplaySession::new(X11Display::new(7), Box::new(backend))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_generated_hostname() {
        let hostname = generate_hostname();
        assert!(hostname.starts_with(HOSTNAME_PREFIX));
        assert_eq!(hostname.len(), HOSTNAME_PREFIX.len() + 12);
        assert!(hostname[HOSTNAME_PREFIX.len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hostname, generate_hostname());
    }

    #[test]
    fn test_allocate_host_display() {
        let ctx = HostContext::new("/home/u", 1000).with_env("DISPLAY", ":3.0");
        let display = allocate_display(BackendKind::Host, &ctx, Path::new("/nonexistent"))
            .expect("host display");
        assert_eq!(display.number(), 3);
    }

    #[test]
    fn test_allocate_nested_display() {
        let sockets = TempDir::new().expect("failed to create temp dir");
        for name in ["X0", "X1", "X3"] {
            std::fs::write(sockets.path().join(name), b"").expect("create fake socket");
        }
        let ctx = HostContext::new("/home/u", 1000);

        let display =
            allocate_display(BackendKind::Xephyr, &ctx, sockets.path()).expect("nested display");
        assert_eq!(display.number(), 2);
        assert_eq!(display.socket_path(), sockets.path().join("X2"));

        let display =
            allocate_display(BackendKind::Xpra, &ctx, sockets.path()).expect("xpra display");
        assert_eq!(display.number(), 10);
    }

    #[test]
    fn test_launch_reports_exit_code_and_stops_display() {
        let backend = CountingBackend::default();
        let stops = Arc::clone(&backend.stops);

        let code = launch(&shell("exit 4"), Some(session_for(backend)), false, &CancelToken::new())
            .expect("launch");
        assert_eq!(code, 4);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_launch_after_interrupt_runs_nothing() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let marker = temp_dir.path().join("ran");
        let command = shell(&format!("touch '{}'", marker.display()));
        let backend = CountingBackend::default();
        let starts = Arc::clone(&backend.starts);

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(launch(&command, None, false, &cancel).ok(), Some(EXIT_INTERRUPTED));
        assert_eq!(launch(&command, None, true, &cancel).ok(), Some(EXIT_INTERRUPTED));
        assert_eq!(
            launch(&command, Some(session_for(backend)), false, &cancel).ok(),
            Some(EXIT_INTERRUPTED)
        );

        assert_eq!(starts.load(Ordering::SeqCst), 0);
        assert!(!marker.exists());
    }

    #[test]
    fn test_execute_after_interrupt_runs_nothing() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let marker = temp_dir.path().join("ran");
        let command = shell(&format!("sleep 1; touch '{}'", marker.display()));

        let cancel = CancelToken::new();
        cancel.cancel();
        let started = Instant::now();
        assert_eq!(execute(&command, false, &cancel).ok(), Some(EXIT_INTERRUPTED));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!marker.exists());
    }

    #[test]
    fn test_interrupt_reaches_running_command() {
        restore_default_sigint();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let code = launch(&shell("exec sleep 5"), None, false, &cancel).expect("launch");
        canceller.join().expect("join canceller");

        assert_eq!(code, EXIT_INTERRUPTED);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_execute_forwards_interrupt_as_sigint() {
        restore_default_sigint();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let code = execute(&shell("exec sleep 5"), false, &cancel).expect("execute");
        canceller.join().expect("join canceller");
        assert_eq!(code, 128 + libc::SIGINT);
    }
}
