//! Pseudo-terminal relay.
//!
//! Runs a command with a fresh pseudo-terminal as its controlling terminal
//! and copies bytes between our own stdin/stdout and the terminal's master
//! side until the command exits. The window size of our terminal is copied
//! on start and on every `SIGWINCH`.
//!
//! Job control does not pass through: Ctrl+Z suspends nothing.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::pty::{Winsize, openpty};
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::error::{EXIT_FAILURE, EXIT_SIGNAL_BASE, RelayError};
use crate::system::CancelToken;

const POLL_TIMEOUT_MS: u16 = 200;
const BUFFER_SIZE: usize = 8192;

nix::ioctl_read_bad!(get_window_size, libc::TIOCGWINSZ, Winsize);
nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, Winsize);

/// Maps a termination status to a shell-style exit code.
///
/// Death by signal `N` becomes `128 + N`.
#[must_use]
pub fn exit_code_from_status(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => EXIT_SIGNAL_BASE + signal,
        (None, None) => EXIT_FAILURE,
    }
}

/// Runs a command under a pseudo-terminal.
///
/// # Example
///
/// ```no_run
/// use winecell::pty::PtyRelay;
///
/// let code = PtyRelay::new(["sh", "-c", "exit 3"]).run().unwrap();
/// assert_eq!(code, 3);
/// ```
#[derive(Debug, Clone)]
pub struct PtyRelay {
    argv: Vec<String>,
    cancel: Option<CancelToken>,
}

impl PtyRelay {
    /// Creates a relay for `argv`, program first.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cancel: None,
        }
    }

    /// Forwards SIGINT to the command once `cancel` is raised.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Runs the command to completion and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::BinaryMissing` if the program does not exist and
    /// other variants if the terminal cannot be set up.
    pub fn run(&self) -> Result<i32, RelayError> {
        let (program, args) = self.argv.split_first().ok_or(RelayError::EmptyCommand)?;

        let initial_size = window_size(io::stdout().as_fd());
        let pty = openpty(initial_size.as_ref(), None).map_err(RelayError::OpenPty)?;
        let mut child = spawn_attached(program, args, &pty.slave)?;
        // Only the child may hold the slave, or the master never sees EOF.
        drop(pty.slave);
        let master = File::from(pty.master);
        debug!(pid = child.id(), "Relaying {program} through a pseudo-terminal");

        let resized = Arc::new(AtomicBool::new(false));
        let sigwinch = signal_hook::flag::register(signal_hook::consts::SIGWINCH, Arc::clone(&resized))
            .map_err(|e| RelayError::Io {
                context: "installing SIGWINCH handler".to_string(),
                source: e,
            })?;

        let relayed = {
            let _raw_mode = RawModeGuard::enable()?;
            self.relay(&mut child, &master, &resized)
        };
        signal_hook::low_level::unregister(sigwinch);
        relayed?;

        let status = child.wait().map_err(|e| RelayError::Io {
            context: format!("waiting for {program}"),
            source: e,
        })?;
        debug!(%status, "Relayed command exited");
        Ok(exit_code_from_status(status))
    }

    fn relay(&self, child: &mut Child, master: &File, resized: &AtomicBool) -> Result<(), RelayError> {
        let stdin = io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map(File::from)
            .map_err(|e| RelayError::Io {
                context: "duplicating stdin".to_string(),
                source: e,
            })?;
        let mut stdout = io::stdout().lock();
        let mut stdin_open = true;
        let mut interrupt_forwarded = false;
        let mut buffer = [0u8; BUFFER_SIZE];

        loop {
            if resized.swap(false, Ordering::SeqCst) {
                copy_window_size(io::stdout().as_fd(), master.as_fd());
            }

            if !interrupt_forwarded && self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                forward_interrupt(child);
                interrupt_forwarded = true;
            }

            let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            let (master_ready, stdin_ready) = {
                let mut fds = vec![PollFd::new(master.as_fd(), PollFlags::POLLIN)];
                if stdin_open {
                    fds.push(PollFd::new(stdin.as_fd(), PollFlags::POLLIN));
                }
                match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(RelayError::Terminal {
                            context: "polling".to_string(),
                            source: e,
                        });
                    }
                }
                let ready = |fd: &PollFd<'_>| fd.revents().is_some_and(|r| r.intersects(readable));
                (ready(&fds[0]), fds.get(1).is_some_and(ready))
            };

            if master_ready {
                match read_chunk(master, &mut buffer) {
                    Some(0) | None => break,
                    Some(n) => write_all(&mut stdout, &buffer[..n])?,
                }
            }

            if stdin_ready {
                match read_chunk(&stdin, &mut buffer) {
                    Some(0) | None => {
                        trace!("stdin closed");
                        stdin_open = false;
                    }
                    Some(n) => write_all(&mut (&*master), &buffer[..n])?,
                }
            }

            if !master_ready && child_exited(child)? {
                drain(master, &mut stdout, &mut buffer)?;
                break;
            }
        }

        Ok(())
    }
}

/// Reads once; `None` for EOF-like errors such as `EIO` on a closed master.
fn read_chunk(mut source: &File, buffer: &mut [u8]) -> Option<usize> {
    loop {
        match source.read(buffer) {
            Ok(n) => return Some(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                trace!(error = %e, "Read ended");
                return None;
            }
        }
    }
}

/// Copies whatever is already buffered in `source`, without blocking.
fn drain(source: &File, out: &mut impl Write, buffer: &mut [u8]) -> Result<(), RelayError> {
    loop {
        let mut fds = [PollFd::new(source.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                trace!(error = %e, "Drain ended");
                return Ok(());
            }
        }
        match read_chunk(source, buffer) {
            Some(0) | None => return Ok(()),
            Some(n) => write_all(out, &buffer[..n])?,
        }
    }
}

fn write_all(out: &mut impl Write, data: &[u8]) -> Result<(), RelayError> {
    out.write_all(data)
        .and_then(|()| out.flush())
        .map_err(|e| RelayError::Io {
            context: "forwarding output".to_string(),
            source: e,
        })
}

fn child_exited(child: &mut Child) -> Result<bool, RelayError> {
    child
        .try_wait()
        .map(|status| status.is_some())
        .map_err(|e| RelayError::Io {
            context: "polling child status".to_string(),
            source: e,
        })
}

/// Sends SIGINT to `child`, logging failures.
pub(crate) fn forward_interrupt(child: &Child) {
    let pid = Pid::from_raw(child.id() as i32);
    if let Err(e) = signal::kill(pid, Signal::SIGINT) {
        warn!(error = %e, "Failed to forward interrupt");
    }
}

/// Spawns `program` in a new session with `slave` as controlling terminal.
fn spawn_attached(program: &str, args: &[String], slave: &OwnedFd) -> Result<Child, RelayError> {
    let stdio = || {
        slave.try_clone().map(Stdio::from).map_err(|e| RelayError::Io {
            context: "duplicating pseudo-terminal".to_string(),
            source: e,
        })
    };

    let mut command = Command::new(program);
    command.args(args).stdin(stdio()?).stdout(stdio()?).stderr(stdio()?);

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    command.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => RelayError::BinaryMissing {
            command: program.to_string(),
        },
        _ => RelayError::Io {
            context: format!("spawning {program}"),
            source: e,
        },
    })
}

/// Window size of `fd`, if it is a terminal.
fn window_size(fd: BorrowedFd<'_>) -> Option<Winsize> {
    let mut size = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: `size` is a valid, writable winsize.
    unsafe { get_window_size(fd.as_raw_fd(), &mut size) }.ok()?;
    Some(size)
}

fn copy_window_size(from: BorrowedFd<'_>, to: BorrowedFd<'_>) {
    let Some(size) = window_size(from) else {
        return;
    };
    trace!(rows = size.ws_row, cols = size.ws_col, "Copying window size");
    // SAFETY: `size` is a valid winsize that outlives the call.
    if let Err(e) = unsafe { set_window_size(to.as_raw_fd(), &size) } {
        debug!(error = %e, "Failed to set window size");
    }
}

/// Puts stdin into raw mode and restores it on drop.
struct RawModeGuard {
    fd: OwnedFd,
    original: Termios,
}

impl RawModeGuard {
    /// `None` if stdin is not a terminal.
    fn enable() -> Result<Option<Self>, RelayError> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }

        let fd = stdin.as_fd().try_clone_to_owned().map_err(|e| RelayError::Io {
            context: "duplicating stdin".to_string(),
            source: e,
        })?;
        let terminal_error = |context: &str| {
            let context = context.to_string();
            move |source| RelayError::Terminal { context, source }
        };

        let original = termios::tcgetattr(&fd).map_err(terminal_error("reading attributes"))?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&fd, SetArg::TCSANOW, &raw).map_err(terminal_error("entering raw mode"))?;

        Ok(Some(Self { fd, original }))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(&self.fd, SetArg::TCSANOW, &self.original) {
            warn!(error = %e, "Failed to restore terminal attributes");
        }
    }
}
