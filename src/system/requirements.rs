//! Host binaries a launch depends on.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::EngineError;

/// The namespace engine.
pub const ENGINE_COMMAND: &str = "bwrap";

/// Engine flag that must be supported (bubblewrap >= 0.8.0).
pub const REQUIRED_ENGINE_FLAG: &str = "--disable-userns";

/// Guest runtime used to run Windows programs.
pub const GUEST_RUNTIME_COMMAND: &str = "wine";

/// Resolved locations of the binaries a launch needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirements {
    /// Path of the namespace engine.
    pub engine: PathBuf,
    /// Path of the guest runtime, when it is used.
    pub guest_runtime: Option<PathBuf>,
}

/// Checks the engine and, if `with_wine`, the guest runtime.
///
/// # Errors
///
/// Returns the first failing check.
pub fn check_all(with_wine: bool) -> Result<Requirements, EngineError> {
    let engine = check_engine(ENGINE_COMMAND)?;
    let guest_runtime = if with_wine {
        Some(require_binary(GUEST_RUNTIME_COMMAND)?)
    } else {
        None
    };

    Ok(Requirements {
        engine,
        guest_runtime,
    })
}

/// Locates `command` on the search path.
///
/// # Errors
///
/// Returns `EngineError::MissingBinary` if it cannot be found.
pub fn require_binary(command: &str) -> Result<PathBuf, EngineError> {
    which::which(command).map_err(|_| EngineError::MissingBinary {
        command: command.to_string(),
    })
}

/// Locates the engine and verifies it supports [`REQUIRED_ENGINE_FLAG`].
///
/// # Errors
///
/// Returns `EngineError::MissingBinary` if the engine is not installed,
/// `EngineError::Unsupported` if it is too old, and `EngineError::Probe` if
/// its help text cannot be obtained.
pub fn check_engine(command: &str) -> Result<PathBuf, EngineError> {
    let path = require_binary(command)?;
    let help = engine_help(command, &path)?;

    if !help.contains(REQUIRED_ENGINE_FLAG) {
        return Err(EngineError::Unsupported {
            command: command.to_string(),
            flag: REQUIRED_ENGINE_FLAG.to_string(),
        });
    }

    debug!(path = %path.display(), "Engine supports {REQUIRED_ENGINE_FLAG}");
    Ok(path)
}

fn engine_help(command: &str, path: &Path) -> Result<String, EngineError> {
    let output = Command::new(path)
        .arg("--help")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| EngineError::Probe {
            command: command.to_string(),
            source: e,
        })?;

    // Some builds print usage to stderr.
    let mut help = String::from_utf8_lossy(&output.stdout).into_owned();
    help.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(help)
}
