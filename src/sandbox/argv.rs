//! Compiles a [`MountPlan`] into the namespace engine's command line.
//!
//! The command is kept as a list of groups, one per logical stage, so it can
//! be printed as an auditable transcript before it runs:
//!
//! ```text
//! # bwrap \
//!     --new-session \
//!     ...
//!     -- \
//!     sh -c 'wineserver -p0 && "$0" "$@" ; ret=$? ; wineserver -k ; exit ${ret}' \
//!     wine notepad.exe
//! ```
//!
//! Compilation is pure: the same plan and payload always produce the same
//! command.

use std::fmt;
use std::io::{self, Write};

use tracing::debug;

use super::host::HostContext;
use super::mounts::{MountMode, MountPlan, MountTask};
use crate::system::ENGINE_COMMAND;

/// Starts a wineserver before the payload and kills it afterwards, keeping
/// the payload's exit code.
pub const WINESERVER_WRAPPER: &str =
    r#"wineserver -p0 && "$0" "$@" ; ret=$? ; wineserver -k ; exit ${ret}"#;

/// Runs winecfg once, then replaces itself with the payload on success.
pub const WINECFG_WRAPPER: &str = r#"winecfg && exec "$0" "$@""#;

/// Runs the payload a second time if the first attempt fails.
pub const RETRY_WRAPPER: &str = r#""$0" "$@" || exec "$0" "$@""#;

/// What runs inside the sandbox, and how it is wrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Program to run; `true` is run when absent.
    pub program: Option<String>,
    /// Program arguments.
    pub args: Vec<String>,
    /// Run through `wine` with a managed wineserver.
    pub with_wine: bool,
    /// Run winecfg first.
    pub configure: bool,
    /// Try twice.
    pub retry: bool,
}

/// Decides whether the one-time winecfg step runs.
///
/// It needs a display and Wine, and runs when forced, when the `~/.wine`
/// host directory was just created, or when `~/.wine` is an empty tmpfs.
#[must_use]
pub fn needs_configure(
    forced: bool,
    display_active: bool,
    with_wine: bool,
    ephemeral_state: bool,
    state_dir_created: bool,
) -> bool {
    display_active && with_wine && (forced || ephemeral_state || state_dir_created)
}

/// The engine command line, grouped by stage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledCommand {
    groups: Vec<Vec<String>>,
}

impl CompiledCommand {
    /// Appends a group; empty groups are skipped.
    pub(crate) fn add<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group: Vec<String> = args.into_iter().map(Into::into).collect();
        if !group.is_empty() {
            self.groups.push(group);
        }
    }

    /// All groups in order.
    #[must_use]
    pub fn groups(&self) -> &[Vec<String>] {
        &self.groups
    }

    /// Arguments in execution order.
    pub fn iter_flat(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().flatten().map(String::as_str)
    }

    /// Flat argument vector, program first.
    #[must_use]
    pub fn to_argv(&self) -> Vec<String> {
        self.iter_flat().map(str::to_string).collect()
    }

    /// Groups after the `--` separator: wrappers and the payload.
    ///
    /// Flattened, these form a command line that can run outside the sandbox.
    #[must_use]
    pub fn payload_groups(&self) -> &[Vec<String>] {
        let separator = self
            .groups
            .iter()
            .position(|group| group.len() == 1 && group[0] == "--");
        match separator {
            Some(index) => &self.groups[index + 1..],
            None => &[],
        }
    }

    /// Writes the transcript to `out`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn announce_to(&self, out: &mut impl Write) -> io::Result<()> {
        write!(out, "{self}")
    }
}

impl fmt::Display for CompiledCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.groups.len().saturating_sub(1);
        for (index, group) in self.groups.iter().enumerate() {
            let prefix = if index == 0 { "# " } else { "    " };
            let suffix = if index == last { "" } else { " \\" };
            let quoted = shell_words::join(group);
            writeln!(f, "{prefix}{quoted}{suffix}")?;
        }
        Ok(())
    }
}

/// Compiles the engine invocation.
///
/// `ctx` resolves inherited environment variables.
#[must_use]
pub fn compile(plan: &MountPlan, payload: &Payload, ctx: &HostContext) -> CompiledCommand {
    let mut command = CompiledCommand::default();

    command.add([ENGINE_COMMAND]);
    command.add(["--new-session"]);
    command.add(["--disable-userns"]);
    command.add(["--die-with-parent"]);
    command.add(["--hostname", plan.hostname.as_str()]);

    let mut unshare = vec!["--unshare-all"];
    if plan.share_network {
        unshare.push("--share-net");
    }
    command.add(unshare);

    for task in &plan.tasks {
        command.add(mount_args(task));
    }

    command.add(["--clearenv"]);
    for (name, value) in plan.resolved_env(ctx) {
        command.add(["--setenv".to_string(), name, value]);
    }
    command.add(["--"]);

    if payload.with_wine {
        command.add(["sh", "-c", WINESERVER_WRAPPER]);
    }
    if payload.configure && payload.with_wine {
        command.add(["sh", "-c", WINECFG_WRAPPER]);
    }
    if payload.retry {
        command.add(["sh", "-c", RETRY_WRAPPER]);
    }

    match &payload.program {
        Some(program) => {
            let mut invocation = Vec::with_capacity(payload.args.len() + 2);
            if payload.with_wine {
                invocation.push("wine".to_string());
            }
            invocation.push(program.clone());
            invocation.extend(payload.args.iter().cloned());
            command.add(invocation);
        }
        None => command.add(["true"]),
    }

    debug!(groups = command.groups.len(), "Compiled sandbox command");
    command
}

fn mount_args(task: &MountTask) -> Vec<String> {
    let target = task.target.to_string_lossy().into_owned();
    let source = task.source().to_string_lossy().into_owned();

    let (flag, with_source) = match task.mode {
        MountMode::Tmpfs => ("--tmpfs", false),
        MountMode::DevTmpfs => ("--dev", false),
        MountMode::Proc => ("--proc", false),
        MountMode::BindReadOnly => ("--ro-bind", true),
        MountMode::BindReadWrite => ("--bind", true),
        MountMode::BindDevice => ("--dev-bind", true),
        MountMode::Symlink => ("--symlink", true),
    };

    if with_source {
        vec![flag.to_string(), source, target]
    } else {
        vec![flag.to_string(), target]
    }
}
