//! Mount plan for the sandbox filesystem.
//!
//! This module turns a launch configuration into the ordered list of
//! filesystem operations the namespace engine performs, together with the
//! environment the sandboxed program starts with:
//!
//! - tmpfs for `/`, `/tmp` and the home directory
//! - read-only binds of the host system directories (or symlinks where the
//!   host has symlinks, e.g. `/lib -> usr/lib`)
//! - a fresh devtmpfs at `/dev` plus the host's `/dev/dri` for GPU access
//! - a fresh procfs at `/proc`
//! - optional binds for networking, sound, X11, `~/.wine` and user paths
//!
//! # Ordering
//!
//! The engine applies mount operations strictly in argv order, and a later
//! operation at an equal or nested path shadows an earlier one. Tasks are
//! therefore sorted ascending by target (byte order), which establishes `/`
//! before anything below it.
//!
//! # Missing host paths
//!
//! A bind whose host source is missing aborts the plan when the task is
//! required and is dropped with a diagnostic otherwise. The X11 socket is the
//! one exception: it only appears once the display server runs, after the
//! plan is built.

use std::collections::BTreeMap;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};

use super::config::{AccessMode, BindSpec, LaunchConfig};
use super::host::{HostContext, HostFs};
use crate::display::X11Display;
use crate::error::MountError;

/// Host resolver configuration files bound when networking is enabled.
pub const RESOLVER_PATHS: &[&str] = &[
    "/run/NetworkManager/resolv.conf",
    "/run/systemd/resolve/resolv.conf",
    "/run/systemd/resolve/stub-resolv.conf",
];

/// Variables copied from the host environment when present.
pub const INHERITED_ENV_VARS: &[&str] = &["HOME", "TERM", "USER", "WINEDEBUG"];

/// Kind of filesystem operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountMode {
    /// Fresh, empty tmpfs.
    Tmpfs,
    /// Fresh devtmpfs with the minimal device set.
    DevTmpfs,
    /// Fresh procfs.
    Proc,
    /// Read-only bind of a host path.
    BindReadOnly,
    /// Read-write bind of a host path.
    BindReadWrite,
    /// Bind of a host path that keeps device access.
    BindDevice,
    /// Symlink whose payload is `source`.
    Symlink,
}

impl MountMode {
    /// Whether the operation exposes a host path.
    #[must_use]
    pub fn is_bind(self) -> bool {
        matches!(
            self,
            MountMode::BindReadOnly | MountMode::BindReadWrite | MountMode::BindDevice
        )
    }
}

impl From<AccessMode> for MountMode {
    fn from(access: AccessMode) -> Self {
        match access {
            AccessMode::ReadOnly => MountMode::BindReadOnly,
            AccessMode::ReadWrite => MountMode::BindReadWrite,
        }
    }
}

/// One filesystem operation inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTask {
    /// Kind of operation.
    pub mode: MountMode,
    /// Absolute path inside the sandbox.
    pub target: PathBuf,
    /// Host path, or link payload for symlinks; defaults to `target`.
    pub source: Option<PathBuf>,
    /// Whether a missing host source is fatal.
    pub required: bool,
}

impl MountTask {
    /// Creates a required task with `source == target`.
    #[must_use]
    pub fn new(mode: MountMode, target: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            target: target.into(),
            source: None,
            required: true,
        }
    }

    /// Sets an explicit source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Marks the task as best-effort.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// The effective source path.
    #[must_use]
    pub fn source(&self) -> &Path {
        self.source.as_deref().unwrap_or(&self.target)
    }
}

/// Value of one sandbox environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvTask {
    /// Copy from the host if set there, omit otherwise.
    Inherit,
    /// Use exactly this value.
    Set(String),
}

/// Something the plan left out, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDiagnostic {
    /// An optional bind whose host source does not exist.
    DroppedMount { target: PathBuf },
    /// A search-path entry that would not be visible in the sandbox.
    DroppedSearchPath { path: PathBuf },
}

/// Inputs of plan building that come from the launch configuration.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// Share the host network.
    pub network: bool,
    /// Expose the PulseAudio socket.
    pub pulseaudio: bool,
    /// Display whose socket is bound, if any.
    pub display: Option<X11Display>,
    /// Host directory for `~/.wine`.
    pub dotwine: Option<BindSpec>,
    /// Additional binds.
    pub extra_binds: Vec<BindSpec>,
    /// Program as given by the user.
    pub program: Option<String>,
    /// Whether the program runs under Wine.
    pub with_wine: bool,
    /// Hostname inside the sandbox.
    pub hostname: String,
}

impl PlanRequest {
    /// Derives a request from a launch configuration.
    #[must_use]
    pub fn from_config(
        config: &LaunchConfig,
        display: Option<X11Display>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            network: config.network,
            pulseaudio: config.pulseaudio,
            display,
            dotwine: config.dotwine.clone(),
            extra_binds: config.extra_binds.clone(),
            program: config.program.clone(),
            with_wine: config.with_wine,
            hostname: hostname.into(),
        }
    }
}

/// The resolved filesystem and environment layout of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    /// Operations in the order the engine must apply them.
    pub tasks: Vec<MountTask>,
    /// Environment of the sandboxed program.
    pub env: BTreeMap<String, EnvTask>,
    /// Host search-path entries that remain reachable.
    pub search_path: Vec<PathBuf>,
    /// Hostname inside the sandbox.
    pub hostname: String,
    /// Whether the host network is shared.
    pub share_network: bool,
    /// Whether the `~/.wine` host directory was created just now.
    pub state_dir_created: bool,
    /// What was left out and why.
    pub diagnostics: Vec<PlanDiagnostic>,
}

impl MountPlan {
    /// Resolves [`EnvTask::Inherit`] entries against the host, in name order.
    ///
    /// Variables without a value are skipped.
    #[must_use]
    pub fn resolved_env(&self, ctx: &HostContext) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|(name, task)| {
                let value = match task {
                    EnvTask::Set(value) => value.clone(),
                    EnvTask::Inherit => ctx.var(name)?.to_string(),
                };
                Some((name.clone(), value))
            })
            .collect()
    }
}

/// Returns the fixed base tasks present in every sandbox.
#[must_use]
pub fn base_tasks(home: &Path) -> Vec<MountTask> {
    vec![
        MountTask::new(MountMode::Tmpfs, "/"),
        MountTask::new(MountMode::BindReadOnly, "/bin"),
        MountTask::new(MountMode::DevTmpfs, "/dev"),
        MountTask::new(MountMode::BindDevice, "/dev/dri"),
        MountTask::new(MountMode::BindReadOnly, "/etc"),
        MountTask::new(MountMode::BindReadOnly, "/lib"),
        MountTask::new(MountMode::BindReadOnly, "/lib32").optional(),
        MountTask::new(MountMode::BindReadOnly, "/lib64"),
        MountTask::new(MountMode::Proc, "/proc"),
        MountTask::new(MountMode::BindReadOnly, "/sys"),
        MountTask::new(MountMode::Tmpfs, "/tmp"),
        MountTask::new(MountMode::BindReadOnly, "/usr"),
        MountTask::new(MountMode::Tmpfs, home),
    ]
}

/// Builds the mount plan for one launch.
///
/// Creates the `~/.wine` host directory (mode 0700) when it is configured but
/// absent; that is the only side effect.
///
/// # Errors
///
/// Returns `MountError::MissingRequiredPath` if a required bind source is
/// absent, and `MountError::CreateDir` if the `~/.wine` directory cannot be
/// created.
#[instrument(skip_all, fields(network = request.network, display = ?request.display))]
pub fn build_mount_plan(
    request: &PlanRequest,
    ctx: &HostContext,
    fs: &dyn HostFs,
) -> Result<MountPlan, MountError> {
    debug!("Building mount plan");

    let home = fs.real_path(&ctx.home);
    let mut tasks: Vec<MountTask> = base_tasks(&home)
        .into_iter()
        .map(|task| reproduce_host_symlink(task, fs))
        .collect();

    let mut env: BTreeMap<String, EnvTask> = INHERITED_ENV_VARS
        .iter()
        .map(|name| ((*name).to_string(), EnvTask::Inherit))
        .collect();
    env.insert(
        "HOSTNAME".to_string(),
        EnvTask::Set(request.hostname.clone()),
    );

    if request.network {
        tasks.extend(
            RESOLVER_PATHS
                .iter()
                .map(|path| MountTask::new(MountMode::BindReadOnly, path).optional()),
        );
    }

    if request.pulseaudio {
        let socket = PathBuf::from(format!("/run/user/{}/pulse/native", ctx.uid));
        env.insert(
            "PULSE_SERVER".to_string(),
            EnvTask::Set(format!("unix:{}", socket.display())),
        );
        tasks.push(MountTask::new(MountMode::BindReadWrite, socket));
    }

    let pending_socket = request.display.as_ref().map(X11Display::socket_path);
    if let Some(display) = &request.display {
        tasks.push(MountTask::new(
            MountMode::BindReadWrite,
            display.socket_path(),
        ));
        env.insert("DISPLAY".to_string(), EnvTask::Set(display.to_string()));
    }

    let dotwine_target = ctx.home.join(".wine");
    let mut state_dir_created = false;
    match &request.dotwine {
        Some(spec) => {
            let source = absolutize(&spec.path);
            if !fs.exists(&source) {
                debug!(path = %source.display(), "Creating directory");
                fs.create_private_dir(&source)
                    .map_err(|e| MountError::CreateDir {
                        path: source.clone(),
                        source: e,
                    })?;
                state_dir_created = true;
            }
            tasks.push(MountTask::new(spec.access.into(), dotwine_target).with_source(source));
        }
        None => tasks.push(MountTask::new(MountMode::Tmpfs, dotwine_target)),
    }

    for spec in &request.extra_binds {
        tasks.push(MountTask::new(spec.access.into(), absolutize(&spec.path)));
    }

    if let Some(program) = request.program.as_deref().filter(|p| p.contains('/')) {
        let real = fs.real_path(&absolutize(Path::new(program)));
        let mut candidates = vec![real.clone()];
        if request.with_wine {
            candidates.push(with_suffix(&real, ".exe"));
            candidates.push(with_suffix(&real, ".EXE"));
        }
        tasks.extend(
            candidates
                .into_iter()
                .map(|path| MountTask::new(MountMode::BindReadOnly, path).optional()),
        );
    }

    sort_by_target(&mut tasks);

    let mut diagnostics = Vec::new();
    let tasks = drop_missing_sources(tasks, pending_socket.as_deref(), fs, &mut diagnostics)?;

    let search_path = filter_search_path(
        ctx.var("PATH").unwrap_or_default(),
        &tasks,
        fs,
        &mut diagnostics,
    );
    env.insert(
        "PATH".to_string(),
        EnvTask::Set(join_search_path(&search_path)),
    );

    debug!(
        tasks = tasks.len(),
        dropped = diagnostics.len(),
        "Mount plan complete"
    );
    Ok(MountPlan {
        tasks,
        env,
        search_path,
        hostname: request.hostname.clone(),
        share_network: request.network,
        state_dir_created,
        diagnostics,
    })
}

/// Replaces a bind of a host symlink by an equivalent symlink task.
fn reproduce_host_symlink(task: MountTask, fs: &dyn HostFs) -> MountTask {
    if !task.mode.is_bind() {
        return task;
    }
    match fs.symlink_target(task.source()) {
        Some(link) => {
            trace!(target = %task.target.display(), link = %link.display(), "Reproducing host symlink");
            MountTask {
                mode: MountMode::Symlink,
                source: Some(link),
                ..task
            }
        }
        None => task,
    }
}

/// Sorts tasks ascending by target, byte-wise. The sort is stable.
pub fn sort_by_target(tasks: &mut [MountTask]) {
    tasks.sort_by(|a, b| {
        a.target
            .as_os_str()
            .as_bytes()
            .cmp(b.target.as_os_str().as_bytes())
    });
}

fn drop_missing_sources(
    tasks: Vec<MountTask>,
    pending_socket: Option<&Path>,
    fs: &dyn HostFs,
    diagnostics: &mut Vec<PlanDiagnostic>,
) -> Result<Vec<MountTask>, MountError> {
    let mut kept = Vec::with_capacity(tasks.len());

    for task in tasks {
        let appears_later = pending_socket == Some(task.target.as_path());
        if task.mode.is_bind() && !appears_later && !fs.exists(task.source()) {
            if task.required {
                return Err(MountError::MissingRequiredPath {
                    path: task.source().to_path_buf(),
                });
            }
            debug!(
                path = %task.source().display(),
                "Path does not exist on the host, dropped from mount tasks"
            );
            diagnostics.push(PlanDiagnostic::DroppedMount {
                target: task.target.clone(),
            });
            continue;
        }
        kept.push(task);
    }

    Ok(kept)
}

/// Keeps the search-path entries that resolve into a bound host path.
///
/// Each entry is resolved to its real path and matched against the tasks in
/// descending target order; the first bind whose target is the entry or one
/// of its ancestors keeps it. Comparison uses a guaranteed trailing `/`, so
/// `/usr2/bin` does not match a bind of `/usr`. An empty entry stands for the
/// current directory and goes through the same check.
pub fn filter_search_path(
    host_path: &str,
    sorted_tasks: &[MountTask],
    fs: &dyn HostFs,
    diagnostics: &mut Vec<PlanDiagnostic>,
) -> Vec<PathBuf> {
    let mut available = Vec::new();

    for entry in host_path.split(':') {
        let entry = if entry.is_empty() { CURRENT_DIR } else { entry };
        let candidate = fs.real_path(Path::new(entry));
        let candidate_key = with_trailing_separator(&candidate);

        let reachable = sorted_tasks.iter().rev().any(|task| {
            task.mode.is_bind() && candidate_key.starts_with(&with_trailing_separator(&task.target))
        });

        if reachable {
            available.push(candidate);
        } else {
            debug!(
                path = %candidate.display(),
                "Path will not exist in sandbox mount stack, dropped from PATH"
            );
            diagnostics.push(PlanDiagnostic::DroppedSearchPath { path: candidate });
        }
    }

    available
}

const CURRENT_DIR: &str = ".";

fn join_search_path(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join(":")
}

fn with_trailing_separator(path: &Path) -> String {
    let mut text = path.to_string_lossy().trim_end_matches('/').to_string();
    text.push('/');
    text
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut text = path.as_os_str().to_os_string();
    text.push(suffix);
    PathBuf::from(text)
}

fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_tasks_cover_system_dirs() {
        let tasks = base_tasks(Path::new("/home/alice"));
        let targets: Vec<_> = tasks.iter().map(|t| t.target.clone()).collect();
        for dir in ["/", "/bin", "/dev", "/etc", "/lib", "/proc", "/sys", "/tmp", "/usr"] {
            assert!(targets.contains(&PathBuf::from(dir)), "missing {dir}");
        }
        assert!(targets.contains(&PathBuf::from("/home/alice")));

        let lib32 = tasks
            .iter()
            .find(|t| t.target == Path::new("/lib32"))
            .expect("lib32 task");
        assert!(!lib32.required);
    }

    #[test]
    fn test_source_defaults_to_target() {
        let task = MountTask::new(MountMode::BindReadOnly, "/usr");
        assert_eq!(task.source(), Path::new("/usr"));

        let task = task.with_source("/opt/usr");
        assert_eq!(task.source(), Path::new("/opt/usr"));
    }

    #[test]
    fn test_sort_is_bytewise() {
        let mut tasks = vec![
            MountTask::new(MountMode::BindReadOnly, "/a/b"),
            MountTask::new(MountMode::BindReadOnly, "/a-b"),
            MountTask::new(MountMode::Tmpfs, "/"),
        ];
        sort_by_target(&mut tasks);
        let targets: Vec<_> = tasks.iter().map(|t| t.target.to_str().unwrap_or("")).collect();
        assert_eq!(targets, vec!["/", "/a-b", "/a/b"]);
    }

    #[test]
    fn test_access_mode_maps_to_bind() {
        assert_eq!(MountMode::from(AccessMode::ReadOnly), MountMode::BindReadOnly);
        assert_eq!(MountMode::from(AccessMode::ReadWrite), MountMode::BindReadWrite);
        assert!(MountMode::BindDevice.is_bind());
        assert!(!MountMode::Symlink.is_bind());
        assert!(!MountMode::Tmpfs.is_bind());
    }

    #[test]
    fn test_trailing_separator() {
        assert_eq!(with_trailing_separator(Path::new("/usr/")), "/usr/");
        assert_eq!(with_trailing_separator(Path::new("/usr")), "/usr/");
        assert_eq!(with_trailing_separator(Path::new("/")), "/");
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("/games/setup"), ".exe"),
            PathBuf::from("/games/setup.exe")
        );
    }
}
