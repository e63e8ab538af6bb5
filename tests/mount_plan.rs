//! Integration tests for mount plan building.
//!
//! The host is described by a fake filesystem, so these tests do not depend
//! on the layout of the machine running them.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use winecell::display::X11Display;
use winecell::error::MountError;
use winecell::sandbox::{
    AccessMode, BindSpec, EnvTask, HostContext, HostFs, MountMode, MountPlan, MountTask,
    PlanDiagnostic, PlanRequest, build_mount_plan, filter_search_path,
};

/// In-memory host filesystem.
#[derive(Debug, Default)]
struct FakeFs {
    existing: BTreeSet<PathBuf>,
    symlinks: BTreeMap<PathBuf, PathBuf>,
    real_paths: BTreeMap<PathBuf, PathBuf>,
    created: RefCell<Vec<PathBuf>>,
}

impl FakeFs {
    /// A host with every required base directory.
    fn standard() -> Self {
        let mut fs = Self::default();
        for path in ["/bin", "/dev/dri", "/etc", "/lib", "/lib64", "/sys", "/usr", "/usr/bin"] {
            fs.add(path);
        }
        fs
    }

    fn add(&mut self, path: &str) -> &mut Self {
        self.existing.insert(PathBuf::from(path));
        self
    }

    fn remove(&mut self, path: &str) -> &mut Self {
        self.existing.remove(Path::new(path));
        self
    }

    fn link(&mut self, path: &str, raw_target: &str, resolved: &str) -> &mut Self {
        self.symlinks.insert(PathBuf::from(path), PathBuf::from(raw_target));
        self.real_paths.insert(PathBuf::from(path), PathBuf::from(resolved));
        self
    }
}

impl HostFs for FakeFs {
    fn exists(&self, path: &Path) -> bool {
        let resolved = self.real_path(path);
        self.existing.contains(&resolved) || self.created.borrow().contains(&resolved)
    }

    fn symlink_target(&self, path: &Path) -> Option<PathBuf> {
        self.symlinks.get(path).cloned()
    }

    fn real_path(&self, path: &Path) -> PathBuf {
        self.real_paths
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_path_buf())
    }

    fn create_private_dir(&self, path: &Path) -> io::Result<()> {
        self.created.borrow_mut().push(path.to_path_buf());
        Ok(())
    }
}

fn context() -> HostContext {
    HostContext::new("/home/alice", 1000)
        .with_env("HOME", "/home/alice")
        .with_env("PATH", "/usr/bin")
        .with_env("USER", "alice")
}

fn request() -> PlanRequest {
    PlanRequest {
        network: false,
        pulseaudio: false,
        display: None,
        dotwine: None,
        extra_binds: Vec::new(),
        program: Some("notepad.exe".to_string()),
        with_wine: true,
        hostname: "winecell-test".to_string(),
    }
}

fn find<'a>(plan: &'a MountPlan, target: &str) -> Option<&'a MountTask> {
    plan.tasks.iter().find(|task| task.target == Path::new(target))
}

fn env_value<'a>(plan: &'a MountPlan, name: &str) -> Option<&'a str> {
    match plan.env.get(name) {
        Some(EnvTask::Set(value)) => Some(value.as_str()),
        _ => None,
    }
}

#[test]
fn test_tasks_are_sorted_bytewise() {
    let mut fs = FakeFs::standard();
    fs.add("/srv/a-b").add("/srv/a/b").add("/run/systemd/resolve/resolv.conf");

    let request = PlanRequest {
        network: true,
        extra_binds: vec![
            BindSpec::new("/srv/a/b", AccessMode::ReadOnly),
            BindSpec::new("/srv/a-b", AccessMode::ReadWrite),
        ],
        ..request()
    };
    let plan = build_mount_plan(&request, &context(), &fs).expect("plan should build");

    let targets: Vec<&[u8]> = plan
        .tasks
        .iter()
        .map(|task| task.target.as_os_str().as_bytes())
        .collect();
    assert!(targets.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(plan.tasks[0].target, Path::new("/"));
}

#[test]
fn test_base_layout() {
    let plan = build_mount_plan(&request(), &context(), &FakeFs::standard()).expect("plan");

    assert_eq!(find(&plan, "/").map(|t| t.mode), Some(MountMode::Tmpfs));
    assert_eq!(find(&plan, "/dev").map(|t| t.mode), Some(MountMode::DevTmpfs));
    assert_eq!(find(&plan, "/dev/dri").map(|t| t.mode), Some(MountMode::BindDevice));
    assert_eq!(find(&plan, "/proc").map(|t| t.mode), Some(MountMode::Proc));
    assert_eq!(find(&plan, "/usr").map(|t| t.mode), Some(MountMode::BindReadOnly));
    assert_eq!(find(&plan, "/home/alice").map(|t| t.mode), Some(MountMode::Tmpfs));
    assert_eq!(
        find(&plan, "/home/alice/.wine").map(|t| t.mode),
        Some(MountMode::Tmpfs)
    );
}

#[test]
fn test_missing_required_path_aborts() {
    let mut fs = FakeFs::standard();
    fs.remove("/lib64");

    let result = build_mount_plan(&request(), &context(), &fs);
    match result {
        Err(MountError::MissingRequiredPath { path }) => assert_eq!(path, Path::new("/lib64")),
        other => panic!("expected missing path error, got {other:?}"),
    }
}

#[test]
fn test_missing_extra_bind_aborts() {
    let request = PlanRequest {
        extra_binds: vec![BindSpec::new("/srv/missing", AccessMode::ReadOnly)],
        ..request()
    };
    let result = build_mount_plan(&request, &context(), &FakeFs::standard());
    assert!(matches!(result, Err(MountError::MissingRequiredPath { .. })));
}

#[test]
fn test_missing_optional_path_is_dropped() {
    let plan = build_mount_plan(&request(), &context(), &FakeFs::standard()).expect("plan");

    assert!(find(&plan, "/lib32").is_none());
    assert!(plan.diagnostics.contains(&PlanDiagnostic::DroppedMount {
        target: PathBuf::from("/lib32"),
    }));
}

#[test]
fn test_resolver_configuration_is_best_effort() {
    let mut fs = FakeFs::standard();
    fs.add("/run/systemd/resolve/stub-resolv.conf");
    let request = PlanRequest {
        network: true,
        ..request()
    };

    let plan = build_mount_plan(&request, &context(), &fs).expect("plan");
    assert!(plan.share_network);
    assert!(find(&plan, "/run/systemd/resolve/stub-resolv.conf").is_some());
    assert!(find(&plan, "/run/systemd/resolve/resolv.conf").is_none());
    assert!(find(&plan, "/run/NetworkManager/resolv.conf").is_none());
}

#[test]
fn test_search_path_filtering() {
    let mut fs = FakeFs::standard();
    fs.add("/usr2/bin").add("/opt/bin");
    let ctx = context().with_env("PATH", "/usr/bin:/usr2/bin:/opt/bin");

    let plan = build_mount_plan(&request(), &ctx, &fs).expect("plan");
    assert_eq!(plan.search_path, vec![PathBuf::from("/usr/bin")]);
    assert_eq!(env_value(&plan, "PATH"), Some("/usr/bin"));
    assert!(plan.diagnostics.contains(&PlanDiagnostic::DroppedSearchPath {
        path: PathBuf::from("/usr2/bin"),
    }));
}

#[test]
fn test_search_path_ignores_tmpfs_targets() {
    let tasks = vec![
        MountTask::new(MountMode::Tmpfs, "/"),
        MountTask::new(MountMode::BindReadOnly, "/usr"),
    ];
    let mut diagnostics = Vec::new();
    let kept = filter_search_path(
        "/usr:/usr/local/bin:/home/alice/bin",
        &tasks,
        &FakeFs::default(),
        &mut diagnostics,
    );

    assert_eq!(kept, vec![PathBuf::from("/usr"), PathBuf::from("/usr/local/bin")]);
    assert_eq!(diagnostics.len(), 1);
}

#[test]
fn test_empty_search_path_entry_is_the_current_directory() {
    let tasks = vec![MountTask::new(MountMode::BindReadOnly, "/usr")];
    let mut fs = FakeFs::default();
    fs.real_paths
        .insert(PathBuf::from("."), PathBuf::from("/home/alice/work"));

    let mut diagnostics = Vec::new();
    let kept = filter_search_path("/usr/bin::", &tasks, &fs, &mut diagnostics);
    assert_eq!(kept, vec![PathBuf::from("/usr/bin")]);
    assert_eq!(
        diagnostics,
        vec![
            PlanDiagnostic::DroppedSearchPath {
                path: PathBuf::from("/home/alice/work"),
            };
            2
        ]
    );

    fs.real_paths.insert(PathBuf::from("."), PathBuf::from("/usr/share"));
    diagnostics.clear();
    let kept = filter_search_path(":/usr/bin", &tasks, &fs, &mut diagnostics);
    assert_eq!(kept, vec![PathBuf::from("/usr/share"), PathBuf::from("/usr/bin")]);
    assert!(diagnostics.is_empty());
}

#[test]
fn test_host_symlinks_are_reproduced() {
    let mut fs = FakeFs::standard();
    fs.link("/bin", "usr/bin", "/usr/bin");
    let ctx = context().with_env("PATH", "/bin");

    let plan = build_mount_plan(&request(), &ctx, &fs).expect("plan");
    let bin = find(&plan, "/bin").expect("/bin task");
    assert_eq!(bin.mode, MountMode::Symlink);
    assert_eq!(bin.source(), Path::new("usr/bin"));
    assert_eq!(plan.search_path, vec![PathBuf::from("/usr/bin")]);
}

#[test]
fn test_display_socket_may_not_exist_yet() {
    let request = PlanRequest {
        display: Some(X11Display::new(7)),
        ..request()
    };
    let plan = build_mount_plan(&request, &context(), &FakeFs::standard()).expect("plan");

    let socket = find(&plan, "/tmp/.X11-unix/X7").expect("socket bind");
    assert_eq!(socket.mode, MountMode::BindReadWrite);
    assert_eq!(env_value(&plan, "DISPLAY"), Some(":7"));
}

#[test]
fn test_sound_requires_socket() {
    let request = PlanRequest {
        pulseaudio: true,
        ..request()
    };
    let result = build_mount_plan(&request, &context(), &FakeFs::standard());
    assert!(matches!(result, Err(MountError::MissingRequiredPath { .. })));

    let mut fs = FakeFs::standard();
    fs.add("/run/user/1000/pulse/native");
    let plan = build_mount_plan(&request, &context(), &fs).expect("plan");
    assert_eq!(
        env_value(&plan, "PULSE_SERVER"),
        Some("unix:/run/user/1000/pulse/native")
    );
}

#[test]
fn test_dotwine_is_created_when_missing() {
    let fs = FakeFs::standard();
    let request = PlanRequest {
        dotwine: Some(BindSpec::new("/data/prefix", AccessMode::ReadWrite)),
        ..request()
    };

    let plan = build_mount_plan(&request, &context(), &fs).expect("plan");
    assert!(plan.state_dir_created);
    assert_eq!(*fs.created.borrow(), vec![PathBuf::from("/data/prefix")]);

    let dotwine = find(&plan, "/home/alice/.wine").expect(".wine task");
    assert_eq!(dotwine.mode, MountMode::BindReadWrite);
    assert_eq!(dotwine.source(), Path::new("/data/prefix"));
}

#[test]
fn test_existing_dotwine_is_reused() {
    let mut fs = FakeFs::standard();
    fs.add("/data/prefix");
    let request = PlanRequest {
        dotwine: Some(BindSpec::new("/data/prefix", AccessMode::ReadOnly)),
        ..request()
    };

    let plan = build_mount_plan(&request, &context(), &fs).expect("plan");
    assert!(!plan.state_dir_created);
    assert!(fs.created.borrow().is_empty());
    assert_eq!(
        find(&plan, "/home/alice/.wine").map(|t| t.mode),
        Some(MountMode::BindReadOnly)
    );
}

#[test]
fn test_program_path_is_bound() {
    let mut fs = FakeFs::standard();
    fs.add("/games/setup.exe");
    let request = PlanRequest {
        program: Some("/games/setup".to_string()),
        ..request()
    };

    let plan = build_mount_plan(&request, &context(), &fs).expect("plan");
    assert!(find(&plan, "/games/setup.exe").is_some());
    assert!(find(&plan, "/games/setup").is_none());
    assert!(find(&plan, "/games/setup.EXE").is_none());
}

#[test]
fn test_environment() {
    let plan = build_mount_plan(&request(), &context(), &FakeFs::standard()).expect("plan");

    assert_eq!(env_value(&plan, "HOSTNAME"), Some("winecell-test"));
    assert_eq!(plan.env.get("TERM"), Some(&EnvTask::Inherit));

    let resolved: BTreeMap<_, _> = plan.resolved_env(&context()).into_iter().collect();
    assert_eq!(resolved.get("USER").map(String::as_str), Some("alice"));
    assert!(!resolved.contains_key("TERM"));
    assert!(!resolved.contains_key("DISPLAY"));
}
