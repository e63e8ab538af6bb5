//! Sandbox layout and command compilation.
//!
//! A launch goes through two pure steps before anything runs:
//!
//! 1. [`build_mount_plan`] decides which host paths are visible, how, and
//!    with which environment.
//! 2. [`compile`] turns the plan and the payload into the `bwrap` command
//!    line, grouped for display.
//!
//! # Example
//!
//! ```no_run
//! use winecell::sandbox::{
//!     HostContext, LaunchConfig, Payload, PlanRequest, RealFs, build_mount_plan, compile,
//! };
//!
//! let config = LaunchConfig::new("notepad.exe");
//! let ctx = HostContext::from_process();
//! let request = PlanRequest::from_config(&config, None, "winecell-0123456789ab");
//! let plan = build_mount_plan(&request, &ctx, &RealFs).unwrap();
//!
//! let payload = Payload {
//!     program: config.program.clone(),
//!     args: config.args.clone(),
//!     with_wine: config.with_wine,
//!     configure: false,
//!     retry: config.retry,
//! };
//! println!("{}", compile(&plan, &payload, &ctx));
//! ```

mod argv;
mod config;
mod host;
mod mounts;

pub use argv::{
    CompiledCommand, Payload, RETRY_WRAPPER, WINECFG_WRAPPER, WINESERVER_WRAPPER, compile,
    needs_configure,
};
pub use config::{AccessMode, BindSpec, LaunchConfig};
pub use host::{HostContext, HostFs, RealFs};
pub use mounts::{
    EnvTask, INHERITED_ENV_VARS, MountMode, MountPlan, MountTask, PlanDiagnostic, PlanRequest,
    RESOLVER_PATHS, base_tasks, build_mount_plan, filter_search_path, sort_by_target,
};
