//! winecell - Entry Point

use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use tracing::{Level, debug, warn};
use tracing_subscriber::{EnvFilter, fmt};

use winecell::display::{Geometry, X11Mode};
use winecell::sandbox::{BindSpec, HostContext, LaunchConfig};
use winecell::system::CancelToken;
use winecell::{error, launcher};

/// Run Windows programs under Wine inside a bubblewrap sandbox.
///
/// Everything is denied unless granted: no network, no sound, no X11, an
/// empty ~/.wine on tmpfs.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("x11_mode").multiple(false)))]
struct Args {
    /// Command to run
    #[arg(value_name = "PROGRAM", required_unless_present = "configure")]
    program: Option<String>,

    /// Arguments to pass to PROGRAM
    #[arg(value_name = "ARG", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Enable nested X11 using the first available of nxagent, Xephyr, Xnest
    #[arg(long, group = "x11_mode")]
    x11: bool,

    /// Enable nested X11 using X2Go nxagent
    #[arg(long, group = "x11_mode")]
    nxagent: bool,

    /// Enable nested X11 using Xephyr
    #[arg(long, group = "x11_mode")]
    xephyr: bool,

    /// Enable nested X11 using Xnest
    #[arg(long, group = "x11_mode")]
    xnest: bool,

    /// Enable nested X11 using xpra (experimental)
    #[arg(long, group = "x11_mode")]
    xpra: bool,

    /// Enable nested X11 using Xvfb (invisible)
    #[arg(long, group = "x11_mode")]
    xvfb: bool,

    /// Enable the host X11 display (DANGEROUS: no isolation from other clients)
    #[arg(long = "host-x11-danger-danger", group = "x11_mode")]
    host_x11: bool,

    /// Screen geometry of nested displays
    #[arg(long, value_name = "WxH", default_value = "1024x768")]
    geometry: Geometry,

    /// Enable networking
    #[arg(long)]
    network: bool,

    /// Enable sound through PulseAudio
    #[arg(long)]
    pulseaudio: bool,

    /// Use PATH for ~/.wine (default: empty tmpfs)
    #[arg(long, value_name = "PATH:{ro,rw}")]
    dotwine: Option<BindSpec>,

    /// Bind-mount PATH at the same location inside the sandbox (repeatable)
    #[arg(long = "pass", value_name = "PATH:{ro,rw}")]
    pass: Vec<BindSpec>,

    /// Run winecfg before PROGRAM (default: as needed)
    #[arg(long)]
    configure: bool,

    /// Run PROGRAM directly instead of through wine
    #[arg(long)]
    no_wine: bool,

    /// Run PROGRAM a second time if it fails
    #[arg(long)]
    retry: bool,

    /// Do not relay through a pseudo-terminal
    #[arg(long)]
    no_pty: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

impl Args {
    fn x11_mode(&self) -> X11Mode {
        [
            (self.x11, X11Mode::Auto),
            (self.nxagent, X11Mode::Nxagent),
            (self.xephyr, X11Mode::Xephyr),
            (self.xnest, X11Mode::Xnest),
            (self.xpra, X11Mode::Xpra),
            (self.xvfb, X11Mode::Xvfb),
            (self.host_x11, X11Mode::Host),
        ]
        .into_iter()
        .find_map(|(selected, mode)| selected.then_some(mode))
        .unwrap_or(X11Mode::None)
    }

    fn into_config(self) -> LaunchConfig {
        let x11 = self.x11_mode();
        LaunchConfig {
            program: self.program,
            args: self.args,
            x11,
            geometry: self.geometry,
            network: self.network,
            pulseaudio: self.pulseaudio,
            dotwine: self.dotwine,
            extra_binds: self.pass,
            configure: self.configure,
            with_wine: !self.no_wine,
            retry: self.retry,
            pty: !self.no_pty,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Logs and the command transcript go to stderr; stdout belongs to PROGRAM.
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    debug!("winecell v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancelToken::new();
    if let Err(e) = cancel.install_interrupt_handler() {
        warn!(error = %e, "Failed to install interrupt handler");
    }

    let config = args.into_config();
    let ctx = HostContext::from_process();

    let code = match launcher::run(&config, &ctx, &cancel) {
        Ok(code) => code,
        Err(e) => {
            let code = e.exit_code();
            eprintln!("{:?}", miette::Report::new(e));
            code
        }
    };

    ExitCode::from(u8::try_from(code).unwrap_or(error::EXIT_FAILURE as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let config = Args::parse_from(["winecell", "notepad.exe"]).into_config();
        assert_eq!(config.program.as_deref(), Some("notepad.exe"));
        assert_eq!(config.x11, X11Mode::None);
        assert!(config.with_wine);
        assert!(config.pty);
        assert_eq!(config.geometry, Geometry::default());
    }

    #[test]
    fn test_program_arguments_keep_hyphens() {
        let config =
            Args::parse_from(["winecell", "--network", "app.exe", "/S", "--silent"]).into_config();
        assert!(config.network);
        assert_eq!(config.args, vec!["/S", "--silent"]);
    }

    #[test]
    fn test_x11_flags_are_exclusive() {
        let result = Args::try_parse_from(["winecell", "--xephyr", "--xnest", "app.exe"]);
        assert!(result.is_err());

        let config = Args::parse_from(["winecell", "--xpra", "app.exe"]).into_config();
        assert_eq!(config.x11, X11Mode::Xpra);
    }

    #[test]
    fn test_program_optional_with_configure() {
        assert!(Args::try_parse_from(["winecell"]).is_err());

        let config = Args::parse_from(["winecell", "--configure", "--x11"]).into_config();
        assert!(config.program.is_none());
        assert!(config.configure);
        assert_eq!(config.x11, X11Mode::Auto);
    }

    #[test]
    fn test_bind_specs() {
        let config = Args::parse_from([
            "winecell",
            "--dotwine",
            "/tmp/prefix:rw",
            "--pass",
            "/srv/a:ro",
            "--pass",
            "/srv/b:rw",
            "app.exe",
        ])
        .into_config();
        assert_eq!(config.extra_binds.len(), 2);
        assert_eq!(
            config.dotwine.map(|spec| spec.to_string()),
            Some("/tmp/prefix:rw".to_string())
        );

        assert!(Args::try_parse_from(["winecell", "--pass", "/srv/a", "app.exe"]).is_err());
    }
}
