//! CLI for remote AMD PSP access.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod access;
mod config;
mod console;
mod output;
mod parse;

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pspproxy::Session;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::console::ConsoleIo;

#[derive(Parser)]
#[command(
    name = "pspproxy",
    version,
    about = "Access AMD PSP hardware through a remote proxy stub"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by every subcommand.
#[derive(clap::Args)]
struct GlobalArgs {
    /// Target device: tcp://host:port, unix:///path or
    /// serial:///dev/ttyX[:baud[:parity[:bits]]].
    #[arg(short, long, global = true, env = "PSPPROXY_DEVICE")]
    device: Option<String>,

    /// CCD requests are addressed to [default: 0].
    #[arg(long, global = true)]
    ccd: Option<u32>,

    /// Per-request timeout in milliseconds [default: 10000].
    #[arg(long, global = true, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Output format.
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Access(access::Access),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable text.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

/// Connection settings after flags, environment and config file are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    device: String,
    timeout: Duration,
    ccd: u32,
}

impl Settings {
    /// Flags win over the config file; built-in defaults fill the rest.
    fn resolve(global: &GlobalArgs, config: Config) -> Result<Self> {
        let device = global.device.clone().or(config.device).with_context(|| {
            let file = Config::path().map_or_else(
                || "the config file".to_owned(),
                |p| p.display().to_string(),
            );
            format!("no device given; pass --device, set PSPPROXY_DEVICE or add it to {file}")
        })?;
        let timeout = global
            .timeout_ms
            .or(config.timeout_ms)
            .map_or(pspproxy::DEFAULT_TIMEOUT, Duration::from_millis);
        Ok(Self {
            device,
            timeout,
            ccd: global.ccd.or(config.ccd).unwrap_or(0),
        })
    }

    /// Opens a session, with stdin and stdout attached when `console` is set.
    fn open(&self, console: bool) -> Result<Session> {
        let mut builder = Session::builder()
            .device(&self.device)
            .timeout(self.timeout);
        if console {
            builder = builder.io(ConsoleIo::spawn());
        }
        let mut psp = builder
            .open()
            .with_context(|| format!("connecting to {}", self.device))?;
        if self.ccd != 0 {
            psp.set_target(self.ccd)?;
        }
        Ok(psp)
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);
    if let Err(e) = cli.dispatch() {
        eprintln!("pspproxy: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Access(cmd) => {
                let settings = Settings::resolve(&self.global, Config::load()?)?;
                let mut psp = settings.open(cmd.wants_console())?;
                let mut out = io::stdout().lock();
                cmd.run(&mut psp, self.global.format, &mut out)
            }
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "pspproxy", &mut io::stdout());
                Ok(())
            }
        }
    }
}
