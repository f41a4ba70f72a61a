//! `qmpctl` — issue ad hoc QMP/QGA commands against local QEMU VMs
//!
//! A thin front end over [`qmpmux::Client`]: it does not run its own
//! event loop, it builds one `Client`, queues the commands the
//! subcommand asks for, and calls `execute` once before exiting.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use qmpmux::{Client, SocketLocator};
use std::path::PathBuf;

mod config;
mod output;

use config::QmpctlConfig;
use output::OutputFormat;

/// Command-line front end for qmpmux
#[derive(Parser)]
#[command(name = "qmpctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file path
    #[arg(long, default_value_os_t = QmpctlConfig::default_path(), global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    /// Socket connect deadline, in seconds (overrides the config file)
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    /// Per-command run timeout, in seconds (overrides the default
    /// per-command timeout table; 0 means "use the 3s default")
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Resolves socket paths under the configured `socket_dir`.
struct ConfiguredSocketLocator {
    socket_dir: PathBuf,
}

impl SocketLocator for ConfiguredSocketLocator {
    fn socket_path(&self, vmid: u32, qga: bool) -> PathBuf {
        let ext = if qga { "qga" } else { "qmp" };
        self.socket_dir.join(format!("{vmid}.{ext}"))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a raw QMP or QGA command
    Cmd(CmdArgs),

    /// Shorthand for `query-status` over QMP
    Status {
        /// VM id
        vmid: u32,
    },

    /// Shorthand for `guest-ping` over QGA
    Ping {
        /// VM id
        vmid: u32,
    },
}

#[derive(clap::Args)]
struct CmdArgs {
    /// VM id
    vmid: u32,

    /// QMP command to execute (e.g. `query-status`, `guest-ping`)
    execute: String,

    /// Route over the guest agent socket instead of the QMP socket
    #[arg(long)]
    qga: bool,

    /// Command argument as `key=value`; value is parsed as JSON if
    /// possible, otherwise kept as a string. Repeatable.
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    args: Vec<String>,
}

fn parse_arguments(pairs: &[String]) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("invalid --arg '{pair}', expected key=value"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let config = QmpctlConfig::load(&cli.config).context("loading qmpctl config")?;
    let connect_timeout = cli.connect_timeout.unwrap_or(config.connect_timeout_secs);
    let locator = ConfiguredSocketLocator {
        socket_dir: config.socket_dir,
    };
    let mut client = Client::new(locator).with_connect_timeout_secs(connect_timeout);

    let (vmid, qga, execute, arguments) = match cli.command {
        Commands::Cmd(args) => {
            if args.execute.is_empty() {
                bail!("execute must not be empty");
            }
            let arguments = parse_arguments(&args.args)?;
            (args.vmid, args.qga, args.execute, arguments)
        }
        Commands::Status { vmid } => (vmid, false, "query-status".to_string(), serde_json::Map::new()),
        Commands::Ping { vmid } => (vmid, true, "guest-ping".to_string(), serde_json::Map::new()),
    };

    match client.cmd(vmid, qga, execute, arguments, cli.timeout) {
        Ok(response) => output::print_value(&response, cli.format),
        Err(e) => {
            output::print_error(&e.to_string());
            std::process::exit(1);
        }
    }

    Ok(())
}
