//! CLI definition using clap derive.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "duet", version, about = "Live reporter for reference-vs-candidate test runs")]
pub struct Cli {
    /// Config file (default: ./duet.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Interface the result listener binds to
    #[arg(long, global = true, env = "DUET_BIND")]
    pub bind: Option<IpAddr>,

    /// Port the result listener binds to
    #[arg(long, global = true, env = "DUET_PORT")]
    pub port: Option<u16>,

    /// Do not start the result listener; rely on marker lines only
    #[arg(long, global = true)]
    pub no_socket: bool,

    /// Log filter (overrides DUET_LOG / RUST_LOG)
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Log file used while the TUI is active
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run one test command and show its results live
    Run(RunOpts),
    /// Browse discovered test scripts and run them (default)
    Browse(RootOpts),
    /// Print discovered test scripts by category
    List(RootOpts),
    /// Render a saved stdout transcript
    Replay(ReplayOpts),
}

#[derive(clap::Args)]
pub struct RunOpts {
    /// Print a plain-text report instead of the TUI
    #[arg(long)]
    pub headless: bool,

    /// Program to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

impl RunOpts {
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }
}

#[derive(clap::Args, Default)]
pub struct RootOpts {
    /// Tests root (overrides [run] tests_root)
    #[arg(long)]
    pub root: Option<PathBuf>,
}

#[derive(clap::Args)]
pub struct ReplayOpts {
    /// Transcript file
    pub transcript: PathBuf,
}

impl Cli {
    /// Fold flag / environment overrides into the file configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.listener.bind = bind;
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if self.no_socket {
            config.listener.enabled = false;
        }
    }
}
