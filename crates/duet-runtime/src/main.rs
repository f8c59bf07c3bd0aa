//! duet: run a reference-vs-candidate test command and report its results
//! live, from the producer's socket events or its marker output.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod app;
mod cli;
mod config;
mod discovery;
mod display;
mod headless;
mod listener;
mod process;
mod report;
mod tui;

use app::{App, Outcome};
use config::{Config, ListenerConfig};
use listener::{ListenerEvent, SocketServer};
use process::ProcessRunner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = cli::Cli::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let command = args
        .command
        .take()
        .unwrap_or_else(|| cli::Command::Browse(cli::RootOpts::default()));
    let filter = config
        .log
        .resolve_filter(args.log.as_deref(), |key| std::env::var(key).ok());

    let code = match command {
        cli::Command::List(opts) => {
            init_logging(&filter, None)?;
            let root = opts.root.unwrap_or_else(|| config.run.tests_root.clone());
            let scripts = discover(&root)?;
            print!("{}", format_scripts(&scripts));
            0
        }
        cli::Command::Replay(opts) => {
            init_logging(&filter, None)?;
            let text = std::fs::read(&opts.transcript)
                .with_context(|| format!("failed to read transcript {}", opts.transcript.display()))?;
            let text = String::from_utf8_lossy(&text);
            let mut app = App::new();
            let outcome = headless::replay(&mut app, &opts.transcript.display().to_string(), &text);
            print!("{}", report::render(&app));
            outcome.exit_code()
        }
        cli::Command::Run(opts) if opts.headless => {
            init_logging(&filter, None)?;
            let (mut server, mut listener_rx) = start_listener(&config.listener);
            let runner = producer_runner(
                ProcessRunner::new(opts.program(), opts.args().to_vec()),
                server.as_ref(),
            );
            let mut app = App::new();
            let outcome = headless::run(&mut app, runner, &mut listener_rx).await;
            if let Some(server) = server.as_mut() {
                server.stop();
            }
            print!("{}", report::render(&app));
            outcome.exit_code()
        }
        cli::Command::Run(opts) => {
            let log_file = config.log.resolve_file(args.log_file.as_deref());
            init_logging(&filter, Some(&log_file))?;
            let (mut server, mut listener_rx) = start_listener(&config.listener);
            let runner = ProcessRunner::new(opts.program(), opts.args().to_vec());
            let launcher = tui::Launcher {
                target: tui::Target::Command(runner),
                env: listener::producer_env(server.as_ref().map(SocketServer::local_addr)),
                server: server.as_ref(),
            };
            let mut app = App::new();
            let outcome = tui::run_tui(&mut app, launcher, &mut listener_rx).await?;
            if let Some(server) = server.as_mut() {
                server.stop();
            }
            print!("{}", report::render(&app));
            outcome.map_or(0, |o| o.exit_code())
        }
        cli::Command::Browse(opts) => {
            let log_file = config.log.resolve_file(args.log_file.as_deref());
            init_logging(&filter, Some(&log_file))?;
            let root = opts.root.unwrap_or_else(|| config.run.tests_root.clone());
            let scripts = discover(&root)?;
            if scripts.is_empty() {
                anyhow::bail!("no test scripts found under {}", root.display());
            }
            let (mut server, mut listener_rx) = start_listener(&config.listener);
            let launcher = tui::Launcher {
                target: tui::Target::Scripts {
                    python: config.run.python.clone(),
                },
                env: listener::producer_env(server.as_ref().map(SocketServer::local_addr)),
                server: server.as_ref(),
            };
            let mut app = App::with_scripts(scripts);
            let outcome = tui::run_tui(&mut app, launcher, &mut listener_rx).await?;
            if let Some(server) = server.as_mut() {
                server.stop();
            }
            outcome.as_ref().map_or(0, Outcome::exit_code)
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Logs go to stderr, or to `file` while the TUI owns the terminal.
fn init_logging(filter: &str, file: Option<&Path>) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter));
    match file {
        None => builder.with_writer(std::io::stderr).init(),
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        }
    }
    Ok(())
}

/// Start the result listener. A listener that cannot start is not fatal:
/// producers fall back to marker output.
fn start_listener(config: &ListenerConfig) -> (Option<SocketServer>, mpsc::UnboundedReceiver<ListenerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    if !config.enabled {
        info!("result listener disabled");
        return (None, rx);
    }
    match SocketServer::start(config, tx) {
        Ok(server) => (Some(server), rx),
        Err(err) => {
            warn!(error = %err, "result listener unavailable, relying on marker output");
            (None, rx)
        }
    }
}

fn producer_runner(runner: ProcessRunner, server: Option<&SocketServer>) -> ProcessRunner {
    listener::producer_env(server.map(SocketServer::local_addr))
        .into_iter()
        .fold(runner, |runner, (key, value)| runner.env(key, value))
}

fn discover(root: &Path) -> anyhow::Result<Vec<discovery::Script>> {
    discovery::discover(root).with_context(|| format!("invalid tests root {}", root.display()))
}

/// Scripts grouped under their category heading.
fn format_scripts(scripts: &[discovery::Script]) -> String {
    let mut out = String::new();
    let mut category: Option<&str> = None;
    for script in scripts {
        if category != Some(script.category.as_str()) {
            category = Some(script.category.as_str());
            out.push_str(&script.category);
            out.push('\n');
        }
        out.push_str(&format!("  {:<32} {}\n", script.name(), script.path.display()));
    }
    if out.is_empty() {
        out.push_str("no test scripts found\n");
    }
    out
}
