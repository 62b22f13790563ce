// SPDX-License-Identifier: MIT

//! `cronicled` — the node binary. `init` seeds a fresh storage tree;
//! `run` starts the daemon (manager/worker, decided by election, not by
//! flag) in the foreground until interrupted (spec.md §6).

mod color;
mod exit_error;
mod setup;

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use cronicle_daemon::{Config, Daemon};
use cronicle_storage::engine::LocalFsEngine;
use cronicle_storage::Storage;
use exit_error::ExitError;
use std::path::PathBuf;
use std::sync::Arc;

const BUILD_GIT_HASH: &str = env!("BUILD_GIT_HASH");

#[derive(Parser)]
#[command(name = "cronicled")]
struct Cli {
    /// Path to the JSON config file (default: ./config.json).
    #[arg(short = 'C', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Overrides the config's `secret_key`.
    #[arg(long, global = true)]
    secret_key: Option<String>,

    /// Reads `secret_key` from a file instead of the command line.
    #[arg(long, global = true)]
    secret_key_file: Option<PathBuf>,

    /// Disables colored terminal output.
    #[arg(long, global = true)]
    nocolor: bool,

    /// Overrides the configured log verbosity (0-9, higher is noisier).
    #[arg(long, global = true)]
    debug_level: Option<u8>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seeds a fresh storage tree: primary server group, admin API key,
    /// general category, plus anything named in `--setup`.
    Init {
        /// A JSON manifest of extra server groups/categories, with
        /// `_HOSTNAME_`/`_IP_` tokens substituted for local values.
        #[arg(long)]
        setup: Option<PathBuf>,
    },
    /// Runs the daemon in the foreground until interrupted.
    Run {
        /// Runs crash recovery only, then exits (spec.md §6).
        #[arg(long)]
        recover: bool,
    },
}

fn init_tracing(debug_level: u8) {
    let level = match debug_level {
        0 => "error",
        1..=2 => "warn",
        3..=5 => "info",
        6..=7 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().unwrap_or_else(|| PathBuf::from("config.json"));
    let mut config = if path.exists() {
        Config::load(&path).with_context(|| format!("loading config {}", path.display()))?
    } else {
        Config::default()
    };
    config.apply_env_overrides();

    if let Some(path) = &cli.secret_key_file {
        let key = std::fs::read_to_string(path).with_context(|| format!("reading secret key file {}", path.display()))?;
        config.secret_key = key.trim().to_string();
    }
    if let Some(key) = &cli.secret_key {
        config.secret_key = key.clone();
    }
    if let Some(level) = cli.debug_level {
        config.debug_level = level;
    }
    Ok(config)
}

async fn build_storage(config: &Config) -> Result<Arc<Storage>> {
    let engine = Arc::new(LocalFsEngine::new(config.storage.base_dir.clone()));
    let storage = Arc::new(Storage::new(engine, config.storage.transactions_dir.clone(), config.storage.concurrency));
    storage.recover().await.map_err(|e| ExitError::fatal(format!("crash recovery failed: {e}")))?;
    Ok(storage)
}

async fn run_init(cli: &Cli, setup_manifest: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(cli)?;
    if config.secret_key.is_empty() {
        config.secret_key = nanoid::nanoid!(32);
        println!("{} no secret_key configured, generated one for this node", color::context("note:"));
    }
    config.validate().map_err(|e| ExitError::fatal(format!("invalid config: {e}")))?;

    let storage = build_storage(&config).await?;
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let summary = setup::seed(&storage, &hostname, setup_manifest.as_deref()).await?;

    println!("{}", color::header("cronicled init"));
    if summary.is_empty() {
        println!("  {}", color::context("storage already initialized, nothing to do"));
    } else {
        for line in &summary {
            println!("  {line}");
        }
    }
    Ok(())
}

async fn run_recover(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    config.validate().map_err(|e| ExitError::fatal(format!("invalid config: {e}")))?;
    build_storage(&config).await?;
    println!("{}", color::header("recovery complete"));
    Ok(())
}

#[allow(clippy::expect_used)]
async fn run_daemon(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    config.validate().map_err(|e| ExitError::fatal(format!("invalid config: {e}")))?;
    let _pid_lock = setup::acquire_pid_lock(&config.pid_file)?;
    let storage = build_storage(&config).await?;
    let hostname = gethostname::gethostname().to_string_lossy().to_string();

    let web_server = config.web_server.clone();
    let udp_port = config.udp_broadcast_port;
    let daemon = Daemon::new(storage, hostname.clone(), config);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", web_server.http_port))
        .await
        .map_err(|e| ExitError::fatal(format!("binding http port {}: {e}", web_server.http_port)))?;
    let router = cronicle_daemon::http::build_router(daemon.app_state(), web_server.max_concurrent_requests, web_server.max_queue_length);

    let broadcast_sock = tokio::net::UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ExitError::fatal(format!("binding discovery socket: {e}")))?;
    broadcast_sock.set_broadcast(true).map_err(|e| ExitError::fatal(format!("enabling broadcast: {e}")))?;
    let discovery_ip = setup::local_ip();
    let discovery = tokio::spawn(cronicle_daemon::discovery::run_broadcast_loop(
        Arc::new(broadcast_sock),
        format!("255.255.255.255:{udp_port}").parse().expect("valid socket addr"),
        hostname,
        discovery_ip,
        std::time::Duration::from_secs(5),
        || true,
    ));

    println!("{} listening on :{}", color::header("cronicled"), web_server.http_port);

    let result = tokio::select! {
        result = daemon.run() => result.map_err(|e| ExitError::fatal(format!("daemon loop exited: {e}"))),
        result = axum::serve(listener, router) => result.map_err(|e| ExitError::fatal(format!("http server exited: {e}"))),
        _ = tokio::signal::ctrl_c() => {
            discovery.abort();
            println!("{}", color::context("shutting down"));
            Ok(())
        }
    };
    Ok(result?)
}

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() {
    let matches = Cli::command().version(BUILD_GIT_HASH).styles(color::styles()).get_matches();
    let cli = Cli::from_arg_matches(&matches).expect("clap already validated these args");
    if cli.nocolor {
        color::force_plain();
    }
    init_tracing(cli.debug_level.unwrap_or(5));

    let result = match &cli.command {
        Command::Init { setup } => run_init(&cli, setup.clone()).await,
        Command::Run { recover: true } => run_recover(&cli).await,
        Command::Run { recover: false } => run_daemon(&cli).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", color::header("error:"), e);
        let code = e.downcast_ref::<ExitError>().map(|ee| ee.code).unwrap_or(1);
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
