use bollard::Docker;
use clap::builder::styling::AnsiColor;
use clap::builder::Styles;
use clap::Parser;
use snafu::Report;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::{env, fs};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

use crate::config::Config;
use crate::db::Database;
use crate::docker::DockerClient;
use crate::problem::ProblemRegistry;
use crate::types::AppState;

mod config;
mod db;
mod docker;
mod http;
mod judge;
mod problem;
mod sftp;
mod ssh;
mod stager;
mod types;
mod userface;
mod workflow;

const CLAP_STYLE: Styles = Styles::styled()
    .header(AnsiColor::Red.on_default().bold())
    .usage(AnsiColor::Red.on_default().bold())
    .literal(AnsiColor::Blue.on_default().bold())
    .placeholder(AnsiColor::Green.on_default());

/// Secure Online Judge: SSH-fronted, container-isolated code judging
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, styles = CLAP_STYLE)]
struct Args {
    /// Path to the config file
    config_file: PathBuf,
}

fn logger_config() -> Box<dyn Layer<Registry> + Send + Sync> {
    match env::var("LOG_FORMAT")
        .unwrap_or("plain".to_string())
        .as_str()
    {
        "json" => Box::new(tracing_subscriber::fmt::layer().json()),
        _ => Box::new(tracing_subscriber::fmt::layer()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(logger_config())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config_file = args.config_file;
    if !config_file.exists() || !config_file.is_file() {
        eprintln!("Config file {config_file:?} does not exist or is not a file!");
        std::process::exit(1);
    }

    let config = Config::load(&config_file).expect("Config file is valid");

    for dir in [&config.submits_dir, &config.submit_work_dir] {
        fs::create_dir_all(dir).expect("Base directories can be created");
    }

    let docker = DockerClient::new(
        Docker::connect_with_defaults().expect("Container engine is reachable"),
    );

    let db = Database::new(&config.sqlite_path).await.unwrap();

    // Crash recovery before accepting anything new.
    let orphaned = db.mark_dead_submissions().await.unwrap();
    if orphaned > 0 {
        warn!(orphaned, "Marked unfinished submissions from a previous run as dead");
    }

    let problems = ProblemRegistry::load(&config.problems_dir).expect("Problems directory loads");
    info!(problems = problems.ids().len(), "Problem registry ready");

    let state = AppState {
        config: Arc::new(config),
        docker,
        db,
        problems,
        paused: Arc::new(AtomicBool::new(false)),
    };

    let http = tokio::spawn(http::serve(state.clone()));

    select! {
        res = ssh::serve(state) => {
            if let Err(e) = res {
                error!(error = %Report::from_error(e), "SSH server failed");
            }
        }
        _ = http => {
            error!("HTTP API exited unexpectedly");
        }
        _ = graceful_shutdown() => {}
    }

    info!("Goodbye!");
}

async fn graceful_shutdown() {
    let mut sigterm = signal(SignalKind::terminate()).unwrap();
    let interrupt = tokio::signal::ctrl_c();
    select! {
        _ = sigterm.recv() => warn!("Received SIGTERM"),
        _ = interrupt => warn!("Received SIGINT")
    }
}
