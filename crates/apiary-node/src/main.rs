// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! apiaryd - Application Hosting Runtime
//!
//! The node is responsible for:
//! - Hosting every application found in the spool directory
//! - Supervising a pool of worker processes per application
//! - Routing client request streams into idle workers

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use apiary_node::config::{Component, Config};
use apiary_node::node::Node;
use apiary_node::signals;

#[derive(Parser)]
#[command(name = "apiaryd")]
#[command(version)]
#[command(about = "Application hosting runtime")]
struct Args {
    /// Location of the configuration file
    #[arg(short = 'c', long)]
    configuration: PathBuf,

    /// Logging backend
    #[arg(short = 'l', long, default_value = "core")]
    logging: String,

    /// Daemonize on start
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// Location of a pid file
    #[arg(short = 'p', long)]
    pidfile: Option<PathBuf>,
}

/// Pid file that is removed when the process exits cleanly.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: PathBuf) -> std::io::Result<Self> {
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn init_logging(backend: &Component) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match backend.kind.as_str() {
        "stdout" | "unspecified" => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        "file" => {
            let path = backend
                .args
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "the 'file' logger needs a 'path' argument".to_string())?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("unable to open the log file: {e}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        other => {
            return Err(format!("unknown logger type '{other}'"));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Signal plumbing comes first so that every thread inherits it.
    if let Err(e) = signals::block_sigpipe() {
        eprintln!("ERROR: unable to block SIGPIPE - {e}.");
        return ExitCode::FAILURE;
    }
    signals::install_crash_handlers();

    let config = match Config::load(&args.configuration) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: unable to initialize the configuration - {e}.");
            return ExitCode::FAILURE;
        }
    };

    let Some(backend) = config.loggers.get(&args.logging).cloned() else {
        eprintln!("ERROR: unable to initialize the logging - backend does not exist.");
        return ExitCode::FAILURE;
    };

    // Daemonize before the runtime spins up any threads.
    let mut _pidfile = None;
    if args.daemonize {
        if let Err(e) = nix::unistd::daemon(false, false) {
            eprintln!("ERROR: daemonization failed - {e}.");
            return ExitCode::FAILURE;
        }

        let pid_path = args
            .pidfile
            .clone()
            .unwrap_or_else(|| config.paths.runtime.join("apiaryd.pid"));
        match PidFile::create(pid_path) {
            Ok(pidfile) => _pidfile = Some(pidfile),
            Err(e) => {
                eprintln!("ERROR: unable to create the pidfile - {e}.");
                return ExitCode::FAILURE;
            }
        }
    }

    if let Err(e) = init_logging(&backend) {
        eprintln!("ERROR: unable to initialize the logging - {e}.");
        return ExitCode::FAILURE;
    }

    info!(
        configuration = %args.configuration.display(),
        logging = %args.logging,
        "starting the node"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("ERROR: unable to initialize the runtime - {e}.");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(Node::new(config).run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e}.");
            ExitCode::FAILURE
        }
    }
}
