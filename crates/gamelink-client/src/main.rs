//! `gamelink-probe`: ping every configured backend service once.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use gamelink_client::platform::PlatformDirs;
use gamelink_client::probe::{self, ProbeOutcome};
use gamelink_config::{CliArgs, Config};
use gamelink_log::init_logging;
use gamelink_net::{Dispatcher, EngineConfig, NetworkContext, SocketConfig, TcpDriver};

const CONNECT_WAIT: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let dirs = match PlatformDirs::resolve_and_create() {
        Ok(dirs) => dirs.with_config_dir(args.config.clone()),
        Err(e) => {
            eprintln!("Failed to initialize platform directories: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = match Config::load_or_create(&dirs.config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config, using defaults: {e}");
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);
    init_logging(Some(&dirs.log_dir), Some(&config));

    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }
    if config.servers.is_empty() {
        tracing::error!("no server addresses configured");
        return ExitCode::FAILURE;
    }

    let engine = match EngineConfig::from_config(&config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let driver = match TcpDriver::new(SocketConfig::default()) {
        Ok(driver) => driver,
        Err(e) => {
            tracing::error!("failed to start I/O runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let ctx = Arc::new(NetworkContext::new(engine, Arc::new(driver)));
    let dispatcher = match Dispatcher::spawn(Arc::clone(&ctx)) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            tracing::error!("failed to start dispatcher: {e}");
            return ExitCode::FAILURE;
        }
    };

    let reports = probe::run(&ctx, &config.servers, CONNECT_WAIT);
    for report in &reports {
        println!("{report}");
    }

    probe::shutdown(&ctx, &config.servers);
    drop(dispatcher);

    let all_ok = reports
        .iter()
        .all(|report| matches!(report.outcome, ProbeOutcome::Replied { .. }));
    if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
