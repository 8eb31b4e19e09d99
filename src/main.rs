// ABOUTME: Entry point for the anabasis CLI application.
// ABOUTME: Parses arguments, wires cancellation, and dispatches up/down.

mod cli;

use anabasis::config::Config;
use anabasis::error::{Error, Result};
use anabasis::orchestrate::{Controller, ErrorKind, Options};
use clap::Parser;
use cli::{Cli, Commands};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::new(parse_log_level(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    if let Err(e) = run(cli, cancel).await {
        handle_error(e);
    }
}

/// Map the --log-level argument onto a tracing filter, defaulting to info.
fn parse_log_level(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, canceling operation");
            cancel.cancel();
        }
    });
}

/// Print errors with programmatic error types and helpful hints.
fn handle_error(e: Error) -> ! {
    if let Error::Orchestrate(ref orch) = e {
        match orch.kind() {
            ErrorKind::FlagContention => {
                eprintln!("Error: {e}");
                eprintln!("       Tip: Inspect the flag file in the state directory to see who holds it");
            }
            ErrorKind::DependencyNotRunning => {
                eprintln!("Error: {e}");
                eprintln!("       Tip: Start the dependency first, or rerun with --handle-deps");
            }
            ErrorKind::RollbackIncomplete => {
                eprintln!("Error: {e}");
                eprintln!("       Tip: Some services may still be running; run 'anabasis down' to clean up");
            }
            _ => eprintln!("Error: {e}"),
        }
    } else {
        eprintln!("Error: {e}");
    }
    std::process::exit(1);
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    match cli.command {
        Commands::Up {
            env,
            ssh_key,
            dry_run,
            handle_deps,
            timeout,
            check_interval,
        } => {
            let config = Config::load(&cli.config)?;
            let mut environment = config.take_environment(&env)?;
            environment.override_key(ssh_key);

            let mut options = Options::new(&env);
            options.dry_run = dry_run;
            options.handle_deps = handle_deps;
            if let Some(timeout) = timeout {
                options.operation_timeout = timeout;
            }
            if let Some(interval) = check_interval {
                options.monitor_interval = interval;
            }

            let controller = Controller::new(environment, options);
            controller.up(cancel).await?;
            Ok(())
        }
        Commands::Down {
            env,
            ssh_key,
            dry_run,
            stop_deps,
            timeout,
        } => {
            let config = Config::load(&cli.config)?;
            let mut environment = config.take_environment(&env)?;
            environment.override_key(ssh_key);

            let mut options = Options::new(&env);
            options.dry_run = dry_run;
            options.stop_deps = stop_deps;
            if let Some(timeout) = timeout {
                options.operation_timeout = timeout;
            }

            let controller = Controller::new(environment, options);
            controller.down(cancel).await?;
            Ok(())
        }
    }
}
