//! StockHub shell - sign in and query the StockHub inventory API from a terminal.
//!
//! Usage: `stockhub [#fragment]`. The optional fragment picks the starting
//! page the same way a bookmarked URL would.

mod command;
mod shell;

use std::path::PathBuf;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stockhub_core::Config;

use command::Command;
use shell::{prompt_line, Flow, Shell};

// ============================================================================
// Constants
// ============================================================================

const LOG_FILE: &str = "stockhub.log";

/// Initialize file logging. stdout belongs to the shell.
///
/// Use RUST_LOG to control the level (e.g., RUST_LOG=stockhub_core=debug).
fn init_tracing(log_dir: PathBuf) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    let log_dir = config.cache_dir().unwrap_or_else(|_| std::env::temp_dir().join("stockhub"));
    let _log_guard = init_tracing(log_dir)?;
    info!(api_url = %config.api_url, auth_url = %config.auth_url, "StockHub shell starting");

    if config.auth_key.is_empty() {
        warn!("No identity provider key configured");
        eprintln!("Warning: STOCKHUB_AUTH_KEY is not set; sign-in will likely fail.");
    }

    let initial_fragment = std::env::args().nth(1).unwrap_or_default();
    let mut shell = Shell::new(config, &initial_fragment)?;
    shell.start().await;

    finish(run(&mut shell).await)
}

/// Log how the shell ended and hand the outcome back as the exit status.
fn finish(result: Result<()>) -> Result<()> {
    if let Err(e) = &result {
        error!(error = %e, "Shell loop failed");
    }
    info!("StockHub shell shutting down");
    result
}

async fn run(shell: &mut Shell) -> Result<()> {
    loop {
        let line = match prompt_line(&shell.prompt()).await {
            Ok(line) => line,
            // EOF ends the session like `quit`.
            Err(_) => {
                println!();
                return Ok(());
            }
        };

        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };

        shell.housekeeping().await;
        if shell.handle(command).await? == Flow::Quit {
            return Ok(());
        }
    }
}
