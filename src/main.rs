//! RustLB - Main entry point

use anyhow::Result;
use clap::Parser;
use rustlb::{Config, Supervisor};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// RustLB - A multi-frontend HTTP reverse proxy and load balancer
#[derive(Parser, Debug)]
#[command(name = "rustlb")]
#[command(author = "RustLB Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A multi-frontend HTTP reverse proxy and load balancer")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "RUSTLB_CONFIG")]
    config: PathBuf,

    /// Log one line per request
    #[arg(long)]
    access_log: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Like `Args::parse()`, but usage errors exit with status 1 instead of 2
fn parse_args() -> Args {
    Args::try_parse().unwrap_or_else(|e| {
        if e.use_stderr() {
            let _ = e.print();
            std::process::exit(1);
        }
        e.exit()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Cannot read configuration {}: {}", args.config.display(), e);
            eprintln!("rustlb: cannot read {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting RustLB v1.0.0 with {} frontend(s)",
        config.frontends.len()
    );

    Supervisor::new(config)
        .with_access_log(args.access_log)
        .run()
        .await;

    Ok(())
}
