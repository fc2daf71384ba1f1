use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use check_agent::config::Config;
use check_agent::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "check-agent", about = "Host monitoring agent that posts checks to a remote endpoint")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/check-agent/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Run a single check cycle and exit
    #[arg(long)]
    once: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("check-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(&cli.config)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.agent.hostname,
        url = %config.agent.postback_url(),
        interval_secs = config.agent.check_freq_secs,
        "Starting check agent"
    );

    if let Err(e) = run(config, cli.once).await {
        error!(error = %format!("{:#}", e), "Agent terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    match config.agent.log_file {
        Some(ref path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.init(),
    }

    Ok(())
}

async fn run(config: Config, once: bool) -> Result<()> {
    let pid_file = config.agent.pid_file.clone();
    if let Some(ref path) = pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write pid file: {}", path))?;
    }

    let mut orchestrator = Orchestrator::from_config(config)?;

    if once {
        let report = orchestrator.run_cycle().await;
        info!(
            sections = report.sections.len(),
            failed = ?report.failed,
            delivered = report.postback.is_delivered(),
            "Single check cycle finished"
        );
    } else {
        tokio::select! {
            _ = orchestrator.run() => {}
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Received shutdown signal, exiting");
            }
        }
    }

    if let Some(ref path) = pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path, error = %e, "Failed to remove pid file");
        }
    }

    Ok(())
}
