use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use topsql_mock::{agent, config};

/// Mock TopSQL agent fleet that records reported CPU usage.
#[derive(Parser)]
#[command(name = "topsql-mock", about)]
struct Cli {
    /// Path to an optional YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Address of the first gRPC service. Services use consecutive ports.
    #[arg(long)]
    grpc_listen: Option<String>,

    /// Number of gRPC services to start.
    #[arg(long)]
    count: Option<usize>,

    /// Address of the read-side HTTP API.
    #[arg(long)]
    ui_listen: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

impl Cli {
    /// Flags win over the file.
    fn apply(&self, cfg: &mut config::Config) {
        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
        if let Some(listen) = &self.grpc_listen {
            cfg.grpc.listen = listen.clone();
        }
        if let Some(count) = self.count {
            cfg.grpc.count = count;
        }
        if let Some(listen) = &self.ui_listen {
            cfg.api.listen = listen.clone();
        }
    }
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

/// File values, then flag overrides, then one validation pass.
fn load_config(cli: &Cli) -> Result<config::Config> {
    let mut cfg = match &cli.config {
        Some(path) => config::Config::parse_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::Config::default(),
    };
    cli.apply(&mut cfg);
    cfg.validate()?;

    Ok(cfg)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("topsql-mock {}", version::full());
        return Ok(());
    }

    let cfg = load_config(&cli)?;

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        grpc_listen = %cfg.grpc.listen,
        count = cfg.grpc.count,
        api_listen = %cfg.api.listen,
        "starting topsql-mock",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    shutdown_signal().await;

    agent.stop().await?;

    tracing::info!("topsql-mock stopped");

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "listening for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "registering SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
