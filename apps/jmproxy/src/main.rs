use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use jmproxy_core::Runtime;

mod cli;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("jmproxy failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.into_patch()?.into_config()?;
    info!(
        event = "config_loaded",
        host = %config.host,
        port = config.port,
        data_dir = %config.data_dir,
        env_file = %config.env_file,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        strategy = %config.session_strategy
    );

    let runtime = Runtime::start(config).await?;
    let bind = runtime.config().bind_addr();
    serve(runtime.router(), &bind).await?;

    let counters = runtime.shutdown().await;
    info!(
        event = "shutdown_complete",
        deleted = counters.deleted,
        failed = counters.failed,
        protected = counters.protected,
        dropped = counters.dropped
    );
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("jmproxy=info,jmproxy_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(app: axum::Router, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "listening", addr = %bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(event = "signal_listener_failed", error = %err);
        std::future::pending::<()>().await;
    }
    info!(event = "shutdown_requested");
}
