// Grove node daemon: runs an ultrapeer directory node.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use grove_core::Identity;
use grove_node::config;
use grove_node::ultrapeer::Ultrapeer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("grove-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new().context("start runtime")?;
    rt.block_on(async {
        let identity =
            Arc::new(Identity::generate(&cfg.host).context("generate node identity")?);
        tracing::info!(
            derived_port = identity.p2p_port(),
            "node identity generated"
        );

        let node = Ultrapeer::start(identity, cfg)
            .await
            .context("start ultrapeer")?;

        shutdown_signal().await?;
        tracing::info!("shutting down");
        node.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("install Ctrl+C handler")?;
    }
    Ok(())
}
