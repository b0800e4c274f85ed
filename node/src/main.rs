//! `swarmcache-node`: boots a peer-to-peer content distribution node
//! and runs it until Ctrl+C/SIGTERM.
//!
//! The interactive CLI driver, config-file discovery beyond
//! environment overrides, metrics reporting, and any HTTP control
//! surface are deliberately not this binary's job.

use swarmcache_core::{Node, NodeConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = NodeConfig::from_env();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let node = Node::bootstrap(config).await?;
        tracing::info!(addr = %node.local_addr(), "node running");
        shutdown_signal().await?;
        node.shutdown().await?;
        Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
