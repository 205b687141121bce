//! `kbridge app`: local proxy to one service of a compute session

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::output::{format_banner, print_info};
use kb_core::config::ConfigFile;
use kb_proxy::{ApiSession, LocalProxyListener, LocalTarget};

/// Run the local proxy until `cancel` fires
pub async fn app_command(
    config: &ConfigFile,
    target: LocalTarget,
    cancel: CancellationToken,
) -> Result<()> {
    let client = ApiSession::new(&config.api).context("Failed to create API session")?;
    tracing::info!("Using API endpoint {}", client.endpoint());

    let listener = LocalProxyListener::bind(
        &config.local.bind_address(),
        target,
        Arc::new(client),
        config.relay.clone(),
        cancel.clone(),
    )
    .await?;

    let port = listener.local_addr()?.port();
    print_info(&format_banner(listener.target(), &config.local.bind_host, port));

    let mut serve = tokio::spawn(listener.serve());
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = &mut serve => {
            return result.context("Local proxy task failed")?;
        }
    }

    print_info("Shutting down....");
    serve.await.context("Local proxy task failed")??;
    print_info("Done");
    Ok(())
}
