//! `kbridge proxy`: unauthenticated API gateway for development use

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::output::{print_info, print_warning};
use kb_core::config::ConfigFile;
use kb_proxy::{ApiSession, GatewayProxyServer};

/// Run the gateway until `cancel` fires
pub async fn proxy_command(config: &ConfigFile, cancel: CancellationToken) -> Result<()> {
    let client = ApiSession::new(&config.api).context("Failed to create API session")?;

    let server = GatewayProxyServer::bind(
        &config.gateway.bind_address(),
        Arc::new(client),
        config.relay.clone(),
        cancel.clone(),
    )
    .await?;

    let port = server.local_addr()?.port();
    print_warning("The gateway adds no authentication; use it for development and testing only");
    print_info(&format!(
        "Relaying http://{}:{} to {}",
        config.gateway.bind_host, port, config.api.endpoint
    ));

    let mut serve = tokio::spawn(server.serve());
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = &mut serve => {
            return result.context("Gateway task failed")?;
        }
    }

    print_info("Shutting down....");
    serve.await.context("Gateway task failed")??;
    print_info("Done");
    Ok(())
}
