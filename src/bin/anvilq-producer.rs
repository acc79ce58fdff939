//! Producer process: accepts task submissions over HTTP and publishes them
//! to the work queue.

use anvilq::http;
use anvilq::logging::init_tracing;
use anvilq::prelude::*;
use anyhow::Context;
use tokio::net::TcpListener;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:3000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AnvilConfig::load().context("loading configuration")?;
    init_tracing(&config.logging);

    let addr = std::env::var("ANVILQ_HTTP_ADDR").unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    // No workers here; the Anvil is only used for its channel
    let anvil = Anvil::with_amqp(config, HandlerRegistry::new())
        .await
        .context("connecting to broker")?;

    http::serve(listener, anvil.submitter(), async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C, stopping producer");
    })
    .await
    .context("serving HTTP")?;

    anvil.close().await?;
    Ok(())
}
