//! Consumer process: pulls `task_created` tasks from the work queue and
//! forges them until Ctrl+C or a fatal broker condition.

use anvilq::logging::init_tracing;
use anvilq::prelude::*;
use anyhow::Context;
use std::time::Duration;

/// Simulated work per task.
const WORK_DURATION: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AnvilConfig::load().context("loading configuration")?;
    init_tracing(&config.logging);

    let registry = HandlerRegistry::new().with_fn(DEFAULT_PATTERN, |envelope| async move {
        let description = envelope.description().unwrap_or("<none>").to_string();
        tracing::info!("Received task: {}", description);
        tokio::time::sleep(WORK_DURATION).await;
        tracing::info!("Task processed: {}", description);
        Ok(())
    });

    let anvil = Anvil::with_amqp(config, registry)
        .await
        .context("connecting to broker")?;
    anvil.start_forging().await?;

    let result = anvil.wait_for_shutdown().await;
    anvil.close().await?;
    result.context("worker pool stopped on a fatal error")
}
