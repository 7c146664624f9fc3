//! `fieldlink run`: acquisition and reconciliation in one process,
//! joined by an in-memory queue.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fieldlink_core::{MemoryBus, MemoryGraphStore, MemoryValueStore, Receiver};

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;

/// How long to keep consuming after the controllers have stopped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL: Duration = Duration::from_millis(50);

pub async fn handle(
    args: RunArgs,
    global: &GlobalOpts,
    shutdown: CancellationToken,
) -> Result<(), CliError> {
    let config = super::load_config(global)?;

    let bus = MemoryBus::new();
    bus.bind(&config.broker.exchange, &config.broker.queue);
    let source = bus.consume(&config.broker.queue).await.ok_or_else(|| CliError::Validation {
        field: "broker.queue".into(),
        reason: "queue already has a consumer".into(),
    })?;

    // The receiver outlives acquisition so it can drain what was published.
    let receiver_cancel = CancellationToken::new();
    let graph = Arc::new(MemoryGraphStore::new());
    let values = Arc::new(MemoryValueStore::new());
    let receiver = Receiver::new(graph.clone(), values.clone(), config.receiver_settings());
    let background = receiver.spawn_background(&receiver_cancel);
    let consumer = tokio::spawn({
        let receiver = receiver.clone();
        let cancel = receiver_cancel.clone();
        async move { receiver.run(source, cancel).await }
    });

    let ctx = super::context(&config, Arc::new(bus.clone()), shutdown.clone())?;
    let runtimes = super::runtimes(&config, &ctx, &args.only).await?;
    if let Some(duration) = args.duration {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            info!(after = ?duration, "run duration elapsed");
            shutdown.cancel();
        });
    }

    info!(controllers = runtimes.len(), "pipeline started");
    join_all(runtimes.iter().map(|runtime| runtime.run())).await;

    drain(&bus, &config.broker.queue).await;
    if let Err(e) = receiver.settle().await {
        warn!(error = %e, "reconciliation queue closed before it settled");
    }
    receiver_cancel.cancel();
    let result = match consumer.await {
        Ok(result) => result,
        Err(e) => Err(fieldlink_core::CoreError::Fatal {
            reason: format!("receiver task failed: {e}"),
        }),
    };
    join_all(background).await;
    result?;

    super::store::print_summary(&graph, &values).await;
    Ok(())
}

/// Wait until every published message has been settled.
async fn drain(bus: &MemoryBus, queue: &str) {
    let waited = tokio::time::timeout(DRAIN_TIMEOUT, async {
        loop {
            let stats = bus.stats(queue);
            if stats.acked + stats.dropped >= stats.published {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    })
    .await;
    if waited.is_err() {
        let stats = bus.stats(queue);
        warn!(
            published = stats.published,
            acked = stats.acked,
            "stopping with unsettled messages"
        );
    }
}
