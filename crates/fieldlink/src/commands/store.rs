//! `fieldlink store`: reconcile JSON-line events read from stdin.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use fieldlink_core::{MemoryGraphStore, MemoryValueStore, Receiver};

use crate::cli::{GlobalOpts, StoreArgs};
use crate::error::CliError;
use crate::lines::LineSource;

pub async fn handle(
    args: StoreArgs,
    global: &GlobalOpts,
    shutdown: CancellationToken,
) -> Result<(), CliError> {
    let config = super::load_config(global)?;
    let graph = Arc::new(MemoryGraphStore::new());
    let values = Arc::new(MemoryValueStore::new());

    let receiver = Receiver::new(graph.clone(), values.clone(), config.receiver_settings());
    let background_cancel = shutdown.child_token();
    let background = receiver.spawn_background(&background_cancel);

    let source = LineSource::new(BufReader::new(tokio::io::stdin()));
    let result = receiver.run(source, shutdown).await;

    background_cancel.cancel();
    join_all(background).await;
    result?;

    if args.summary {
        print_summary(&graph, &values).await;
    }
    Ok(())
}

pub(crate) async fn print_summary(graph: &MemoryGraphStore, values: &MemoryValueStore) {
    let counts = graph.counts().await;
    println!("platforms   {}", counts.platforms);
    println!("sensors     {}", counts.sensors);
    println!("brokers     {}", counts.brokers);
    println!("brokerages  {}", counts.brokerages);
    println!("units       {}", counts.units);
    println!("timeseries  {}", counts.timeseries);
    println!("values      {}", values.len().await);
}
