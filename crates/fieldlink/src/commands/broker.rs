//! `fieldlink broker`: acquisition only, events written to stdout.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::{BrokerArgs, GlobalOpts};
use crate::error::CliError;
use crate::lines::LineSink;

pub async fn handle(
    args: BrokerArgs,
    global: &GlobalOpts,
    shutdown: CancellationToken,
) -> Result<(), CliError> {
    let config = super::load_config(global)?;
    let sink = Arc::new(LineSink::new(tokio::io::stdout()));
    let ctx = super::context(&config, sink, shutdown)?;

    let runtimes = super::runtimes(&config, &ctx, &args.only).await?;
    info!(controllers = runtimes.len(), "acquisition started");

    join_all(runtimes.iter().map(|runtime| runtime.run())).await;
    info!("acquisition stopped");
    Ok(())
}
