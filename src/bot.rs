use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::vk::longpoll::{LongPollSession, LongPollTransport};

/// Run the poll → dispatch loop. All dispatch work for one batch finishes
/// before the next poll is issued, since the next cursor depends on it.
/// Returns only on a fatal protocol error; termination is by process exit.
pub async fn run(
    transport: Arc<dyn LongPollTransport>,
    mut dispatcher: Dispatcher,
    wait: u64,
) -> Result<()> {
    let mut session = LongPollSession::connect(transport, wait)
        .await
        .context("Failed to establish long poll session")?;

    info!("Entering poll loop (wait={}s)", wait);
    loop {
        let updates = session.poll().await.context("Long poll failed")?;
        if !updates.is_empty() {
            debug!(
                "received {} update(s), cursor now {}",
                updates.len(),
                session.cursor()
            );
        }
        dispatcher.handle_batch(&updates).await;
    }
}
