//! Local consumer for events relayed through the in-process channel.

use outbox::{InboxDeduplicator, OutboundMessage};
use store::{StoreError, TransactionalStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Spawns a consumer that acknowledges each relayed event exactly once.
///
/// Every message is guarded by the inbox, so a row the dispatcher
/// republishes after a lost confirmation is recognised and dropped.
pub fn spawn_consumer<S>(
    inbox: InboxDeduplicator<S>,
    mut receiver: mpsc::Receiver<OutboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: TransactionalStore + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = receiver.recv() => {
                    let Some(message) = message else { break };
                    handle(&inbox, &message).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("event consumer stopped");
    })
}

async fn handle<S: TransactionalStore>(inbox: &InboxDeduplicator<S>, message: &OutboundMessage) {
    let outcome = inbox
        .consume_once::<(), StoreError, _>(&message.message_id, |_uow| Box::pin(async { Ok(()) }))
        .await;

    match outcome {
        Ok(Some(())) => {
            metrics::counter!("events_consumed_total", "event_type" => message.event_type.clone())
                .increment(1);
            tracing::info!(
                message_id = %message.message_id,
                routing_key = %message.routing_key,
                event_type = %message.event_type,
                "event consumed"
            );
        }
        Ok(None) => {
            tracing::debug!(message_id = %message.message_id, "duplicate event ignored");
        }
        Err(e) => {
            tracing::error!(message_id = %message.message_id, error = %e, "event consumption failed");
        }
    }
}
