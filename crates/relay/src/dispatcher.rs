// Dispatcher
//
// The single consumer of events from the live stream and the gap-fill fetch.
// "Notify, then advance the checkpoint" is one step here; nothing else reads
// or writes the checkpoint while the relay runs.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::checkpoint::Checkpoint;
use crate::event::{Event, EventSource, Inbound};
use crate::notifier::Notifier;

/// What happened to one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Shown to the user; the checkpoint moved if the event was not older
    Delivered { advanced: bool },
    /// Not a `message` event
    Ignored,
    /// The sink rejected it; the checkpoint is unchanged
    Failed,
}

/// Running totals for a relay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub failed: usize,
    pub ignored: usize,
}

pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    checkpoint: Checkpoint,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, checkpoint: Checkpoint) -> Self {
        Self {
            notifier,
            checkpoint,
            stats: DispatchStats::default(),
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub async fn dispatch_inbound(&mut self, inbound: Inbound) -> DispatchOutcome {
        self.dispatch(inbound.source, &inbound.event).await
    }

    /// Deliver one event and advance the checkpoint on success
    pub async fn dispatch(&mut self, source: EventSource, event: &Event) -> DispatchOutcome {
        if !event.is_message() {
            debug!(%source, event_id = %event.id, kind = ?event.kind, "ignoring non-message event");
            self.stats.ignored += 1;
            return DispatchOutcome::Ignored;
        }

        info!(%source, message_id = %event.id, topic = %event.topic, "received ntfy message");

        match self
            .notifier
            .notify(event.display_title(), &event.message)
            .await
        {
            Ok(()) => {
                let advanced = self.checkpoint.advance(event);
                self.stats.delivered += 1;
                debug!(
                    %source,
                    message_id = %event.id,
                    time = %event.time,
                    advanced,
                    "notified message"
                );
                DispatchOutcome::Delivered { advanced }
            }
            Err(e) => {
                self.stats.failed += 1;
                error!(%source, message_id = %event.id, error = %e, "failed to notify message");
                DispatchOutcome::Failed
            }
        }
    }

    /// Final checkpoint, consuming the dispatcher
    pub fn into_checkpoint(self) -> Checkpoint {
        self.checkpoint
    }
}
