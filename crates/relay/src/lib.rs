// ntfy relay
//
// Subscribes to ntfy topics over a WebSocket and shows each message as a
// desktop notification. A checkpoint of the last delivered message lets a
// restarted relay catch up on what it missed through the poll endpoint.
//
// Key design decisions:
// - Two producers (live stream, one-shot gap-fill) feed one bounded channel
// - A single coordinator loop owns the checkpoint and the notifier
// - The checkpoint only moves after a notification is accepted
// - Only a failed connect ends a run with an error; there is no reconnect

pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod gapfill;
pub mod lifecycle;
pub mod notifier;
pub mod proxy;
pub mod stream;

// In-memory implementations for examples and testing
pub mod memory;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{AuthHeaders, Config, Endpoints};
pub use dispatcher::{DispatchOutcome, DispatchStats, Dispatcher};
pub use error::{RelayError, Result};
pub use event::{Event, EventKind, EventSource, Inbound};
pub use lifecycle::{ExitReason, Relay, RelaySettings, RunSummary};
pub use notifier::{CommandNotifier, Notifier};
pub use stream::{CloseReason, ShutdownOutcome, StreamClient, StreamOptions};
