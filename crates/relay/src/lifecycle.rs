// Lifecycle coordinator
//
// Wires the checkpoint store, gap-fill fetcher, stream client and dispatcher
// together for one run. The coordinator loop is the only place that mutates
// the checkpoint or calls the notifier; the checkpoint is persisted once on
// every exit path, including a failed connect.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{AuthHeaders, Config, Endpoints};
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{ConfigError, Result};
use crate::event::Inbound;
use crate::gapfill::GapFillFetcher;
use crate::notifier::Notifier;
use crate::stream::{CloseReason, ShutdownOutcome, StreamClient, StreamOptions};

/// Capacity of the channel shared by the live stream and the gap-fill fetch
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Everything a run needs, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub endpoints: Endpoints,
    pub headers: AuthHeaders,
    pub cache_dir: PathBuf,
    pub fetch_missed: bool,
    pub stream: StreamOptions,
}

impl RelaySettings {
    /// Expects a resolved config (see [`Config::resolve`])
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        let cache_dir = config.cache_dir().ok_or(ConfigError::NoCacheDir)?;
        Ok(Self {
            endpoints: config.endpoints()?,
            headers: config.auth_headers(),
            cache_dir: cache_dir.to_path_buf(),
            fetch_missed: config.fetch_missed,
            stream: StreamOptions::new(config.keep_alive()?),
        })
    }

    /// Point both URLs somewhere else (plain `ws://` / `http://` in tests)
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.stream = options;
        self
    }

    pub fn with_fetch_missed(mut self, fetch_missed: bool) -> Self {
        self.fetch_missed = fetch_missed;
        self
    }
}

/// Why a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The connection ended on its own (remote close, deadline, transport error)
    StreamClosed(CloseReason),
    /// The interrupt fired and the stream was shut down
    Interrupted(ShutdownOutcome),
}

impl ExitReason {
    /// Graceful stop or clean remote close
    pub fn is_clean(&self) -> bool {
        match self {
            ExitReason::StreamClosed(reason) => reason.is_clean(),
            ExitReason::Interrupted(_) => true,
        }
    }
}

/// Result of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub exit: ExitReason,
    pub stats: DispatchStats,
    /// Checkpoint as persisted on exit
    pub checkpoint: Checkpoint,
}

/// One relay run: gap-fill, live stream, dispatch, persist
pub struct Relay {
    settings: RelaySettings,
    notifier: Arc<dyn Notifier>,
}

impl Relay {
    pub fn new(settings: RelaySettings, notifier: Arc<dyn Notifier>) -> Self {
        Self { settings, notifier }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Run until the stream closes or `interrupt` resolves.
    ///
    /// Only a failed connect is returned as an error; the checkpoint has
    /// already been persisted by then.
    #[instrument(skip_all, fields(stream = %self.settings.endpoints.stream))]
    pub async fn run<F>(self, interrupt: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let store = CheckpointStore::new(&self.settings.cache_dir);
        let checkpoint = match store.load() {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                error!(error = %e, "failed to load checkpoint, starting from scratch");
                Checkpoint::default()
            }
        };

        let mut dispatcher = Dispatcher::new(Arc::clone(&self.notifier), checkpoint.clone());
        let result = self.drive(&mut dispatcher, checkpoint, interrupt).await;

        let stats = dispatcher.stats();
        let checkpoint = dispatcher.into_checkpoint();
        persist(&store, &checkpoint);

        let exit = result?;
        info!(
            exit = ?exit,
            delivered = stats.delivered,
            failed = stats.failed,
            ignored = stats.ignored,
            "relay stopped"
        );
        Ok(RunSummary {
            exit,
            stats,
            checkpoint,
        })
    }

    async fn drive<F>(
        &self,
        dispatcher: &mut Dispatcher,
        checkpoint: Checkpoint,
        interrupt: F,
    ) -> Result<ExitReason>
    where
        F: Future<Output = ()>,
    {
        let (events_tx, mut events_rx) = mpsc::channel::<Inbound>(EVENT_CHANNEL_CAPACITY);

        if self.settings.fetch_missed {
            let fetcher =
                GapFillFetcher::new(self.settings.endpoints.clone(), self.settings.headers.clone());
            // Detached: never awaited, ends with the process at the latest
            tokio::spawn(fetcher.run(checkpoint, events_tx.clone()));
        } else {
            debug!("gap-fill disabled");
        }

        let client = StreamClient::new(
            self.settings.endpoints.stream.clone(),
            self.settings.headers.clone(),
            self.settings.stream.clone(),
        );
        let mut session = match client.connect(events_tx).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "failed to subscribe to ntfy");
                return Err(e.into());
            }
        };
        info!("subscribed to ntfy");

        tokio::pin!(interrupt);

        let exit = loop {
            tokio::select! {
                reason = session.closed() => {
                    // The reader queues everything it decoded before reporting the close
                    while let Ok(inbound) = events_rx.try_recv() {
                        dispatcher.dispatch_inbound(inbound).await;
                    }
                    break ExitReason::StreamClosed(reason);
                }
                _ = &mut interrupt => {
                    info!("closing ntfy-relay");
                    break ExitReason::Interrupted(session.shutdown().await);
                }
                Some(inbound) = events_rx.recv() => {
                    dispatcher.dispatch_inbound(inbound).await;
                }
            }
        };

        Ok(exit)
    }
}

/// Best effort; a failed write is logged and the run still ends normally
fn persist(store: &CheckpointStore, checkpoint: &Checkpoint) {
    if let Err(e) = store.save(checkpoint) {
        error!(error = %e, "failed to persist checkpoint");
    }
}
