// Gap-fill fetcher
//
// One-shot catch-up on startup: poll everything cached on the server since the
// last checkpoint and hand it to the dispatcher. Runs concurrently with the
// live stream and is never retried.

use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::{AuthHeaders, Endpoints};
use crate::error::FetchError;
use crate::event::{Event, EventSource, Inbound};

/// Longest line accepted from the poll body; a longer one aborts the fetch
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Counts for one gap-fill run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapFillSummary {
    /// Events handed to the dispatcher
    pub forwarded: usize,
    /// Boundary events dropped because they were already delivered
    pub skipped: usize,
    /// Lines that did not decode
    pub malformed: usize,
    /// The whole body was read
    pub completed: bool,
}

/// Why a gap-fill ended early
#[derive(Debug)]
enum Interrupted {
    Transport(FetchError),
    ConsumerGone,
}

pub struct GapFillFetcher {
    client: Client,
    endpoints: Endpoints,
    headers: AuthHeaders,
}

impl GapFillFetcher {
    /// No client-side timeout: the server holds the response open while it streams
    pub fn new(endpoints: Endpoints, headers: AuthHeaders) -> Self {
        Self::with_client(Client::new(), endpoints, headers)
    }

    pub fn with_client(client: Client, endpoints: Endpoints, headers: AuthHeaders) -> Self {
        Self {
            client,
            endpoints,
            headers,
        }
    }

    /// Fetch and forward; failures are logged and end the fetch
    pub async fn run(self, checkpoint: Checkpoint, tx: mpsc::Sender<Inbound>) -> GapFillSummary {
        info!(since = %checkpoint.last_seen_timestamp, "fetching cached messages");

        let mut summary = GapFillSummary::default();
        match self.fetch(&checkpoint, &tx, &mut summary).await {
            Ok(()) => {}
            Err(Interrupted::Transport(e)) => {
                error!(error = %e, "failed to fetch cached messages");
            }
            Err(Interrupted::ConsumerGone) => {
                debug!("relay stopped before cached messages were forwarded");
            }
        }

        info!(
            count = summary.forwarded,
            skipped = summary.skipped,
            malformed = summary.malformed,
            completed = summary.completed,
            "fetched cached messages"
        );
        summary
    }

    async fn fetch(
        &self,
        checkpoint: &Checkpoint,
        tx: &mpsc::Sender<Inbound>,
        summary: &mut GapFillSummary,
    ) -> Result<(), Interrupted> {
        let url = self.endpoints.poll_since(&checkpoint.last_seen_timestamp);
        debug!(url = %url, "requesting cached messages");

        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, &self.headers.user_agent);
        if let Some(authorization) = &self.headers.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Interrupted::Transport(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Interrupted::Transport(FetchError::Status {
                status: status.as_u16(),
                message: message.trim().to_string(),
            }));
        }

        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Interrupted::Transport(e.into()))?;
            // Bytes before this point were already searched for a newline
            let mut scan_from = buffer.len();
            buffer.extend_from_slice(&chunk);

            let mut line_start = 0;
            while let Some(offset) = buffer[scan_from..].iter().position(|b| *b == b'\n') {
                let end = scan_from + offset;
                check_line_length(end - line_start)?;
                forward_line(&buffer[line_start..end], checkpoint, tx, summary).await?;
                line_start = end + 1;
                scan_from = line_start;
            }
            buffer.drain(..line_start);
            check_line_length(buffer.len())?;
        }

        // Last line without a trailing newline
        if !buffer.is_empty() {
            forward_line(&buffer, checkpoint, tx, summary).await?;
        }

        summary.completed = true;
        Ok(())
    }
}

fn check_line_length(len: usize) -> Result<(), Interrupted> {
    if len > MAX_LINE_BYTES {
        return Err(Interrupted::Transport(FetchError::LineTooLong {
            limit: MAX_LINE_BYTES,
        }));
    }
    Ok(())
}

async fn forward_line(
    line: &[u8],
    checkpoint: &Checkpoint,
    tx: &mpsc::Sender<Inbound>,
    summary: &mut GapFillSummary,
) -> Result<(), Interrupted> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    let event = match Event::from_json(line) {
        Ok(event) => event,
        Err(e) => {
            summary.malformed += 1;
            warn!(error = %e, "failed to parse cached message");
            return Ok(());
        }
    };

    if checkpoint.is_boundary(&event) {
        debug!(message_id = %event.id, "skipping already delivered message");
        summary.skipped += 1;
        return Ok(());
    }

    tx.send(Inbound {
        source: EventSource::GapFill,
        event,
    })
    .await
    .map_err(|_| Interrupted::ConsumerGone)?;
    summary.forwarded += 1;
    Ok(())
}
