//! Live subscription stream
//!
//! A [`StreamSession`] is one WebSocket subscription. It runs two tasks:
//!
//! ```text
//!            ┌──────────── control channel (Close) ───────────┐
//!            │                                                ▼
//! coordinator ──────────────────────────────────────▶  writer / heartbeat ──▶ socket
//!      ▲                                                  (Ping every 9/10 keep-alive)
//!      │ events channel
//!      └──────────────  reader (decode frames, pong resets deadline)  ◀── socket
//! ```
//!
//! Only the writer touches the sink half of the socket, so heartbeat pings and
//! the close frame are serialized. The reader publishes the terminal
//! [`SessionState::Closed`] on a watch channel, which is the "stream closed"
//! signal the coordinator waits on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{AuthHeaders, MAX_KEEP_ALIVE_SECS};
use crate::error::ConnectError;
use crate::event::{Event, EventSource, Inbound};
use crate::proxy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Consecutive undecodable frames tolerated before the connection is treated as degraded
pub const MAX_CONSECUTIVE_DECODE_FAILURES: usize = 16;

/// Keep-alive bounds; timer arithmetic stays in range and the ping period is never zero
const MIN_KEEP_ALIVE: Duration = Duration::from_millis(10);
const MAX_KEEP_ALIVE: Duration = Duration::from_secs(MAX_KEEP_ALIVE_SECS);

/// Timing policy for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Read deadline; reset by every pong
    pub keep_alive: Duration,
    /// Bound on the opening handshake
    pub handshake_timeout: Duration,
    /// Bound on each control-frame write
    pub write_timeout: Duration,
    /// How long shutdown waits for the close handshake to complete
    pub shutdown_grace: Duration,
    pub max_decode_failures: usize,
    /// Explicit HTTP proxy; when unset the proxy environment is consulted
    pub proxy: Option<Url>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(1),
            max_decode_failures: MAX_CONSECUTIVE_DECODE_FAILURES,
            proxy: None,
        }
    }
}

impl StreamOptions {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            keep_alive: keep_alive.clamp(MIN_KEEP_ALIVE, MAX_KEEP_ALIVE),
            ..Default::default()
        }
    }

    /// Tunnel through this `http://` proxy regardless of the environment
    pub fn with_proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_decode_failures(mut self, max: usize) -> Self {
        self.max_decode_failures = max.max(1);
        self
    }

    /// Keep-alive actually used by the session
    pub fn effective_keep_alive(&self) -> Duration {
        self.keep_alive.clamp(MIN_KEEP_ALIVE, MAX_KEEP_ALIVE)
    }

    /// Pings go out at 9/10 of the keep-alive so a pong can land before the deadline
    pub fn ping_period(&self) -> Duration {
        let keep_alive = self.effective_keep_alive();
        keep_alive
            .checked_mul(9)
            .map_or(keep_alive / 10 * 9, |period| period / 10)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Close handshake with status 1000
    Normal,
    /// Remote sent a close frame with another (or no) status
    Remote { code: u16, reason: String },
    /// No pong within the keep-alive window
    DeadlineExpired,
    /// Too many consecutive undecodable frames
    Degraded { failures: usize },
    /// Socket error
    Transport(String),
    /// Socket ended without a close frame
    Reset,
}

impl CloseReason {
    pub fn is_clean(&self) -> bool {
        matches!(self, CloseReason::Normal)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "normal closure"),
            CloseReason::Remote { code, reason } if reason.is_empty() => {
                write!(f, "closed by remote with code {code}")
            }
            CloseReason::Remote { code, reason } => {
                write!(f, "closed by remote with code {code}: {reason}")
            }
            CloseReason::DeadlineExpired => write!(f, "read deadline expired"),
            CloseReason::Degraded { failures } => {
                write!(f, "{failures} consecutive undecodable frames")
            }
            CloseReason::Transport(e) => write!(f, "transport error: {e}"),
            CloseReason::Reset => write!(f, "connection reset without close frame"),
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed(CloseReason),
}

/// Result of a graceful shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Reader observed the close within the grace period
    Confirmed(CloseReason),
    /// Grace period elapsed first; resources were released anyway
    TimedOut,
    /// The session had already closed on its own
    AlreadyClosed(CloseReason),
}

/// Frames other than heartbeat pings that the writer sends on request
#[derive(Debug)]
enum Control {
    Close(oneshot::Sender<Result<(), String>>),
}

/// Opens subscriptions to one stream URL
#[derive(Debug, Clone)]
pub struct StreamClient {
    url: Url,
    headers: AuthHeaders,
    options: StreamOptions,
}

impl StreamClient {
    pub fn new(url: Url, headers: AuthHeaders, options: StreamOptions) -> Self {
        Self {
            url,
            headers,
            options,
        }
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Perform the handshake and start the reader and heartbeat tasks.
    ///
    /// Decoded events are sent on `events` in wire order.
    pub async fn connect(
        &self,
        events: mpsc::Sender<Inbound>,
    ) -> Result<StreamSession, ConnectError> {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let url = self.url.to_string();

        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|source| ConnectError::Handshake {
                    url: url.clone(),
                    source,
                })?;
        let headers = request.headers_mut();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.headers.user_agent)
                .map_err(|_| ConnectError::InvalidHeader { name: "User-Agent" })?,
        );
        if let Some(authorization) = &self.headers.authorization {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(authorization)
                    .map_err(|_| ConnectError::InvalidHeader {
                        name: "Authorization",
                    })?,
            );
        }

        let via = self
            .options
            .proxy
            .clone()
            .or_else(|| proxy::proxy_for(&self.url));
        let target = self.url.clone();
        let handshake_url = url.clone();
        let handshake = async move {
            let handshake_error = |source| ConnectError::Handshake {
                url: handshake_url.clone(),
                source,
            };
            match via {
                Some(proxy_url) => {
                    debug!(
                        url = %handshake_url,
                        proxy = %proxy::display(&proxy_url),
                        "subscribing to ntfy endpoint through proxy"
                    );
                    let tunnel = proxy::tunnel(&proxy_url, &target).await?;
                    tokio_tungstenite::client_async_tls_with_config(request, tunnel, None, None)
                        .await
                        .map_err(handshake_error)
                }
                None => {
                    debug!(url = %handshake_url, "subscribing to ntfy endpoint");
                    tokio_tungstenite::connect_async(request)
                        .await
                        .map_err(handshake_error)
                }
            }
        };

        let (ws, _response) = timeout(self.options.handshake_timeout, handshake)
            .await
            .map_err(|_| ConnectError::HandshakeTimeout {
                url: url.clone(),
                timeout: self.options.handshake_timeout,
            })??;

        let state_tx = Arc::new(state_tx);
        state_tx.send_replace(SessionState::Open);

        let (sink, stream) = ws.split();
        let (control_tx, control_rx) = mpsc::channel(1);

        let ping_period = self.options.ping_period();
        let write_timeout = self.options.write_timeout;
        let writer = tokio::spawn(async move {
            write_loop(sink, control_rx, ping_period, write_timeout).await;
            debug!("heartbeat loop exited");
        });
        let reader = tokio::spawn(read_loop(
            stream,
            events,
            Arc::clone(&state_tx),
            self.options.effective_keep_alive(),
            self.options.max_decode_failures,
        ));

        Ok(StreamSession {
            state_tx,
            state_rx,
            control_tx,
            reader,
            writer,
            shutdown_grace: self.options.shutdown_grace,
        })
    }
}

/// One live subscription; never reused after it closes
pub struct StreamSession {
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    control_tx: mpsc::Sender<Control>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl StreamSession {
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Resolves once the reader has stopped. Cancel safe.
    pub async fn closed(&mut self) -> CloseReason {
        wait_closed(&mut self.state_rx).await
    }

    /// Send a close frame and wait (bounded) for the reader to observe the close
    pub async fn shutdown(mut self) -> ShutdownOutcome {
        if let SessionState::Closed(reason) = self.state() {
            return ShutdownOutcome::AlreadyClosed(reason);
        }

        self.state_tx.send_if_modified(|state| {
            if matches!(state, SessionState::Closed(_)) {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });

        let (ack_tx, ack_rx) = oneshot::channel();
        let sent = match self.control_tx.send(Control::Close(ack_tx)).await {
            Ok(()) => ack_rx
                .await
                .unwrap_or_else(|_| Err("writer stopped".to_string())),
            Err(_) => Err("writer stopped".to_string()),
        };
        if let Err(e) = sent {
            error!(error = %e, "failed to send close message to ntfy");
        }

        match timeout(self.shutdown_grace, wait_closed(&mut self.state_rx)).await {
            Ok(reason) => ShutdownOutcome::Confirmed(reason),
            Err(_) => {
                debug!(grace = ?self.shutdown_grace, "ntfy endpoint timed out");
                ShutdownOutcome::TimedOut
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn wait_closed(state_rx: &mut watch::Receiver<SessionState>) -> CloseReason {
    loop {
        if let SessionState::Closed(reason) = &*state_rx.borrow_and_update() {
            return reason.clone();
        }
        if state_rx.changed().await.is_err() {
            return CloseReason::Reset;
        }
    }
}

/// Heartbeat and control-frame writer; owns the sink half of the socket
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut control_rx: mpsc::Receiver<Control>,
    ping_period: Duration,
    write_timeout: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match timeout(write_timeout, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => debug!("sent ping to ntfy endpoint"),
                    // The reader notices the dead connection through its deadline
                    Ok(Err(e)) => {
                        debug!(error = %e, "ping failed, stopping heartbeat");
                        return;
                    }
                    Err(_) => {
                        debug!("ping write timed out, stopping heartbeat");
                        return;
                    }
                }
            }
            control = control_rx.recv() => {
                match control {
                    Some(Control::Close(ack)) => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        let result = match timeout(write_timeout, sink.send(Message::Close(Some(frame)))).await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(_) => Err(format!("write timed out after {write_timeout:?}")),
                        };
                        let _ = ack.send(result);
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

/// Reader task: runs until the connection ends, then publishes `Closed`
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<Inbound>,
    state_tx: Arc<watch::Sender<SessionState>>,
    keep_alive: Duration,
    max_decode_failures: usize,
) {
    let reason = read_frames(&mut stream, &events, keep_alive, max_decode_failures).await;

    if reason.is_clean() {
        info!("ntfy closed connection");
    } else {
        error!(reason = %reason, "cannot read ntfy message");
    }
    state_tx.send_replace(SessionState::Closed(reason));
    debug!("read loop exited");
}

async fn read_frames(
    stream: &mut SplitStream<WsStream>,
    events: &mpsc::Sender<Inbound>,
    keep_alive: Duration,
    max_decode_failures: usize,
) -> CloseReason {
    let mut deadline = Instant::now() + keep_alive;
    let mut decode_failures = 0usize;
    let mut close_frame: Option<CloseReason> = None;

    loop {
        let next = match timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => return close_frame.unwrap_or(CloseReason::DeadlineExpired),
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                return close_frame.unwrap_or(CloseReason::Normal)
            }
            Some(Err(e)) => {
                return close_frame.unwrap_or_else(|| CloseReason::Transport(e.to_string()))
            }
            None => return close_frame.unwrap_or(CloseReason::Reset),
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Pong(_) => {
                deadline = Instant::now() + keep_alive;
                debug!("received pong from ntfy endpoint");
                continue;
            }
            // Pings are answered by the protocol layer on the next read
            Message::Ping(_) | Message::Frame(_) => continue,
            Message::Close(frame) => {
                // Keep reading so the close reply is flushed and the socket drains
                close_frame = Some(classify_close(frame));
                continue;
            }
        };

        match Event::from_json(&text) {
            Ok(event) => {
                decode_failures = 0;
                debug!(event_id = %event.id, kind = ?event.kind, "received ws message");
                let inbound = Inbound {
                    source: EventSource::Live,
                    event,
                };
                if events.send(inbound).await.is_err() {
                    // Coordinator is gone; nothing left to deliver to
                    return CloseReason::Normal;
                }
            }
            Err(e) => {
                decode_failures += 1;
                warn!(error = %e, failures = decode_failures, "failed to decode ws message");
                if decode_failures >= max_decode_failures {
                    return CloseReason::Degraded {
                        failures: decode_failures,
                    };
                }
            }
        }
    }
}

fn classify_close(frame: Option<CloseFrame<'_>>) -> CloseReason {
    match frame {
        Some(frame) if frame.code == CloseCode::Normal => CloseReason::Normal,
        Some(frame) => CloseReason::Remote {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        },
        None => CloseReason::Remote {
            code: 1005,
            reason: String::new(),
        },
    }
}
