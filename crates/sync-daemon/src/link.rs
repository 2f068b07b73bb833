//! Connection from the agent to the sync server.
//!
//! [`ServerLink::run`] keeps one WebSocket session open, reconnecting with
//! exponential backoff. Each session says `hello` with the engine's cursor so
//! the server replays only what the engine has not seen, then forwards every
//! `event` frame to the engine. The link is also the engine's [`EventSink`]:
//! a submission is written to the current session and completes when the
//! server acks or rejects its `local_id`.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sync_core::protocol::{ClientMessage, Credentials, ServerMessage, check_version};
use sync_core::retry::calculate_backoff;
use sync_core::transport::{self, EventSink, TransportError};
use sync_core::{Event, PeerId, RemoteCursor, RetryConfig, ShutdownBarrier};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

/// Bound on connecting and on waiting for `welcome`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type AckSender = oneshot::Sender<transport::Result<u64>>;

/// The server refused the configured credentials. Retrying cannot help.
#[derive(Debug, Error)]
#[error("Server denied login: {0}")]
pub struct LoginDenied(pub String);

/// State of the current session, if any.
#[derive(Default)]
struct Session {
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    /// Submissions waiting for ack, by local id
    pending: HashMap<u64, AckSender>,
}

pub struct ServerLink {
    url: String,
    peer_id: PeerId,
    credentials: Credentials,
    ack_timeout: Duration,
    reconnect: RetryConfig,
    session: Mutex<Session>,
}

impl ServerLink {
    pub fn new(
        url: impl Into<String>,
        peer_id: PeerId,
        credentials: Credentials,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            peer_id,
            credentials,
            ack_timeout,
            reconnect: RetryConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                max_attempts: None,
                ..RetryConfig::default()
            },
            session: Mutex::new(Session::default()),
        }
    }

    /// Override the reconnect backoff.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.outgoing.is_some()
    }

    /// Stay connected until shutdown or until the engine stops taking events.
    ///
    /// A denied login triggers shutdown with exit code 1.
    pub async fn run(
        self: Arc<Self>,
        cursor: RemoteCursor,
        remote_tx: mpsc::Sender<Event>,
        shutdown: ShutdownBarrier,
    ) {
        let mut failures = 0;
        loop {
            let session = shutdown
                .run_until_exit(self.connect_once(&cursor, &remote_tx, &mut failures))
                .await;
            self.disconnect().await;

            match session {
                None => break,
                Some(Ok(())) if remote_tx.is_closed() => break,
                Some(Ok(())) => info!("Server closed the connection"),
                Some(Err(e)) if e.is::<LoginDenied>() => {
                    error!("{}; check [server] username and password", e);
                    shutdown.exit(1);
                    break;
                }
                Some(Err(e)) => warn!("Server connection failed: {:#}", e),
            }

            failures += 1;
            let delay = calculate_backoff(failures, &self.reconnect);
            info!("Reconnecting to {} in {:?} (attempt {})", self.url, delay, failures);
            if shutdown
                .run_until_exit(tokio::time::sleep(delay))
                .await
                .is_none()
            {
                break;
            }
        }
        debug!("Server link stopped");
    }

    /// One connection, from handshake until it drops.
    async fn connect_once(
        &self,
        cursor: &RemoteCursor,
        remote_tx: &mpsc::Sender<Event>,
        failures: &mut u32,
    ) -> Result<()> {
        let (ws_stream, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(&self.url))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", self.url))?
            .with_context(|| format!("Failed to connect to {}", self.url))?;
        let (mut write, mut read) = ws_stream.split();

        let resume_from = cursor.dispatched().await;
        let hello = ClientMessage::hello(self.peer_id, &self.credentials, resume_from);
        write.send(Message::Text(hello.to_json().into())).await?;

        let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_message(&mut read))
            .await
            .map_err(|_| anyhow!("No welcome within {:?}", HANDSHAKE_TIMEOUT))??;
        let last_id = match welcome {
            Some(ServerMessage::Welcome { version, last_id }) => {
                check_version(version)?;
                last_id
            }
            Some(ServerMessage::Denied { reason }) => return Err(LoginDenied(reason).into()),
            Some(other) => bail!("Expected welcome, got {:?}", other),
            None => bail!("Server closed the connection during handshake"),
        };
        info!(
            "Connected to {} as {}, resuming after #{} of {}",
            self.url, self.peer_id, resume_from, last_id
        );
        *failures = 0;
        if last_id < resume_from {
            warn!(
                "Server log ends at #{} but this agent has seen #{}; following the server",
                last_id, resume_from
            );
            cursor.rewind(last_id).await;
        }

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel();
        self.session.lock().await.outgoing = Some(outgoing);

        loop {
            tokio::select! {
                Some(frame) = outgoing_rx.recv() => write.send(frame).await?,
                incoming = next_message(&mut read) => match incoming? {
                    None => return Ok(()),
                    Some(ServerMessage::Event { event }) => {
                        if remote_tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(ServerMessage::Ack { local_id, id }) => self.resolve(local_id, Ok(id)).await,
                    Some(ServerMessage::Rejected { local_id, reason }) => {
                        self.resolve(local_id, Err(TransportError::Rejected(reason))).await;
                    }
                    Some(message @ (ServerMessage::Welcome { .. } | ServerMessage::Denied { .. })) => {
                        warn!("Ignoring unexpected {:?}", message);
                    }
                },
            }
        }
    }

    async fn resolve(&self, local_id: u64, result: transport::Result<u64>) {
        match self.session.lock().await.pending.remove(&local_id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!("Reply for unknown submission {}", local_id),
        }
    }

    /// Drop the current session; unanswered submissions fail as not connected.
    async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        session.outgoing = None;
        for (_, waiter) in session.pending.drain() {
            let _ = waiter.send(Err(TransportError::NotConnected));
        }
    }
}

#[async_trait]
impl EventSink for ServerLink {
    async fn submit(&self, event: &Event) -> transport::Result<u64> {
        let local_id = event.local_id;
        let (waiter, reply) = oneshot::channel();
        {
            let mut session = self.session.lock().await;
            let Some(outgoing) = session.outgoing.clone() else {
                return Err(TransportError::NotConnected);
            };
            let frame = ClientMessage::Submit {
                event: event.clone(),
            };
            outgoing
                .send(Message::Text(frame.to_json().into()))
                .map_err(|_| TransportError::NotConnected)?;
            session.pending.insert(local_id, waiter);
        }

        match tokio::time::timeout(self.ack_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                self.session.lock().await.pending.remove(&local_id);
                Err(TransportError::Timeout)
            }
        }
    }
}

/// Next protocol message, or `None` once the server hangs up.
async fn next_message<S>(read: &mut S) -> Result<Option<ServerMessage>>
where
    S: futures::Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => {
                String::from_utf8(data.to_vec()).map_err(|_| anyhow!("Binary frame is not UTF-8"))?
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
            Some(Err(e)) => return Err(e.into()),
        };
        return Ok(Some(ServerMessage::from_json(&text)?));
    }
}
