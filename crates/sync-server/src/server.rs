//! WebSocket server fanning the event log out to agents.
//!
//! Each connection gets its own task. The first frame must be a `hello`
//! whose credentials match an active account. The task then subscribes to
//! live appends, replays the log from the agent's resume point in batches,
//! and then forwards every new event while appending the agent's own
//! submissions. Events reach every agent, the submitter included.

use crate::persistence::FileEventLog;
use crate::users::Users;
use anyhow::{Context, Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sync_core::event_log::EventLog;
use sync_core::protocol::{ClientMessage, ServerMessage, check_version};
use sync_core::{PeerId, ShutdownBarrier};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{
    WebSocketStream, accept_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

/// Events sent per replay batch.
pub const REPLAY_BATCH: usize = 256;

/// How long a new connection may take to say hello.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

type WsWrite = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRead = SplitStream<WebSocketStream<TcpStream>>;

pub struct SyncServer {
    log: Arc<FileEventLog>,
    users: Arc<Users>,
    shutdown: ShutdownBarrier,
}

impl SyncServer {
    pub fn new(log: Arc<FileEventLog>, users: Users, shutdown: ShutdownBarrier) -> Self {
        Self {
            log,
            users: Arc::new(users),
            shutdown,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", listen_addr))?;
        info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until shutdown.
    pub async fn run(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.wait_for_exit() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let log = self.log.clone();
                        let users = self.users.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            let session = Session::accept(stream, addr, log, users).await;
                            if let Some(session) = session {
                                shutdown.run_until_exit(session.run()).await;
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }
        info!("Sync server stopped accepting connections");
    }
}

/// One agent connection.
struct Session {
    addr: SocketAddr,
    write: WsWrite,
    read: WsRead,
    log: Arc<FileEventLog>,
    users: Arc<Users>,
    /// Highest event id sent to this agent
    sent_up_to: u64,
}

impl Session {
    async fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        log: Arc<FileEventLog>,
        users: Arc<Users>,
    ) -> Option<Self> {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without a WebSocket handshake
                debug!("WebSocket upgrade failed for {}: {}", addr, e);
                return None;
            }
        };
        info!("New connection from {}", addr);

        let (write, read) = ws_stream.split();
        Some(Self {
            addr,
            write,
            read,
            log,
            users,
            sent_up_to: 0,
        })
    }

    async fn run(mut self) {
        let peer_id = match self.serve().await {
            Ok(peer_id) => peer_id.map(|p| p.to_string()),
            Err(e) => {
                warn!("Connection {} ended with error: {:#}", self.addr, e);
                None
            }
        };
        let _ = self.write.send(Message::Close(None)).await;
        info!(
            "Peer {} disconnected ({})",
            peer_id.as_deref().unwrap_or("?"),
            self.addr
        );
    }

    async fn serve(&mut self) -> Result<Option<PeerId>> {
        let hello = match tokio::time::timeout(HELLO_TIMEOUT, self.next_message()).await {
            Ok(Ok(Some(hello))) => hello,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow!("No hello within {:?}", HELLO_TIMEOUT)),
        };
        let (peer_id, resume_from) = match hello {
            ClientMessage::Hello {
                version,
                peer_id,
                username,
                password,
                resume_from,
            } => {
                check_version(version)?;
                if !self.users.verify(&username, &password) {
                    self.send(&ServerMessage::Denied {
                        reason: "invalid username or password".to_string(),
                    })
                    .await?;
                    return Err(anyhow!(
                        "Peer {} failed to authenticate as {:?}",
                        peer_id,
                        username
                    ));
                }
                (peer_id, resume_from)
            }
            ClientMessage::Submit { .. } => return Err(anyhow!("Expected hello, got submit")),
        };
        info!(
            "Peer {} connected from {}, resuming after #{}",
            peer_id, self.addr, resume_from
        );

        // Subscribe before replaying so nothing appended meanwhile is missed
        let mut live = self.log.subscribe();
        let last_id = self.log.last_id().await;
        if resume_from > last_id {
            warn!(
                "Peer {} resumes after #{} but the log ends at #{}; sending from #{}",
                peer_id,
                resume_from,
                last_id,
                last_id + 1
            );
        }
        self.send(&ServerMessage::welcome(last_id)).await?;
        self.sent_up_to = resume_from.min(last_id);
        self.replay().await?;

        loop {
            tokio::select! {
                incoming = self.next_message() => match incoming? {
                    Some(message) => self.handle(message).await?,
                    None => return Ok(Some(peer_id)),
                },
                appended = live.recv() => match appended {
                    Ok(event) => self.forward(event).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Peer {} lagged by {} events, replaying", peer_id, skipped);
                        self.replay().await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(Some(peer_id)),
                },
            }
        }
    }

    async fn handle(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Hello { .. } => Err(anyhow!("Duplicate hello")),
            ClientMessage::Submit { event } => {
                let local_id = event.local_id;
                let reply = match self.log.append(event).await {
                    Ok(stored) => {
                        let id = stored.id.unwrap_or_default();
                        debug!("Appended #{} {} from {}", id, stored.path, self.addr);
                        ServerMessage::Ack { local_id, id }
                    }
                    Err(e) => {
                        warn!("Rejected event from {}: {}", self.addr, e);
                        ServerMessage::Rejected {
                            local_id,
                            reason: e.to_string(),
                        }
                    }
                };
                self.send(&reply).await
            }
        }
    }

    /// Send every stored event after `sent_up_to`.
    async fn replay(&mut self) -> Result<()> {
        loop {
            let batch = self
                .log
                .retrieve_range(self.sent_up_to + 1, REPLAY_BATCH)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }
            for event in batch {
                self.forward(event).await?;
            }
        }
    }

    async fn forward(&mut self, event: sync_core::Event) -> Result<()> {
        let id = event.id.unwrap_or_default();
        // Already sent during replay
        if id <= self.sent_up_to {
            return Ok(());
        }
        self.send(&ServerMessage::Event { event }).await?;
        self.sent_up_to = id;
        Ok(())
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<()> {
        self.write
            .send(Message::Text(message.to_json().into()))
            .await
            .map_err(|e| anyhow!("Failed to send to {}: {}", self.addr, e))
    }

    /// Next protocol message, or `None` once the agent hangs up.
    async fn next_message(&mut self) -> Result<Option<ClientMessage>> {
        loop {
            let text = match self.read.next().await {
                Some(Ok(Message::Text(text))) => text.to_string(),
                Some(Ok(Message::Binary(data))) => String::from_utf8(data.to_vec())
                    .map_err(|_| anyhow!("Binary frame is not UTF-8"))?,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(e)) => return Err(e.into()),
            };
            return Ok(Some(ClientMessage::from_json(&text)?));
        }
    }
}
