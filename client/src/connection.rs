//! The connection task and the handle views use to talk to it.
//!
//! [`ClientHandle::connect`] spawns one task that owns the socket. Clones of
//! the handle share that task: views mount and unmount freely, taking and
//! releasing room interest, without re-dialing. The socket is closed only by
//! [`ClientHandle::disconnect`], by dropping every handle, or by an
//! unrecoverable failure.
//!
//! ERROR HANDLING
//! ==============
//! Transport errors never surface as `Err`; they drive the
//! [`ConnectionManager`] and show up as [`ConnectionStatus`] changes. Handle
//! methods only fail once the task has stopped.

use std::time::Duration;

use frames::{Frame, PresenceUser, RoomId, decode_frame, decode_json, encode_frame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::manager::{ConnectionManager, ConnectionStatus, Decision, FailReason};
use crate::policy::ReconnectPolicy;
use crate::rooms::{provide_sync_frame, request_sync_frame, save_snapshot_frame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;

/// Default spacing of canvas presence heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("session credential was rejected")]
    Unauthenticated,
    #[error("gave up after {0} consecutive connection attempts")]
    ReconnectExhausted(u32),
    #[error("connection task has stopped")]
    Closed,
}

impl From<FailReason> for ClientError {
    fn from(reason: FailReason) -> Self {
        match reason {
            FailReason::Unauthenticated => Self::Unauthenticated,
            FailReason::Exhausted(attempts) => Self::ReconnectExhausted(attempts),
        }
    }
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Socket endpoint, e.g. `ws://127.0.0.1:3000/api/ws`.
    pub endpoint: String,
    /// Session token presented at the handshake.
    pub token: String,
    pub policy: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    /// Inbound frames buffered per subscriber before the slowest one lags.
    pub inbound_capacity: usize,
}

impl ClientConfig {
    /// Build a config from the server's HTTP base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidBaseUrl`] unless `base_url` is
    /// `http(s)://` or `ws(s)://`.
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self {
            endpoint: ws_endpoint(base_url)?,
            token: token.into(),
            policy: ReconnectPolicy::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            inbound_capacity: 256,
        })
    }

    fn url(&self) -> String {
        format!("{}?token={}&encoding=binary", self.endpoint, self.token)
    }
}

fn ws_endpoint(base_url: &str) -> Result<String, ClientError> {
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/api/ws"));
    }
    if let Some(rest) = base.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/api/ws"));
    }
    if base.starts_with("ws://") || base.starts_with("wss://") {
        return Ok(format!("{base}/api/ws"));
    }
    Err(ClientError::InvalidBaseUrl(base_url.to_owned()))
}

// =============================================================================
// HANDLE
// =============================================================================

#[derive(Debug)]
enum Command {
    Join(RoomId, Option<PresenceUser>),
    Leave(RoomId),
    Send(Frame),
    Retry,
    Disconnect,
}

/// Cloneable front end of one logical connection.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    inbound: broadcast::Sender<Frame>,
}

impl ClientHandle {
    /// Spawn the connection task and start dialing. Must be called inside a
    /// tokio runtime.
    #[must_use]
    pub fn connect(config: ClientConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);
        let (inbound, _) = broadcast::channel(config.inbound_capacity.max(1));

        let driver = Driver {
            manager: ConnectionManager::new(config.policy),
            config,
            commands: command_rx,
            status: status_tx,
            inbound: inbound.clone(),
        };
        tokio::spawn(driver.run());

        Self { commands, status, inbound }
    }

    /// Take interest in `room`. Canvas rooms should carry the presence
    /// payload that heartbeats will repeat.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] once the connection task has stopped.
    pub fn join_room(&self, room: RoomId, presence: Option<PresenceUser>) -> Result<(), ClientError> {
        self.command(Command::Join(room, presence))
    }

    /// Release interest in `room`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] once the connection task has stopped.
    pub fn leave_room(&self, room: RoomId) -> Result<(), ClientError> {
        self.command(Command::Leave(room))
    }

    /// Send an application frame. Frames sent while offline are dropped.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] once the connection task has stopped.
    pub fn send(&self, frame: Frame) -> Result<(), ClientError> {
        self.command(Command::Send(frame))
    }

    /// Ask peers in a canvas room for their raster. The answering
    /// `canvas:sync` arrives on [`ClientHandle::subscribe`].
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] once the connection task has stopped.
    pub fn request_sync(&self, room: &RoomId) -> Result<(), ClientError> {
        self.send(request_sync_frame(room))
    }

    /// Answer a peer's `canvas:requestSync`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] once the connection task has stopped.
    pub fn provide_sync(&self, room: &RoomId, canvas_data: impl Into<String>) -> Result<(), ClientError> {
        self.send(provide_sync_frame(room, canvas_data))
    }

    /// Upload the local raster. Pair with [`crate::SnapshotSchedule`] to
    /// decide when.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] once the connection task has stopped.
    pub fn save_snapshot(&self, room: &RoomId, canvas_data: impl Into<String>) -> Result<(), ClientError> {
        self.send(save_snapshot_frame(room, canvas_data))
    }

    /// Reset the attempt budget and dial now if the connection is down.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] once the connection task has stopped.
    pub fn retry(&self) -> Result<(), ClientError> {
        self.command(Command::Retry)
    }

    /// Close the connection for every clone of this handle.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] if the task has already stopped.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect)
    }

    /// Status updates.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Inbound frames from the moment of subscription on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.inbound.subscribe()
    }

    /// Wait until the connection is up.
    ///
    /// # Errors
    ///
    /// The failure reason if the connection lands in `Failed`, or
    /// [`ClientError::Closed`] if the task stops first.
    pub async fn connected(&self) -> Result<(), ClientError> {
        let mut status = self.status.clone();
        let seen = status
            .wait_for(|s| s.is_connected() || s.is_failed())
            .await
            .map_err(|_| ClientError::Closed)?;
        match *seen {
            ConnectionStatus::Failed(reason) => Err(reason.into()),
            _ => Ok(()),
        }
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }
}

// =============================================================================
// DRIVER
// =============================================================================

struct Driver {
    config: ClientConfig,
    manager: ConnectionManager,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    inbound: broadcast::Sender<Frame>,
}

/// How a connected session ended.
enum SessionEnd {
    Dropped,
    Closed,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.manager.begin_connect();
            self.publish();

            let decision = match connect_async(self.config.url()).await {
                Ok((socket, _)) => {
                    let rejoin = self.manager.on_connected();
                    self.publish();
                    info!(endpoint = %self.config.endpoint, rooms = rejoin.len(), "client: connected");
                    match self.session(socket, rejoin).await {
                        SessionEnd::Dropped => self.manager.on_closed(),
                        SessionEnd::Closed => Decision::Stop,
                    }
                }
                Err(tungstenite::Error::Http(resp)) if resp.status() == StatusCode::UNAUTHORIZED => {
                    error!(endpoint = %self.config.endpoint, "client: credential rejected");
                    self.manager.on_auth_rejected()
                }
                Err(e) => {
                    warn!(endpoint = %self.config.endpoint, error = %e, "client: connect failed");
                    self.manager.on_connect_error()
                }
            };
            self.publish();

            let keep_going = match decision {
                Decision::Reconnect(delay) => self.back_off(delay).await,
                Decision::Wait => {
                    warn!(status = ?self.manager.status(), "client: waiting for manual retry");
                    self.idle().await
                }
                Decision::Stop => false,
            };
            if !keep_going {
                break;
            }
        }
        self.manager.close();
        self.publish();
        info!("client: connection task stopped");
    }

    fn publish(&self) {
        self.status.send_replace(self.manager.status());
    }

    /// Sleep before the next dial while still taking commands. Returns
    /// `false` if the task should stop.
    async fn back_off(&mut self, delay: Duration) -> bool {
        let wake = tokio::time::sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                () = &mut wake => return true,
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Disconnect) => return false,
                    Some(Command::Retry) => {
                        self.manager.retry();
                        return true;
                    }
                    Some(cmd) => self.offline(cmd),
                },
            }
        }
    }

    /// Stay down until a manual retry. Returns `false` if the task should
    /// stop.
    async fn idle(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                None | Some(Command::Disconnect) => return false,
                Some(Command::Retry) => {
                    if self.manager.retry() {
                        info!("client: manual retry");
                        return true;
                    }
                }
                Some(cmd) => self.offline(cmd),
            }
        }
    }

    /// Room interest still counts while offline; it is replayed on connect.
    fn offline(&mut self, cmd: Command) {
        match cmd {
            Command::Join(room, presence) => {
                let _ = self.manager.join(room, presence);
            }
            Command::Leave(room) => {
                let _ = self.manager.leave(&room);
            }
            Command::Send(frame) => {
                let _ = self.manager.outbound(frame);
            }
            Command::Retry | Command::Disconnect => {}
        }
    }

    async fn session(&mut self, socket: Socket, rejoin: Vec<Frame>) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        if write_all(&mut sink, &rejoin).await.is_err() {
            return SessionEnd::Dropped;
        }

        let every = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Binary(bytes))) => decode_frame(&bytes),
                        Some(Ok(Message::Text(text))) => decode_json(text.as_str()),
                        Some(Ok(Message::Close(_))) | None => {
                            info!("client: server closed the connection");
                            return SessionEnd::Dropped;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(error = %e, "client: socket error");
                            return SessionEnd::Dropped;
                        }
                    };
                    match decoded {
                        Ok(frame) => self.deliver(frame),
                        Err(e) => warn!(error = %e, "client: undecodable frame"),
                    }
                }
                cmd = self.commands.recv() => {
                    let outgoing = match cmd {
                        None | Some(Command::Disconnect) => {
                            self.manager.close();
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::Closed;
                        }
                        Some(Command::Retry) => {
                            self.manager.retry();
                            None
                        }
                        Some(Command::Join(room, presence)) => self.manager.join(room, presence),
                        Some(Command::Leave(room)) => self.manager.leave(&room),
                        Some(Command::Send(frame)) => self.manager.outbound(frame),
                    };
                    if let Some(frame) = outgoing {
                        if write(&mut sink, &frame).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if write_all(&mut sink, &self.manager.heartbeat_frames()).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }

    fn deliver(&mut self, frame: Frame) {
        if !self.manager.accept_inbound(&frame) {
            debug!(syscall = %frame.syscall, room = ?frame.room, "client: sync ignored; none requested");
            return;
        }
        // No subscribers is fine; frames are not buffered for late views.
        let _ = self.inbound.send(frame);
    }
}

async fn write_all(sink: &mut Sink, frames: &[Frame]) -> Result<(), tungstenite::Error> {
    for frame in frames {
        write(sink, frame).await?;
    }
    Ok(())
}

async fn write(sink: &mut Sink, frame: &Frame) -> Result<(), tungstenite::Error> {
    sink.send(Message::binary(encode_frame(frame))).await.inspect_err(|e| {
        warn!(syscall = %frame.syscall, error = %e, "client: send failed");
    })
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
