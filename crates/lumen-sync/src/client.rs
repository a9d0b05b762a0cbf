use crate::machine::{Action, ConnectionEvent, ConnectionMachine, ConnectionState, ReconnectPolicy};
use crate::reconcile::{reconcile, ReconciledState};
use futures_util::{SinkExt, StreamExt};
use lumen_core::model::{CheckResult, CommandKind, Diagnostic, FileChangeEvent, HealthSnapshot};
use lumen_core::protocol::{
    decode_message, encode_command, validate_snapshot, ClientCommand, ProtocolError, WireMsg,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UPDATE_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid hub url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("sync client task has stopped")]
    Closed,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid snapshot: {0}")]
    Invalid(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub url: Url,
    pub policy: ReconnectPolicy,
}

impl SyncConfig {
    pub fn new(url: &str) -> Result<Self, SyncError> {
        let parsed = Url::parse(url).map_err(|source| SyncError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SyncError::UnsupportedScheme(parsed.scheme().to_string()));
        }
        Ok(Self {
            url: parsed,
            policy: ReconnectPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    State(ConnectionState),
    Snapshot(ReconciledState),
    FileChange(FileChangeEvent),
    CheckResult(CheckResult),
    Diagnostic(Diagnostic),
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Send(ClientCommand),
}

#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SyncHandle {
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.command(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.command(Command::Disconnect).await
    }

    pub async fn send(&self, kind: CommandKind) -> Result<(), SyncError> {
        self.command(Command::Send(ClientCommand::new(kind))).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn wait_for(&mut self, target: ConnectionState) -> Result<(), SyncError> {
        self.state
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Closed)
    }

    async fn command(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Closed)
    }
}

pub struct SyncClient;

impl SyncClient {
    pub fn spawn(config: SyncConfig) -> (SyncHandle, mpsc::Receiver<SyncUpdate>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (update_tx, update_rx) = mpsc::channel(UPDATE_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let task = ClientTask {
            machine: ConnectionMachine::new(config.policy),
            config,
            socket: None,
            dialing: None,
            reconnect_at: None,
            updates: update_tx,
            state: state_tx,
        };
        tokio::spawn(task.run(command_rx));
        (
            SyncHandle {
                commands: command_tx,
                state: state_rx,
            },
            update_rx,
        )
    }
}

struct ClientTask {
    config: SyncConfig,
    machine: ConnectionMachine,
    socket: Option<WsStream>,
    dialing: Option<JoinHandle<Option<WsStream>>>,
    reconnect_at: Option<Instant>,
    updates: mpsc::Sender<SyncUpdate>,
    state: watch::Sender<ConnectionState>,
}

impl ClientTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let reconnect_at = self.reconnect_at;
            let event = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect) => ConnectionEvent::Connect,
                    Some(Command::Disconnect) => ConnectionEvent::Disconnect,
                    Some(Command::Send(command)) => {
                        self.send_command(&command).await;
                        continue;
                    }
                    None => {
                        self.apply(ConnectionEvent::Disconnect).await;
                        break;
                    }
                },
                frame = next_frame(&mut self.socket) => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.deliver(&text).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.socket = None;
                        ConnectionEvent::Closed
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(event = "sync_read_error", error = %err);
                        self.socket = None;
                        ConnectionEvent::Failed
                    }
                },
                dialed = dial_result(&mut self.dialing), if self.dialing.is_some() => {
                    self.dialing = None;
                    match dialed {
                        Ok(Some(socket)) => {
                            self.socket = Some(socket);
                            ConnectionEvent::Opened
                        }
                        Ok(None) => ConnectionEvent::Failed,
                        Err(err) => {
                            warn!(event = "sync_connect_error", error = %err);
                            ConnectionEvent::Failed
                        }
                    }
                }
                _ = reconnect_timer(reconnect_at), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    ConnectionEvent::ReconnectDue
                }
            };
            self.apply(event).await;
        }
        debug!(event = "sync_stopped");
    }

    async fn apply(&mut self, event: ConnectionEvent) {
        let transition = self.machine.handle(event);
        for state in transition.visited {
            self.state.send_replace(state);
            let _ = self.updates.send(SyncUpdate::State(state)).await;
        }
        for action in transition.actions {
            match action {
                Action::OpenTransport => {
                    if let Some(previous) = self.dialing.take() {
                        previous.abort();
                    }
                    self.dialing = Some(tokio::spawn(dial(self.config.url.clone())));
                }
                Action::CloseTransport => {
                    if let Some(dialing) = self.dialing.take() {
                        dialing.abort();
                        debug!(event = "sync_connect_cancelled", url = %self.config.url);
                    }
                    if let Some(mut socket) = self.socket.take() {
                        let _ = socket.close(None).await;
                    }
                }
                Action::ScheduleReconnect(delay) => {
                    info!(
                        event = "sync_reconnect_scheduled",
                        delay_ms = delay.as_millis() as u64,
                        attempt = self.machine.attempts()
                    );
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                Action::CancelReconnect => self.reconnect_at = None,
            }
        }
    }

    async fn send_command(&mut self, command: &ClientCommand) {
        let connected = self.machine.state() == ConnectionState::Connected;
        let Some(socket) = self.socket.as_mut().filter(|_| connected) else {
            warn!(
                event = "sync_send_dropped",
                command = %command.command,
                state = %self.machine.state(),
                "not connected"
            );
            return;
        };
        let text = match encode_command(command) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "sync_encode_error", error = %err);
                return;
            }
        };
        if let Err(err) = socket.send(Message::Text(text)).await {
            warn!(event = "sync_send_error", error = %err);
        }
    }

    async fn deliver(&mut self, text: &str) {
        let message = match decode_message(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "sync_message_rejected", error = %err);
                return;
            }
        };
        let update = match message.msg {
            WireMsg::Snapshot(snapshot) => SyncUpdate::Snapshot(reconcile(&snapshot)),
            WireMsg::FileChange(event) => SyncUpdate::FileChange(event),
            WireMsg::CheckResult(result) => SyncUpdate::CheckResult(result),
            WireMsg::Diagnostic(diagnostic) => SyncUpdate::Diagnostic(diagnostic),
        };
        let _ = self.updates.send(update).await;
    }
}

async fn dial(url: Url) -> Option<WsStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((socket, _))) => {
            info!(event = "sync_connected", url = %url);
            Some(socket)
        }
        Ok(Err(err)) => {
            warn!(event = "sync_connect_error", url = %url, error = %err);
            None
        }
        Err(_) => {
            warn!(event = "sync_connect_timeout", url = %url);
            None
        }
    }
}

async fn dial_result(
    dialing: &mut Option<JoinHandle<Option<WsStream>>>,
) -> Result<Option<WsStream>, JoinError> {
    match dialing {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

pub fn load_last_snapshot(path: &Path) -> Result<ReconciledState, SyncError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SyncError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: HealthSnapshot = serde_json::from_str(&raw)
        .map_err(|err| SyncError::Invalid(ProtocolError::Decode(err.to_string())))?;
    validate_snapshot(&snapshot)?;
    Ok(reconcile(&snapshot))
}
