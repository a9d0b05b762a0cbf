use crate::runner::{CheckCoordinator, RunRequest};
use crate::store::SnapshotStore;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::future::join_all;
use futures_util::{Sink, SinkExt, StreamExt};
use lumen_core::model::{CommandKind, HealthSnapshot};
use lumen_core::protocol::{decode_command, encode_message, WireMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

const CLIENT_QUEUE: usize = 256;

pub struct Client {
    conn_id: String,
    sender: mpsc::Sender<Message>,
}

impl Client {
    pub fn new(conn_id: impl Into<String>, sender: mpsc::Sender<Message>) -> Self {
        Self {
            conn_id: conn_id.into(),
            sender,
        }
    }

    async fn send_text(&self, text: &str, timeout: Duration) -> bool {
        self.sender
            .send_timeout(Message::Text(text.to_string()), timeout)
            .await
            .is_ok()
    }

    fn close(&self, reason: &str) {
        let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
            code: 1011,
            reason: reason.to_string().into(),
        })));
    }
}

pub struct HubState {
    write_timeout: Duration,
    debug: bool,
    conn_counter: AtomicU64,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    snapshot: RwLock<HealthSnapshot>,
    store: SnapshotStore,
    coordinator: Arc<CheckCoordinator>,
}

impl HubState {
    pub fn new(
        initial: HealthSnapshot,
        store: SnapshotStore,
        coordinator: Arc<CheckCoordinator>,
        write_timeout: Duration,
        debug: bool,
    ) -> Self {
        Self {
            write_timeout,
            debug,
            conn_counter: AtomicU64::new(0),
            clients: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(initial),
            store,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<CheckCoordinator> {
        &self.coordinator
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn current_snapshot(&self) -> HealthSnapshot {
        self.snapshot.read().await.clone()
    }

    async fn snapshot_text(&self) -> Option<String> {
        let snapshot = self.current_snapshot().await;
        match encode_message(&WireMessage::snapshot(snapshot)) {
            Ok(text) => Some(text),
            Err(err) => {
                error!(event = "snapshot_invalid", error = %err);
                None
            }
        }
    }

    pub async fn register_client(&self, client: Arc<Client>) {
        let mut clients = self.clients.lock().await;
        if let Some(text) = self.snapshot_text().await {
            if !client.send_text(&text, self.write_timeout).await {
                warn!(event = "snapshot_error", conn_id = %client.conn_id);
                client.close("snapshot_error");
                return;
            }
        }
        clients.insert(client.conn_id.clone(), client.clone());
        info!(event = "client_connected", conn_id = %client.conn_id, clients = clients.len());
    }

    pub async fn remove_client(&self, conn_id: &str, reason: &str) {
        let removed = self.clients.lock().await.remove(conn_id);
        if let Some(client) = removed {
            client.close(reason);
            info!(event = "client_disconnected", conn_id = conn_id, reason = reason);
        }
    }

    pub async fn broadcast(&self, message: &WireMessage) -> usize {
        let text = match encode_message(message) {
            Ok(text) => text,
            Err(err) => {
                error!(event = "broadcast_invalid", kind = message.msg.kind(), error = %err);
                return 0;
            }
        };
        let mut clients = self.clients.lock().await;
        let targets: Vec<Arc<Client>> = clients.values().cloned().collect();
        let results = join_all(targets.iter().map(|client| {
            let text = text.as_str();
            async move { (client, client.send_text(text, self.write_timeout).await) }
        }))
        .await;

        let mut delivered = 0;
        for (client, ok) in results {
            if ok {
                delivered += 1;
                continue;
            }
            warn!(event = "send_error", conn_id = %client.conn_id);
            clients.remove(&client.conn_id);
            client.close("send_error");
        }
        debug!(
            event = "broadcast",
            kind = message.msg.kind(),
            delivered = delivered,
            clients = clients.len()
        );
        delivered
    }

    pub async fn send_snapshot(&self, client: &Client) {
        let Some(text) = self.snapshot_text().await else {
            return;
        };
        if !client.send_text(&text, self.write_timeout).await {
            warn!(event = "snapshot_error", conn_id = %client.conn_id);
            self.remove_client(&client.conn_id, "snapshot_error").await;
        }
    }

    pub async fn publish_snapshot(&self, snapshot: HealthSnapshot) {
        *self.snapshot.write().await = snapshot.clone();

        let store = self.store.clone();
        let to_save = snapshot.clone();
        match tokio::task::spawn_blocking(move || store.save(&to_save)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(event = "persist_error", error = %err),
            Err(err) => warn!(event = "persist_error", error = %err),
        }

        info!(
            event = "snapshot_published",
            illumination = snapshot.illumination,
            failing = snapshot.total_failing(),
            diagnostics = snapshot.diagnostics.len()
        );
        self.broadcast(&WireMessage::snapshot(snapshot)).await;
    }

    pub async fn handle_command(&self, client: &Client, raw: &str) {
        let command = match decode_command(raw) {
            Ok(command) => command,
            Err(err) => {
                warn!(event = "command_invalid", conn_id = %client.conn_id, error = %err);
                return;
            }
        };
        match command.kind() {
            Ok(CommandKind::RequestCheck) => {
                let reason = format!("client {}", client.conn_id);
                if self.coordinator.request_run(&reason) == RunRequest::AlreadyRunning {
                    debug!(event = "command_ignored", conn_id = %client.conn_id);
                }
            }
            Ok(CommandKind::Refresh) => self.send_snapshot(client).await,
            Err(_) => {
                warn!(
                    event = "command_unknown",
                    conn_id = %client.conn_id,
                    command = %command.command
                );
            }
        }
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (ws_sender, mut ws_receiver) = socket.split();
        let (tx, rx) = mpsc::channel::<Message>(CLIENT_QUEUE);
        let write_task = tokio::spawn(write_loop(ws_sender, rx, self.write_timeout));

        let client = Arc::new(Client::new(self.next_conn_id(), tx.clone()));
        info!(event = "handshake_ok", conn_id = %client.conn_id, remote = %remote);
        self.register_client(client.clone()).await;

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            match msg {
                Message::Text(text) => {
                    if self.debug {
                        debug!(event = "message_received", conn_id = %client.conn_id, raw = %text);
                    }
                    self.handle_command(&client, &text).await;
                }
                Message::Binary(_) => {
                    warn!(event = "message_invalid", conn_id = %client.conn_id, error = "binary frame");
                }
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }

        self.remove_client(&client.conn_id, "disconnect").await;
        drop(tx);
        drop(client);
        let _ = write_task.await;
    }
}

async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Message>, write_timeout: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        match tokio::time::timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "write_error", error = %err);
                return;
            }
            Err(_) => {
                debug!(event = "write_timeout");
                return;
            }
        }
        if closing {
            return;
        }
    }
}
