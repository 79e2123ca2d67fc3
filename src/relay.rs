//! Pairing relay: forwards text frames between the sender and receiver of a
//! consultation, holding frames for a side that has not connected yet.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::session::Role;
use crate::signaling::{SignalLink, SignalTransport};
use crate::utils::{role_from_endpoint, CONSULTATION_PATH};

struct Slot {
    conn_id: u64,
    tx: mpsc::UnboundedSender<String>,
    since: DateTime<Utc>,
}

/// A frame waiting for its addressee, tagged with the connection that sent it.
struct Held {
    origin: Option<u64>,
    text: String,
}

#[derive(Default)]
struct Hub {
    sender: Option<Slot>,
    receiver: Option<Slot>,
    pending_for_sender: VecDeque<Held>,
    pending_for_receiver: VecDeque<Held>,
}

impl Hub {
    fn slot(&mut self, role: Role) -> &mut Option<Slot> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    fn pending(&mut self, role: Role) -> &mut VecDeque<Held> {
        match role {
            Role::Sender => &mut self.pending_for_sender,
            Role::Receiver => &mut self.pending_for_receiver,
        }
    }

    /// Discards what `conn_id` (playing `role`) left for its counterpart.
    fn purge_from(&mut self, role: Role, conn_id: u64) -> usize {
        let pending = self.pending(role.counterpart());
        let before = pending.len();
        pending.retain(|held| held.origin != Some(conn_id));
        before - pending.len()
    }
}

/// One sender/receiver pair. A new connection for a role replaces the old one.
#[derive(Clone, Default)]
pub struct Relay {
    hub: Arc<Mutex<Hub>>,
    next_id: Arc<AtomicU64>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `role` and flushes whatever was held for it.
    /// Returns the connection id and the stream of frames addressed to it.
    pub fn connect(&self, role: Role) -> (u64, mpsc::UnboundedReceiver<String>) {
        let conn_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut hub = lock(&self.hub);
        let held: Vec<Held> = hub.pending(role).drain(..).collect();
        let flushed = held.len();
        for Held { text, .. } in held {
            let _ = tx.send(text);
        }
        let previous = hub.slot(role).replace(Slot {
            conn_id,
            tx,
            since: Utc::now(),
        });
        if let Some(old) = previous {
            info!(
                "{} reconnected, replacing connection {} (up since {})",
                role,
                old.conn_id,
                old.since.to_rfc3339()
            );
        }
        info!("{} connected as {}, flushed {} held", role, conn_id, flushed);
        (conn_id, rx)
    }

    /// Forwards `text` from whatever connection currently plays `from`.
    pub fn relay(&self, from: Role, text: String) {
        let origin = lock(&self.hub).slot(from).as_ref().map(|s| s.conn_id);
        self.forward(from, origin, text);
    }

    /// Forwards `text` to the counterpart of `from`, or holds it until the
    /// counterpart connects. Held frames die with their origin connection.
    fn forward(&self, from: Role, origin: Option<u64>, text: String) {
        let to = from.counterpart();
        let mut hub = lock(&self.hub);
        let text = match hub.slot(to).as_ref() {
            Some(slot) => match slot.tx.send(text) {
                Ok(()) => {
                    debug!("Relayed {} -> {}", from, to);
                    return;
                }
                Err(mpsc::error::SendError(text)) => text,
            },
            None => text,
        };
        let pending = hub.pending(to);
        pending.push_back(Held { origin, text });
        debug!("Holding frame for {}, {} held", to, pending.len());
    }

    /// Clears `role`'s slot if it still belongs to `conn_id`, and discards the
    /// frames that connection left for a counterpart that never picked them up.
    pub fn disconnect(&self, role: Role, conn_id: u64) {
        let mut hub = lock(&self.hub);
        let slot = hub.slot(role);
        if slot.as_ref().is_some_and(|s| s.conn_id == conn_id) {
            *slot = None;
            info!("{} disconnected ({})", role, conn_id);
        }
        let purged = hub.purge_from(role, conn_id);
        if purged > 0 {
            info!("Discarded {} frames held from {} ({})", purged, role, conn_id);
        }
    }

    /// Drops whatever connection `role` currently has, as if the network went away.
    pub fn drop_role(&self, role: Role) -> bool {
        let mut hub = lock(&self.hub);
        let Some(slot) = hub.slot(role).take() else {
            return false;
        };
        hub.purge_from(role, slot.conn_id);
        warn!("Dropped {} connection", role);
        true
    }

    pub fn is_connected(&self, role: Role) -> bool {
        lock(&self.hub).slot(role).is_some()
    }

    /// Frames held for `role`.
    pub fn held_for(&self, role: Role) -> usize {
        lock(&self.hub).pending(role).len()
    }
}

/// In-process transport: sessions talk to the relay directly.
#[async_trait]
impl SignalTransport for Relay {
    async fn connect(&self, endpoint: &str) -> Result<SignalLink, ChannelError> {
        let role = role_from_endpoint(endpoint)
            .ok_or_else(|| ChannelError::InvalidEndpoint(endpoint.to_owned()))?;
        let (conn_id, incoming) = Relay::connect(self, role);
        let (outgoing, mut from_client) = mpsc::unbounded_channel::<String>();

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(text) = from_client.recv().await {
                relay.forward(role, Some(conn_id), text);
            }
            relay.disconnect(role, conn_id);
        });

        Ok(SignalLink { outgoing, incoming })
    }
}

/// Routes `/ws/live-consultation/{role}` to the relay.
pub fn router(relay: Relay) -> Router {
    Router::new()
        .route(&format!("{CONSULTATION_PATH}/{{role}}"), get(ws_handler))
        .with_state(relay)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(role): Path<String>,
    State(relay): State<Relay>,
) -> Response {
    match role.parse::<Role>() {
        Ok(role) => ws
            .on_upgrade(move |socket| handle_socket(socket, role, relay))
            .into_response(),
        Err(e) => {
            warn!("Rejecting connection: {}", e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, role: Role, relay: Relay) {
    let (mut sink, mut stream) = socket.split();
    let (conn_id, mut rx) = relay.connect(role);

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn({
        let relay = relay.clone();
        async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    Message::Text(text) => {
                        relay.forward(role, Some(conn_id), text.as_str().to_owned())
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    relay.disconnect(role, conn_id);
}
