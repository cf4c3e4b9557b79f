//! Room-scoped signaling relay server.
//!
//! The relay never inspects signaling payloads: every text frame received from
//! a room member is forwarded verbatim to every other member of the same room.
//! Two endpoints make up the whole surface:
//!
//! - `GET /create`: allocates a room and returns `{"room_id": "..."}`.
//! - `GET /join?roomID=<id>&username=<name>`: WebSocket upgrade; announces
//!   the newcomer to the rest of the room and relays frames until the socket
//!   closes.

use crate::error::Error;
use crate::signaling::RelayFrame;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinQuery {
    #[serde(rename = "roomID")]
    room_id: String,
    username: String,
}

struct Participant {
    id: u64,
    name: String,
    tx: UnboundedSender<Message>,
}

/// Shared relay state: the room map plus a participant id counter.
#[derive(Clone, Default)]
pub struct RelayState {
    rooms: Arc<Mutex<HashMap<String, Vec<Participant>>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayState {
    /// Allocates an empty room and returns its id.
    pub fn create_room(&self) -> String {
        let mut room_id = Uuid::new_v4().simple().to_string();
        room_id.truncate(8);
        self.rooms.lock().insert(room_id.clone(), Vec::new());
        debug!("created room {room_id}");
        room_id
    }

    pub fn room_size(&self, room_id: &str) -> usize {
        self.rooms.lock().get(room_id).map_or(0, Vec::len)
    }

    fn register(&self, room_id: &str, name: &str) -> (u64, UnboundedReceiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        let mut rooms = self.rooms.lock();
        rooms.entry(room_id.to_owned()).or_default().push(Participant {
            id,
            name: name.to_owned(),
            tx,
        });
        debug!("{name} joined room {room_id}");
        (id, rx)
    }

    /// Forwards `message` to every member of the room except `sender_id`.
    fn broadcast(&self, room_id: &str, sender_id: u64, message: Message) {
        let rooms = self.rooms.lock();
        let Some(participants) = rooms.get(room_id) else {
            return;
        };
        for participant in participants {
            if participant.id != sender_id {
                // a full outbound queue only means the peer task already died
                let _ = participant.tx.send(message.clone());
            }
        }
    }

    fn remove(&self, room_id: &str, id: u64) {
        let mut rooms = self.rooms.lock();
        if let Some(participants) = rooms.get_mut(room_id) {
            participants.retain(|p| p.id != id);
            if participants.is_empty() {
                rooms.remove(room_id);
                debug!("deleted empty room {room_id}");
            }
        }
    }
}

async fn create_room(State(state): State<RelayState>) -> Json<CreateRoomResponse> {
    Json(CreateRoomResponse {
        room_id: state.create_room(),
    })
}

async fn join_room(
    ws: WebSocketUpgrade,
    Query(query): Query<JoinQuery>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_participant(socket, query, state))
}

async fn handle_participant(socket: WebSocket, query: JoinQuery, state: RelayState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (id, mut outbound) = state.register(&query.room_id, &query.username);

    // announce the newcomer to everyone else in the room
    match serde_json::to_string(&RelayFrame::join(&query.username)) {
        Ok(text) => state.broadcast(&query.room_id, id, Message::Text(text.into())),
        Err(err) => warn!("failed to encode join announcement: {err}"),
    }

    let forward = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => state.broadcast(&query.room_id, id, Message::Text(text)),
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.remove(&query.room_id, id);
    forward.abort();
    debug!("{} left room {}", query.username, query.room_id);
}

/// Builds the relay router on top of `state`.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/create", get(create_room))
        .route("/join", get(join_room))
        .with_state(state)
}

/// Binds the relay on `addr` and serves it on a background task.
///
/// Returns the actually bound address (useful with port 0) and the server
/// task handle.
pub async fn bind(addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>), Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router(RelayState::default())).await {
            warn!("relay server stopped: {err}");
        }
    });
    Ok((local_addr, task))
}

/// Runs the relay on `addr` until the process exits.
pub async fn serve(addr: SocketAddr) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(RelayState::default())).await?;
    Ok(())
}
