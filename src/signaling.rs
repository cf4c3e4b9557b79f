//! Relay wire contract and the WebSocket client used to reach it.
//!
//! The relay ferries opaque JSON objects between the members of a room. Each
//! frame carries at most one meaningful field combination; [RelayFrame] keeps
//! the permissive "all fields optional" shape of the wire format, while
//! [SignalEvent] is the tagged form the rest of the crate dispatches on.

use crate::error::Error;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// One JSON object on the relay socket.
///
/// One of: `{join: true, partnerName}`,
/// `{partnerName}`, `{offer}`, `{answer}` or `{iceCandidate}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<RTCSessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<RTCSessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<RTCIceCandidateInit>,
}

impl RelayFrame {
    /// Frame announcing that `identity` entered the room.
    pub fn join(identity: &str) -> Self {
        RelayFrame {
            join: Some(true),
            partner_name: Some(identity.to_owned()),
            ..Default::default()
        }
    }

    /// Bare identity reply, sent once per newly learned peer.
    pub fn identity(identity: &str) -> Self {
        RelayFrame {
            partner_name: Some(identity.to_owned()),
            ..Default::default()
        }
    }

    pub fn offer(sdp: RTCSessionDescription) -> Self {
        RelayFrame {
            offer: Some(sdp),
            ..Default::default()
        }
    }

    pub fn answer(sdp: RTCSessionDescription) -> Self {
        RelayFrame {
            answer: Some(sdp),
            ..Default::default()
        }
    }

    pub fn candidate(candidate: RTCIceCandidateInit) -> Self {
        RelayFrame {
            ice_candidate: Some(candidate),
            ..Default::default()
        }
    }

    /// Classifies the frame into the single event it describes.
    ///
    /// A `join` flag wins over a bare `partnerName`, since the two co-occur in
    /// join announcements. Frames carrying none of the known fields yield
    /// `None` and are dropped by the caller.
    pub fn into_event(self) -> Option<SignalEvent> {
        if self.join.unwrap_or(false) {
            return Some(SignalEvent::Join {
                identity: self.partner_name,
            });
        }
        if let Some(offer) = self.offer {
            return Some(SignalEvent::Offer(offer));
        }
        if let Some(answer) = self.answer {
            return Some(SignalEvent::Answer(answer));
        }
        if let Some(candidate) = self.ice_candidate {
            return Some(SignalEvent::Candidate(candidate));
        }
        self.partner_name.map(SignalEvent::Identity)
    }
}

/// Tagged signaling event, dispatched by the session driver.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// A peer entered the room; `identity` is absent for legacy announcements.
    Join { identity: Option<String> },
    /// A peer told us its identity.
    Identity(String),
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    Candidate(RTCIceCandidateInit),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client side of the relay socket for one room.
pub struct RelayClient {
    ws: WsStream,
}

impl RelayClient {
    /// Opens the relay socket: `<relay_url>/join?roomID=<id>&username=<name>`.
    pub async fn connect(relay_url: &str, room_id: &str, identity: &str) -> Result<Self, Error> {
        let url = format!(
            "{}/join?roomID={}&username={}",
            relay_url.trim_end_matches('/'),
            room_id,
            identity
        );
        let (ws, _) = connect_async(url).await?;
        Ok(RelayClient { ws })
    }

    /// Splits the socket into independently usable halves, so that the writer
    /// task and the dispatch loop do not contend for one handle.
    pub fn split(self) -> (RelaySink, RelayStream) {
        let (sink, stream) = self.ws.split();
        (RelaySink(sink), RelayStream(stream))
    }
}

/// Write half of the relay socket.
pub struct RelaySink(SplitSink<WsStream, Message>);

impl RelaySink {
    pub async fn send(&mut self, frame: &RelayFrame) -> Result<(), Error> {
        let text = serde_json::to_string(frame)?;
        self.0.send(Message::Text(text)).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.0.close().await?;
        Ok(())
    }
}

/// Read half of the relay socket.
pub struct RelayStream(SplitStream<WsStream>);

impl RelayStream {
    /// Next frame from the relay, or `None` once the socket is gone.
    ///
    /// Non-text messages are skipped; a malformed JSON frame is surfaced as an
    /// error so that the caller can log and drop it without ending the stream.
    pub async fn recv(&mut self) -> Option<Result<RelayFrame, Error>> {
        while let Some(item) = self.0.next().await {
            match item {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).map_err(Error::from))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
        None
    }
}
