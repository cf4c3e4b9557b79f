//! `peerroom` connects exactly two peers through a named room and gives them
//! a direct [webrtc](https://webrtc.rs) link carrying two logical streams:
//! - chunked file transfer over a `"file"` data channel,
//! - plain text chat over a `"chat"` data channel.
//!
//! A lightweight WebSocket relay (see [relay]) forwards signaling frames
//! between room members; once the offer/answer exchange completes, all
//! traffic flows peer to peer and the relay is idle. Which peer offers is
//! derived from the two identities, so no extra coordination round trip is
//! needed.
//!
//! # Examples
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use peerroom::{relay, Error, FileMeta, RoomSession, SessionConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     // in-process relay; in production this runs as its own binary
//!     let (addr, _server) = relay::bind("127.0.0.1:0".parse().unwrap()).await?;
//!     let url = format!("ws://{addr}");
//!
//!     let alice = RoomSession::join(SessionConfig::new(&url, "demo", "alice")).await?;
//!     let mut bob = RoomSession::join(SessionConfig::new(&url, "demo", "bob")).await?;
//!
//!     alice.connected().await?;
//!     bob.connected().await?;
//!
//!     let body = Bytes::from_static(b"hello from alice");
//!     let meta = FileMeta {
//!         name: "hello.txt".to_owned(),
//!         mime_type: "text/plain".to_owned(),
//!         size: body.len() as u64,
//!     };
//!     alice.send_file(meta, body)?;
//!
//!     while let Some(event) = bob.recv().await {
//!         if let SessionEvent::FileReceived(file) = event {
//!             println!("received {} ({} bytes)", file.meta.name, file.bytes.len());
//!             break;
//!         }
//!     }
//!
//!     alice.close();
//!     bob.close();
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod data_channel;
pub mod error;
pub mod mux;
pub mod negotiator;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use chat::{Author, ChatMessage};
pub use data_channel::{DataChannel, Frame};
pub use error::Error;
pub use mux::{Multiplexer, CHAT_LABEL, FILE_LABEL};
pub use negotiator::{Negotiator, PeerTransport};
pub use session::{RoomSession, SessionConfig, SessionEvent, SessionState};
pub use signaling::{RelayClient, RelayFrame, SignalEvent};
pub use transfer::{FileMeta, ReceivedFile, CHUNK_SIZE};
