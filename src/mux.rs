//! Channel multiplexer: two fixed logical streams over one peer transport.
//!
//! Both roles agree on a single pair of labels; routing is exact string
//! matching, so the initiator and the responder must never drift apart in
//! their spelling. Channels with any other label are logged and dropped.

use crate::data_channel::DataChannel;
use crate::error::Error;
use crate::negotiator::PeerTransport;
use log::warn;
use std::sync::Arc;
use tokio::sync::watch;

/// Label of the chunked file transfer channel.
pub const FILE_LABEL: &str = "file";
/// Label of the line-based chat channel.
pub const CHAT_LABEL: &str = "chat";

/// The two logical channels of a connected session.
#[derive(Debug)]
pub struct AttachedChannels {
    pub file: DataChannel,
    pub chat: DataChannel,
}

/// Owns the session-level connectivity flag and hands out labeled channels.
///
/// The flag goes up when either channel opens and down when either closes;
/// partial connectivity of one logical stream is not distinguished.
#[derive(Debug, Clone)]
pub struct Multiplexer {
    connectivity: Arc<watch::Sender<bool>>,
    connected: watch::Receiver<bool>,
}

impl Multiplexer {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Multiplexer {
            connectivity: Arc::new(tx),
            connected: rx,
        }
    }

    /// Current value of the session connectivity flag.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// A watch over the connectivity flag.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Initiator side: creates the `"file"` and `"chat"` channels on
    /// `transport`. Must run before the offer is produced so that the channel
    /// announcements ride in it.
    pub async fn attach_initiator(
        &self,
        transport: &PeerTransport,
    ) -> Result<AttachedChannels, Error> {
        let file = transport.create_channel(FILE_LABEL).await?;
        let chat = transport.create_channel(CHAT_LABEL).await?;
        Ok(AttachedChannels {
            file: DataChannel::new(file, self.connectivity.clone()),
            chat: DataChannel::new(chat, self.connectivity.clone()),
        })
    }

    /// Responder side: waits for the peer-announced channels and classifies
    /// them by label until both logical streams are bound.
    pub async fn attach_responder(
        &self,
        transport: Arc<PeerTransport>,
    ) -> Result<AttachedChannels, Error> {
        let mut file = None;
        let mut chat = None;
        while file.is_none() || chat.is_none() {
            let dc = transport
                .incoming_channel()
                .await
                .ok_or(Error::SessionClosed)?;
            match dc.label() {
                FILE_LABEL if file.is_none() => {
                    file = Some(DataChannel::new(dc, self.connectivity.clone()));
                }
                CHAT_LABEL if chat.is_none() => {
                    chat = Some(DataChannel::new(dc, self.connectivity.clone()));
                }
                other => warn!("dropping data channel with unexpected label {other:?}"),
            }
        }
        match (file, chat) {
            (Some(file), Some(chat)) => Ok(AttachedChannels { file, chat }),
            _ => Err(Error::SessionClosed),
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Multiplexer::new()
    }
}
