use std::sync::Arc;
use thiserror::Error;

/// Crate-wide error type.
///
/// Failure causes coming from other libraries are wrapped in [Arc] so that the
/// error stays cheaply cloneable: a single close reason may have to be handed
/// out to every waiter of a channel or transport.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("webrtc failure: {0}")]
    Rtc(#[source] Arc<webrtc::Error>),
    #[error("relay transport failure: {0}")]
    Relay(#[source] Arc<tokio_tungstenite::tungstenite::Error>),
    #[error("malformed frame: {0}")]
    Frame(#[source] Arc<serde_json::Error>),
    #[error("i/o failure: {0}")]
    Io(#[source] Arc<std::io::Error>),
    #[error("session is closed")]
    SessionClosed,
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("not connected to a peer")]
    NotConnected,
    #[error("received an answer but no offer is outstanding")]
    NoPendingOffer,
    #[error("another send is already in flight")]
    SendBusy,
    #[error("chat message is empty")]
    EmptyMessage,
    #[error("binary chunk received before transfer metadata")]
    ChunkBeforeMetadata,
    #[error("transfer end received before transfer metadata")]
    EndBeforeMetadata,
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::Rtc(Arc::new(value))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Relay(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Frame(Arc::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}
