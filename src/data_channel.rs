//! Async wrapper over a single WebRTC data channel.
//!
//! The raw `RTCDataChannel` speaks in callbacks; this wrapper turns it into a
//! [Stream] of inbound [Frame]s and a [Sink] for outbound ones, and reports
//! open/close transitions to the session-level connectivity flag owned by the
//! multiplexer.

use crate::error::Error;
use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::{ready, Sink, Stream};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{watch, Notify};
use tokio_util::sync::ReusableBoxFuture;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// One message on a data channel.
///
/// Text frames carry UTF-8 control or chat payloads, binary frames carry raw
/// file chunks. The distinction is preserved end to end because the file
/// transfer protocol dispatches on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl From<DataChannelMessage> for Frame {
    fn from(msg: DataChannelMessage) -> Self {
        if msg.is_string {
            Frame::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            Frame::Binary(msg.data)
        }
    }
}

/// Lifecycle of the underlying channel.
#[derive(Debug)]
enum ChannelState {
    /// Channel was created or announced but the transport handshake has not
    /// finished yet.
    Connecting { opened: Notify },
    Open,
    Closed { reason: Option<Error> },
}

impl ChannelState {
    fn connecting() -> Arc<Self> {
        Arc::new(ChannelState::Connecting {
            opened: Notify::new(),
        })
    }

    fn open() -> Arc<Self> {
        Arc::new(ChannelState::Open)
    }

    fn closed(reason: Option<Error>) -> Arc<Self> {
        Arc::new(ChannelState::Closed { reason })
    }

    fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed { .. })
    }
}

pub struct DataChannel {
    dc: Arc<RTCDataChannel>,
    state: Arc<ArcSwap<ChannelState>>,
    /// Inbound frames stashed by the `on_message` callback until read.
    /// `Ok(None)` marks the end of the stream.
    inbound: UnboundedReceiver<Result<Option<Frame>, Error>>,
    /// In-flight send, or (while still connecting) the wait for the channel
    /// to open.
    send_waiter: ReusableBoxFuture<'static, Result<(), Error>>,
    sending: bool,
}

impl DataChannel {
    /// Wraps `dc`, wiring its callbacks into the stream buffer, the state
    /// machine and the shared `connectivity` flag ("open" on either logical
    /// channel marks the whole session connected, "closed" on either marks it
    /// disconnected).
    pub fn new(dc: Arc<RTCDataChannel>, connectivity: Arc<watch::Sender<bool>>) -> Self {
        let (tx, inbound) = unbounded_channel();
        let state = Arc::new(ArcSwap::new(ChannelState::connecting()));

        {
            let state = Arc::downgrade(&state);
            let connectivity = connectivity.clone();
            dc.on_open(Box::new(move || {
                let state = state.clone();
                let connectivity = connectivity.clone();
                Box::pin(async move {
                    if let Some(state) = state.upgrade() {
                        state.rcu(|old| match &**old {
                            ChannelState::Connecting { opened } => {
                                opened.notify_waiters();
                                ChannelState::open()
                            }
                            // a channel never reopens once closed
                            _ => old.clone(),
                        });
                        if state.load().is_open() {
                            connectivity.send_replace(true);
                        }
                    }
                })
            }));
        }
        {
            let state = Arc::downgrade(&state);
            let tx = tx.clone();
            let connectivity = connectivity.clone();
            dc.on_close(Box::new(move || {
                let state = state.clone();
                let tx = tx.clone();
                let connectivity = connectivity.clone();
                Box::pin(async move {
                    if let Some(state) = state.upgrade() {
                        let old = state.swap(ChannelState::closed(None));
                        if let ChannelState::Connecting { opened } = &*old {
                            opened.notify_waiters();
                        }
                    }
                    connectivity.send_replace(false);
                    let _ = tx.send(Ok(None));
                })
            }));
        }
        {
            let state = Arc::downgrade(&state);
            let tx = tx.clone();
            let connectivity = connectivity.clone();
            dc.on_error(Box::new(move |cause| {
                let state = state.clone();
                let tx = tx.clone();
                let connectivity = connectivity.clone();
                Box::pin(async move {
                    let error: Error = cause.into();
                    if let Some(state) = state.upgrade() {
                        let old = state.swap(ChannelState::closed(Some(error.clone())));
                        if let ChannelState::Connecting { opened } = &*old {
                            opened.notify_waiters();
                        }
                    }
                    connectivity.send_replace(false);
                    let _ = tx.send(Err(error));
                })
            }));
        }
        {
            let tx = tx.clone();
            dc.on_message(Box::new(move |msg| {
                let _ = tx.send(Ok(Some(Frame::from(msg))));
                Box::pin(async move {})
            }));
        }

        let send_waiter = ReusableBoxFuture::new(wait_open(state.clone()));
        DataChannel {
            dc,
            state,
            inbound,
            send_waiter,
            sending: false,
        }
    }

    pub fn label(&self) -> &str {
        self.dc.label()
    }

    pub fn is_open(&self) -> bool {
        self.state.load().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.state.load().is_closed()
    }

    /// Waits until the channel leaves the `Connecting` state.
    ///
    /// Returns `Ok(true)` once open, `Ok(false)` if it was closed gracefully
    /// before opening, and the close reason if it failed.
    pub async fn ready(&self) -> Result<bool, Error> {
        loop {
            let state = self.state.load_full();
            match &*state {
                ChannelState::Open => return Ok(true),
                ChannelState::Closed { reason } => {
                    return match reason {
                        Some(reason) => Err(reason.clone()),
                        None => Ok(false),
                    }
                }
                ChannelState::Connecting { opened } => opened.notified().await,
            }
        }
    }

    /// Closes the channel and the underlying transport stream.
    pub async fn close(&mut self) -> Result<(), Error> {
        let old = self.state.swap(ChannelState::closed(None));
        if let ChannelState::Connecting { opened } = &*old {
            opened.notify_waiters();
        }
        self.inbound.close();
        self.dc.close().await?;
        Ok(())
    }
}

/// Resolves once `state` becomes open, or with the close reason.
async fn wait_open(state: Arc<ArcSwap<ChannelState>>) -> Result<(), Error> {
    loop {
        let current = state.load_full();
        match &*current {
            ChannelState::Open => return Ok(()),
            ChannelState::Closed { reason } => {
                return Err(reason.clone().unwrap_or(Error::ChannelClosed))
            }
            ChannelState::Connecting { opened } => opened.notified().await,
        }
    }
}

impl Stream for DataChannel {
    type Item = Result<Frame, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(self.inbound.poll_recv(cx)) {
            Some(Ok(Some(frame))) => Poll::Ready(Some(Ok(frame))),
            Some(Ok(None)) => {
                self.inbound.close();
                Poll::Ready(None)
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

impl Sink<Frame> for DataChannel {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if self.sending {
            let res = ready!(self.send_waiter.poll(cx));
            self.sending = false;
            return Poll::Ready(res);
        }
        let state = self.state.load_full();
        match &*state {
            ChannelState::Open => Poll::Ready(Ok(())),
            // the initial waiter future awaits the channel opening
            ChannelState::Connecting { .. } => self.send_waiter.poll(cx),
            ChannelState::Closed { .. } => Poll::Ready(Err(Error::ChannelClosed)),
        }
    }

    fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<(), Error> {
        let dc = self.dc.clone();
        self.send_waiter.set(async move {
            let _ = match frame {
                Frame::Text(text) => dc.send_text(text).await?,
                Frame::Binary(data) => dc.send(&data).await?,
            };
            Ok(())
        });
        self.sending = true;
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if self.sending {
            let res = ready!(self.send_waiter.poll(cx));
            self.sending = false;
            return Poll::Ready(res);
        }
        if self.state.load().is_closed() {
            Poll::Ready(Err(Error::ChannelClosed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if self.sending {
            let res = ready!(self.send_waiter.poll(cx));
            self.sending = false;
            if res.is_err() {
                return Poll::Ready(res);
            }
        }
        let old = self.state.swap(ChannelState::closed(None));
        if let ChannelState::Connecting { opened } = &*old {
            opened.notify_waiters();
        }
        let dc = self.dc.clone();
        tokio::spawn(async move {
            let _ = dc.close().await;
        });
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.dc.label())
            .field("open", &self.is_open())
            .finish()
    }
}
