//! Two-party room sessions.
//!
//! [RoomSession::join] connects to the relay, learns who else is in the room
//! and negotiates a direct peer connection with them. All session state lives
//! in a driver task; the [RoomSession] handle talks to it over channels and
//! stays cheap to move around.
//!
//! Which side offers is decided without any extra round trip: the peer with
//! the lexicographically smaller identity offers, the other waits. Both
//! sides compute this locally from the same two names, so they can never
//! disagree.

use crate::chat::{self, ChatLog, ChatMessage};
use crate::data_channel::{DataChannel, Frame};
use crate::error::Error;
use crate::mux::{AttachedChannels, Multiplexer};
use crate::negotiator::Negotiator;
use crate::signaling::{RelayClient, RelayFrame, RelayStream, SignalEvent};
use crate::transfer::{self, FileAssembler, FileMeta, ReceivedFile, SendGuard, TransferEvent};
use bytes::Bytes;
use futures_util::StreamExt;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch, Notify};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::track::track_local::TrackLocal;

/// Everything needed to join a room.
pub struct SessionConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:8000`.
    pub relay_url: String,
    pub room_id: String,
    /// Name announced to the peer; also the tiebreaker for who offers.
    pub identity: String,
    /// Local media tracks attached before negotiation, may be empty.
    pub tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    pub ice_servers: Vec<RTCIceServer>,
    /// Invoked once during teardown, before the relay connection drops.
    pub on_teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl SessionConfig {
    pub fn new(relay_url: &str, room_id: &str, identity: &str) -> Self {
        SessionConfig {
            relay_url: relay_url.to_owned(),
            room_id: room_id.to_owned(),
            identity: identity.to_owned(),
            tracks: Vec::new(),
            ice_servers: crate::negotiator::default_ice_servers(),
            on_teardown: None,
        }
    }
}

/// Lifecycle of one session.
///
/// A session only exists once [RoomSession::join] has reached the relay, so
/// `AwaitingPeer` is the initial state; there is no pre-join state to
/// observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Joined the relay, no peer in the room.
    AwaitingPeer,
    /// Peer known, offer/answer exchange in flight.
    Negotiating,
    Connected,
    Closed,
}

/// Everything the session reports back to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    PeerJoined(String),
    StateChanged(SessionState),
    ConnectivityChanged(bool),
    /// A message entered the log, local echo included.
    Chat(ChatMessage),
    TransferStarted(FileMeta),
    TransferProgress { received: u64, total: u64 },
    FileReceived(ReceivedFile),
    /// Outbound transfer progress in `0.0..=1.0`.
    SendProgress(f64),
    Closed,
}

enum Command {
    SendFile { meta: FileMeta, bytes: Bytes },
    SendChat(String),
    Close,
}

/// Handle to a running session.
pub struct RoomSession {
    commands: UnboundedSender<Command>,
    events: UnboundedReceiver<SessionEvent>,
    state_rx: watch::Receiver<SessionState>,
    connected_rx: watch::Receiver<bool>,
    guard: SendGuard,
    closed: AtomicBool,
}

impl RoomSession {
    /// Connects to the relay and spawns the session driver.
    pub async fn join(config: SessionConfig) -> Result<Self, Error> {
        let client =
            RelayClient::connect(&config.relay_url, &config.room_id, &config.identity).await?;
        let (mut sink, stream) = client.split();

        // all outbound relay traffic funnels through one writer task
        let (relay_tx, mut relay_out) = unbounded_channel::<RelayFrame>();
        let shutdown = Arc::new(Notify::new());
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = relay_out.recv() => match frame {
                        Some(frame) => {
                            if let Err(cause) = sink.send(&frame).await {
                                warn!("relay send failed: {}", cause);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_shutdown.notified() => break,
                }
            }
            let _ = sink.close().await;
        });
        let _ = relay_tx.send(RelayFrame::join(&config.identity));

        let negotiator = Negotiator::new(relay_tx.clone(), config.tracks, config.ice_servers)?;
        let mux = Multiplexer::new();
        let connected_rx = mux.watch();
        let (state_tx, state_rx) = watch::channel(SessionState::AwaitingPeer);
        let (event_tx, events) = unbounded_channel();
        let (commands, cmd_rx) = unbounded_channel();
        let guard = SendGuard::default();

        let driver = Driver {
            identity: config.identity,
            commands: cmd_rx,
            relay: Some(stream),
            shutdown,
            events: event_tx,
            state: state_tx,
            negotiator,
            mux,
            connected_rx: connected_rx.clone(),
            was_connected: false,
            file_chan: None,
            chat_chan: None,
            attach_rx: None,
            assembler: FileAssembler::default(),
            chat_log: ChatLog::default(),
            guard: guard.clone(),
            remote_identity: None,
            on_teardown: config.on_teardown,
        };
        tokio::spawn(driver.run());

        Ok(RoomSession {
            commands,
            events,
            state_rx,
            connected_rx,
            guard,
            closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Awaits the peer connection coming up; fails if the session closes
    /// before that happens.
    pub async fn connected(&self) -> Result<(), Error> {
        let mut state_rx = self.state_rx.clone();
        loop {
            match *state_rx.borrow_and_update() {
                SessionState::Connected => return Ok(()),
                SessionState::Closed => return Err(Error::SessionClosed),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(Error::SessionClosed);
            }
        }
    }

    /// Next session event, `None` once the driver is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Queues one file for transfer. A single outbound send may be in
    /// flight at a time.
    pub fn send_file(&self, meta: FileMeta, bytes: Bytes) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.guard.is_busy() {
            return Err(Error::SendBusy);
        }
        self.commands
            .send(Command::SendFile { meta, bytes })
            .map_err(|_| Error::SessionClosed)
    }

    /// Queues one chat message. Blank text is rejected here, before it
    /// reaches the driver.
    pub fn send_chat(&self, text: &str) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.guard.is_busy() {
            return Err(Error::SendBusy);
        }
        let trimmed = chat::prepare(text)?;
        self.commands
            .send(Command::SendChat(trimmed.to_owned()))
            .map_err(|_| Error::SessionClosed)
    }

    /// Tears the session down. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Close);
        }
    }

    /// Awaits the driver finishing its teardown.
    pub async fn wait_closed(&mut self) {
        while self.events.recv().await.is_some() {}
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// True when the local identity is the offering side against `remote`.
pub(crate) fn offers_first(local: &str, remote: &str) -> bool {
    local < remote
}

struct Driver {
    identity: String,
    commands: UnboundedReceiver<Command>,
    relay: Option<RelayStream>,
    shutdown: Arc<Notify>,
    events: UnboundedSender<SessionEvent>,
    state: watch::Sender<SessionState>,
    negotiator: Negotiator,
    mux: Multiplexer,
    connected_rx: watch::Receiver<bool>,
    was_connected: bool,
    file_chan: Option<DataChannel>,
    chat_chan: Option<DataChannel>,
    attach_rx: Option<oneshot::Receiver<Result<AttachedChannels, Error>>>,
    assembler: FileAssembler,
    chat_log: ChatLog,
    guard: SendGuard,
    remote_identity: Option<String>,
    on_teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Close) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                frame = relay_next(&mut self.relay) => match frame {
                    Some(Ok(frame)) => {
                        if let Some(event) = frame.into_event() {
                            self.handle_signal(event).await;
                        }
                    }
                    Some(Err(cause)) => warn!("dropping malformed relay frame: {}", cause),
                    None => {
                        // once connected the relay is only needed for renegotiation
                        warn!("relay connection lost");
                        self.relay = None;
                        if !self.was_connected {
                            break;
                        }
                    }
                },
                frame = next_frame(&mut self.file_chan) => match frame {
                    Some(Ok(frame)) => self.handle_file_frame(frame),
                    Some(Err(cause)) => {
                        warn!("file channel error: {}", cause);
                        self.file_chan = None;
                    }
                    None => {
                        if self.assembler.abort() {
                            warn!("file channel closed mid transfer");
                        }
                        self.file_chan = None;
                    }
                },
                frame = next_frame(&mut self.chat_chan) => match frame {
                    Some(Ok(Frame::Text(text))) => {
                        let msg = self.chat_log.push_remote(text);
                        let _ = self.events.send(SessionEvent::Chat(msg));
                    }
                    Some(Ok(Frame::Binary(_))) => {
                        warn!("ignoring binary frame on the chat channel");
                    }
                    Some(Err(cause)) => {
                        warn!("chat channel error: {}", cause);
                        self.chat_chan = None;
                    }
                    None => self.chat_chan = None,
                },
                attached = wait_attach(&mut self.attach_rx) => {
                    self.attach_rx = None;
                    match attached {
                        Ok(channels) => self.install_channels(channels),
                        Err(cause) => {
                            warn!("responder channel setup failed: {}", cause);
                            break;
                        }
                    }
                },
                changed = self.connected_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now = *self.connected_rx.borrow();
                    let _ = self.events.send(SessionEvent::ConnectivityChanged(now));
                    if now {
                        self.was_connected = true;
                        self.set_state(SessionState::Connected);
                    } else if self.was_connected {
                        // peer hung up or the link died
                        break;
                    }
                },
            }
        }
        self.teardown().await;
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    fn install_channels(&mut self, channels: AttachedChannels) {
        self.file_chan = Some(channels.file);
        self.chat_chan = Some(channels.chat);
    }

    async fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Join { identity } => {
                if let Some(name) = identity {
                    self.learn_peer(name, true).await;
                }
            }
            SignalEvent::Identity(name) => self.learn_peer(name, false).await,
            SignalEvent::Offer(offer) => match self.negotiator.accept_offer(offer).await {
                Ok(Some(transport)) => {
                    self.set_state(SessionState::Negotiating);
                    let mux = self.mux.clone();
                    let (tx, rx) = oneshot::channel();
                    self.attach_rx = Some(rx);
                    tokio::spawn(async move {
                        let _ = tx.send(mux.attach_responder(transport).await);
                    });
                }
                Ok(None) => {}
                Err(cause) => warn!("could not answer the remote offer: {}", cause),
            },
            SignalEvent::Answer(answer) => {
                if let Err(cause) = self.negotiator.accept_answer(answer).await {
                    warn!("dropping remote answer: {}", cause);
                }
            }
            SignalEvent::Candidate(candidate) => {
                if let Err(cause) = self.negotiator.accept_remote_candidate(candidate).await {
                    warn!("dropping remote ICE candidate: {}", cause);
                }
            }
        }
    }

    /// Records the peer's name and, for the first sighting, kicks off
    /// negotiation when this side is the offerer.
    async fn learn_peer(&mut self, name: String, announce_back: bool) {
        if name == self.identity {
            return;
        }
        match &self.remote_identity {
            Some(known) if *known == name => return,
            Some(known) => {
                // the room holds two parties; later arrivals are not ours
                warn!("ignoring extra participant {:?}, already paired with {:?}", name, known);
                return;
            }
            None => {}
        }
        self.remote_identity = Some(name.clone());
        let _ = self.events.send(SessionEvent::PeerJoined(name.clone()));
        if announce_back {
            let _ = self
                .negotiator_out()
                .send(RelayFrame::identity(&self.identity));
        }
        if offers_first(&self.identity, &name) {
            self.set_state(SessionState::Negotiating);
            match self.negotiator.initiate(&self.mux).await {
                Ok(Some(channels)) => self.install_channels(channels),
                Ok(None) => {}
                Err(cause) => warn!("could not start negotiation: {}", cause),
            }
        }
    }

    fn negotiator_out(&self) -> UnboundedSender<RelayFrame> {
        self.negotiator.relay_out()
    }

    fn handle_file_frame(&mut self, frame: Frame) {
        match self.assembler.accept(frame) {
            Ok(TransferEvent::Started(meta)) => {
                let _ = self.events.send(SessionEvent::TransferStarted(meta));
            }
            Ok(TransferEvent::Progress { received, total }) => {
                let _ = self
                    .events
                    .send(SessionEvent::TransferProgress { received, total });
            }
            Ok(TransferEvent::Completed(file)) => {
                let _ = self.events.send(SessionEvent::FileReceived(file));
            }
            Err(cause) => warn!("dropping invalid transfer frame: {}", cause),
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendFile { meta, bytes } => {
                let permit = match self.guard.acquire() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("file send rejected, another send is in flight");
                        return;
                    }
                };
                let Some(file) = self.file_chan.as_mut() else {
                    warn!("file send rejected, channel is gone");
                    return;
                };
                let events = self.events.clone();
                let result = transfer::send_file(file, &meta, bytes, |progress| {
                    let _ = events.send(SessionEvent::SendProgress(progress));
                })
                .await;
                drop(permit);
                if let Err(cause) = result {
                    warn!("file send failed: {}", cause);
                }
            }
            Command::SendChat(text) => {
                let Some(chat_chan) = self.chat_chan.as_mut() else {
                    warn!("chat send rejected, channel is gone");
                    return;
                };
                match chat::send_chat(chat_chan, &mut self.chat_log, &self.guard, &text).await {
                    Ok(msg) => {
                        let _ = self.events.send(SessionEvent::Chat(msg));
                    }
                    Err(cause) => warn!("chat send failed: {}", cause),
                }
            }
            Command::Close => unreachable!("handled in the select loop"),
        }
    }

    async fn teardown(mut self) {
        if let Some(hook) = self.on_teardown.take() {
            hook();
        }
        self.shutdown.notify_waiters();
        if let Err(cause) = self.negotiator.close().await {
            warn!("peer connection did not close cleanly: {}", cause);
        }
        self.file_chan = None;
        self.chat_chan = None;
        self.set_state(SessionState::Closed);
        let _ = self.events.send(SessionEvent::Closed);
    }
}

async fn relay_next(relay: &mut Option<RelayStream>) -> Option<Result<RelayFrame, Error>> {
    match relay {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(chan: &mut Option<DataChannel>) -> Option<Result<Frame, Error>> {
    match chan {
        Some(dc) => dc.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_attach(
    rx: &mut Option<oneshot::Receiver<Result<AttachedChannels, Error>>>,
) -> Result<AttachedChannels, Error> {
    match rx {
        Some(rx) => rx.await.unwrap_or(Err(Error::SessionClosed)),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chat::Author;
    use crate::relay;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn smaller_identity_offers() {
        assert!(offers_first("alice", "bob"));
        assert!(!offers_first("bob", "alice"));
        assert!(!offers_first("zed", "zebra"));
        assert!(offers_first("zebra", "zed"));
    }

    async fn start_relay() -> String {
        let (addr, _handle) = relay::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        format!("ws://{addr}")
    }

    async fn wait_for<F>(session: &mut RoomSession, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        loop {
            let event = session.recv().await.expect("driver ended unexpectedly");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reported_once() {
        let url = start_relay().await;
        let mut session = RoomSession::join(SessionConfig::new(&url, "lonely", "alice"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::AwaitingPeer);

        session.close();
        session.close();

        let mut saw_closed = 0;
        while let Some(event) = session.recv().await {
            if matches!(event, SessionEvent::Closed) {
                saw_closed += 1;
            }
        }
        assert_eq!(saw_closed, 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn teardown_hook_runs_once() {
        let url = start_relay().await;
        let (tx, rx) = oneshot::channel();
        let mut config = SessionConfig::new(&url, "hooked", "alice");
        config.on_teardown = Some(Box::new(move || {
            let _ = tx.send(());
        }));
        let mut session = RoomSession::join(config).await.unwrap();
        session.close();
        session.wait_closed().await;
        timeout(Duration::from_secs(1), rx)
            .await
            .expect("hook not invoked")
            .unwrap();
    }

    #[tokio::test]
    async fn file_and_chat_between_two_sessions() {
        let url = start_relay().await;
        let room = "shared";

        let mut alice = RoomSession::join(SessionConfig::new(&url, room, "alice"))
            .await
            .unwrap();
        let mut bob = RoomSession::join(SessionConfig::new(&url, room, "bob"))
            .await
            .unwrap();

        timeout(Duration::from_secs(20), async {
            alice.connected().await.unwrap();
            bob.connected().await.unwrap();
        })
        .await
        .expect("peers did not connect");

        // file from the offering side to the answering side
        let body: Bytes = (0..40000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        let meta = FileMeta {
            name: "holiday.png".to_owned(),
            mime_type: "image/png".to_owned(),
            size: body.len() as u64,
        };
        alice.send_file(meta.clone(), body.clone()).unwrap();

        let received = timeout(
            Duration::from_secs(10),
            wait_for(&mut bob, |e| matches!(e, SessionEvent::FileReceived(_))),
        )
        .await
        .expect("file never arrived");
        match received {
            SessionEvent::FileReceived(file) => {
                assert_eq!(file.meta, meta);
                assert_eq!(file.bytes, body);
            }
            _ => unreachable!(),
        }

        // chat in the other direction
        bob.send_chat("got it, thanks!").unwrap();
        let chat = timeout(
            Duration::from_secs(10),
            wait_for(&mut alice, |e| {
                matches!(e, SessionEvent::Chat(m) if m.author == Author::Remote)
            }),
        )
        .await
        .expect("chat never arrived");
        match chat {
            SessionEvent::Chat(msg) => assert_eq!(msg.text, "got it, thanks!"),
            _ => unreachable!(),
        }

        alice.close();
        bob.close();
    }

    #[tokio::test]
    async fn send_rejected_before_connection() {
        let url = start_relay().await;
        let session = RoomSession::join(SessionConfig::new(&url, "early", "alice"))
            .await
            .unwrap();
        assert!(matches!(session.send_chat("hello"), Err(Error::NotConnected)));
        let meta = FileMeta {
            name: "x".to_owned(),
            mime_type: "application/octet-stream".to_owned(),
            size: 0,
        };
        assert!(matches!(
            session.send_file(meta, Bytes::new()),
            Err(Error::NotConnected)
        ));
    }
}
