//! Scripted Pitaya server.
//!
//! [`TestServer`] speaks the server side of the protocol over TCP, TLS or an
//! in-memory duplex stream. Its behavior is fixed by a [`ServerScript`]:
//! handshake code, heartbeat interval and a reply per request route. Tests
//! can additionally push, kick or drop every live session, and inspect what
//! the server received.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use pitaya_client::{BoxStream, ConnectFailure, Connector, Target};
use pitaya_proto::{
    ErrorBody, HANDSHAKE_OK, HandshakeRequest, HandshakeResponse, Kick, Message, MessageKind,
    Packet, PacketDecoder, PacketType,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::{Notify, broadcast, mpsc},
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

use crate::{HarnessError, certs::ServerIdentity};

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// How the server answers a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Respond with the request body
    Echo,
    /// Respond with a fixed body
    Respond(Vec<u8>),
    /// Respond with an error
    Fail(ErrorBody),
    /// Respond with a fixed body after a delay
    Delay(Duration, Vec<u8>),
    /// Never respond
    Ignore,
    /// Kick the session instead of responding
    Kick(String),
    /// Drop the connection instead of responding
    Close,
}

/// Fixed server behavior.
#[derive(Debug, Clone)]
pub struct ServerScript {
    /// Handshake response code; anything but 200 rejects the session
    pub handshake_code: u16,
    /// Heartbeat interval announced in the handshake
    pub heartbeat: Option<Duration>,
    /// Answer client heartbeats
    pub answer_heartbeats: bool,
    /// Reply for requests on a route
    pub routes: HashMap<String, Reply>,
    /// Reply for requests on routes not in `routes`
    pub fallback: Reply,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            handshake_code: HANDSHAKE_OK,
            heartbeat: None,
            answer_heartbeats: true,
            routes: HashMap::new(),
            fallback: Reply::Echo,
        }
    }
}

impl ServerScript {
    /// Answer requests on `route` with `reply`.
    #[must_use]
    pub fn route(mut self, route: impl Into<String>, reply: Reply) -> Self {
        self.routes.insert(route.into(), reply);
        self
    }

    /// Announce a heartbeat interval.
    #[must_use]
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    /// Reject handshakes with `code`.
    #[must_use]
    pub fn reject_handshake(mut self, code: u16) -> Self {
        self.handshake_code = code;
        self
    }

    /// Stop answering client heartbeats.
    #[must_use]
    pub fn silent_heartbeats(mut self) -> Self {
        self.answer_heartbeats = false;
        self
    }

    fn reply_for(&self, route: &str) -> &Reply {
        self.routes.get(route).unwrap_or(&self.fallback)
    }
}

#[derive(Debug, Clone)]
enum Control {
    Push { route: String, body: Vec<u8> },
    Kick(String),
    Close,
}

#[derive(Debug, Default)]
struct ServerState {
    received: Mutex<Vec<Message>>,
    handshakes: Mutex<Vec<HandshakeRequest>>,
    accepted: AtomicUsize,
    live: AtomicUsize,
    refusing: AtomicBool,
    changed: Notify,
}

impl ServerState {
    fn record(&self, message: Message) {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).push(message);
        self.changed.notify_waiters();
    }

    fn record_handshake(&self, handshake: HandshakeRequest) {
        self.handshakes.lock().unwrap_or_else(PoisonError::into_inner).push(handshake);
        self.changed.notify_waiters();
    }

    fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct Shared {
    script: ServerScript,
    state: ServerState,
    control: broadcast::Sender<Control>,
}

/// Running test server.
///
/// Stops accepting when dropped; live sessions are closed.
pub struct TestServer {
    shared: Arc<Shared>,
    addr: SocketAddr,
    accept: JoinHandle<()>,
    identity: Option<ServerIdentity>,
}

impl std::fmt::Debug for TestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestServer")
            .field("addr", &self.addr)
            .field("tls", &self.identity.is_some())
            .finish_non_exhaustive()
    }
}

impl TestServer {
    /// Plain TCP server on an ephemeral localhost port.
    pub async fn tcp(script: ServerScript) -> Result<Self, HarnessError> {
        Self::start(script, None).await
    }

    /// TLS server presenting `identity`.
    pub async fn tls(script: ServerScript, identity: ServerIdentity) -> Result<Self, HarnessError> {
        Self::start(script, Some(identity)).await
    }

    async fn start(
        script: ServerScript,
        identity: Option<ServerIdentity>,
    ) -> Result<Self, HarnessError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let acceptor = match &identity {
            Some(identity) => Some(TlsAcceptor::from(identity.server_config()?)),
            None => None,
        };

        let (control, _) = broadcast::channel(64);
        let shared = Arc::new(Shared { script, state: ServerState::default(), control });
        let accept = tokio::spawn(accept_loop(listener, acceptor, shared.clone()));

        debug!(%addr, tls = identity.is_some(), "test server listening");
        Ok(Self { shared, addr, accept, identity })
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// TLS identity, if serving TLS.
    pub fn identity(&self) -> Option<&ServerIdentity> {
        self.identity.as_ref()
    }

    /// In-process transport reaching this server without a socket or TLS.
    ///
    /// Suited to paused-clock tests, where real sockets would let the clock
    /// auto-advance while waiting on the kernel.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector { shared: self.shared.clone() })
    }

    /// Drop new connections immediately (and refuse in-memory ones).
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.state.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Push `body` on `route` to every live session.
    pub fn push(&self, route: &str, body: &[u8]) {
        let _ = self
            .shared
            .control
            .send(Control::Push { route: route.to_string(), body: body.to_vec() });
    }

    /// Kick every live session.
    pub fn kick(&self, reason: &str) {
        let _ = self.shared.control.send(Control::Kick(reason.to_string()));
    }

    /// Drop every live session without a kick.
    pub fn close_sessions(&self) {
        let _ = self.shared.control.send(Control::Close);
    }

    /// Requests and notifies received so far, in arrival order.
    pub fn received(&self) -> Vec<Message> {
        self.shared.state.received()
    }

    /// Handshakes received so far.
    pub fn handshakes(&self) -> Vec<HandshakeRequest> {
        self.shared.state.handshakes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Connections accepted, including refused ones.
    pub fn accepted(&self) -> usize {
        self.shared.state.accepted.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn live_sessions(&self) -> usize {
        self.shared.state.live.load(Ordering::SeqCst)
    }

    /// Wait until a message on `route` arrived.
    pub async fn wait_for_message(&self, route: &str) -> Message {
        loop {
            let changed = self.shared.state.changed.notified();
            if let Some(message) =
                self.received().into_iter().find(|m| m.route.as_deref() == Some(route))
            {
                return message;
            }
            changed.await;
        }
    }

    /// Wait until exactly `count` sessions are open.
    pub async fn wait_for_live_sessions(&self, count: usize) {
        loop {
            let changed = self.shared.state.changed.notified();
            if self.live_sessions() == count {
                return;
            }
            changed.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = self.shared.control.send(Control::Close);
    }
}

async fn accept_loop(listener: TcpListener, acceptor: Option<TlsAcceptor>, shared: Arc<Shared>) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            },
        };
        shared.state.accepted.fetch_add(1, Ordering::SeqCst);

        if shared.state.refusing.load(Ordering::SeqCst) {
            debug!(%peer, "refusing connection");
            drop(tcp);
            continue;
        }

        let acceptor = acceptor.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(tcp).await {
                    Ok(tls) => serve(tls, shared).await,
                    Err(error) => debug!(%peer, %error, "TLS accept failed"),
                },
                None => serve(tcp, shared).await,
            }
        });
    }
}

struct MemoryConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, target: &Target) -> Result<BoxStream, ConnectFailure> {
        self.shared.state.accepted.fetch_add(1, Ordering::SeqCst);
        if self.shared.state.refusing.load(Ordering::SeqCst) {
            return Err(ConnectFailure::network("connection refused"));
        }

        trace!(%target, "memory connection");
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        tokio::spawn(serve(server, self.shared.clone()));
        Ok(Box::new(client))
    }
}

/// What a session does after handling one packet.
enum Step {
    Continue,
    End,
}

struct Session<W> {
    writer: W,
    shared: Arc<Shared>,
    delayed: mpsc::UnboundedSender<Packet>,
}

impl<W> Session<W>
where
    W: AsyncWrite + Unpin,
{
    async fn write(&mut self, packet: &Packet) -> io::Result<()> {
        let bytes = packet.to_bytes().map_err(io::Error::other)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await
    }

    async fn handle(&mut self, packet: Packet) -> io::Result<Step> {
        match packet.kind {
            PacketType::Handshake => {
                let request = HandshakeRequest::from_packet(&packet).map_err(io::Error::other)?;
                trace!(version = %request.version, "handshake");
                self.shared.state.record_handshake(request);

                let response = HandshakeResponse {
                    code: self.shared.script.handshake_code,
                    heartbeat_secs: self.shared.script.heartbeat.map(|d| d.as_secs().max(1)),
                };
                self.write(&response.into_packet().map_err(io::Error::other)?).await?;
            },
            PacketType::HandshakeAck => trace!("handshake acknowledged"),
            PacketType::Heartbeat => {
                if self.shared.script.answer_heartbeats {
                    self.write(&Packet::empty(PacketType::Heartbeat)).await?;
                }
            },
            PacketType::Data => {
                let message = Message::from_packet(&packet).map_err(io::Error::other)?;
                return self.handle_message(message).await;
            },
            PacketType::Kick => return Ok(Step::End),
        }
        Ok(Step::Continue)
    }

    async fn handle_message(&mut self, message: Message) -> io::Result<Step> {
        self.shared.state.record(message.clone());
        if message.kind != MessageKind::Request {
            return Ok(Step::Continue);
        }

        let (Some(id), Some(route)) = (message.id, message.route.as_deref()) else {
            return Ok(Step::Continue);
        };

        let reply = self.shared.script.reply_for(route).clone();
        let response = match reply {
            Reply::Echo => Message::response(id, message.body),
            Reply::Respond(body) => Message::response(id, body),
            Reply::Fail(error) => Message::error_response(id, &error).map_err(io::Error::other)?,
            Reply::Delay(delay, body) => {
                let packet = Message::response(id, body).into_packet().map_err(io::Error::other)?;
                let delayed = self.delayed.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = delayed.send(packet);
                });
                return Ok(Step::Continue);
            },
            Reply::Ignore => return Ok(Step::Continue),
            Reply::Kick(reason) => {
                self.write(&Kick { reason }.into_packet()).await?;
                return Ok(Step::End);
            },
            Reply::Close => return Ok(Step::End),
        };

        self.write(&response.into_packet().map_err(io::Error::other)?).await?;
        Ok(Step::Continue)
    }

    async fn handle_control(&mut self, control: Control) -> io::Result<Step> {
        match control {
            Control::Push { route, body } => {
                let packet = Message::push(route, body).into_packet().map_err(io::Error::other)?;
                self.write(&packet).await?;
                Ok(Step::Continue)
            },
            Control::Kick(reason) => {
                self.write(&Kick { reason }.into_packet()).await?;
                Ok(Step::End)
            },
            Control::Close => Ok(Step::End),
        }
    }
}

async fn serve<S>(stream: S, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut control = shared.control.subscribe();
    let (mut reader, writer) = tokio::io::split(stream);
    let (delayed_tx, mut delayed_rx) = mpsc::unbounded_channel();
    let mut session = Session { writer, shared: shared.clone(), delayed: delayed_tx };

    shared.state.live.fetch_add(1, Ordering::SeqCst);
    shared.state.changed.notify_waiters();

    let mut decoder = PacketDecoder::new();
    let mut chunk = vec![0u8; 4096];
    let result: io::Result<()> = async {
        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    decoder.extend(&chunk[..n]);
                    while let Some(packet) = decoder.next_packet().map_err(io::Error::other)? {
                        if let Step::End = session.handle(packet).await? {
                            return Ok(());
                        }
                    }
                },
                Some(packet) = delayed_rx.recv() => session.write(&packet).await?,
                control = control.recv() => match control {
                    Ok(control) => {
                        if let Step::End = session.handle_control(control).await? {
                            return Ok(());
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => {},
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
    .await;

    if let Err(error) = result {
        debug!(%error, "session ended with error");
    }
    let _ = session.writer.shutdown().await;

    shared.state.live.fetch_sub(1, Ordering::SeqCst);
    shared.state.changed.notify_waiters();
}
