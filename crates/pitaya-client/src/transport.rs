//! Byte-stream transports and the per-attempt link task.
//!
//! A [`Connector`] turns a [`Target`] into a bidirectional byte stream. The
//! link task owns that stream for one connection attempt: it frames outbound
//! packets, decodes inbound ones, and reports everything back to the client
//! driver tagged with the attempt id. Every link ends with exactly one
//! terminal event (`ConnectFailed` or `Disconnected`).

use std::sync::Arc;

use async_trait::async_trait;
use pitaya_core::{AttemptId, ConnectFailure, PinStore, Target, TransportEvent};
use pitaya_proto::{Packet, PacketDecoder};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tracing::{debug, trace, warn};

use crate::{error::ClientError, tls::TlsOptions};

/// Reason reported for every TLS or pin validation failure.
pub const TLS_HANDSHAKE_ERROR: &str = "TLS Handshake Error";

const READ_CHUNK: usize = 16 * 1024;

/// Bidirectional byte stream usable as a transport.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Boxed transport stream.
pub type BoxStream = Box<dyn Stream>;

/// Establishes transport streams.
///
/// Implementations must classify failures: TLS and pinning failures are
/// [`FailureKind::Handshake`](pitaya_core::FailureKind::Handshake) and are
/// never retried; everything else is network-level.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a stream to `target`.
    async fn connect(&self, target: &Target) -> Result<BoxStream, ConnectFailure>;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &Target) -> Result<BoxStream, ConnectFailure> {
        let stream = tcp_connect(target).await?;
        Ok(Box::new(stream))
    }
}

/// TLS over TCP, validating the server against the pin store.
#[derive(Clone)]
pub struct TlsConnector {
    connector: tokio_rustls::TlsConnector,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Connector trusting `options` roots and enforcing `pins`.
    ///
    /// The pin store is consulted on every handshake, so later changes to
    /// `pins` apply to subsequent connects.
    pub fn new(options: &TlsOptions, pins: PinStore) -> Result<Self, ClientError> {
        let config = options.client_config(pins)?;
        Ok(Self { connector: tokio_rustls::TlsConnector::from(Arc::new(config)) })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, target: &Target) -> Result<BoxStream, ConnectFailure> {
        let server_name = ServerName::try_from(target.host.clone()).map_err(|e| {
            warn!(host = %target.host, error = %e, "invalid TLS server name");
            ConnectFailure::handshake(TLS_HANDSHAKE_ERROR)
        })?;

        let tcp = tcp_connect(target).await?;
        let tls = self.connector.connect(server_name, tcp).await.map_err(|e| {
            warn!(%target, error = %e, "TLS handshake failed");
            ConnectFailure::handshake(TLS_HANDSHAKE_ERROR)
        })?;

        Ok(Box::new(tls))
    }
}

async fn tcp_connect(target: &Target) -> Result<TcpStream, ConnectFailure> {
    let stream = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|e| ConnectFailure::network(e.to_string()))?;
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%error, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// What a link reports to the driver.
#[derive(Debug)]
pub(crate) enum LinkReport {
    /// Lifecycle or inbound packet
    Transport(TransportEvent),
    /// Packet carrying this ack token was written
    Written(u32),
}

/// Report tagged with its attempt.
#[derive(Debug)]
pub(crate) struct LinkEvent {
    pub attempt: AttemptId,
    pub report: LinkReport,
}

#[derive(Debug)]
struct Outbound {
    packet: Packet,
    ack: Option<u32>,
}

/// Driver-side handle to a running link.
#[derive(Debug)]
pub(crate) struct LinkHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    close: Option<oneshot::Sender<String>>,
}

impl LinkHandle {
    /// Queue a packet. Returns false if the link already ended.
    pub fn send(&self, packet: Packet, ack: Option<u32>) -> bool {
        self.outbound.send(Outbound { packet, ack }).is_ok()
    }

    /// Ask the link to close. It still reports `Disconnected` afterwards.
    pub fn close(mut self, reason: String) {
        if let Some(close) = self.close.take() {
            let _ = close.send(reason);
        }
    }
}

/// Spawn the link task for `attempt` on `runtime`.
pub(crate) fn spawn_link(
    runtime: &tokio::runtime::Handle,
    attempt: AttemptId,
    target: Target,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> LinkHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = oneshot::channel();

    runtime.spawn(async move {
        let link = Link { attempt, events };
        link.run(target, connector, outbound_rx, close_rx).await;
    });

    LinkHandle { outbound: outbound_tx, close: Some(close_tx) }
}

struct Link {
    attempt: AttemptId,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Link {
    fn report(&self, report: LinkReport) {
        // Driver gone means the client was cleaned up
        let _ = self.events.send(LinkEvent { attempt: self.attempt, report });
    }

    async fn run(
        self,
        target: Target,
        connector: Arc<dyn Connector>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        mut close: oneshot::Receiver<String>,
    ) {
        let connected = tokio::select! {
            result = connector.connect(&target) => result,
            reason = &mut close => {
                let reason = reason.unwrap_or_else(|_| "closed".to_string());
                debug!(attempt = %self.attempt, %reason, "closed while connecting");
                self.report(LinkReport::Transport(TransportEvent::Disconnected { reason }));
                return;
            },
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(failure) => {
                self.report(LinkReport::Transport(TransportEvent::ConnectFailed(failure)));
                return;
            },
        };

        debug!(attempt = %self.attempt, %target, "transport connected");
        self.report(LinkReport::Transport(TransportEvent::Connected));

        let reason = self.pump(stream, outbound, close).await;
        debug!(attempt = %self.attempt, %reason, "transport closed");
        self.report(LinkReport::Transport(TransportEvent::Disconnected { reason }));
    }

    /// Move packets until the stream ends or a close is requested.
    async fn pump(
        &self,
        stream: BoxStream,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        mut close: oneshot::Receiver<String>,
    ) -> String {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut decoder = PacketDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        let reason = loop {
            tokio::select! {
                reason = &mut close => {
                    break reason.unwrap_or_else(|_| "closed".to_string());
                },
                next = outbound.recv() => {
                    let Some(Outbound { packet, ack }) = next else {
                        break "closed".to_string();
                    };
                    if let Err(reason) = write_packet(&mut writer, &packet).await {
                        break reason;
                    }
                    if let Some(token) = ack {
                        self.report(LinkReport::Written(token));
                    }
                },
                read = reader.read(&mut chunk) => {
                    match read {
                        Ok(0) => break "connection closed by peer".to_string(),
                        Ok(n) => {
                            decoder.extend(&chunk[..n]);
                            if let Err(reason) = self.drain_decoder(&mut decoder) {
                                break reason;
                            }
                        },
                        Err(e) => break e.to_string(),
                    }
                },
            }
        };

        if let Err(error) = writer.shutdown().await {
            trace!(%error, "shutdown after close");
        }
        reason
    }

    fn drain_decoder(&self, decoder: &mut PacketDecoder) -> Result<(), String> {
        loop {
            match decoder.next_packet() {
                Ok(Some(packet)) => {
                    trace!(attempt = %self.attempt, kind = ?packet.kind, "packet received");
                    self.report(LinkReport::Transport(TransportEvent::Packet(packet)));
                },
                Ok(None) => return Ok(()),
                Err(error) => {
                    warn!(attempt = %self.attempt, %error, "undecodable stream");
                    return Err(format!("protocol error: {error}"));
                },
            }
        }
    }
}

async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes().map_err(|e| format!("encode failed: {e}"))?;
    writer.write_all(&bytes).await.map_err(|e| format!("write failed: {e}"))?;
    writer.flush().await.map_err(|e| format!("flush failed: {e}"))
}
