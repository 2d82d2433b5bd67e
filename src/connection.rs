use crate::channel::{Channel, Inbound, RequestId};
use crate::config::CastConfig;
use crate::error::{CastError, Result};
use crate::protocol::RECEIVER_ID;
use crate::subscription::{DeviceError, ErrorSink, StateSink, StateUpdate};
use crate::types::{AppState, Change, ConnectionState, DeviceId, MediaState, VolumeState};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_native_tls::native_tls;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const MIN_HEARTBEAT: std::time::Duration = std::time::Duration::from_millis(100);

/// Heartbeat periods without inbound traffic before the receiver is given up on
const MISSED_HEARTBEATS: u32 = 3;

/// Byte stream the framing runs over (TLS, or plain TCP for test receivers)
trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type FramedTransport = Framed<Box<dyn Transport>, LengthDelimitedCodec>;

/// Owner of the cached state the dispatch loop merges into
pub(crate) trait StatusTarget: Send + Sync + 'static {
    fn set_volume(&self, volume: VolumeState) -> Change;
    fn set_app(&self, app: Option<AppState>) -> Change;
    fn set_media(&self, media: Option<MediaState>) -> Change;

    /// A reply (or failure) for `request_id` was processed
    fn reply_received(&self, request_id: RequestId);

    /// The transport went away without a local disconnect
    fn connection_lost(&self);
}

/// Resources of an established connection
struct Live {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    shutdown: oneshot::Sender<()>,

    /// Set by the dispatch loop before it reports the transport lost
    lost: Arc<AtomicBool>,

    dispatch: JoinHandle<()>,
    writer: JoinHandle<Result<()>>,
}

impl Live {
    fn is_running(&self) -> bool {
        !self.lost.load(Ordering::SeqCst) && !self.dispatch.is_finished()
    }
}

/// Secured connection to one receiver
pub struct Connection {
    channel: Arc<Channel>,
    live: Option<Live>,
}

impl Connection {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel, live: None }
    }

    /// True while the transport is open and the dispatch loop is running
    pub fn is_connected(&self) -> bool {
        self.live.as_ref().is_some_and(Live::is_running)
    }

    /// Open the transport, perform the handshake and start dispatching
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn connect(
        &mut self,
        id: &str,
        addr: SocketAddr,
        timeout: std::time::Duration,
        config: &CastConfig,
        target: Arc<dyn StatusTarget>,
        errors: ErrorSink,
        states: StateSink,
    ) -> Result<()> {
        if self.is_connected() {
            return Err(CastError::OutOfOrder(format!("{} is already connected", id)));
        }
        if let Some(stale) = self.live.take() {
            tracing::debug!("Reaping dead connection to {}", stale.addr);
            // the loop has already reported the loss and is only finishing up
            stale.writer.abort();
            if let Err(e) = stale.dispatch.await {
                if e.is_panic() {
                    tracing::warn!("Dispatch loop for {} panicked: {}", stale.addr, e);
                }
            }
        }

        tracing::info!("Connecting to {} at {}", id, addr);

        let framed = tokio::time::timeout(timeout, self.open(addr, config))
            .await
            .map_err(|_| CastError::Timeout(format!("connecting to {}", addr)))??;

        self.start(id, addr, framed, config.heartbeat_interval, target, errors, states);
        tracing::info!("Connected to {} at {}", id, addr);
        Ok(())
    }

    /// Spawn the writer and the dispatch loop over an opened transport
    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        id: &str,
        addr: SocketAddr,
        framed: FramedTransport,
        heartbeat: std::time::Duration,
        target: Arc<dyn StatusTarget>,
        errors: ErrorSink,
        states: StateSink,
    ) {
        let (write, read) = framed.split();

        self.channel.reset();

        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (write_failed, write_failed_rx) = oneshot::channel();
        let lost = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_loop(write, rx, write_failed));

        let dispatcher = Dispatcher {
            id: id.to_string(),
            channel: self.channel.clone(),
            target,
            tx: tx.clone(),
            errors,
            states,
            lost: lost.clone(),
        };
        let dispatch = tokio::spawn(dispatcher.run(read, shutdown_rx, write_failed_rx, heartbeat));

        self.live = Some(Live {
            addr,
            tx,
            shutdown,
            lost,
            dispatch,
            writer,
        });
    }

    /// Open the socket, wrap it in TLS and open the platform channel
    async fn open(&self, addr: SocketAddr, config: &CastConfig) -> Result<FramedTransport> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;

        let stream: Box<dyn Transport> = if config.tls {
            // Receivers present self-signed certificates
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            Box::new(connector.connect(&addr.ip().to_string(), tcp).await?)
        } else {
            Box::new(tcp)
        };

        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(config.max_frame_length)
            .new_codec();
        let mut framed = Framed::new(stream, codec);

        framed.send(self.channel.connect(RECEIVER_ID)?).await?;
        Ok(framed)
    }

    /// Queue one framed message for the writer
    pub fn send(&self, data: Bytes) -> Result<()> {
        let live = self.live.as_ref().ok_or(CastError::ConnectionClosed)?;
        live.tx.send(data).map_err(|_| CastError::ConnectionClosed)
    }

    /// Stop dispatching and close the transport
    ///
    /// Every step is attempted; the errors of all steps are returned together.
    pub async fn disconnect(&mut self, shutdown_timeout: std::time::Duration) -> Result<()> {
        let Some(live) = self.live.take() else {
            return Ok(());
        };

        tracing::info!("Disconnecting from {}", live.addr);
        let mut errors = Vec::new();

        if live.is_running() {
            match self.channel.close(RECEIVER_ID) {
                Ok(data) => {
                    if live.tx.send(data).is_err() {
                        errors.push(CastError::ConnectionClosed);
                    }
                }
                Err(e) => errors.push(e),
            }
        }

        let _ = live.shutdown.send(());
        if let Err(e) = live.dispatch.await {
            if e.is_panic() {
                errors.push(CastError::Task(format!("dispatch loop: {}", e)));
            }
        }

        // The writer drains queued frames and closes once the last sender is gone
        drop(live.tx);
        let abort = live.writer.abort_handle();
        match tokio::time::timeout(shutdown_timeout, live.writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => errors.push(e),
            Ok(Err(e)) => errors.push(CastError::Task(format!("writer: {}", e))),
            Err(_) => {
                abort.abort();
                errors.push(CastError::Timeout(format!("closing {}", live.addr)));
            }
        }

        self.channel.reset();
        CastError::combine(errors)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.dispatch.abort();
            live.writer.abort();
        }
    }
}

/// Write queued frames until every sender is gone
///
/// A write error is handed to the dispatch loop, which reports it and ends the
/// connection. It is only returned here when the loop is already gone.
async fn write_loop(
    mut sink: SplitSink<FramedTransport, Bytes>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    failed: oneshot::Sender<CastError>,
) -> Result<()> {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::error!("Failed to send message: {}", e);
            return match failed.send(e.into()) {
                Ok(()) => Ok(()),
                Err(e) => Err(e),
            };
        }
    }
    sink.close().await?;
    Ok(())
}

/// How the dispatch loop ended
enum Exit {
    Shutdown,
    Lost,
}

/// Background receive loop for one connection
struct Dispatcher {
    id: DeviceId,
    channel: Arc<Channel>,
    target: Arc<dyn StatusTarget>,
    tx: mpsc::UnboundedSender<Bytes>,
    errors: ErrorSink,
    states: StateSink,
    lost: Arc<AtomicBool>,
}

impl Dispatcher {
    async fn run(
        self,
        mut read: SplitStream<FramedTransport>,
        mut shutdown: oneshot::Receiver<()>,
        mut write_failed: oneshot::Receiver<CastError>,
        heartbeat: std::time::Duration,
    ) {
        let period = heartbeat.max(MIN_HEARTBEAT);
        let silence = period * MISSED_HEARTBEATS;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut last_seen = Instant::now();
        let mut writer_open = true;

        let exit = loop {
            tokio::select! {
                _ = &mut shutdown => break Exit::Shutdown,
                failed = &mut write_failed, if writer_open => match failed {
                    Ok(e) => {
                        self.report(e);
                        break Exit::Lost;
                    }
                    Err(_) => writer_open = false,
                },
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= silence {
                        tracing::warn!("No traffic from {} for {:?}", self.id, last_seen.elapsed());
                        self.report(CastError::Timeout(format!("heartbeat from {}", self.id)));
                        break Exit::Lost;
                    }
                    if let Err(e) = self.channel.ping().and_then(|data| self.send(data)) {
                        self.report(e);
                        break Exit::Lost;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(frame)) => {
                        last_seen = Instant::now();
                        if self.handle(&frame).is_break() {
                            break Exit::Lost;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("Transport error from {}: {}", self.id, e);
                        self.report(e.into());
                        break Exit::Lost;
                    }
                    None => {
                        tracing::info!("Connection to {} closed by peer", self.id);
                        break Exit::Lost;
                    }
                },
            }
        };

        if let Exit::Lost = exit {
            self.lost.store(true, Ordering::SeqCst);
            self.target.connection_lost();
            let _ = self.states.send(StateUpdate::Connection {
                id: self.id.clone(),
                state: ConnectionState::Disconnected,
            });
        }
        tracing::debug!("Dispatch loop for {} exited", self.id);
    }

    fn handle(&self, frame: &[u8]) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        let inbound = match self.channel.decode(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!("Failed to decode frame from {}: {}", self.id, e);
                self.report(e);
                return ControlFlow::Continue(());
            }
        };

        match inbound {
            Inbound::Ping => {
                if let Err(e) = self.channel.pong().and_then(|data| self.send(data)) {
                    self.report(e);
                    return ControlFlow::Break(());
                }
            }
            Inbound::Pong => tracing::trace!("Heartbeat from {}", self.id),
            Inbound::Closed { source } if source == RECEIVER_ID => {
                tracing::info!("Receiver {} closed the connection", self.id);
                return ControlFlow::Break(());
            }
            Inbound::Closed { source } => {
                tracing::debug!("Application endpoint {} closed", source);
            }
            Inbound::ReceiverStatus {
                request_id,
                volume,
                app,
                ..
            } => {
                if let Some(volume) = volume {
                    self.notify(self.target.set_volume(volume));
                }
                self.notify(self.target.set_app(app));
                self.target.reply_received(request_id);
            }
            Inbound::MediaStatus {
                request_id, media, ..
            } => {
                self.notify(self.target.set_media(media));
                self.target.reply_received(request_id);
            }
            Inbound::Failure {
                request_id,
                intent,
                reason,
            } => {
                tracing::warn!("Request {} to {} failed: {}", request_id, self.id, reason);
                self.target.reply_received(request_id);
                self.report(CastError::Receiver {
                    request_id,
                    intent,
                    reason,
                });
            }
            Inbound::Ignored { namespace } => {
                tracing::trace!("Ignoring message on {}", namespace);
            }
        }

        ControlFlow::Continue(())
    }

    fn send(&self, data: Bytes) -> Result<()> {
        self.tx.send(data).map_err(|_| CastError::ConnectionClosed)
    }

    fn notify(&self, change: Change) {
        if change.is_changed() {
            let _ = self.states.send(StateUpdate::Changed {
                id: self.id.clone(),
                change,
            });
        }
    }

    fn report(&self, error: CastError) {
        let _ = self.errors.send(DeviceError {
            id: self.id.clone(),
            error,
        });
    }
}
