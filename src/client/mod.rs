//! Client dialer and serving loop
//!
//! The client connects the control channel, issues one BIND for its proxy
//! rule, then serves OPEN frames: each one is answered by dialing the
//! configured local destination and acking (or closing) the link. The
//! client is deliberately crash-only: channel loss, a refused bind, or
//! heartbeat starvation all end [`run`] with an error, the process exits
//! non-zero, and an external supervisor is expected to restart it.

use crate::channel::{self, ChannelMessage, ChannelReader, FrameSink};
use crate::config::{addr_for_dial, control_url, ProxyRule};
use crate::link::{spawn_socket_tasks, Link, LinkEvent, LinkId, LinkTable};
use crate::protocol::{BindReply, BindRequest, Frame, FrameType};
use crate::{tls, Error, HEARTBEAT_TIMEOUT, PING_INTERVAL};
use rustls::pki_types::ServerName;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// How long to wait for the server's answer to our BIND
const BIND_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue depth for link and dial events
const EVENT_QUEUE_DEPTH: usize = 256;

/// Everything the client needs to run
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Control endpoint host
    pub remote_host: String,
    /// Control endpoint port
    pub remote_port: u16,
    /// PEM client certificate presented to the server
    pub cert_path: PathBuf,
    /// PEM client private key
    pub key_path: PathBuf,
    /// The one proxy rule to serve
    pub rule: ProxyRule,
}

/// Connect, bind, and serve until the channel dies.
///
/// Never returns `Ok`: every exit path is a fatal condition reported as an
/// error so the process terminates non-zero.
pub async fn run(options: ClientOptions) -> crate::Result<()> {
    let ws = connect(&options).await?;
    info!(
        "control channel established to {}:{}",
        options.remote_host, options.remote_port
    );

    let (mut sink, mut reader) = channel::split(ws);

    request_bind(&mut sink, &mut reader, &options.rule).await?;
    info!(
        "bound {}:{} on the gateway",
        options.rule.bind_host, options.rule.bind_port
    );

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (dials_tx, mut dials_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let mut state = ClientState {
        sink,
        links: LinkTable::new(),
        pending_dials: HashSet::new(),
        local_addr: options.rule.local_addr(),
        events_tx,
        dials_tx,
    };

    let result = state.serve(&mut reader, &mut events_rx, &mut dials_rx).await;

    // crash-only: drop every local socket before reporting the failure
    state.links.shutdown_all();
    result
}

/// Dial the control endpoint: TCP, then TLS with our certificate, then the
/// WebSocket handshake.
async fn connect(options: &ClientOptions) -> crate::Result<WebSocketStream<TlsStream<TcpStream>>> {
    let addr = addr_for_dial(&options.remote_host, options.remote_port);
    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;

    let config = tls::client_config(&options.cert_path, &options.key_path)?;
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(options.remote_host.clone())
        .map_err(|e| Error::Config(format!("invalid remote host '{}': {}", options.remote_host, e)))?;

    let tls_stream = connector.connect(server_name, stream).await?;

    let url = control_url(&options.remote_host, options.remote_port);
    let (ws, _response) = tokio_tungstenite::client_async(url, tls_stream).await?;
    Ok(ws)
}

/// Issue the BIND and wait for the matching BIND_ACK
async fn request_bind(
    sink: &mut FrameSink<TlsStream<TcpStream>>,
    reader: &mut ChannelReader<TlsStream<TcpStream>>,
    rule: &ProxyRule,
) -> crate::Result<()> {
    let request = BindRequest::new(rule.bind_host.clone(), rule.bind_port);
    let bind_link_id: LinkId = rand::random();
    sink.send_frame(Frame::bind(bind_link_id, &request)).await?;

    let ack = tokio::time::timeout(BIND_ACK_TIMEOUT, async {
        loop {
            match channel::next_message(reader).await {
                ChannelMessage::Frame(frame)
                    if frame.frame_type == FrameType::BindAck && frame.link_id == bind_link_id =>
                {
                    return Ok(BindReply::decode(&frame.payload)?);
                }
                ChannelMessage::Frame(frame) => {
                    warn!(
                        "ignoring frame type={:?} link={} before bind ack",
                        frame.frame_type, frame.link_id
                    );
                }
                ChannelMessage::Ping(payload) => sink.send_pong(payload).await?,
                ChannelMessage::Pong(_) => {}
                ChannelMessage::Closed => return Err(Error::ChannelClosed),
            }
        }
    })
    .await
    .map_err(|_| Error::BindRefused("timed out waiting for bind ack".to_string()))??;

    if !ack.success {
        let message = ack.error.unwrap_or_else(|| "unspecified".to_string());
        return Err(Error::BindRefused(message));
    }
    Ok(())
}

/// A local dial finished for one requested link
struct DialOutcome {
    link_id: LinkId,
    result: std::io::Result<TcpStream>,
}

struct ClientState {
    sink: FrameSink<TlsStream<TcpStream>>,
    links: LinkTable,
    /// Links whose local dial is still in flight
    pending_dials: HashSet<LinkId>,
    local_addr: String,
    events_tx: mpsc::Sender<LinkEvent>,
    dials_tx: mpsc::Sender<DialOutcome>,
}

impl ClientState {
    async fn serve(
        &mut self,
        reader: &mut ChannelReader<TlsStream<TcpStream>>,
        events_rx: &mut mpsc::Receiver<LinkEvent>,
        dials_rx: &mut mpsc::Receiver<DialOutcome>,
    ) -> crate::Result<()> {
        let mut starvation_check = tokio::time::interval(PING_INTERVAL);
        starvation_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // the server must ping within the heartbeat window from now on
        let mut last_ping = Instant::now();

        loop {
            tokio::select! {
                _ = starvation_check.tick() => {
                    if last_ping.elapsed() >= HEARTBEAT_TIMEOUT {
                        warn!("no ping from the server for {:?}, giving up", HEARTBEAT_TIMEOUT);
                        return Err(Error::HeartbeatTimeout);
                    }
                }

                message = channel::next_message(reader) => match message {
                    ChannelMessage::Frame(frame) => self.handle_frame(frame).await?,
                    ChannelMessage::Ping(payload) => {
                        last_ping = Instant::now();
                        self.sink.send_pong(payload).await?;
                    }
                    ChannelMessage::Pong(_) => {}
                    ChannelMessage::Closed => {
                        info!("control channel closed");
                        return Err(Error::ChannelClosed);
                    }
                },

                Some(outcome) = dials_rx.recv() => {
                    self.on_dial_done(outcome).await?;
                }

                Some(event) = events_rx.recv() => match event {
                    LinkEvent::Data { link_id, data } => {
                        // local sockets only exist for confirmed links
                        if self.links.contains(link_id) {
                            self.sink.send_frame(Frame::data(link_id, data)).await?;
                        }
                    }
                    LinkEvent::Closed { link_id } => {
                        self.close_link(link_id, true).await?;
                    }
                },
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> crate::Result<()> {
        match frame.frame_type {
            FrameType::Open => self.on_open(frame.link_id).await,
            FrameType::Close => self.on_close(frame.link_id).await,
            FrameType::Data => self.on_data(frame.link_id, frame.payload).await,
            FrameType::Bind | FrameType::BindAck => {
                warn!(
                    "unexpected frame type={:?} for link {}, dropping",
                    frame.frame_type, frame.link_id
                );
                Ok(())
            }
        }
    }

    /// The server announced a new external connection: dial the local
    /// destination without blocking the loop.
    async fn on_open(&mut self, link_id: LinkId) -> crate::Result<()> {
        if self.links.contains(link_id) || self.pending_dials.contains(&link_id) {
            warn!("duplicate open for link {}, closing it", link_id);
            self.pending_dials.remove(&link_id);
            return self.close_link(link_id, true).await;
        }

        debug!("open for link {}, dialing {}", link_id, self.local_addr);
        self.pending_dials.insert(link_id);

        let addr = self.local_addr.clone();
        let dials_tx = self.dials_tx.clone();
        tokio::spawn(async move {
            let result = TcpStream::connect(&addr).await;
            let _ = dials_tx.send(DialOutcome { link_id, result }).await;
        });
        Ok(())
    }

    /// A local dial finished. The ack is sent before the relay tasks can
    /// produce any data event, so the server always sees OPEN before DATA
    /// for the link.
    async fn on_dial_done(&mut self, outcome: DialOutcome) -> crate::Result<()> {
        if !self.pending_dials.remove(&outcome.link_id) {
            // the server closed the link while the dial was in flight
            debug!("discarding finished dial for closed link {}", outcome.link_id);
            return Ok(());
        }

        match outcome.result {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (data_tx, reader) =
                    spawn_socket_tasks(stream, outcome.link_id, self.events_tx.clone());
                self.links.insert(outcome.link_id, Link::ready(data_tx, reader));

                debug!("link {} ready", outcome.link_id);
                self.sink.send_frame(Frame::open(outcome.link_id)).await
            }
            Err(e) => {
                warn!(
                    "local dial to {} failed for link {}: {}",
                    self.local_addr, outcome.link_id, e
                );
                self.sink.send_frame(Frame::close(outcome.link_id)).await
            }
        }
    }

    async fn on_close(&mut self, link_id: LinkId) -> crate::Result<()> {
        if self.pending_dials.remove(&link_id) {
            debug!("link {} closed before its dial finished", link_id);
            return Ok(());
        }
        self.close_link(link_id, false).await
    }

    async fn on_data(&mut self, link_id: LinkId, data: bytes::Bytes) -> crate::Result<()> {
        let Some(link) = self.links.get(link_id) else {
            debug!("data for unknown link {}, dropping {} bytes", link_id, data.len());
            return Ok(());
        };

        if !link.forward(data) {
            debug!("link {} writer gone, closing", link_id);
            return self.close_link(link_id, true).await;
        }
        Ok(())
    }

    async fn close_link(&mut self, link_id: LinkId, notify_peer: bool) -> crate::Result<()> {
        let Some(link) = self.links.remove(link_id) else {
            return Ok(());
        };
        link.shutdown();
        debug!("closed link {}", link_id);

        if notify_peer {
            self.sink.send_frame(Frame::close(link_id)).await?;
        }
        Ok(())
    }
}
