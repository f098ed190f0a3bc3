//! Per-channel session: frame dispatch, link lifecycle, heartbeat
//!
//! One session task owns everything belonging to a control channel: the
//! write sink, the link table, and the event queues feeding it. Sockets
//! accepted on bound endpoints arrive through the inbound queue; per-link
//! relay tasks report socket bytes and closures through the link event
//! queue. Because every frame send happens inside this single task, frames
//! leave in a well-defined order: the early-data drain on an open ack
//! completes before any newer bytes for that link are forwarded.

use super::binds::BindRegistry;
use crate::channel::{self, ChannelMessage, ChannelReader, FrameSink};
use crate::link::{
    spawn_socket_tasks, Link, LinkEvent, LinkId, LinkIdAllocator, LinkTable,
};
use crate::protocol::{BindReply, BindRequest, Frame, FrameType};
use crate::{Error, EARLY_DATA_LIMIT, HEARTBEAT_TIMEOUT, PING_INTERVAL};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queue depth for link events and inbound sockets
const EVENT_QUEUE_DEPTH: usize = 256;

/// Run one admitted control channel to completion.
///
/// Returns when the channel dies for any reason; all links, link ids, and
/// bind participations of the channel are released before returning.
pub async fn run<S>(
    channel_id: u64,
    sink: FrameSink<S>,
    mut reader: ChannelReader<S>,
    binds: Arc<BindRegistry>,
    ids: Arc<LinkIdAllocator>,
) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (inbound_tx, mut inbound_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let mut state = SessionState {
        channel_id,
        sink,
        links: LinkTable::new(),
        binds: Arc::clone(&binds),
        ids: Arc::clone(&ids),
        events_tx,
        inbound_tx,
    };

    let result = state
        .serve(&mut reader, &mut events_rx, &mut inbound_rx)
        .await;

    // release everything the channel owned, whatever ended it
    binds.release_channel(channel_id).await;
    for link_id in state.links.shutdown_all() {
        ids.release(link_id);
    }
    info!("channel {} closed", channel_id);

    result
}

struct SessionState<S> {
    channel_id: u64,
    sink: FrameSink<S>,
    links: LinkTable,
    binds: Arc<BindRegistry>,
    ids: Arc<LinkIdAllocator>,
    /// Prototype sender for per-link relay tasks
    events_tx: mpsc::Sender<LinkEvent>,
    /// Prototype sender registered with bind entries
    inbound_tx: mpsc::Sender<TcpStream>,
}

impl<S> SessionState<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn serve(
        &mut self,
        reader: &mut ChannelReader<S>,
        events_rx: &mut mpsc::Receiver<LinkEvent>,
        inbound_rx: &mut mpsc::Receiver<TcpStream>,
    ) -> crate::Result<()> {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut awaiting_pong = false;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if last_heard.elapsed() >= HEARTBEAT_TIMEOUT {
                        info!("channel {} silent for {:?}, terminating", self.channel_id, HEARTBEAT_TIMEOUT);
                        return Err(Error::HeartbeatTimeout);
                    }
                    if awaiting_pong {
                        info!("channel {} missed a ping, terminating", self.channel_id);
                        return Err(Error::HeartbeatTimeout);
                    }
                    self.sink.send_ping().await?;
                    awaiting_pong = true;
                }

                message = channel::next_message(reader) => match message {
                    ChannelMessage::Frame(frame) => self.handle_frame(frame).await?,
                    ChannelMessage::Ping(payload) => {
                        last_heard = Instant::now();
                        self.sink.send_pong(payload).await?;
                    }
                    ChannelMessage::Pong(_) => {
                        awaiting_pong = false;
                        last_heard = Instant::now();
                    }
                    ChannelMessage::Closed => {
                        debug!("channel {} closed by peer", self.channel_id);
                        return Ok(());
                    }
                },

                Some(stream) = inbound_rx.recv() => {
                    self.open_incoming(stream).await?;
                }

                Some(event) = events_rx.recv() => match event {
                    LinkEvent::Data { link_id, data } => self.local_data(link_id, data).await?,
                    LinkEvent::Closed { link_id } => self.local_closed(link_id).await?,
                },
            }
        }
    }

    /// A bound endpoint accepted an external connection: allocate a link,
    /// start its relay tasks, and ask the client to open its side.
    async fn open_incoming(&mut self, stream: TcpStream) -> crate::Result<()> {
        let _ = stream.set_nodelay(true);
        let link_id = self.ids.allocate();

        let (data_tx, reader) = spawn_socket_tasks(stream, link_id, self.events_tx.clone());
        self.links.insert(link_id, Link::opening(data_tx, reader));

        debug!("channel {} opening link {}", self.channel_id, link_id);
        self.sink.send_frame(Frame::open(link_id)).await
    }

    async fn handle_frame(&mut self, frame: Frame) -> crate::Result<()> {
        match frame.frame_type {
            FrameType::Open => self.on_open_ack(frame.link_id).await,
            FrameType::Close => self.on_close(frame.link_id).await,
            FrameType::Data => self.on_data(frame.link_id, frame.payload).await,
            FrameType::Bind => self.on_bind(frame.link_id, &frame.payload).await,
            FrameType::BindAck => {
                warn!(
                    "channel {} sent an unexpected BIND_ACK for link {}, dropping",
                    self.channel_id, frame.link_id
                );
                Ok(())
            }
        }
    }

    /// The client confirmed a link: flush the early buffer, in arrival
    /// order, before anything newer may be sent for it.
    async fn on_open_ack(&mut self, link_id: LinkId) -> crate::Result<()> {
        let Some(link) = self.links.get_mut(link_id) else {
            warn!("open ack for unknown link {}, dropping", link_id);
            return Ok(());
        };

        if link.is_ready() {
            warn!("duplicate open ack for link {}, closing it", link_id);
            return self.close_link(link_id, true).await;
        }

        let buffered = link.confirm();
        debug!(
            "link {} confirmed, draining {} early chunk(s)",
            link_id,
            buffered.len()
        );
        for chunk in buffered {
            self.sink.send_frame(Frame::data(link_id, chunk)).await?;
        }
        Ok(())
    }

    async fn on_close(&mut self, link_id: LinkId) -> crate::Result<()> {
        // idempotent: a close for an absent link is a no-op
        self.close_link(link_id, false).await
    }

    async fn on_data(&mut self, link_id: LinkId, data: bytes::Bytes) -> crate::Result<()> {
        let Some(link) = self.links.get_mut(link_id) else {
            debug!("data for unknown link {}, dropping {} bytes", link_id, data.len());
            return Ok(());
        };

        if link.is_ready() {
            if !link.forward(data) {
                debug!("link {} writer gone, closing", link_id);
                return self.close_link(link_id, true).await;
            }
            return Ok(());
        }

        if !link.buffer_early(data, EARLY_DATA_LIMIT) {
            warn!("link {} exceeded the early-data limit, closing", link_id);
            return self.close_link(link_id, true).await;
        }
        Ok(())
    }

    /// Bytes arrived from a link's external socket
    async fn local_data(&mut self, link_id: LinkId, data: bytes::Bytes) -> crate::Result<()> {
        let Some(link) = self.links.get_mut(link_id) else {
            // the link was torn down while this chunk sat in the queue
            return Ok(());
        };

        if link.is_ready() {
            return self.sink.send_frame(Frame::data(link_id, data)).await;
        }

        if !link.buffer_early(data, EARLY_DATA_LIMIT) {
            warn!("link {} exceeded the early-data limit, closing", link_id);
            return self.close_link(link_id, true).await;
        }
        Ok(())
    }

    /// The external socket reached EOF or failed
    async fn local_closed(&mut self, link_id: LinkId) -> crate::Result<()> {
        self.close_link(link_id, true).await
    }

    /// Handle a BIND request, always answering with a BIND_ACK that mirrors
    /// the request's link id.
    async fn on_bind(&mut self, link_id: LinkId, payload: &[u8]) -> crate::Result<()> {
        let reply = match BindRequest::decode(payload) {
            Ok(request) => {
                info!(
                    "channel {} requests bind {}",
                    self.channel_id,
                    request.key()
                );
                match self
                    .binds
                    .bind(
                        &request.host,
                        request.port,
                        self.channel_id,
                        self.inbound_tx.clone(),
                    )
                    .await
                {
                    Ok(()) => BindReply::ok(),
                    Err(message) => {
                        warn!("bind {} refused: {}", request.key(), message);
                        BindReply::refused(message)
                    }
                }
            }
            Err(e) => {
                warn!("channel {} sent an invalid BIND: {}", self.channel_id, e);
                BindReply::refused(e.to_string())
            }
        };

        self.sink
            .send_frame(Frame::bind_ack(link_id, reply.encode()?))
            .await
    }

    /// Remove a link, stop its relay tasks, release its id, and tell the
    /// peer when the closure originated here. At most one CLOSE is ever
    /// emitted per link because removal happens first.
    async fn close_link(&mut self, link_id: LinkId, notify_peer: bool) -> crate::Result<()> {
        let Some(link) = self.links.remove(link_id) else {
            return Ok(());
        };
        link.shutdown();
        self.ids.release(link_id);
        debug!("channel {} closed link {}", self.channel_id, link_id);

        if notify_peer {
            self.sink.send_frame(Frame::close(link_id)).await?;
        }
        Ok(())
    }
}
