//! Control channel message pump
//!
//! One WebSocket-over-TLS connection carries every frame between a client
//! and the server. This module wraps the raw socket in a typed reader
//! ([`next_message`]) and a serializing writer ([`FrameSink`]); because all
//! sends on one side go through a single `FrameSink` owner, frames are
//! delivered in send order per direction.
//!
//! Frames travel as binary messages; WebSocket ping/pong carries liveness.
//! Messages that fail to decode (short header, unrecognized type) are
//! logged and skipped without disturbing the channel.

use crate::protocol::Frame;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

/// WebSocket close code sent when admission rejects a client
pub const REJECT_CLOSE_CODE: u16 = 1001;

/// Reader half of a control channel
pub type ChannelReader<S> = SplitStream<WebSocketStream<S>>;

/// One decoded inbound event on the control channel
#[derive(Debug)]
pub enum ChannelMessage {
    /// A protocol frame
    Frame(Frame),
    /// Liveness probe from the peer; answer with a pong
    Ping(Bytes),
    /// Answer to one of our pings
    Pong(Bytes),
    /// The channel is gone (close handshake, EOF, or transport error)
    Closed,
}

/// Split a WebSocket connection into the sink/reader pair used by the
/// session loops
pub fn split<S>(ws: WebSocketStream<S>) -> (FrameSink<S>, ChannelReader<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (FrameSink { inner: sink }, stream)
}

/// Serializing writer for one control channel
pub struct FrameSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> FrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one frame as a binary message
    pub async fn send_frame(&mut self, frame: Frame) -> crate::Result<()> {
        trace!(
            "sending frame type={:?} link={} payload={} bytes",
            frame.frame_type,
            frame.link_id,
            frame.payload.len()
        );
        self.inner
            .send(Message::Binary(frame.encode().freeze()))
            .await?;
        Ok(())
    }

    /// Send a liveness probe
    pub async fn send_ping(&mut self) -> crate::Result<()> {
        self.inner.send(Message::Ping(Bytes::new())).await?;
        Ok(())
    }

    /// Answer a peer ping, echoing its payload
    pub async fn send_pong(&mut self, payload: Bytes) -> crate::Result<()> {
        self.inner.send(Message::Pong(payload)).await?;
        Ok(())
    }

    /// Initiate a close handshake with an explicit code and reason
    pub async fn close_with(&mut self, code: u16, reason: &str) -> crate::Result<()> {
        self.inner
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })))
            .await?;
        Ok(())
    }
}

/// Read the next meaningful event from the channel.
///
/// Undecodable frames and non-binary payloads are logged and skipped; any
/// transport-level failure is collapsed into [`ChannelMessage::Closed`],
/// which tears the whole channel (and every link on it) down.
pub async fn next_message<S>(reader: &mut ChannelReader<S>) -> ChannelMessage
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(Message::Binary(data))) => match Frame::decode(data) {
                Ok(frame) => return ChannelMessage::Frame(frame),
                Err(e) => warn!("dropping frame: {}", e),
            },
            Some(Ok(Message::Ping(payload))) => return ChannelMessage::Ping(payload),
            Some(Ok(Message::Pong(payload))) => return ChannelMessage::Pong(payload),
            Some(Ok(Message::Close(close))) => {
                debug!("peer closed channel: {:?}", close);
                return ChannelMessage::Closed;
            }
            Some(Ok(other)) => warn!("ignoring non-binary message: {:?}", other),
            Some(Err(e)) => {
                debug!("channel read error: {}", e);
                return ChannelMessage::Closed;
            }
            None => return ChannelMessage::Closed,
        }
    }
}
