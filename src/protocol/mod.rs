//! Frame encoding/decoding for the gateway protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |           Type (4B, BE)           |
//! +--------+--------+--------+--------+
//! |          Link ID (4B, BE)         |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! Frames have no length field: the transport is message-oriented and
//! delivers each frame as one whole message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 8;

/// Protocol layer errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0} bytes, header needs {FRAME_HEADER_SIZE}")]
    Malformed(usize),

    #[error("unknown frame type {value} (link {link_id})")]
    UnknownType { value: u32, link_id: u32 },

    #[error("invalid bind payload: {0}")]
    InvalidBind(String),

    #[error("invalid bind ack payload: {0}")]
    InvalidBindAck(String),
}

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    /// Server to client: a new external connection wants this link opened.
    /// Client to server: the link is dialed and ready (ack).
    Open = 0,
    /// Link teardown, either direction
    Close = 1,
    /// Stream bytes for one link
    Data = 2,
    /// Client to server: bind a public endpoint
    Bind = 10,
    /// Server to client: bind outcome, JSON payload
    BindAck = 11,
}

impl TryFrom<u32> for FrameType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Close),
            2 => Ok(FrameType::Data),
            10 => Ok(FrameType::Bind),
            11 => Ok(FrameType::BindAck),
            other => Err(other),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Link this frame belongs to
    pub link_id: u32,
    /// Payload data (empty for OPEN and CLOSE)
    pub payload: Bytes,
}

impl Frame {
    /// Create an open (or open-ack) frame
    pub fn open(link_id: u32) -> Self {
        Self {
            frame_type: FrameType::Open,
            link_id,
            payload: Bytes::new(),
        }
    }

    /// Create a close frame
    pub fn close(link_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            link_id,
            payload: Bytes::new(),
        }
    }

    /// Create a data frame
    pub fn data(link_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            link_id,
            payload,
        }
    }

    /// Create a bind request frame
    pub fn bind(link_id: u32, request: &BindRequest) -> Self {
        Self {
            frame_type: FrameType::Bind,
            link_id,
            payload: request.encode(),
        }
    }

    /// Create a bind ack frame
    pub fn bind_ack(link_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::BindAck,
            link_id,
            payload,
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.frame_type as u32);
        buf.put_u32(self.link_id);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from one whole transport message
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Malformed(buf.len()));
        }

        let raw_type = buf.get_u32();
        let link_id = buf.get_u32();

        let frame_type = FrameType::try_from(raw_type)
            .map_err(|value| ProtocolError::UnknownType { value, link_id })?;

        Ok(Self {
            frame_type,
            link_id,
            payload: buf,
        })
    }
}

/// A parsed BIND request: 2-byte big-endian port, then the UTF-8 host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub host: String,
    pub port: u16,
}

impl BindRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The registry key for this endpoint
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Encode to a frame payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.host.len());
        buf.put_u16(self.port);
        buf.extend_from_slice(self.host.as_bytes());
        buf.freeze()
    }

    /// Decode from a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 3 {
            return Err(ProtocolError::InvalidBind(format!(
                "{} bytes, need a port and a host",
                payload.len()
            )));
        }

        let port = u16::from_be_bytes([payload[0], payload[1]]);
        let host = std::str::from_utf8(&payload[2..])
            .map_err(|e| ProtocolError::InvalidBind(format!("host is not UTF-8: {}", e)))?
            .to_string();

        Ok(Self { host, port })
    }
}

/// BIND_ACK payload, serialized as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BindReply {
    /// A successful bind
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A refused bind with the failure message
    pub fn refused(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }

    /// Serialize to a frame payload
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::InvalidBindAck(e.to_string()))?;
        Ok(Bytes::from(json))
    }

    /// Parse from a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::InvalidBindAck(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(42, Bytes::from_static(b"Hello, World!"));
        let encoded = original.encode().freeze();

        let decoded = Frame::decode(encoded).unwrap();

        assert_eq!(decoded.frame_type, original.frame_type);
        assert_eq!(decoded.link_id, 42);
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::data(0x01020304, Bytes::from_static(b"x"));
        let encoded = frame.encode();

        assert_eq!(&encoded[..4], &[0, 0, 0, 2]);
        assert_eq!(&encoded[4..8], &[1, 2, 3, 4]);
        assert_eq!(&encoded[8..], b"x");
    }

    #[test]
    fn test_link_id_zero_is_valid() {
        let frame = Frame::open(0);
        let decoded = Frame::decode(frame.encode().freeze()).unwrap();
        assert_eq!(decoded.link_id, 0);
        assert_eq!(decoded.frame_type, FrameType::Open);
    }

    #[test]
    fn test_malformed_frame() {
        let err = Frame::decode(Bytes::from_static(&[0, 0, 0])).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(3)));
    }

    #[test]
    fn test_unknown_type_preserved() {
        let mut buf = BytesMut::new();
        buf.put_u32(99);
        buf.put_u32(7);
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnknownType { value: 99, link_id: 7 }
        ));
    }

    #[test]
    fn test_bind_request_roundtrip() {
        let request = BindRequest::new("0.0.0.0", 9000);
        let payload = request.encode();

        assert_eq!(&payload[..2], &9000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"0.0.0.0");

        let decoded = BindRequest::decode(&payload).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.key(), "0.0.0.0:9000");
    }

    #[test]
    fn test_bind_request_too_short() {
        assert!(BindRequest::decode(&[0x23]).is_err());
        assert!(BindRequest::decode(&9000u16.to_be_bytes()).is_err());
    }

    #[test]
    fn test_bind_reply_json_shape() {
        let ok = BindReply::ok().encode().unwrap();
        assert_eq!(&ok[..], br#"{"success":true}"#);

        let refused = BindReply::refused("address in use").encode().unwrap();
        assert_eq!(
            &refused[..],
            br#"{"success":false,"error":"address in use"}"#
        );

        let parsed = BindReply::decode(&refused).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error.as_deref(), Some("address in use"));
    }
}
