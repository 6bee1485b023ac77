/**
 * p2p/frame.rs
 *
 * Channel frame codec
 */

use crate::error::ChannelError;
use anyhow::{anyhow, Result};

/// Largest UDP payload over IPv4
pub const MAX_FRAME_LEN: usize = 65_507;

const FRAME_MAGIC: &[u8; 4] = b"P2PC";
const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Reply,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    UnknownTopic,
}

/// One channel datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub status: Status,
    /// Correlation id; replies echo the id of their request
    pub id: u64,
    pub topic: String,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn request(id: u64, topic: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Request,
            status: Status::Ok,
            id,
            topic: topic.into(),
            data,
        }
    }

    pub fn reply(id: u64, status: Status, topic: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Reply,
            status,
            id,
            topic: topic.into(),
            data,
        }
    }

    pub fn close() -> Self {
        Self {
            kind: FrameKind::Close,
            status: Status::Ok,
            id: 0,
            topic: String::new(),
            data: Vec::new(),
        }
    }

    /// Layout: magic (4) | kind (1) | status (1) | id (8) | topic len (2) | topic | data
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        let size = HEADER_LEN + self.topic.len() + self.data.len();
        if size > MAX_FRAME_LEN || self.topic.len() > u16::MAX as usize {
            return Err(ChannelError::TooLarge {
                size,
                max: MAX_FRAME_LEN,
            });
        }

        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(FRAME_MAGIC);
        bytes.push(match self.kind {
            FrameKind::Request => 0,
            FrameKind::Reply => 1,
            FrameKind::Close => 2,
        });
        bytes.push(match self.status {
            Status::Ok => 0,
            Status::Error => 1,
            Status::UnknownTopic => 2,
        });
        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes.extend_from_slice(&(self.topic.len() as u16).to_be_bytes());
        bytes.extend_from_slice(self.topic.as_bytes());
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(anyhow!("Frame too short: {}", data.len()));
        }
        if &data[0..4] != FRAME_MAGIC {
            return Err(anyhow!("Invalid frame magic"));
        }

        let kind = match data[4] {
            0 => FrameKind::Request,
            1 => FrameKind::Reply,
            2 => FrameKind::Close,
            other => return Err(anyhow!("Unknown frame kind: {}", other)),
        };
        let status = match data[5] {
            0 => Status::Ok,
            1 => Status::Error,
            2 => Status::UnknownTopic,
            other => return Err(anyhow!("Unknown frame status: {}", other)),
        };

        let mut id = [0u8; 8];
        id.copy_from_slice(&data[6..14]);
        let topic_len = u16::from_be_bytes([data[14], data[15]]) as usize;
        if data.len() < HEADER_LEN + topic_len {
            return Err(anyhow!("Frame topic truncated"));
        }
        let topic = std::str::from_utf8(&data[HEADER_LEN..HEADER_LEN + topic_len])
            .map_err(|e| anyhow!("Frame topic is not UTF-8: {}", e))?
            .to_string();

        Ok(Self {
            kind,
            status,
            id: u64::from_be_bytes(id),
            topic,
            data: data[HEADER_LEN + topic_len..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let bytes = Frame::request(0x0102, "test", b"ping".to_vec()).encode().unwrap();
        assert_eq!(&bytes[0..4], b"P2PC");
        assert_eq!(bytes[4], 0);
        assert_eq!(&bytes[6..14], &0x0102u64.to_be_bytes());
        assert_eq!(&bytes[14..16], &4u16.to_be_bytes());
        assert_eq!(&bytes[16..20], b"test");
        assert_eq!(&bytes[20..], b"ping");
    }

    #[test]
    fn reply_decodes_with_status() {
        let frame = Frame::reply(9, Status::UnknownTopic, "missing", Vec::new());
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = Frame::request(1, "big", vec![0u8; MAX_FRAME_LEN]);
        assert!(matches!(frame.encode(), Err(ChannelError::TooLarge { .. })));
    }

    #[test]
    fn garbage_is_not_a_frame() {
        assert!(Frame::decode(b"P2PP\x00\x00\x00\x00\x00\x00\x00\x00\x00\x2a").is_err());
        assert!(Frame::decode(b"short").is_err());

        let mut truncated = Frame::request(1, "topic", Vec::new()).encode().unwrap();
        truncated.truncate(18);
        assert!(Frame::decode(&truncated).is_err());
    }
}
