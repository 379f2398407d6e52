//! Peer wire messages.
//!
//! Every message travels as a 4-byte big-endian length prefix followed by
//! `length` payload bytes; a zero length is a keep-alive. The first payload
//! byte is the message id.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;

/// Peer wire message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            other => Err(other),
        }
    }
}

/// Peer wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bytes: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// The message id (None for keep-alive)
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
        }
    }

    /// Payload length written into the frame prefix
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bytes } => 1 + bytes.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Encode the full frame, length prefix included
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.id() {
            buf.put_u8(id as u8);
        }
        match self {
            Message::Have { index } => buf.put_u32(*index),
            Message::Bitfield { bytes } => buf.put_slice(bytes),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            _ => {}
        }
        buf.to_vec()
    }

    /// Decode a message from its id and body (the payload after the id byte)
    pub fn decode(id: MessageId, body: &[u8]) -> Result<Self, Error> {
        let mut buf = BytesMut::from(body);
        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                if buf.remaining() < 4 {
                    return Err(Error::protocol("have message too short"));
                }
                Ok(Message::Have {
                    index: buf.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield {
                bytes: buf.to_vec(),
            }),
            MessageId::Request => {
                if buf.remaining() < 12 {
                    return Err(Error::protocol("request message too short"));
                }
                Ok(Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            MessageId::Piece => {
                if buf.remaining() < 8 {
                    return Err(Error::protocol("piece message too short"));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    block: buf.to_vec(),
                })
            }
            MessageId::Cancel => {
                if buf.remaining() < 12 {
                    return Err(Error::protocol("cancel message too short"));
                }
                Ok(Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            MessageId::Port => {
                if buf.remaining() < 2 {
                    return Err(Error::protocol("port message too short"));
                }
                Ok(Message::Port {
                    listen_port: buf.get_u16(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let frame = msg.encode();
        let length = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), 4 + length);
        if length == 0 {
            return Message::KeepAlive;
        }
        let id = MessageId::try_from(frame[4]).unwrap();
        Message::decode(id, &frame[5..]).unwrap()
    }

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_flag_messages_roundtrip() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            assert_eq!(msg.encode().len(), 5);
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_have_roundtrip() {
        let msg = Message::Have { index: 42 };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_request_frame_is_17_bytes() {
        let msg = Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        };
        let frame = msg.encode();
        assert_eq!(frame.len(), 17);
        assert_eq!(&frame[..4], &13u32.to_be_bytes());
        assert_eq!(frame[4], MessageId::Request as u8);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_bitfield_prefix_counts_id_byte() {
        let bytes = vec![0b1000_0000, 0b0000_0001];
        let msg = Message::Bitfield {
            bytes: bytes.clone(),
        };
        let frame = msg.encode();
        assert_eq!(&frame[..4], &3u32.to_be_bytes());
        assert_eq!(frame[4], MessageId::Bitfield as u8);
        assert_eq!(&frame[5..], bytes.as_slice());
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_piece_roundtrip() {
        let msg = Message::Piece {
            index: 3,
            begin: 32768,
            block: vec![7u8; 64],
        };
        let frame = msg.encode();
        assert_eq!(&frame[..4], &(9u32 + 64).to_be_bytes());
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_port_roundtrip() {
        let msg = Message::Port { listen_port: 6881 };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_decode_short_bodies_rejected() {
        assert!(Message::decode(MessageId::Have, &[0, 0]).is_err());
        assert!(Message::decode(MessageId::Request, &[0; 11]).is_err());
        assert!(Message::decode(MessageId::Piece, &[0; 7]).is_err());
        assert!(Message::decode(MessageId::Port, &[0]).is_err());
    }

    #[test]
    fn test_unknown_id_rejected() {
        assert_eq!(MessageId::try_from(10), Err(10));
        assert_eq!(MessageId::try_from(20), Err(20));
        assert_eq!(MessageId::try_from(9).unwrap(), MessageId::Port);
    }
}
