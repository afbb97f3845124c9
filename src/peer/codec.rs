//! Wire-level framing for the two distinct phases of a peer connection: the
//! fixed 68-byte handshake, and the length-prefixed message stream that
//! follows it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, BlockInfo, Bitfield, PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed 68-byte frame exchanged once at the start of a connection.
#[derive(Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(68);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 68 {
            return Ok(None);
        }

        let prot_len = buf[0];
        if prot_len != 19 {
            return Err(Error::HandshakeFailed(format!(
                "expected protocol string length 19, got {}",
                prot_len
            )));
        }

        let mut prot = [0; 19];
        prot.copy_from_slice(&buf[1..20]);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::HandshakeFailed(
                "unexpected protocol identifier".into(),
            ));
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        buf.advance(68);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// Peer-wire message identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            _ => return None,
        })
    }
}

/// A peer-wire protocol message, after the handshake.
#[derive(Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut len_buf = [0; 4];
        len_buf.copy_from_slice(&buf[0..4]);
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + len {
            // not enough data yet, but make sure we'll have room for it
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        let id_pos = 4;
        let id = buf[id_pos];
        let payload = &buf[id_pos + 1..4 + len];

        let msg = match MessageId::from_u8(id) {
            Some(MessageId::Choke) => Message::Choke,
            Some(MessageId::Unchoke) => Message::Unchoke,
            Some(MessageId::Interested) => Message::Interested,
            Some(MessageId::NotInterested) => Message::NotInterested,
            Some(MessageId::Have) => {
                if payload.len() != 4 {
                    return Err(Error::ProtocolViolation(
                        "have message payload must be 4 bytes".into(),
                    ));
                }
                let mut b = [0; 4];
                b.copy_from_slice(payload);
                Message::Have {
                    piece_index: u32::from_be_bytes(b) as PieceIndex,
                }
            }
            Some(MessageId::Bitfield) => {
                Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }
            Some(MessageId::Request) => {
                if payload.len() != 12 {
                    return Err(Error::ProtocolViolation(
                        "request message payload must be 12 bytes".into(),
                    ));
                }
                Message::Request(parse_block_info(payload))
            }
            Some(MessageId::Block) => {
                if payload.len() < 8 {
                    return Err(Error::ProtocolViolation(
                        "piece message payload must be at least 8 bytes"
                            .into(),
                    ));
                }
                let mut piece_index_buf = [0; 4];
                piece_index_buf.copy_from_slice(&payload[0..4]);
                let mut offset_buf = [0; 4];
                offset_buf.copy_from_slice(&payload[4..8]);
                Message::Block {
                    piece_index: u32::from_be_bytes(piece_index_buf)
                        as PieceIndex,
                    offset: u32::from_be_bytes(offset_buf),
                    data: payload[8..].to_vec(),
                }
            }
            Some(MessageId::Cancel) => {
                if payload.len() != 12 {
                    return Err(Error::ProtocolViolation(
                        "cancel message payload must be 12 bytes".into(),
                    ));
                }
                Message::Cancel(parse_block_info(payload))
            }
            None => {
                return Err(Error::ProtocolViolation(format!(
                    "unknown message id {}",
                    id
                )));
            }
        };

        buf.advance(4 + len);

        Ok(Some(msg))
    }
}

fn parse_block_info(payload: &[u8]) -> BlockInfo {
    let mut piece_index_buf = [0; 4];
    piece_index_buf.copy_from_slice(&payload[0..4]);
    let mut offset_buf = [0; 4];
    offset_buf.copy_from_slice(&payload[4..8]);
    let mut len_buf = [0; 4];
    len_buf.copy_from_slice(&payload[8..12]);
    BlockInfo {
        piece_index: u32::from_be_bytes(piece_index_buf) as PieceIndex,
        offset: u32::from_be_bytes(offset_buf),
        len: u32::from_be_bytes(len_buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_handshake() {
        let info_hash = [1; 20];
        let peer_id = [2; 20];
        let handshake = Handshake::new(info_hash, peer_id);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, info_hash);
        assert_eq!(decoded.peer_id, peer_id);
    }

    #[test]
    fn rejects_bad_protocol_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(18);
        buf.extend_from_slice(&[0; 67]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn roundtrips_request_message() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 16_384,
            len: 10,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Request(decoded) => assert_eq!(decoded, block),
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[test]
    fn decodes_keep_alive() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(matches!(
            PeerCodec.decode(&mut buf).unwrap().unwrap(),
            Message::KeepAlive
        ));
    }

    #[test]
    fn waits_for_full_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        // only 3 of the 4 payload bytes present
        buf.extend_from_slice(&[0, 0, 0]);
        assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
    }
}
