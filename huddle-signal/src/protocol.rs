//! Binary wire protocol spoken with browser peers.
//!
//! Every integer is little-endian.
//!
//! Client → server (which one is expected depends on the connection state):
//! ```text
//! Intro     ┌──────────┬─────────────────┐
//!           │ i32 lobby│ utf8 name       │   len > 4
//!           └──────────┴─────────────────┘
//! Proposal  ┌──────────┬─────────────────┐
//!           │ u8 approve│ u16 id …       │   len ≥ 3, (len - 1) even
//!           └──────────┴─────────────────┘
//! Relay     ┌──────────┬─────────────────┐
//!           │ u16 to   │ opaque payload  │   len > 2
//!           └──────────┴─────────────────┘
//! ```
//!
//! Server → client frames start with a one byte [`Opcode`].
//! Any id list in a group frame is the full member set with the subject of
//! the event first and everyone else ascending.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Identifier of one live connection.
pub type ClientId = u16;

/// Identifier of a lobby, chosen by the clients.
pub type LobbyId = i32;

/// Random token shared by every member of one finalized group.
pub type CorrelationCode = u32;

const OPCODE_LEN: usize = 1;
const ID_LEN: usize = 2;
const LOBBY_LEN: usize = 4;
const CODE_LEN: usize = 4;

/// Leading byte of every server → client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// A lobby member left (disconnected or was grouped)
    ClientLeave = 0,
    /// A lobby member is present, with its display name
    ClientJoin = 1,
    /// A pending group was closed by the first id
    GroupReject = 2,
    /// The first id accepted a pending group
    GroupRequest = 3,
    /// Everyone accepted; carries the correlation code
    GroupFinal = 4,
    /// The server picked a name for an anonymous client
    YourName = 5,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::ClientLeave,
            1 => Self::ClientJoin,
            2 => Self::GroupReject,
            3 => Self::GroupRequest,
            4 => Self::GroupFinal,
            5 => Self::YourName,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Rejects empty frames and frames larger than `max_packet_size`.
pub fn check_size(len: usize, max_packet_size: usize) -> Result<(), ProtocolError> {
    if len == 0 {
        return Err(ProtocolError::Empty);
    }
    if len > max_packet_size {
        return Err(ProtocolError::TooLarge { len, max: max_packet_size });
    }
    Ok(())
}

/// First message of every client: which lobby to wait in and under what name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intro {
    pub lobby: LobbyId,
    /// Raw display name, not yet sanitized.
    pub name: String,
}

impl Intro {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() <= LOBBY_LEN {
            return Err(ProtocolError::Malformed { kind: "intro", len: bytes.len() });
        }
        let mut buf = bytes;
        let lobby = buf.get_i32_le();
        Ok(Self {
            lobby,
            name: String::from_utf8_lossy(buf).into_owned(),
        })
    }

    /// Client-side encoding.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LOBBY_LEN + self.name.len());
        buf.put_i32_le(self.lobby);
        buf.put_slice(self.name.as_bytes());
        buf.freeze()
    }
}

/// A vote on the group made of the sender plus `ids`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub approve: bool,
    pub ids: BTreeSet<ClientId>,
}

impl Proposal {
    pub fn new(approve: bool, ids: impl IntoIterator<Item = ClientId>) -> Self {
        Self { approve, ids: ids.into_iter().collect() }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < OPCODE_LEN + ID_LEN || (bytes.len() - OPCODE_LEN) % ID_LEN != 0 {
            return Err(ProtocolError::Malformed { kind: "proposal", len: bytes.len() });
        }
        let mut buf = bytes;
        let approve = match buf.get_u8() {
            0 => false,
            1 => true,
            other => return Err(ProtocolError::InvalidApproval(other)),
        };
        let mut ids = BTreeSet::new();
        while buf.has_remaining() {
            ids.insert(buf.get_u16_le());
        }
        Ok(Self { approve, ids })
    }

    /// Client-side encoding.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OPCODE_LEN + self.ids.len() * ID_LEN);
        buf.put_u8(self.approve as u8);
        for id in &self.ids {
            buf.put_u16_le(*id);
        }
        buf.freeze()
    }
}

/// Opaque signaling data exchanged once a group is finalized.
///
/// The frame is kept whole so forwarding only rewrites the two address bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub to: ClientId,
    frame: Bytes,
}

impl RelayFrame {
    pub fn decode(frame: Bytes) -> Result<Self, ProtocolError> {
        if frame.len() <= ID_LEN {
            return Err(ProtocolError::Malformed { kind: "relay", len: frame.len() });
        }
        let to = u16::from_le_bytes([frame[0], frame[1]]);
        Ok(Self { to, frame })
    }

    /// Client-side encoding.
    pub fn encode(to: ClientId, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(ID_LEN + payload.len());
        buf.put_u16_le(to);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Everything after the address.
    pub fn payload(&self) -> &[u8] {
        &self.frame[ID_LEN..]
    }

    /// The frame as a receiver sees it: addressed from `from`.
    pub fn readdressed(&self, from: ClientId) -> Bytes {
        if from == self.to {
            return self.frame.clone();
        }
        let mut buf = BytesMut::from(&self.frame[..]);
        buf[..ID_LEN].copy_from_slice(&from.to_le_bytes());
        buf.freeze()
    }
}

/// A frame queued for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ClientId,
    pub frame: Bytes,
}

impl Delivery {
    pub fn new(to: ClientId, frame: Bytes) -> Self {
        Self { to, frame }
    }
}

pub fn client_join(id: ClientId, name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(OPCODE_LEN + ID_LEN + name.len());
    buf.put_u8(Opcode::ClientJoin as u8);
    buf.put_u16_le(id);
    buf.put_slice(name.as_bytes());
    buf.freeze()
}

pub fn client_leave(id: ClientId) -> Bytes {
    let mut buf = BytesMut::with_capacity(OPCODE_LEN + ID_LEN);
    buf.put_u8(Opcode::ClientLeave as u8);
    buf.put_u16_le(id);
    buf.freeze()
}

pub fn your_name(name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(OPCODE_LEN + name.len());
    buf.put_u8(Opcode::YourName as u8);
    buf.put_slice(name.as_bytes());
    buf.freeze()
}

pub fn group_request(ids: &[ClientId]) -> Bytes {
    id_list(Opcode::GroupRequest, ids)
}

pub fn group_reject(ids: &[ClientId]) -> Bytes {
    id_list(Opcode::GroupReject, ids)
}

pub fn group_final(code: CorrelationCode, ids: &[ClientId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(OPCODE_LEN + CODE_LEN + ids.len() * ID_LEN);
    buf.put_u8(Opcode::GroupFinal as u8);
    buf.put_u32_le(code);
    for id in ids {
        buf.put_u16_le(*id);
    }
    buf.freeze()
}

fn id_list(opcode: Opcode, ids: &[ClientId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(OPCODE_LEN + ids.len() * ID_LEN);
    buf.put_u8(opcode as u8);
    for id in ids {
        buf.put_u16_le(*id);
    }
    buf.freeze()
}

/// Decoded server → client frame, as a browser peer would read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    ClientJoin { id: ClientId, name: String },
    ClientLeave { id: ClientId },
    GroupRequest { ids: Vec<ClientId> },
    GroupReject { ids: Vec<ClientId> },
    GroupFinal { code: CorrelationCode, ids: Vec<ClientId> },
    YourName { name: String },
}

impl ServerMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = bytes;
        if !buf.has_remaining() {
            return Err(ProtocolError::Empty);
        }
        let opcode = Opcode::try_from(buf.get_u8())?;
        let malformed = || ProtocolError::Malformed { kind: "server frame", len: bytes.len() };
        Ok(match opcode {
            Opcode::ClientJoin => {
                if buf.remaining() < ID_LEN {
                    return Err(malformed());
                }
                let id = buf.get_u16_le();
                Self::ClientJoin { id, name: String::from_utf8_lossy(buf).into_owned() }
            }
            Opcode::ClientLeave => {
                if buf.remaining() != ID_LEN {
                    return Err(malformed());
                }
                Self::ClientLeave { id: buf.get_u16_le() }
            }
            Opcode::GroupRequest => Self::GroupRequest { ids: read_ids(buf).ok_or_else(malformed)? },
            Opcode::GroupReject => Self::GroupReject { ids: read_ids(buf).ok_or_else(malformed)? },
            Opcode::GroupFinal => {
                if buf.remaining() < CODE_LEN {
                    return Err(malformed());
                }
                let code = buf.get_u32_le();
                Self::GroupFinal { code, ids: read_ids(buf).ok_or_else(malformed)? }
            }
            Opcode::YourName => Self::YourName { name: String::from_utf8_lossy(buf).into_owned() },
        })
    }
}

fn read_ids(mut buf: &[u8]) -> Option<Vec<ClientId>> {
    if buf.len() % ID_LEN != 0 {
        return None;
    }
    let mut ids = Vec::with_capacity(buf.len() / ID_LEN);
    while buf.has_remaining() {
        ids.push(buf.get_u16_le());
    }
    Some(ids)
}

/// Reasons a frame or connection is rejected. Always fatal to the sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("malformed {kind} of {len} bytes")]
    Malformed { kind: &'static str, len: usize },
    #[error("approval byte must be 0 or 1, got {0}")]
    InvalidApproval(u8),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("text frames are not part of the protocol")]
    TextFrame,
    #[error("display name is empty after sanitizing")]
    InvalidName,
    #[error("unexpected message while {0}")]
    OutOfState(&'static str),
    #[error("relay addressed to {0}, who is not in the sender's group")]
    UnknownRecipient(ClientId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intro_decode() {
        let mut raw = 123i32.to_le_bytes().to_vec();
        raw.extend_from_slice("mo".as_bytes());

        let intro = Intro::decode(&raw).unwrap();
        assert_eq!(intro.lobby, 123);
        assert_eq!(intro.name, "mo");
    }

    #[test]
    fn test_intro_negative_lobby() {
        let intro = Intro { lobby: -7, name: "x".into() };
        assert_eq!(Intro::decode(&intro.encode()).unwrap().lobby, -7);
    }

    #[test]
    fn test_intro_requires_name_bytes() {
        assert_eq!(
            Intro::decode(&[1, 0, 0, 0]),
            Err(ProtocolError::Malformed { kind: "intro", len: 4 })
        );
        assert!(Intro::decode(&[1, 0]).is_err());
    }

    #[test]
    fn test_intro_lossy_utf8() {
        let intro = Intro::decode(&[0, 0, 0, 0, b'a', 0xFF]).unwrap();
        assert_eq!(intro.name, "a\u{FFFD}");
    }

    #[test]
    fn test_proposal_decode() {
        let proposal = Proposal::decode(&[1, 2, 0, 7, 1]).unwrap();
        assert!(proposal.approve);
        assert_eq!(proposal.ids.into_iter().collect::<Vec<_>>(), vec![2, 263]);
    }

    #[test]
    fn test_proposal_collapses_duplicates() {
        let proposal = Proposal::decode(&[0, 5, 0, 5, 0]).unwrap();
        assert!(!proposal.approve);
        assert_eq!(proposal.ids.len(), 1);
    }

    #[test]
    fn test_proposal_shape_checks() {
        // too short
        assert!(Proposal::decode(&[1]).is_err());
        assert!(Proposal::decode(&[1, 2]).is_err());
        // odd id bytes
        assert!(Proposal::decode(&[1, 2, 0, 3]).is_err());
        // approval must be boolean
        assert_eq!(Proposal::decode(&[3, 1, 2]), Err(ProtocolError::InvalidApproval(3)));
    }

    #[test]
    fn test_relay_decode() {
        let relay = RelayFrame::decode(Bytes::from_static(&[9, 0, 0xAB, 0xCD])).unwrap();
        assert_eq!(relay.to, 9);
        assert_eq!(relay.payload(), &[0xAB, 0xCD]);
    }

    #[test]
    fn test_relay_requires_payload() {
        assert!(RelayFrame::decode(Bytes::from_static(&[9, 0])).is_err());
    }

    #[test]
    fn test_relay_readdressed() {
        let relay = RelayFrame::decode(RelayFrame::encode(2, &[0xCD, 0xAB, 0xEF, 0x00])).unwrap();
        let forwarded = relay.readdressed(1);
        assert_eq!(&forwarded[..], &[1, 0, 0xCD, 0xAB, 0xEF, 0x00]);
        // self-addressed frames already carry the sender
        assert_eq!(relay.readdressed(2), RelayFrame::encode(2, &[0xCD, 0xAB, 0xEF, 0x00]));
    }

    #[test]
    fn test_check_size() {
        assert_eq!(check_size(0, 10), Err(ProtocolError::Empty));
        assert_eq!(check_size(11, 10), Err(ProtocolError::TooLarge { len: 11, max: 10 }));
        assert!(check_size(10, 10).is_ok());
    }

    #[test]
    fn test_outgoing_layouts() {
        assert_eq!(&client_join(0x0102, "mo")[..], &[1, 0x02, 0x01, b'm', b'o']);
        assert_eq!(&client_leave(3)[..], &[0, 3, 0]);
        assert_eq!(&your_name("a")[..], &[5, b'a']);
        assert_eq!(&group_request(&[2, 1])[..], &[3, 2, 0, 1, 0]);
        assert_eq!(&group_reject(&[2, 1])[..], &[2, 2, 0, 1, 0]);
        assert_eq!(
            &group_final(0xDEADBEEF, &[1, 2])[..],
            &[4, 0xEF, 0xBE, 0xAD, 0xDE, 1, 0, 2, 0]
        );
    }

    #[test]
    fn test_server_message_decode() {
        assert_eq!(
            ServerMessage::decode(&group_final(42, &[5, 1, 9])).unwrap(),
            ServerMessage::GroupFinal { code: 42, ids: vec![5, 1, 9] }
        );
        assert_eq!(
            ServerMessage::decode(&client_join(4, "momo")).unwrap(),
            ServerMessage::ClientJoin { id: 4, name: "momo".into() }
        );
        assert_eq!(
            ServerMessage::decode(&client_leave(4)).unwrap(),
            ServerMessage::ClientLeave { id: 4 }
        );
    }

    #[test]
    fn test_server_message_rejects_garbage() {
        assert_eq!(ServerMessage::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(ServerMessage::decode(&[9]), Err(ProtocolError::UnknownOpcode(9)));
        assert!(ServerMessage::decode(&[Opcode::GroupReject as u8, 1]).is_err());
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::ClientLeave as u8, 0);
        assert_eq!(Opcode::ClientJoin as u8, 1);
        assert_eq!(Opcode::GroupReject as u8, 2);
        assert_eq!(Opcode::GroupRequest as u8, 3);
        assert_eq!(Opcode::GroupFinal as u8, 4);
        assert_eq!(Opcode::YourName as u8, 5);
    }
}
