use bytes::{Buf, BufMut, BytesMut};

use crate::core::{Error, NodeAddress, ProtocolState, Result};

// Control frame tags
const TAG_TENTATIVE_HEAD: u8 = 0x01;
const TAG_FINAL_HEAD: u8 = 0x02;
const TAG_REROUTE: u8 = 0x03;
const TAG_ROUTE_START: u8 = 0x04;
const TAG_MAKE_CHILD: u8 = 0x05;
const TAG_JOIN_HEAD: u8 = 0x06;
const TAG_NEED_PARENT: u8 = 0x07;
const TAG_PARENT_OFFER: u8 = 0x08;
const TAG_STATUS: u8 = 0x09;
const TAG_NOT_YOUR_PARENT: u8 = 0x0a;

// Time-sync frame tags
const TAG_SYNC_REQUEST: u8 = 0x20;
const TAG_SYNC_REPLY: u8 = 0x21;
const TAG_SYNC_ADJUST: u8 = 0x22;
const TAG_SYNC_DESCEND: u8 = 0x23;

/// Routing/clustering control frames
///
/// Uncompressed, single-byte-type-tagged, fixed-layout big-endian records,
/// carried on the control protocol number. Distinct from the compressed
/// application envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// HEED tentative head claim with the sender's cost
    TentativeHead { cost: u32 },

    /// HEED final head claim with the sender's cost
    FinalHead { cost: u32 },

    /// Forced re-route trigger, rebroadcast-flooded through the mesh
    Reroute,

    /// A routed head announces itself as a parent candidate at `depth`
    RouteStart { depth: u16 },

    /// Request to become a routing child of the destination
    MakeChild,

    /// Request to join the destination's cluster as a member
    JoinHead,

    /// Single-node recovery: solicit parent offers from routed heads
    NeedParent,

    /// Unicast reply to `NeedParent` from a routed head at `depth`
    ParentOffer { depth: u16 },

    /// Periodic status heartbeat used for reconciliation
    Status {
        state: ProtocolState,
        height: u16,
        parent: Option<NodeAddress>,
        cost: u32,
    },

    /// Correction: the sender is not the destination's parent
    NotYourParent,
}

impl ControlMessage {
    /// Encodes the message into its wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(24);
        match self {
            ControlMessage::TentativeHead { cost } => {
                buf.put_u8(TAG_TENTATIVE_HEAD);
                buf.put_u32(*cost);
            }
            ControlMessage::FinalHead { cost } => {
                buf.put_u8(TAG_FINAL_HEAD);
                buf.put_u32(*cost);
            }
            ControlMessage::Reroute => buf.put_u8(TAG_REROUTE),
            ControlMessage::RouteStart { depth } => {
                buf.put_u8(TAG_ROUTE_START);
                buf.put_u16(*depth);
            }
            ControlMessage::MakeChild => buf.put_u8(TAG_MAKE_CHILD),
            ControlMessage::JoinHead => buf.put_u8(TAG_JOIN_HEAD),
            ControlMessage::NeedParent => buf.put_u8(TAG_NEED_PARENT),
            ControlMessage::ParentOffer { depth } => {
                buf.put_u8(TAG_PARENT_OFFER);
                buf.put_u16(*depth);
            }
            ControlMessage::Status {
                state,
                height,
                parent,
                cost,
            } => {
                buf.put_u8(TAG_STATUS);
                buf.put_u8(state.to_byte());
                buf.put_u16(*height);
                match parent {
                    Some(p) => {
                        buf.put_u8(1);
                        buf.put_u64(p.0);
                    }
                    None => {
                        buf.put_u8(0);
                        buf.put_u64(0);
                    }
                }
                buf.put_u32(*cost);
            }
            ControlMessage::NotYourParent => buf.put_u8(TAG_NOT_YOUR_PARENT),
        }
        buf.to_vec()
    }

    /// Decodes a control frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut buf = frame;
        let tag = take_u8(&mut buf)?;
        let msg = match tag {
            TAG_TENTATIVE_HEAD => ControlMessage::TentativeHead {
                cost: take_u32(&mut buf)?,
            },
            TAG_FINAL_HEAD => ControlMessage::FinalHead {
                cost: take_u32(&mut buf)?,
            },
            TAG_REROUTE => ControlMessage::Reroute,
            TAG_ROUTE_START => ControlMessage::RouteStart {
                depth: take_u16(&mut buf)?,
            },
            TAG_MAKE_CHILD => ControlMessage::MakeChild,
            TAG_JOIN_HEAD => ControlMessage::JoinHead,
            TAG_NEED_PARENT => ControlMessage::NeedParent,
            TAG_PARENT_OFFER => ControlMessage::ParentOffer {
                depth: take_u16(&mut buf)?,
            },
            TAG_STATUS => {
                let state_byte = take_u8(&mut buf)?;
                let state = ProtocolState::from_byte(state_byte)
                    .ok_or_else(|| Error::codec(format!("bad state byte {state_byte}")))?;
                let height = take_u16(&mut buf)?;
                let has_parent = take_u8(&mut buf)? != 0;
                let parent_raw = take_u64(&mut buf)?;
                let parent = has_parent.then_some(NodeAddress(parent_raw));
                let cost = take_u32(&mut buf)?;
                ControlMessage::Status {
                    state,
                    height,
                    parent,
                    cost,
                }
            }
            TAG_NOT_YOUR_PARENT => ControlMessage::NotYourParent,
            other => return Err(Error::codec(format!("unknown control tag 0x{other:02x}"))),
        };
        Ok(msg)
    }
}

/// Time-sync frames, carried on the dedicated time-sync protocol number
///
/// All timestamps are effective (sync-corrected) clock milliseconds of the
/// node that stamped them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Initiator's probe; `t1` is its send time
    Request { t1: u64 },

    /// Responder echo: `t2` is link-layer arrival of the request, `t3` the
    /// send time of this reply
    Reply { t1: u64, t2: u64, t3: u64 },

    /// Initiator's offset result for the responder identified by its own
    /// `t2` stamp: `d2 = ((t2 - t1) - (t4 - t3)) / 2`
    Adjust { t2: u64, d2: i64 },

    /// Tells a freshly synced child to resync its own subtree
    Descend,
}

impl SyncMessage {
    /// Encodes the message into its wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(25);
        match self {
            SyncMessage::Request { t1 } => {
                buf.put_u8(TAG_SYNC_REQUEST);
                buf.put_u64(*t1);
            }
            SyncMessage::Reply { t1, t2, t3 } => {
                buf.put_u8(TAG_SYNC_REPLY);
                buf.put_u64(*t1);
                buf.put_u64(*t2);
                buf.put_u64(*t3);
            }
            SyncMessage::Adjust { t2, d2 } => {
                buf.put_u8(TAG_SYNC_ADJUST);
                buf.put_u64(*t2);
                buf.put_i64(*d2);
            }
            SyncMessage::Descend => buf.put_u8(TAG_SYNC_DESCEND),
        }
        buf.to_vec()
    }

    /// Decodes a time-sync frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let mut buf = frame;
        let tag = take_u8(&mut buf)?;
        let msg = match tag {
            TAG_SYNC_REQUEST => SyncMessage::Request {
                t1: take_u64(&mut buf)?,
            },
            TAG_SYNC_REPLY => SyncMessage::Reply {
                t1: take_u64(&mut buf)?,
                t2: take_u64(&mut buf)?,
                t3: take_u64(&mut buf)?,
            },
            TAG_SYNC_ADJUST => SyncMessage::Adjust {
                t2: take_u64(&mut buf)?,
                d2: take_i64(&mut buf)?,
            },
            TAG_SYNC_DESCEND => SyncMessage::Descend,
            other => return Err(Error::codec(format!("unknown sync tag 0x{other:02x}"))),
        };
        Ok(msg)
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::codec("short frame"));
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::codec("short frame"));
    }
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::codec("short frame"));
    }
    Ok(buf.get_u32())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::codec("short frame"));
    }
    Ok(buf.get_u64())
}

fn take_i64(buf: &mut &[u8]) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(Error::codec("short frame"));
    }
    Ok(buf.get_i64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        let msg = ControlMessage::Status {
            state: ProtocolState::RoutedHead,
            height: 3,
            parent: Some(NodeAddress(0xdead_beef)),
            cost: 7,
        };
        let decoded = ControlMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);

        let msg = ControlMessage::Status {
            state: ProtocolState::NoRoute,
            height: 0,
            parent: None,
            cost: 0,
        };
        let decoded = ControlMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_status_layout_is_big_endian() {
        let msg = ControlMessage::Status {
            state: ProtocolState::RoutedMember,
            height: 0x0102,
            parent: Some(NodeAddress(0x0a0b_0c0d_0e0f_1011)),
            cost: 0x2030_4050,
        };
        let bytes = msg.encode();
        assert_eq!(bytes[0], TAG_STATUS);
        assert_eq!(bytes[1], ProtocolState::RoutedMember.to_byte());
        assert_eq!(&bytes[2..4], &[0x01, 0x02]);
        assert_eq!(bytes[4], 1);
        assert_eq!(
            &bytes[5..13],
            &[0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10, 0x11]
        );
        assert_eq!(&bytes[13..17], &[0x20, 0x30, 0x40, 0x50]);
    }

    #[test]
    fn test_tag_only_messages() {
        for msg in [
            ControlMessage::Reroute,
            ControlMessage::MakeChild,
            ControlMessage::JoinHead,
            ControlMessage::NeedParent,
            ControlMessage::NotYourParent,
        ] {
            let bytes = msg.encode();
            assert_eq!(bytes.len(), 1);
            assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_sync_round_trip() {
        let msg = SyncMessage::Reply {
            t1: 100,
            t2: 140,
            t3: 141,
        };
        assert_eq!(SyncMessage::decode(&msg.encode()).unwrap(), msg);

        let msg = SyncMessage::Adjust { t2: 140, d2: -12 };
        assert_eq!(SyncMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ControlMessage::decode(&[]).is_err());
        assert!(ControlMessage::decode(&[0xff]).is_err());
        // Truncated cost field
        assert!(ControlMessage::decode(&[TAG_FINAL_HEAD, 0x00]).is_err());
        assert!(SyncMessage::decode(&[TAG_SYNC_REQUEST, 1, 2]).is_err());
    }
}
