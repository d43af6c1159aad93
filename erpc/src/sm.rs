//! Session management packets and work items.
//!
//! Session management (SM) packets travel on the out-of-band control plane.
//! This layer only reads the endpoint IDs to route a packet; the payload is
//! opaque and interpreted by the endpoint's session state machine.
//!
//! Wire format:
//!
//! ```text
//! Offset  Size  Field
//! 0       1     magic (0xE5)
//! 1       1     pkt_type
//! 2       1     src_rpc_id
//! 3       1     dst_rpc_id
//! 4       4     payload length (little-endian)
//! 8       n     payload
//! ```

use crate::error::{Error, Result};

/// Header size of an encoded SM packet.
pub const SM_PKT_HDR_SIZE: usize = 8;

const SM_PKT_MAGIC: u8 = 0xE5;

/// Session management packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    ConnectReq = 0,
    ConnectResp = 1,
    DisconnectReq = 2,
    DisconnectResp = 3,
}

impl TryFrom<u8> for SmPktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmPktType::ConnectReq),
            1 => Ok(SmPktType::ConnectResp),
            2 => Ok(SmPktType::DisconnectReq),
            3 => Ok(SmPktType::DisconnectResp),
            _ => Err(Error::InvalidSmPacket(format!("unknown type {}", value))),
        }
    }
}

impl SmPktType {
    #[inline]
    pub fn is_req(&self) -> bool {
        matches!(self, SmPktType::ConnectReq | SmPktType::DisconnectReq)
    }
}

/// A session management packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    /// Rpc that sent the packet.
    pub src_rpc_id: u8,
    /// Rpc the packet is addressed to.
    pub dst_rpc_id: u8,
    pub payload: Vec<u8>,
}

impl SmPkt {
    pub fn new(pkt_type: SmPktType, src_rpc_id: u8, dst_rpc_id: u8, payload: Vec<u8>) -> Self {
        Self {
            pkt_type,
            src_rpc_id,
            dst_rpc_id,
            payload,
        }
    }

    #[inline]
    pub fn encoded_len(&self) -> usize {
        SM_PKT_HDR_SIZE + self.payload.len()
    }

    /// Append the encoded packet to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.push(SM_PKT_MAGIC);
        out.push(self.pkt_type as u8);
        out.push(self.src_rpc_id);
        out.push(self.dst_rpc_id);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
    }

    /// Decode a packet occupying all of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SM_PKT_HDR_SIZE {
            return Err(Error::InvalidSmPacket(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        if bytes[0] != SM_PKT_MAGIC {
            return Err(Error::InvalidSmPacket(format!("bad magic {:#x}", bytes[0])));
        }
        let pkt_type = SmPktType::try_from(bytes[1])?;
        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let payload = &bytes[SM_PKT_HDR_SIZE..];
        if payload.len() != len {
            return Err(Error::InvalidSmPacket(format!(
                "payload length {} does not match header {}",
                payload.len(),
                len
            )));
        }
        Ok(Self {
            pkt_type,
            src_rpc_id: bytes[2],
            dst_rpc_id: bytes[3],
            payload: payload.to_vec(),
        })
    }
}

/// Transport-level handle of a control-plane connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub usize);

/// Remote end of an SM work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmPeer {
    /// A host by declared name. The SM thread connects on first use.
    Host(String),
    /// An existing connection, e.g. the one a request arrived on.
    Handle(PeerId),
}

/// A work item exchanged between an endpoint thread and the SM thread.
#[derive(Debug, Clone)]
pub struct SmWorkItem {
    /// The local Rpc ID.
    pub rpc_id: u8,
    pub sm_pkt: SmPkt,
    pub peer: SmPeer,
}

impl SmWorkItem {
    pub fn new(rpc_id: u8, sm_pkt: SmPkt, peer: SmPeer) -> Self {
        Self { rpc_id, sm_pkt, peer }
    }

    /// An item for a host that may not be connected yet.
    pub fn to_host(rpc_id: u8, sm_pkt: SmPkt, hostname: impl Into<String>) -> Self {
        Self::new(rpc_id, sm_pkt, SmPeer::Host(hostname.into()))
    }

    /// An item for an established connection.
    pub fn to_peer(rpc_id: u8, sm_pkt: SmPkt, peer: PeerId) -> Self {
        Self::new(rpc_id, sm_pkt, SmPeer::Handle(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let pkt = SmPkt::new(SmPktType::ConnectReq, 3, 7, b"session 12".to_vec());
        let mut bytes = Vec::new();
        pkt.encode(&mut bytes);
        assert_eq!(bytes.len(), pkt.encoded_len());
        assert_eq!(SmPkt::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SmPkt::decode(&[0xE5, 0, 1]).is_err());
        assert!(SmPkt::decode(&[0x00, 0, 1, 2, 0, 0, 0, 0]).is_err());
        assert!(SmPkt::decode(&[0xE5, 9, 1, 2, 0, 0, 0, 0]).is_err());
        // Length field says 4, only 2 bytes follow.
        assert!(SmPkt::decode(&[0xE5, 0, 1, 2, 4, 0, 0, 0, 1, 2]).is_err());
    }

    #[test]
    fn test_pkt_type_direction() {
        assert!(SmPktType::ConnectReq.is_req());
        assert!(!SmPktType::DisconnectResp.is_req());
    }
}
