//! Per-packet header for eRPC data packets.
//!
//! The header is 16 bytes, stored as two little-endian 64-bit words:
//!
//! ```text
//! word 0: req_type:8 | msg_size:24 | dest_session_num:16 | pkt_type:2 | pkt_num:14
//! word 1: req_num:44 | magic:4 | reserved:16
//! ```
//!
//! Headers live inside message buffers at addresses that are not always
//! 8-byte aligned (received packets are aliased in place), so all accesses
//! go through unaligned reads and writes.

/// Packet header size in bytes.
pub const PKT_HDR_SIZE: usize = 16;

/// Magic value stored in every valid header (4 bits).
pub const PKT_HDR_MAGIC: u8 = 11;

/// Maximum message size (24 bits).
pub const MAX_MSG_SIZE: usize = (1 << 24) - 1;

/// Maximum request number (44 bits).
pub const MAX_REQ_NUM: u64 = (1 << 44) - 1;

/// Maximum packet number (14 bits).
pub const MAX_PKT_NUM: u16 = (1 << 14) - 1;

/// Packet type (2 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// Request data packet.
    Req = 0,
    /// Request-for-response, sent by the client to pull later response packets.
    Rfr = 1,
    /// Explicit credit return.
    ExplCr = 2,
    /// Response data packet.
    Resp = 3,
}

impl PktType {
    fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => PktType::Req,
            1 => PktType::Rfr,
            2 => PktType::ExplCr,
            _ => PktType::Resp,
        }
    }
}

/// Packet header (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct PktHdr {
    w0: u64,
    w1: u64,
}

const MSG_SIZE_SHIFT: u32 = 8;
const SESSION_SHIFT: u32 = 32;
const PKT_TYPE_SHIFT: u32 = 48;
const PKT_NUM_SHIFT: u32 = 50;
const MAGIC_SHIFT: u32 = 44;

impl PktHdr {
    /// Create a new packet header carrying the magic value.
    pub fn new(
        req_type: u8,
        msg_size: usize,
        dest_session_num: u16,
        pkt_type: PktType,
        pkt_num: u16,
        req_num: u64,
    ) -> Self {
        debug_assert!(msg_size <= MAX_MSG_SIZE);
        debug_assert!(pkt_num <= MAX_PKT_NUM);
        debug_assert!(req_num <= MAX_REQ_NUM);

        let w0 = (req_type as u64)
            | (((msg_size & MAX_MSG_SIZE) as u64) << MSG_SIZE_SHIFT)
            | ((dest_session_num as u64) << SESSION_SHIFT)
            | ((pkt_type as u64) << PKT_TYPE_SHIFT)
            | (((pkt_num & MAX_PKT_NUM) as u64) << PKT_NUM_SHIFT);
        let w1 = (req_num & MAX_REQ_NUM) | ((PKT_HDR_MAGIC as u64) << MAGIC_SHIFT);
        Self { w0, w1 }
    }

    /// A header with every field zero except the magic value.
    pub fn blank() -> Self {
        Self {
            w0: 0,
            w1: (PKT_HDR_MAGIC as u64) << MAGIC_SHIFT,
        }
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.w0 as u8
    }

    #[inline]
    pub fn msg_size(&self) -> usize {
        ((self.w0 >> MSG_SIZE_SHIFT) as usize) & MAX_MSG_SIZE
    }

    #[inline]
    pub fn dest_session_num(&self) -> u16 {
        (self.w0 >> SESSION_SHIFT) as u16
    }

    #[inline]
    pub fn pkt_type(&self) -> PktType {
        PktType::from_bits(self.w0 >> PKT_TYPE_SHIFT)
    }

    #[inline]
    pub fn pkt_num(&self) -> u16 {
        (self.w0 >> PKT_NUM_SHIFT) as u16 & MAX_PKT_NUM
    }

    #[inline]
    pub fn req_num(&self) -> u64 {
        self.w1 & MAX_REQ_NUM
    }

    #[inline]
    pub fn magic(&self) -> u8 {
        ((self.w1 >> MAGIC_SHIFT) & 0xF) as u8
    }

    /// Check if the magic value is present.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic() == PKT_HDR_MAGIC
    }

    /// Write the header to `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of PKT_HDR_SIZE bytes.
    #[inline]
    pub unsafe fn write_to(&self, dst: *mut u8) {
        unsafe {
            std::ptr::write_unaligned(dst as *mut u64, self.w0.to_le());
            std::ptr::write_unaligned(dst.add(8) as *mut u64, self.w1.to_le());
        }
    }

    /// Read a header from `src`.
    ///
    /// # Safety
    /// `src` must be valid for reads of PKT_HDR_SIZE bytes.
    #[inline]
    pub unsafe fn read_from(src: *const u8) -> Self {
        unsafe {
            Self {
                w0: u64::from_le(std::ptr::read_unaligned(src as *const u64)),
                w1: u64::from_le(std::ptr::read_unaligned(src.add(8) as *const u64)),
            }
        }
    }

    /// Number of packets needed to carry `msg_size` bytes at the given MTU.
    pub fn calc_num_pkts(msg_size: usize, mtu: usize) -> usize {
        debug_assert!(mtu > PKT_HDR_SIZE);
        let data_per_pkt = mtu - PKT_HDR_SIZE;
        msg_size.div_ceil(data_per_pkt).max(1)
    }
}
