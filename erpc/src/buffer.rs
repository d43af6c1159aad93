//! Packetized message buffers.
//!
//! A [`MsgBuffer`] holds one logical request or response together with a
//! header slot for every packet it is split into. Header 0 sits right before
//! the first data byte, so a single-packet message goes on the wire without
//! moving any data. Headers 1.. follow the data region:
//!
//! ```text
//! backing: [ hdr 0 | data (max_data_size, padded to 8) | hdr 1 | hdr 2 | ... ]
//!                    ^ buf
//! ```
//!
//! Header positions depend only on `max_data_size`, so they stay put when the
//! buffer is resized and reused for messages of different sizes.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fmt;
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::packet::{PKT_HDR_SIZE, PktHdr};

/// Alignment for backing allocations (cache line aligned).
pub const MSG_BUFFER_ALIGN: usize = 64;

/// Granularity to which the data region is padded before headers 1...
const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Round `x` up to a multiple of `to`, which must be a power of two.
#[inline]
pub const fn round_up(x: usize, to: usize) -> usize {
    (x + to - 1) & !(to - 1)
}

/// A backing allocation that message buffers are carved from.
///
/// Memory is zeroed and aligned to MSG_BUFFER_ALIGN.
pub struct Buffer {
    ptr: NonNull<u8>,
    class_size: usize,
}

impl Buffer {
    /// Allocate a zeroed buffer of `class_size` bytes.
    pub fn new(class_size: usize) -> Result<Self> {
        if class_size == 0 {
            return Err(Error::InvalidConfig("Buffer size cannot be 0".into()));
        }

        let layout = Layout::from_size_align(class_size, MSG_BUFFER_ALIGN)
            .map_err(|_| Error::InvalidConfig("Invalid buffer layout".into()))?;

        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "Failed to allocate buffer",
            ))
        })?;

        Ok(Self { ptr, class_size })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Usable size of the allocation in bytes.
    #[inline]
    pub fn class_size(&self) -> usize {
        self.class_size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Layout was validated in new().
        let layout = unsafe { Layout::from_size_align_unchecked(self.class_size, MSG_BUFFER_ALIGN) };
        unsafe {
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:p}, class sz {}]", self.ptr.as_ptr(), self.class_size)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// Safety: Buffer exclusively owns its allocation.
unsafe impl Send for Buffer {}

/// Direction a message buffer is used in. Fixed for the buffer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Outbound: the progress counter tracks packets queued for transmission.
    Tx,
    /// Inbound: the progress counter tracks packets received.
    Rx,
}

/// Packet progress of a message buffer, tagged with its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    dir: Direction,
    pkts: usize,
}

impl Progress {
    fn new(dir: Direction) -> Self {
        Self { dir, pkts: 0 }
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.dir
    }

    #[inline]
    pub fn pkts(&self) -> usize {
        self.pkts
    }
}

/// A message buffer with packet headers before and after the data.
pub struct MsgBuffer {
    /// First data byte. None marks the invalid buffer.
    buf: Option<NonNull<u8>>,
    /// The backing allocation, absent for buffers aliasing a received packet.
    backing: Option<Buffer>,
    max_data_size: usize,
    data_size: usize,
    max_num_pkts: usize,
    num_pkts: usize,
    progress: Progress,
}

impl MsgBuffer {
    /// Return the invalid buffer.
    pub fn invalid() -> Self {
        Self {
            buf: None,
            backing: None,
            max_data_size: 0,
            data_size: 0,
            max_num_pkts: 0,
            num_pkts: 0,
            progress: Progress::new(Direction::Tx),
        }
    }

    /// Bytes a backing buffer needs for `max_data_size` bytes in `max_num_pkts` packets.
    pub const fn required_size(max_data_size: usize, max_num_pkts: usize) -> usize {
        if max_num_pkts <= 1 {
            PKT_HDR_SIZE + max_data_size
        } else {
            round_up(max_data_size, WORD_SIZE) + max_num_pkts * PKT_HDR_SIZE
        }
    }

    /// Carve a message buffer out of `buffer`.
    ///
    /// Header 0 is stored at the start of `buffer`. The buffer starts at full
    /// size: `data_size == max_data_size` and `num_pkts == max_num_pkts`.
    ///
    /// # Panics
    /// Panics if `max_num_pkts` is 0 or `buffer` cannot hold the data and all
    /// header slots.
    pub fn from_buffer(buffer: Buffer, max_data_size: usize, max_num_pkts: usize, dir: Direction) -> Self {
        assert!(max_num_pkts >= 1, "MsgBuffer needs at least one packet");
        assert!(
            buffer.class_size() >= max_data_size + max_num_pkts * PKT_HDR_SIZE,
            "backing buffer of {} bytes too small for {} data bytes in {} packets",
            buffer.class_size(),
            max_data_size,
            max_num_pkts
        );
        assert!(
            buffer.class_size() >= Self::required_size(max_data_size, max_num_pkts),
            "backing buffer of {} bytes cannot hold header slot {}",
            buffer.class_size(),
            max_num_pkts - 1
        );

        let buf = unsafe { NonNull::new_unchecked(buffer.as_ptr().add(PKT_HDR_SIZE)) };
        Self {
            buf: Some(buf),
            backing: Some(buffer),
            max_data_size,
            data_size: max_data_size,
            max_num_pkts,
            num_pkts: max_num_pkts,
            progress: Progress::new(dir),
        }
    }

    /// Allocate a buffer for up to `max_data_size` bytes at the given MTU.
    ///
    /// Every header slot is stamped with the magic value, so the buffer is
    /// valid as soon as it is returned.
    pub fn alloc(max_data_size: usize, mtu: usize, dir: Direction) -> Result<Self> {
        if mtu <= PKT_HDR_SIZE {
            return Err(Error::InvalidConfig(format!(
                "MTU {} leaves no room for data",
                mtu
            )));
        }
        let max_num_pkts = PktHdr::calc_num_pkts(max_data_size, mtu);
        let buffer = Buffer::new(Self::required_size(max_data_size, max_num_pkts))?;
        let mut msgbuf = Self::from_buffer(buffer, max_data_size, max_num_pkts, dir);
        for n in 0..max_num_pkts {
            msgbuf.set_pkthdr(n, &PktHdr::blank());
        }
        Ok(msgbuf)
    }

    /// Build a single-packet buffer over a received packet.
    ///
    /// The buffer never owns memory and is always used in the Rx direction.
    ///
    /// # Safety
    /// `pkt` must point to PKT_HDR_SIZE + `max_data_size` bytes that stay valid,
    /// and are not accessed through other paths, for the lifetime of the
    /// returned buffer.
    pub unsafe fn from_rx_pkt(pkt: NonNull<u8>, max_data_size: usize) -> Self {
        let buf = unsafe { NonNull::new_unchecked(pkt.as_ptr().add(PKT_HDR_SIZE)) };
        Self {
            buf: Some(buf),
            backing: None,
            max_data_size,
            data_size: max_data_size,
            max_num_pkts: 1,
            num_pkts: 1,
            progress: Progress::new(Direction::Rx),
        }
    }

    /// Check if the buffer has data and a valid header 0.
    pub fn is_valid(&self) -> bool {
        match self.buf {
            None => false,
            Some(_) => self.pkthdr(0).is_valid(),
        }
    }

    /// Pointer to the first data byte, None for the invalid buffer.
    #[inline]
    pub fn buf(&self) -> Option<NonNull<u8>> {
        self.buf
    }

    /// Whether this buffer owns a backing allocation.
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.backing.is_some()
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    #[inline]
    pub fn max_num_pkts(&self) -> usize {
        self.max_num_pkts
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        self.buf.expect("invalid MsgBuffer has no data").as_ptr()
    }

    /// Address of header 0, immediately before the data.
    #[inline]
    pub fn pkthdr_0(&self) -> *mut u8 {
        unsafe { self.data_ptr().sub(PKT_HDR_SIZE) }
    }

    /// Address of header `n` (n >= 1), located after the padded data region.
    ///
    /// Uses `max_data_size`, not `data_size`, so the address survives resizing.
    ///
    /// # Panics
    /// Panics unless `1 <= n < max_num_pkts`. A buffer aliasing a received
    /// packet has no header slot beyond 0.
    #[inline]
    pub fn pkthdr_n(&self, n: usize) -> *mut u8 {
        assert!(
            n >= 1 && n < self.max_num_pkts,
            "header slot {} out of range 1..{}",
            n,
            self.max_num_pkts
        );
        unsafe {
            self.data_ptr()
                .add(round_up(self.max_data_size, WORD_SIZE) + (n - 1) * PKT_HDR_SIZE)
        }
    }

    #[inline]
    fn pkthdr_ptr(&self, n: usize) -> *mut u8 {
        if n == 0 { self.pkthdr_0() } else { self.pkthdr_n(n) }
    }

    /// Read header `n`.
    pub fn pkthdr(&self, n: usize) -> PktHdr {
        assert!(n < self.max_num_pkts.max(1));
        unsafe { PktHdr::read_from(self.pkthdr_ptr(n)) }
    }

    /// Write header `n`.
    pub fn set_pkthdr(&mut self, n: usize, hdr: &PktHdr) {
        assert!(n < self.max_num_pkts);
        unsafe { hdr.write_to(self.pkthdr_ptr(n)) }
    }

    /// Current data as a slice.
    pub fn data(&self) -> &[u8] {
        match self.buf {
            None => &[],
            Some(buf) => unsafe { std::slice::from_raw_parts(buf.as_ptr(), self.data_size) },
        }
    }

    /// Current data as a mutable slice.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.buf {
            None => &mut [],
            Some(buf) => unsafe { std::slice::from_raw_parts_mut(buf.as_ptr(), self.data_size) },
        }
    }

    /// Shrink or regrow the buffer within its allocated maxima.
    ///
    /// Never reallocates and never moves header slots.
    ///
    /// # Panics
    /// Panics if either value exceeds its maximum.
    #[inline]
    pub fn resize(&mut self, new_data_size: usize, new_num_pkts: usize) {
        assert!(
            new_data_size <= self.max_data_size,
            "resize to {} bytes exceeds max {}",
            new_data_size,
            self.max_data_size
        );
        assert!(
            new_num_pkts <= self.max_num_pkts,
            "resize to {} packets exceeds max {}",
            new_num_pkts,
            self.max_num_pkts
        );
        self.data_size = new_data_size;
        self.num_pkts = new_num_pkts;
    }

    #[inline]
    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Packets queued for transmission; None for an Rx buffer.
    #[inline]
    pub fn pkts_queued(&self) -> Option<usize> {
        (self.progress.dir == Direction::Tx).then_some(self.progress.pkts)
    }

    /// Packets received; None for a Tx buffer.
    #[inline]
    pub fn pkts_rcvd(&self) -> Option<usize> {
        (self.progress.dir == Direction::Rx).then_some(self.progress.pkts)
    }

    /// Record `n` more packets queued for transmission.
    ///
    /// # Panics
    /// Panics on an Rx buffer.
    #[inline]
    pub fn add_pkts_queued(&mut self, n: usize) {
        assert_eq!(self.progress.dir, Direction::Tx, "pkts_queued on an Rx MsgBuffer");
        self.progress.pkts += n;
        debug_assert!(self.progress.pkts <= self.num_pkts);
    }

    /// Record `n` more packets received.
    ///
    /// # Panics
    /// Panics on a Tx buffer.
    #[inline]
    pub fn add_pkts_rcvd(&mut self, n: usize) {
        assert_eq!(self.progress.dir, Direction::Rx, "pkts_rcvd on a Tx MsgBuffer");
        self.progress.pkts += n;
        debug_assert!(self.progress.pkts <= self.num_pkts);
    }

    /// Reset the progress counter for reuse in the same direction.
    #[inline]
    pub fn reset_progress(&mut self) {
        self.progress.pkts = 0;
    }
}

impl Default for MsgBuffer {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for MsgBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(buf) = self.buf else {
            return write!(f, "[Invalid]");
        };
        write!(f, "[buf {:p}, buffer ", buf.as_ptr())?;
        match &self.backing {
            Some(backing) => write!(f, "{}", backing)?,
            None => write!(f, "[Invalid]")?,
        }
        let label = match self.progress.dir {
            Direction::Tx => "queued",
            Direction::Rx => "rcvd",
        };
        write!(
            f,
            ", data {}({}), pkts {}({}), pkts {} {}]",
            self.data_size,
            self.max_data_size,
            self.num_pkts,
            self.max_num_pkts,
            label,
            self.progress.pkts
        )
    }
}

impl fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// Safety: the backing Buffer is owned; aliased packets are exclusive per the
// from_rx_pkt contract.
unsafe impl Send for MsgBuffer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PktType;
    use proptest::prelude::*;

    fn owned(max_data_size: usize, max_num_pkts: usize) -> MsgBuffer {
        let buffer = Buffer::new(MsgBuffer::required_size(max_data_size, max_num_pkts)).unwrap();
        MsgBuffer::from_buffer(buffer, max_data_size, max_num_pkts, Direction::Tx)
    }

    #[test]
    fn test_invalid_msgbuf() {
        let msgbuf = MsgBuffer::invalid();
        assert!(!msgbuf.is_valid());
        assert!(msgbuf.buf().is_none());
        assert!(msgbuf.data().is_empty());
        assert_eq!(msgbuf.to_string(), "[Invalid]");
    }

    #[test]
    fn test_buffer_alignment() {
        let buffer = Buffer::new(1024).unwrap();
        assert_eq!(buffer.as_ptr() as usize % MSG_BUFFER_ALIGN, 0);
        assert_eq!(buffer.class_size(), 1024);
    }

    #[test]
    fn test_owned_msgbuf_starts_full_size() {
        let msgbuf = owned(100, 3);
        assert_eq!(msgbuf.data_size(), 100);
        assert_eq!(msgbuf.num_pkts(), 3);
        assert_eq!(msgbuf.max_num_pkts(), 3);
        assert!(msgbuf.is_owned());
        assert_eq!(msgbuf.pkts_queued(), Some(0));
        assert_eq!(msgbuf.pkts_rcvd(), None);
    }

    #[test]
    fn test_validity_follows_magic() {
        let mut msgbuf = owned(64, 1);
        // Backing memory is zeroed, so there is no magic yet.
        assert!(!msgbuf.is_valid());

        msgbuf.set_pkthdr(0, &PktHdr::new(3, 64, 7, PktType::Req, 0, 1));
        assert!(msgbuf.is_valid());

        unsafe { std::ptr::write_bytes(msgbuf.pkthdr_0(), 0xFF, PKT_HDR_SIZE) };
        assert!(!msgbuf.is_valid());
    }

    #[test]
    fn test_pkthdr_0_precedes_data() {
        let msgbuf = owned(10, 1);
        let data = msgbuf.buf().unwrap().as_ptr() as usize;
        assert_eq!(msgbuf.pkthdr_0() as usize, data - PKT_HDR_SIZE);
    }

    #[test]
    fn test_pkthdr_n_ignores_data_size() {
        let mut msgbuf = owned(13, 4);
        let data = msgbuf.buf().unwrap().as_ptr() as usize;
        let hdr1 = msgbuf.pkthdr_n(1) as usize;
        assert_eq!(hdr1, data + 16);
        assert_eq!(msgbuf.pkthdr_n(3) as usize, data + 16 + 2 * PKT_HDR_SIZE);

        msgbuf.resize(1, 1);
        assert_eq!(msgbuf.pkthdr_n(1) as usize, hdr1);
    }

    #[test]
    fn test_headers_survive_resize() {
        let mut msgbuf = owned(200, 3);
        let hdr = PktHdr::new(9, 200, 2, PktType::Req, 2, 77);
        msgbuf.set_pkthdr(2, &hdr);
        msgbuf.data_mut().fill(0xAB);

        msgbuf.resize(50, 1);
        assert_eq!(msgbuf.data().len(), 50);
        assert_eq!(msgbuf.pkthdr(2), hdr);

        msgbuf.resize(200, 3);
        assert!(msgbuf.data().iter().all(|&b| b == 0xAB));
    }

    #[test]
    #[should_panic]
    fn test_resize_beyond_max_data_panics() {
        let mut msgbuf = owned(64, 2);
        msgbuf.resize(65, 1);
    }

    #[test]
    #[should_panic]
    fn test_resize_beyond_max_pkts_panics() {
        let mut msgbuf = owned(64, 2);
        msgbuf.resize(10, 3);
    }

    #[test]
    #[should_panic]
    fn test_undersized_backing_panics() {
        let buffer = Buffer::new(100).unwrap();
        let _ = MsgBuffer::from_buffer(buffer, 90, 1, Direction::Tx);
    }

    #[test]
    #[should_panic]
    fn test_zero_pkts_panics() {
        let buffer = Buffer::new(100).unwrap();
        let _ = MsgBuffer::from_buffer(buffer, 10, 0, Direction::Tx);
    }

    #[test]
    fn test_alloc_stamps_all_headers() {
        let mtu = 1024;
        let msgbuf = MsgBuffer::alloc(3000, mtu, Direction::Tx).unwrap();
        assert_eq!(msgbuf.max_num_pkts(), 3);
        assert!(msgbuf.is_valid());
        for n in 0..3 {
            assert!(msgbuf.pkthdr(n).is_valid());
        }
    }

    #[test]
    fn test_alloc_zero_size() {
        let msgbuf = MsgBuffer::alloc(0, 4096, Direction::Rx).unwrap();
        assert_eq!(msgbuf.max_num_pkts(), 1);
        assert_eq!(msgbuf.data_size(), 0);
        assert!(msgbuf.is_valid());
    }

    #[test]
    fn test_rx_pkt_alias() {
        let mut pkt = vec![0u8; PKT_HDR_SIZE + 32];
        let hdr = PktHdr::new(1, 5, 0, PktType::Resp, 0, 9);
        unsafe { hdr.write_to(pkt.as_mut_ptr()) };
        pkt[PKT_HDR_SIZE..PKT_HDR_SIZE + 5].copy_from_slice(b"hello");

        let mut msgbuf = unsafe { MsgBuffer::from_rx_pkt(NonNull::new(pkt.as_mut_ptr()).unwrap(), 32) };
        assert_eq!(msgbuf.max_num_pkts(), 1);
        assert_eq!(msgbuf.num_pkts(), 1);
        assert!(!msgbuf.is_owned());
        assert!(msgbuf.is_valid());
        assert_eq!(msgbuf.pkthdr_0(), pkt.as_mut_ptr());

        msgbuf.resize(5, 1);
        assert_eq!(msgbuf.data(), b"hello");
        msgbuf.add_pkts_rcvd(1);
        assert_eq!(msgbuf.pkts_rcvd(), Some(1));
        assert_eq!(msgbuf.pkts_queued(), None);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_pkthdr_n_past_last_slot_panics() {
        let msgbuf = owned(64, 2);
        let _ = msgbuf.pkthdr_n(2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_pkthdr_n_on_rx_alias_panics() {
        let mut pkt = vec![0u8; PKT_HDR_SIZE + 8];
        let msgbuf = unsafe { MsgBuffer::from_rx_pkt(NonNull::new(pkt.as_mut_ptr()).unwrap(), 8) };
        let _ = msgbuf.pkthdr_n(1);
    }

    #[test]
    #[should_panic]
    fn test_progress_direction_is_enforced() {
        let mut msgbuf = owned(8, 1);
        msgbuf.add_pkts_rcvd(1);
    }

    #[test]
    fn test_display_reports_sizes() {
        let mut msgbuf = owned(100, 2);
        msgbuf.resize(40, 1);
        msgbuf.add_pkts_queued(1);
        let s = msgbuf.to_string();
        assert!(s.contains("data 40(100)"), "{}", s);
        assert!(s.contains("pkts 1(2)"), "{}", s);
        assert!(s.contains("pkts queued 1"), "{}", s);
    }

    proptest! {
        #[test]
        fn prop_resize_within_bounds(
            max_data in 0usize..5000,
            max_pkts in 1usize..8,
            new_data in 0usize..5000,
            new_pkts in 0usize..8,
        ) {
            let mut msgbuf = owned(max_data, max_pkts);
            let hdr1 = (max_pkts > 1).then(|| msgbuf.pkthdr_n(1) as usize);
            let fits = new_data <= max_data && new_pkts <= max_pkts;
            let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                msgbuf.resize(new_data, new_pkts);
            }));
            prop_assert_eq!(res.is_ok(), fits);
            prop_assert!(msgbuf.data_size() <= msgbuf.max_data_size());
            prop_assert!(msgbuf.num_pkts() <= msgbuf.max_num_pkts());
            if let Some(hdr1) = hdr1 {
                let data = msgbuf.buf().unwrap().as_ptr() as usize;
                prop_assert_eq!(hdr1, data + round_up(max_data, WORD_SIZE));
                prop_assert_eq!(msgbuf.pkthdr_n(1) as usize, hdr1);
            }
        }
    }
}
