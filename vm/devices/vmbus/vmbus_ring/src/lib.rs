// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module implements the low-level interface to the VmBus ring buffer. The
//! ring buffer resides in guest memory and is mapped into the host, allowing
//! efficient transfer of variable-sized packets.
//!
//! Ring buffer packets have headers called descriptors, which can specify a
//! transaction ID and metadata referring to memory outside the ring buffer.
//! Each packet is a multiple of 8 bytes and is followed by an 8-byte footer.
//!
//! In practice, ring buffers always come in pairs so that packets can be both
//! sent and received. However, this module's interfaces operate on them singly.
//! Each endpoint owns one index of each ring: the writer owns the in index and
//! the reader owns the out index. Indices are published with sequentially
//! consistent stores after the packet bytes are in place, so no lock protects
//! the ring body.

#![forbid(unsafe_code)]

pub mod gparange;

pub use protocol::Footer;
pub use protocol::PacketDescriptor;
pub use protocol::TransferPageRange;
pub use protocol::PACKET_FLAG_COMPLETION_REQUESTED;
pub use protocol::PAGE_SIZE;

use crate::gparange::GpaRangeBuf;
use crate::gparange::PagedRange;
use protocol::*;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

mod protocol {
    use crate::CONTROL_WORD_COUNT;
    use std::fmt::Debug;
    use std::sync::atomic::AtomicU32;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// VmBus ring buffers are sized in multiples 4KB pages, with a 4KB control page.
    pub const PAGE_SIZE: usize = 4096;

    /// The descriptor header on every packet.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PacketDescriptor {
        pub packet_type: u16,
        pub data_offset8: u16,
        pub length8: u16,
        pub flags: u16,
        pub transaction_id: u64,
    }

    /// A control page accessor.
    pub struct Control<'a>(pub &'a [AtomicU32; CONTROL_WORD_COUNT]);

    impl Control<'_> {
        pub fn inp(&self) -> &AtomicU32 {
            &self.0[0]
        }
        pub fn outp(&self) -> &AtomicU32 {
            &self.0[1]
        }
        pub fn interrupt_mask(&self) -> &AtomicU32 {
            &self.0[2]
        }
        pub fn pending_send_size(&self) -> &AtomicU32 {
            &self.0[3]
        }
        pub fn feature_bits(&self) -> &AtomicU32 {
            &self.0[16]
        }
    }

    impl Debug for Control<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Control")
                .field("inp", self.inp())
                .field("outp", self.outp())
                .field("interrupt_mask", self.interrupt_mask())
                .field("pending_send_size", self.pending_send_size())
                .field("feature_bits", self.feature_bits())
                .finish()
        }
    }

    /// If set, the endpoint supports sending signals when the number of free
    /// bytes in the ring reaches or exceeds `pending_send_size`.
    pub const FEATURE_SUPPORTS_PENDING_SEND_SIZE: u32 = 1;

    /// A transfer range specifying a length and offset within a transfer page
    /// set.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct TransferPageRange {
        pub byte_count: u32,
        pub byte_offset: u32,
    }

    /// The extended portion of the packet descriptor that describes a transfer
    /// page packet.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct TransferPageHeader {
        pub transfer_page_set_id: u16,
        pub reserved: u16, // may have garbage non-zero values
        pub range_count: u32,
    }

    /// The extended portion of the packet descriptor describing a GPA direct packet.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct GpaDirectHeader {
        pub reserved: u32, // may have garbage non-zero values
        pub range_count: u32,
    }

    pub const PACKET_FLAG_COMPLETION_REQUESTED: u16 = 1;

    /// The packet footer. Read as a single 64-bit value, the ring offset of
    /// the packet occupies the upper 32 bits.
    ///
    /// This is the previous write index, which lets the opposite endpoint walk
    /// packets backwards. It is not a copy of the packet length.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Footer {
        pub reserved: u32,
        /// The ring offset of the packet.
        pub offset: u32,
    }
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid ring buffer pointer")]
    InvalidRingPointer,
    #[error("invalid message length")]
    InvalidMessageLength,
    #[error("invalid data available")]
    InvalidDataAvailable,
    #[error("invalid ring memory")]
    InvalidRingMemory,
    #[error("invalid descriptor offset or length")]
    InvalidDescriptorLengths,
    #[error("unknown packet descriptor flags")]
    InvalidDescriptorFlags,
    #[error("unknown packet descriptor type")]
    InvalidDescriptorType,
    #[error("invalid range count for gpa direct packet")]
    InvalidDescriptorGpaDirectRangeCount,
    #[error("packet footer does not match the packet offset")]
    InvalidFooter,
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("ring buffer empty")]
    Empty,
    #[error("receive buffer too small, {0} bytes needed")]
    BufferTooSmall(usize),
    #[error(transparent)]
    Corrupt(#[from] Error),
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("ring buffer full, {0} bytes needed")]
    Full(usize),
    #[error(transparent)]
    Corrupt(#[from] Error),
}

/// The alternate types of incoming packets. For packets with external data,
/// includes the raw bytes of the variable portion of the packet descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IncomingPacketType<'a> {
    InBand,
    Completion,
    GpaDirect(u32, &'a [u8]),
    TransferPages(u16, u32, &'a [u8]),
}

/// A packet parsed from a frame copied out of the ring.
#[derive(Debug)]
pub struct IncomingPacket<'a> {
    pub transaction_id: u64,
    pub flags: u16,
    pub typ: IncomingPacketType<'a>,
    /// The packet data, including any padding up to the 8-byte frame
    /// alignment.
    pub payload: &'a [u8],
}

impl IncomingPacket<'_> {
    /// Returns true if the sender asked for a completion packet in response.
    pub fn completion_requested(&self) -> bool {
        self.flags & PACKET_FLAG_COMPLETION_REQUESTED != 0
    }

    /// Returns the transfer page ranges of a transfer page packet.
    pub fn transfer_page_ranges(&self) -> Vec<TransferPageRange> {
        match self.typ {
            IncomingPacketType::TransferPages(_, count, ranges) => ranges
                .chunks_exact(size_of::<TransferPageRange>())
                .take(count as usize)
                .filter_map(|b| TransferPageRange::read_from_bytes(b).ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

pub const PACKET_TYPE_IN_BAND: u16 = 6;
pub const PACKET_TYPE_TRANSFER_PAGES: u16 = 0x7;
pub const PACKET_TYPE_GPA_DIRECT: u16 = 0x9;
pub const PACKET_TYPE_COMPLETION: u16 = 0xb;

const DESCRIPTOR_SIZE: usize = size_of::<PacketDescriptor>();
const FOOTER_SIZE: usize = size_of::<Footer>();

/// Parses a packet frame as returned by [`IncomingRing::read`], validating the
/// descriptor's declared lengths against the actual frame size.
pub fn parse_packet(frame: &[u8]) -> Result<IncomingPacket<'_>, Error> {
    let (desc, _) =
        PacketDescriptor::read_from_prefix(frame).map_err(|_| Error::InvalidDescriptorLengths)?;
    let len = desc.length8 as usize * 8;
    let data_offset = desc.data_offset8 as usize * 8;
    if len != frame.len() || desc.length8 < desc.data_offset8 || desc.data_offset8 < 2 {
        return Err(Error::InvalidDescriptorLengths);
    }

    if (desc.flags & !PACKET_FLAG_COMPLETION_REQUESTED) != 0 {
        return Err(Error::InvalidDescriptorFlags);
    }
    let extended = &frame[DESCRIPTOR_SIZE..data_offset];
    let typ = match desc.packet_type {
        PACKET_TYPE_IN_BAND => IncomingPacketType::InBand,
        PACKET_TYPE_COMPLETION => IncomingPacketType::Completion,
        PACKET_TYPE_TRANSFER_PAGES => {
            let (tph, ranges) = TransferPageHeader::read_from_prefix(extended)
                .map_err(|_| Error::InvalidDescriptorLengths)?;
            IncomingPacketType::TransferPages(tph.transfer_page_set_id, tph.range_count, ranges)
        }
        PACKET_TYPE_GPA_DIRECT => {
            let (gph, ranges) = GpaDirectHeader::read_from_prefix(extended)
                .map_err(|_| Error::InvalidDescriptorLengths)?;
            if gph.range_count == 0 {
                return Err(Error::InvalidDescriptorGpaDirectRangeCount);
            }
            IncomingPacketType::GpaDirect(gph.range_count, ranges)
        }
        _ => return Err(Error::InvalidDescriptorType),
    };
    Ok(IncomingPacket {
        transaction_id: desc.transaction_id,
        flags: desc.flags,
        typ,
        payload: &frame[data_offset..],
    })
}

/// The size of the control region in 32-bit words.
pub const CONTROL_WORD_COUNT: usize = 32;

/// A trait for memory backing a ring buffer.
pub trait RingMem: Send {
    /// Returns the control page.
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT];

    /// Reads from the data portion of the ring, wrapping (once) at the end of
    /// the ring. Precondition: `addr + data.len() <= self.len() * 2`.
    fn read_at(&self, addr: usize, data: &mut [u8]);

    /// Writes to the data portion of the ring, wrapping (once) at the end of
    /// the ring. Precondition: `addr + data.len() <= self.len() * 2`.
    fn write_at(&self, addr: usize, data: &[u8]);

    /// Returns the length of the ring in bytes.
    fn len(&self) -> usize;
}

/// Implementation of `RingMem` for references. Useful for tests.
impl<T: RingMem + Sync> RingMem for &'_ T {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        (*self).control()
    }
    fn read_at(&self, addr: usize, data: &mut [u8]) {
        (*self).read_at(addr, data)
    }
    fn write_at(&self, addr: usize, data: &[u8]) {
        (*self).write_at(addr, data)
    }
    fn len(&self) -> usize {
        (*self).len()
    }
}

fn atomic_read(src: &[AtomicU8], dest: &mut [u8]) {
    for (d, s) in dest.iter_mut().zip(src) {
        *d = s.load(Ordering::Relaxed);
    }
}

fn atomic_write(dest: &[AtomicU8], src: &[u8]) {
    for (d, s) in dest.iter().zip(src) {
        d.store(*s, Ordering::Relaxed);
    }
}

/// An implementation of `RingMem` over a flat allocation. Useful for tests.
#[derive(Clone)]
pub struct FlatRingMem {
    inner: Arc<FlatRingInner>,
}

struct FlatRingInner {
    control: [AtomicU32; CONTROL_WORD_COUNT],
    data: Vec<AtomicU8>,
}

impl FlatRingMem {
    /// Allocates a new memory.
    pub fn new(len: usize) -> Self {
        let mut data = Vec::new();
        data.resize_with(len, Default::default);
        Self {
            inner: Arc::new(FlatRingInner {
                control: [0; CONTROL_WORD_COUNT].map(Into::into),
                data,
            }),
        }
    }
}

impl Debug for FlatRingMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatRingMem").finish()
    }
}

impl RingMem for FlatRingMem {
    fn read_at(&self, mut addr: usize, data: &mut [u8]) {
        if addr >= self.len() {
            addr -= self.len();
        }
        if addr + data.len() <= self.len() {
            atomic_read(&self.inner.data[addr..addr + data.len()], data);
        } else {
            let (first, last) = data.split_at_mut(self.len() - addr);
            atomic_read(&self.inner.data[addr..], first);
            atomic_read(&self.inner.data[..last.len()], last);
        }
    }

    fn write_at(&self, mut addr: usize, data: &[u8]) {
        if addr >= self.len() {
            addr -= self.len();
        }
        if addr + data.len() <= self.len() {
            atomic_write(&self.inner.data[addr..addr + data.len()], data);
        } else {
            let (first, last) = data.split_at(self.len() - addr);
            atomic_write(&self.inner.data[addr..], first);
            atomic_write(&self.inner.data[..last.len()], last);
        }
    }

    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        &self.inner.control
    }

    fn len(&self) -> usize {
        self.inner.data.len()
    }
}

/// A trait for ring buffer memory divided into discontiguous pages.
pub trait PagedMemory: Send {
    /// Returns the control words at the start of the control page.
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT];
    /// Returns the number of data pages.
    fn data_page_count(&self) -> usize;
    /// Returns a data page.
    ///
    /// `page` may be in `0..data_page_count*2`, representing the ring
    /// logically mapped twice consecutively. The implementation should return
    /// the same page for `n` and `n + data_page_count`.
    fn data(&self, page: usize) -> &[AtomicU8; PAGE_SIZE];
}

/// An implementation of [`RingMem`] on top of discontiguous pages.
#[derive(Debug, Clone)]
pub struct PagedRingMem<T>(T);

impl<T: PagedMemory> PagedRingMem<T> {
    /// Returns a new ring memory wrapping a type implementing [`PagedMemory`].
    pub fn new(inner: T) -> Self {
        Self(inner)
    }

    /// Returns the wrapped memory.
    pub fn inner(&self) -> &T {
        &self.0
    }
}

impl<T: PagedMemory> RingMem for PagedRingMem<T> {
    fn len(&self) -> usize {
        self.0.data_page_count() * PAGE_SIZE
    }

    fn read_at(&self, mut addr: usize, mut data: &mut [u8]) {
        while !data.is_empty() {
            let page = addr / PAGE_SIZE;
            let offset = addr % PAGE_SIZE;
            let offset_end = PAGE_SIZE.min(offset + data.len());
            let len = offset_end - offset;
            let (this, next) = data.split_at_mut(len);
            atomic_read(&self.0.data(page)[offset..offset_end], this);
            addr += len;
            data = next;
        }
    }

    fn write_at(&self, mut addr: usize, mut data: &[u8]) {
        while !data.is_empty() {
            let page = addr / PAGE_SIZE;
            let offset = addr % PAGE_SIZE;
            let offset_end = PAGE_SIZE.min(offset + data.len());
            let len = offset_end - offset;
            let (this, next) = data.split_at(len);
            atomic_write(&self.0.data(page)[offset..offset_end], this);
            addr += len;
            data = next;
        }
    }

    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        self.0.control()
    }
}

/// Information about an outgoing packet. The packet data is `header`
/// followed by `payload`; either may be empty.
#[derive(Debug)]
pub struct OutgoingPacket<'a> {
    pub transaction_id: u64,
    pub typ: OutgoingPacketType<'a>,
    pub header: &'a [u8],
    pub payload: &'a [u8],
}

impl OutgoingPacket<'_> {
    /// The number of data bytes in the packet.
    pub fn size(&self) -> usize {
        self.header.len() + self.payload.len()
    }
}

/// The outgoing packet type variants.
#[derive(Debug, Copy, Clone)]
pub enum OutgoingPacketType<'a> {
    /// A non-transactional data packet.
    InBandNoCompletion,
    /// A transactional data packet.
    InBandWithCompletion,
    /// A completion packet.
    Completion,
    /// A GPA direct packet, which can reference memory outside the ring by address.
    GpaDirect(&'a [PagedRange<'a>]),
    /// A transfer page packet, which can reference memory outside the ring by a
    /// buffer ID and a set of offsets into some pre-established buffer
    /// (typically a GPADL).
    TransferPages(u16, &'a [TransferPageRange]),
}

/// Namespace type with methods to compute packet sizes, for use with
/// `set_pending_send_size`.
pub struct PacketSize(());

impl PacketSize {
    /// Computes the size of an in-band packet.
    pub const fn in_band(payload_len: usize) -> usize {
        DESCRIPTOR_SIZE + ((payload_len + 7) & !7) + FOOTER_SIZE
    }

    /// Computes the size of a completion packet.
    pub const fn completion(payload_len: usize) -> usize {
        Self::in_band(payload_len)
    }

    /// Computes the size of a gpa direct packet.
    pub fn gpa_direct(ranges: &[PagedRange<'_>], payload_len: usize) -> usize {
        Self::in_band(payload_len)
            + size_of::<GpaDirectHeader>()
            + ranges.iter().map(|r| r.encoded_len() * 8).sum::<usize>()
    }

    /// Computes the size of a transfer page packet.
    pub const fn transfer_pages(count: usize, payload_len: usize) -> usize {
        Self::in_band(payload_len)
            + size_of::<TransferPageHeader>()
            + count * size_of::<TransferPageRange>()
    }
}

/// The result of a successful [`IncomingRing::read`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReadPacket {
    /// The length of the frame copied out, excluding the footer.
    pub len: usize,
    /// Whether the opposite endpoint must be signaled because space it was
    /// waiting for is now available.
    pub signal: bool,
}

/// The interface to the receiving endpoint of a ring buffer.
#[derive(Debug)]
pub struct IncomingRing<M: RingMem> {
    inner: InnerRing<M>,
}

impl<M: RingMem> IncomingRing<M> {
    /// Returns a new incoming ring. Fails if the ring memory is not sized or
    /// aligned correctly.
    pub fn new(mem: M) -> Result<Self, Error> {
        let inner = InnerRing::new(mem)?;
        // Start with interrupts masked.
        let control = inner.control();
        control.interrupt_mask().store(1, Ordering::Relaxed);
        Ok(Self { inner })
    }

    /// The backing memory of the ring buffer.
    pub fn mem(&self) -> &M {
        &self.inner.mem
    }

    /// Indicates whether pending send size notification is supported on
    /// the vmbus ring.
    pub fn supports_pending_send_size(&self) -> bool {
        let feature_bits = self.inner.control().feature_bits().load(Ordering::Relaxed);
        (feature_bits & FEATURE_SUPPORTS_PENDING_SEND_SIZE) != 0
    }

    /// Enables or disables the interrupt mask, declaring to the opposite
    /// endpoint that interrupts should not or should be sent for a ring
    /// empty-to-non-empty transition.
    pub fn set_interrupt_mask(&self, state: bool) {
        self.inner
            .control()
            .interrupt_mask()
            .store(state as u32, Ordering::SeqCst);
    }

    fn pointers(&self) -> Result<(u32, u32), Error> {
        let control = self.inner.control();
        let outp = self.inner.validate(control.outp().load(Ordering::Relaxed))?;
        let inp = self.inner.validate(control.inp().load(Ordering::Acquire))?;
        Ok((inp, outp))
    }

    /// Returns true if there are any packets to read.
    pub fn can_read(&self) -> Result<bool, Error> {
        let (inp, outp) = self.pointers()?;
        Ok(inp != outp)
    }

    /// Returns the length of the next packet frame, excluding the footer, so
    /// that the caller can size the destination for [`Self::read`]. Returns
    /// `None` if less than a descriptor's worth of data is available.
    pub fn peek_next_packet_len(&self) -> Result<Option<usize>, Error> {
        let (inp, outp) = self.pointers()?;
        if (self.inner.available(inp, outp) as usize) < DESCRIPTOR_SIZE {
            return Ok(None);
        }
        let mut desc = PacketDescriptor::new_zeroed();
        self.inner.mem.read_at(outp as usize, desc.as_mut_bytes());
        Ok(Some(desc.length8 as usize * 8))
    }

    /// Copies the next packet frame (descriptor through padded payload) into
    /// `dest` and removes it from the ring.
    ///
    /// A frame is accepted only if its declared length fits in the available
    /// data and its footer points back at the frame. Otherwise the ring skips
    /// to the next intact frame, or discards the available data if there is
    /// none, and the error is returned. Either way the ring remains usable for
    /// later packets.
    pub fn read(&self, dest: &mut [u8]) -> Result<ReadPacket, ReadError> {
        let (inp, outp) = self.pointers()?;
        if inp == outp {
            return Err(ReadError::Empty);
        }
        let len = match self.frame_len(inp, outp) {
            Ok(len) => len,
            Err(err) => {
                self.resync(inp, outp);
                return Err(err.into());
            }
        };
        let dest = dest.get_mut(..len).ok_or(ReadError::BufferTooSmall(len))?;
        // read_at splits the copy at the end of the ring.
        self.inner.mem.read_at(outp as usize, dest);
        let next_out = self.inner.add_pointer(outp, (len + FOOTER_SIZE) as u32);
        let signal = self.commit_read(outp, next_out);
        Ok(ReadPacket { len, signal })
    }

    /// Returns the length of the frame at `outp`, excluding the footer, after
    /// checking it against the available data and the frame's footer.
    fn frame_len(&self, inp: u32, outp: u32) -> Result<usize, Error> {
        let avail = self.inner.available(inp, outp) as usize;
        if avail < DESCRIPTOR_SIZE + FOOTER_SIZE {
            return Err(Error::InvalidDataAvailable);
        }
        let mut desc = PacketDescriptor::new_zeroed();
        self.inner.mem.read_at(outp as usize, desc.as_mut_bytes());
        let len = desc.length8 as usize * 8;
        if len < DESCRIPTOR_SIZE || len + FOOTER_SIZE > avail {
            return Err(Error::InvalidDescriptorLengths);
        }
        if !self.is_footer_of(outp + len as u32, outp) {
            return Err(Error::InvalidFooter);
        }
        Ok(len)
    }

    fn is_footer_of(&self, addr: u32, outp: u32) -> bool {
        let mut footer = Footer::new_zeroed();
        self.inner.mem.read_at(addr as usize, footer.as_mut_bytes());
        footer.reserved == 0 && footer.offset == outp
    }

    /// Skips the damaged frame at `outp`. The new read index is just past the
    /// first footer pointing back at `outp` that is followed by the write
    /// index or by an intact frame. Without one, all available data is
    /// discarded.
    fn resync(&self, inp: u32, outp: u32) {
        let avail = self.inner.available(inp, outp);
        let mut next_out = inp;
        let mut skip = DESCRIPTOR_SIZE as u32;
        while skip + FOOTER_SIZE as u32 <= avail {
            if self.is_footer_of(outp + skip, outp) {
                let candidate = self.inner.add_pointer(outp, skip + FOOTER_SIZE as u32);
                if candidate == inp || self.frame_len(inp, candidate).is_ok() {
                    next_out = candidate;
                    break;
                }
            }
            skip += 8;
        }
        self.inner.control().outp().store(next_out, Ordering::SeqCst);
    }

    /// Publishes the new out index, returning whether the opposite endpoint
    /// should be signaled.
    fn commit_read(&self, committed_out: u32, next_out: u32) -> bool {
        let control = self.inner.control();
        control.outp().store(next_out, Ordering::SeqCst);
        let pending_send_size = control.pending_send_size().load(Ordering::SeqCst);
        // Some implementations set the pending send size to the size of the
        // ring minus 1. The intent is that a signal arrive when the ring is
        // completely empty, but this is invalid since the maximum writable ring
        // size in the size of the ring minus 8. Mask off the low bits to work
        // around this.
        let pending_send_size = pending_send_size & !7;
        if pending_send_size != 0 {
            if let Ok(inp) = self.inner.validate(control.inp().load(Ordering::SeqCst)) {
                let old_free = self.inner.free(inp, committed_out);
                let new_free = self.inner.free(inp, next_out);
                old_free < pending_send_size && new_free >= pending_send_size
            } else {
                false
            }
        } else {
            false
        }
    }

    /// Returns whether the sending end is waiting for space that is now
    /// available.
    pub fn writer_needs_signal(&self) -> bool {
        let control = self.inner.control();
        let pending_size = control.pending_send_size().load(Ordering::Relaxed) & !7;
        match self.pointers() {
            Ok((inp, outp)) => pending_size != 0 && self.inner.free(inp, outp) >= pending_size,
            Err(_) => false,
        }
    }
}

/// The sending side of a ring buffer.
#[derive(Debug)]
pub struct OutgoingRing<M: RingMem> {
    inner: InnerRing<M>,
}

impl<M: RingMem> OutgoingRing<M> {
    /// Returns a new outgoing ring over `mem`.
    pub fn new(mem: M) -> Result<Self, Error> {
        let inner = InnerRing::new(mem)?;
        // Report to the opposite endpoint that we will send interrupts for a
        // ring full to ring non-full transition. Feature bits are set by the
        // sending side.
        let control = inner.control();
        control
            .feature_bits()
            .store(FEATURE_SUPPORTS_PENDING_SEND_SIZE, Ordering::Relaxed);
        // Start with no interrupt requested.
        control.pending_send_size().store(0, Ordering::Relaxed);
        Ok(Self { inner })
    }

    /// The backing memory of the ring buffer.
    pub fn mem(&self) -> &M {
        &self.inner.mem
    }

    /// Sets the pending send size: the number of bytes that should be free in
    /// the ring before the opposite endpoint sends a ring-non-full signal.
    ///
    /// Fails if the packet size is larger than the ring's maximum packet size.
    pub fn set_pending_send_size(&self, len: usize) -> Result<(), Error> {
        if len > self.maximum_packet_size() {
            return Err(Error::InvalidMessageLength);
        }
        self.inner
            .control()
            .pending_send_size()
            .store((len as u32 + 7) & !7, Ordering::SeqCst);

        Ok(())
    }

    /// Returns the maximum packet size that can fit in the ring.
    pub fn maximum_packet_size(&self) -> usize {
        self.inner.len() as usize - 8
    }

    /// Returns the number of bytes that can currently be written.
    pub fn free_bytes(&self) -> Result<usize, Error> {
        let control = self.inner.control();
        let inp = self.inner.validate(control.inp().load(Ordering::Relaxed))?;
        let outp = self.inner.validate(control.outp().load(Ordering::Acquire))?;
        Ok(self.inner.free(inp, outp) as usize)
    }

    /// Writes a complete packet and publishes it to the opposite endpoint,
    /// returning whether the opposite endpoint should be signaled. This is the
    /// case only if interrupts are unmasked and the ring was empty before this
    /// write.
    ///
    /// Returns `Err(WriteError::Full(len))` without writing anything if the
    /// ring is full, where `len` is the number of bytes needed to write the
    /// requested packet.
    pub fn write(&self, packet: &OutgoingPacket<'_>) -> Result<bool, WriteError> {
        let mut gpa_ranges = None;
        let (packet_type, header_size, flags) = match packet.typ {
            OutgoingPacketType::InBandNoCompletion => (PACKET_TYPE_IN_BAND, DESCRIPTOR_SIZE, 0),
            OutgoingPacketType::InBandWithCompletion => (
                PACKET_TYPE_IN_BAND,
                DESCRIPTOR_SIZE,
                PACKET_FLAG_COMPLETION_REQUESTED,
            ),
            OutgoingPacketType::Completion => (PACKET_TYPE_COMPLETION, DESCRIPTOR_SIZE, 0),
            OutgoingPacketType::GpaDirect(ranges) => {
                let buf: GpaRangeBuf = ranges.iter().copied().collect();
                let size = DESCRIPTOR_SIZE
                    + size_of::<GpaDirectHeader>()
                    + size_of_val(buf.range_buffer());
                gpa_ranges = Some(buf);
                (PACKET_TYPE_GPA_DIRECT, size, PACKET_FLAG_COMPLETION_REQUESTED)
            }
            OutgoingPacketType::TransferPages(_, ranges) => (
                PACKET_TYPE_TRANSFER_PAGES,
                DESCRIPTOR_SIZE + size_of::<TransferPageHeader>() + size_of_val(ranges),
                PACKET_FLAG_COMPLETION_REQUESTED,
            ),
        };
        let data_len = packet.size();
        let msg_len = (header_size + data_len + 7) & !7;
        let total_msg_len = msg_len + FOOTER_SIZE;
        if total_msg_len > self.maximum_packet_size() || msg_len / 8 > u16::MAX as usize {
            return Err(WriteError::Corrupt(Error::InvalidMessageLength));
        }
        let total_msg_len = total_msg_len as u32;

        let control = self.inner.control();
        let inp = self.inner.validate(control.inp().load(Ordering::Relaxed))?;
        let outp = self.inner.validate(control.outp().load(Ordering::Acquire))?;
        if self.inner.free(inp, outp) < total_msg_len {
            return Err(WriteError::Full(total_msg_len as usize));
        }

        let desc = PacketDescriptor {
            packet_type,
            data_offset8: (header_size / 8) as u16,
            length8: (msg_len / 8) as u16,
            flags,
            transaction_id: packet.transaction_id,
        };
        let footer = Footer {
            reserved: 0,
            offset: inp,
        };

        let off = inp as usize;
        let mem = &self.inner.mem;
        mem.write_at(off, desc.as_bytes());
        match packet.typ {
            OutgoingPacketType::GpaDirect(ranges) => {
                let gpa_header = GpaDirectHeader {
                    reserved: 0,
                    range_count: ranges.len() as u32,
                };
                mem.write_at(off + DESCRIPTOR_SIZE, gpa_header.as_bytes());
                if let Some(buf) = &gpa_ranges {
                    mem.write_at(
                        off + DESCRIPTOR_SIZE + size_of::<GpaDirectHeader>(),
                        buf.range_buffer().as_bytes(),
                    );
                }
            }
            OutgoingPacketType::TransferPages(tp_id, ranges) => {
                let tp_header = TransferPageHeader {
                    transfer_page_set_id: tp_id,
                    reserved: 0,
                    range_count: ranges.len() as u32,
                };
                mem.write_at(off + DESCRIPTOR_SIZE, tp_header.as_bytes());
                mem.write_at(
                    off + DESCRIPTOR_SIZE + size_of::<TransferPageHeader>(),
                    ranges.as_bytes(),
                );
            }
            _ => (),
        }

        let data_off = off + header_size;
        mem.write_at(data_off, packet.header);
        mem.write_at(data_off + packet.header.len(), packet.payload);
        let padding = msg_len - header_size - data_len;
        mem.write_at(data_off + data_len, &[0; 8][..padding]);
        mem.write_at(off + msg_len, footer.as_bytes());

        // Publish the packet. The opposite endpoint needs a signal only if
        // interrupts are unmasked and the ring was empty before this write.
        let next_in = self.inner.add_pointer(inp, total_msg_len);
        control.inp().store(next_in, Ordering::SeqCst);
        let needs_interrupt = control.interrupt_mask().load(Ordering::SeqCst) == 0
            && control.outp().load(Ordering::SeqCst) == inp;
        Ok(needs_interrupt)
    }
}

struct InnerRing<M: RingMem> {
    mem: M,
    size: u32,
}

impl<M: RingMem> Debug for InnerRing<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerRing")
            .field("control", &self.control())
            .field("size", &self.size)
            .finish()
    }
}

impl<M: RingMem> InnerRing<M> {
    pub fn new(mem: M) -> Result<Self, Error> {
        let ring_size = u32::try_from(mem.len()).map_err(|_| Error::InvalidRingMemory)?;
        if ring_size == 0 || ring_size % PAGE_SIZE as u32 != 0 {
            return Err(Error::InvalidRingMemory);
        }
        let ring = InnerRing {
            mem,
            size: ring_size,
        };
        Ok(ring)
    }

    fn control(&self) -> Control<'_> {
        Control(self.mem.control())
    }

    fn len(&self) -> u32 {
        self.size
    }

    fn validate(&self, p: u32) -> Result<u32, Error> {
        if p >= self.size || p % 8 != 0 {
            Err(Error::InvalidRingPointer)
        } else {
            Ok(p)
        }
    }

    fn add_pointer(&self, p: u32, off: u32) -> u32 {
        let np = p + off;
        if np >= self.size {
            np - self.size
        } else {
            np
        }
    }

    fn available(&self, inp: u32, outp: u32) -> u32 {
        if inp >= outp {
            // |____outp....inp_____|
            inp - outp
        } else {
            // |....inp____outp.....|
            self.size + inp - outp
        }
    }

    fn free(&self, inp: u32, outp: u32) -> u32 {
        // It's not possible to fully fill the ring since that state would be
        // indistinguishable from the empty ring. So subtract 8 bytes from the
        // result.
        if outp > inp {
            // |....inp____outp.....|
            outp - inp - 8
        } else {
            // |____outp....inp_____|
            self.size - (inp - outp) - 8
        }
    }
}
