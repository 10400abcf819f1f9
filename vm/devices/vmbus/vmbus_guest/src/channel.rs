// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-channel lifecycle: ring buffer setup, open, close, rescind, and
//! packet traffic.

use crate::codec::InboundPacket;
use crate::codec::MalformedPacketError;
use crate::codec::PacketCodec;
use crate::gpadl::GpadlError;
use crate::gpadl::GpadlRegistry;
use crate::response::Response;
use crate::response::ResponseKey;
use crate::response::ResponseTable;
use crate::ring_mem::DmaRingMem;
use crate::ring_mem::DmaRingPages;
use crate::HostTransport;
use crate::RingLayout;
use guest_dma::AllocationError;
use guest_dma::DmaAllocator;
use guest_dma::DmaBuffer;
use guest_dma::PAGE_SIZE;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::OfferFlags;
use vmbus_core::protocol::UserDefinedData;
use vmbus_core::Guid;
use vmbus_core::OutgoingMessage;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingRing;
use vmbus_ring::PagedRingMem;
use vmbus_ring::ReadError;
use vmbus_ring::WriteError;

/// Frames up to this size are staged on the stack while draining the receive
/// ring.
const SMALL_PACKET_SIZE: usize = 128;

/// The largest ring, in bytes, that ring indices can address.
const MAX_RING_SIZE: usize = u32::MAX as usize & !(PAGE_SIZE - 1);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The host has not offered the channel, or has rescinded it.
    NotPresent,
    Closed,
    /// Ring buffer GPADLs are being registered or are registered, and the
    /// open request has not completed.
    GpadlConfigured,
    Open,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("channel {0} is not offered by the host")]
    NotPresent(ChannelId),
    #[error("invalid ring size {0:#x}")]
    InvalidRingSize(usize),
    #[error("failed to allocate ring buffer")]
    Allocation(#[source] AllocationError),
    #[error("failed to register ring buffer gpadl")]
    Gpadl(#[source] GpadlError),
    #[error("invalid ring buffer")]
    Ring(#[source] vmbus_ring::Error),
    #[error("failed to post open request")]
    Post(#[source] std::io::Error),
    #[error("timed out waiting for the open result")]
    Timeout,
    #[error("host rejected the open request with status {0:#x}")]
    Rejected(u32),
    #[error("channel was rescinded during open")]
    Rescinded,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("channel is not open")]
    NotOpen,
    /// Transient; the caller should retry once the host has consumed data.
    #[error("ring buffer full, {0} bytes needed")]
    RingFull(usize),
    #[error("ring buffer error")]
    Ring(#[source] vmbus_ring::Error),
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("channel is not open")]
    NotOpen,
    #[error("no packet available")]
    Empty,
    #[error("receive buffer too small, {0} bytes needed")]
    BufferTooSmall(usize),
    #[error(transparent)]
    Malformed(#[from] MalformedPacketError),
}

/// Receives packets drained from a channel's receive ring.
///
/// Called from the interrupt path, so implementations must not block. The
/// channel is passed so that the callback can send completions.
pub trait ChannelCallback: Send + Sync {
    fn packet(&self, channel: &Channel, packet: &InboundPacket<'_>);
}

/// The host's description of a channel.
#[derive(Debug, Clone)]
pub struct Offer {
    pub channel_id: ChannelId,
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub connection_id: u32,
    pub subchannel_index: u16,
    pub flags: OfferFlags,
    pub user_defined: UserDefinedData,
}

impl From<&protocol::OfferChannel> for Offer {
    fn from(offer: &protocol::OfferChannel) -> Self {
        Self {
            channel_id: offer.channel_id,
            interface_id: offer.interface_id,
            instance_id: offer.instance_id,
            connection_id: offer.connection_id,
            subchannel_index: offer.subchannel_index,
            flags: offer.flags,
            user_defined: offer.user_defined,
        }
    }
}

/// The connection-wide services a channel uses.
#[derive(Clone)]
pub(crate) struct ChannelDeps {
    pub transport: Arc<dyn HostTransport>,
    pub allocator: Arc<dyn DmaAllocator>,
    pub gpadls: Arc<GpadlRegistry>,
    pub responses: Arc<ResponseTable>,
    pub open_timeout: Duration,
    pub ring_layout: RingLayout,
}

#[derive(Debug)]
struct ChannelState {
    status: ChannelStatus,
    gpadls: Vec<GpadlId>,
}

/// One offered channel.
///
/// The guest is the only writer of the transmit ring and the only reader of
/// the receive ring. The ring locks only serialize guest threads against each
/// other; the host synchronizes through the ring indices.
pub struct Channel {
    offer: Offer,
    deps: ChannelDeps,
    // Serializes open and close.
    lifecycle: Mutex<()>,
    state: Mutex<ChannelState>,
    tx: Mutex<Option<OutgoingRing<DmaRingMem>>>,
    rx: Mutex<Option<IncomingRing<DmaRingMem>>>,
    // Set by an interrupt that found the receive ring busy. Whoever holds the
    // ring drains it after unlocking.
    drain_requested: AtomicBool,
    callback: Mutex<Option<Arc<dyn ChannelCallback>>>,
    codec: PacketCodec,
    next_open_id: AtomicU32,
    malformed_packets: AtomicU64,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("offer", &self.offer)
            .field("state", &self.state)
            .field("codec", &self.codec)
            .field("malformed_packets", &self.malformed_packets)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(offer: Offer, deps: ChannelDeps) -> Self {
        Self {
            offer,
            deps,
            lifecycle: Mutex::new(()),
            state: Mutex::new(ChannelState {
                status: ChannelStatus::Closed,
                gpadls: Vec::new(),
            }),
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            drain_requested: AtomicBool::new(false),
            callback: Mutex::new(None),
            codec: PacketCodec::new(),
            next_open_id: AtomicU32::new(1),
            malformed_packets: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.offer.channel_id
    }

    pub fn offer(&self) -> &Offer {
        &self.offer
    }

    pub fn status(&self) -> ChannelStatus {
        self.state.lock().status
    }

    /// The GPADLs backing the rings of an open channel.
    pub fn gpadl_ids(&self) -> Vec<GpadlId> {
        self.state.lock().gpadls.clone()
    }

    /// The number of packets dropped because they could not be parsed.
    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets.load(Ordering::Relaxed)
    }

    /// The transaction ids awaiting completion.
    pub fn pending_requests(&self) -> usize {
        self.codec.pending_count()
    }

    /// Returns true if a completion for `transaction_id` is still expected.
    pub fn is_pending(&self, transaction_id: u64) -> bool {
        self.codec.is_pending(transaction_id)
    }

    /// The number of completions that matched no pending request.
    pub fn unmatched_completions(&self) -> u64 {
        self.codec.unmatched_completions()
    }

    /// Opens the channel with transmit and receive rings of the given data
    /// sizes, each of which must be a non-zero multiple of the page size. Each
    /// ring also gets a control page.
    ///
    /// Blocks until the host answers or the configured timeouts elapse. Does
    /// nothing if the channel is already open. On failure every buffer and
    /// GPADL acquired so far is released and the channel stays closed.
    pub fn open(
        &self,
        tx_size: usize,
        rx_size: usize,
        callback: Option<Arc<dyn ChannelCallback>>,
    ) -> Result<(), OpenError> {
        let _lifecycle = self.lifecycle.lock();
        match self.status() {
            ChannelStatus::Open => {
                tracing::debug!(channel_id = self.id().0, "channel already open");
                return Ok(());
            }
            ChannelStatus::NotPresent => return Err(OpenError::NotPresent(self.id())),
            ChannelStatus::Closed | ChannelStatus::GpadlConfigured => {}
        }
        for size in [tx_size, rx_size] {
            if size == 0 || size % PAGE_SIZE != 0 || size > MAX_RING_SIZE {
                return Err(OpenError::InvalidRingSize(size));
            }
        }

        let mut gpadls = Vec::new();
        let result = self.try_open(tx_size, rx_size, callback, &mut gpadls);
        if let Err(err) = &result {
            tracing::warn!(
                channel_id = self.id().0,
                error = err as &dyn std::error::Error,
                "failed to open channel"
            );
            self.release(&gpadls);
        }
        result
    }

    fn try_open(
        &self,
        tx_size: usize,
        rx_size: usize,
        callback: Option<Arc<dyn ChannelCallback>>,
        gpadls: &mut Vec<GpadlId>,
    ) -> Result<(), OpenError> {
        let tx_pages = tx_size / PAGE_SIZE;
        let rx_pages = rx_size / PAGE_SIZE;
        let (tx_mem, rx_mem, ring_gpadl, downstream_gpadl, downstream_offset) =
            match self.deps.ring_layout {
                RingLayout::Separate => {
                    let tx_buf = self.allocate(tx_size + PAGE_SIZE)?;
                    let rx_buf = self.allocate(rx_size + PAGE_SIZE)?;
                    let tx_id = self.register_gpadl(&tx_buf, gpadls)?;
                    let rx_id = self.register_gpadl(&rx_buf, gpadls)?;
                    (
                        DmaRingPages::new(tx_buf, 0, tx_pages),
                        DmaRingPages::new(rx_buf, 0, rx_pages),
                        tx_id,
                        rx_id,
                        0,
                    )
                }
                RingLayout::Shared => {
                    let buf = self.allocate(tx_size + rx_size + 2 * PAGE_SIZE)?;
                    let id = self.register_gpadl(&buf, gpadls)?;
                    (
                        DmaRingPages::new(buf.clone(), 0, tx_pages),
                        DmaRingPages::new(buf, tx_pages + 1, rx_pages),
                        id,
                        GpadlId(0),
                        (tx_pages + 1) as u32,
                    )
                }
            };

        let invalid = || OpenError::Ring(vmbus_ring::Error::InvalidRingMemory);
        let tx = OutgoingRing::new(PagedRingMem::new(tx_mem.ok_or_else(invalid)?))
            .map_err(OpenError::Ring)?;
        let rx = IncomingRing::new(PagedRingMem::new(rx_mem.ok_or_else(invalid)?))
            .map_err(OpenError::Ring)?;
        rx.set_interrupt_mask(false);
        self.codec.clear();
        *self.tx.lock() = Some(tx);
        *self.rx.lock() = Some(rx);
        *self.callback.lock() = callback;

        let open_id = self.next_open_id.fetch_add(1, Ordering::Relaxed);
        let key = ResponseKey::OpenResult(self.id());
        self.deps.responses.expect(key);
        let message = protocol::OpenChannel {
            channel_id: self.id(),
            open_id,
            ring_buffer_gpadl_id: ring_gpadl,
            target_vp: 0,
            downstream_ring_buffer_page_offset: downstream_offset,
            user_data: UserDefinedData::default(),
            downstream_ring_buffer_gpadl_id: downstream_gpadl,
        };
        tracing::debug!(
            channel_id = self.id().0,
            open_id,
            ring_gpadl = %ring_gpadl,
            downstream_gpadl = %downstream_gpadl,
            downstream_offset,
            "sending open request"
        );
        if let Err(err) = self
            .deps
            .transport
            .post_message(&OutgoingMessage::new(&message))
        {
            self.deps.responses.cancel(key);
            return Err(OpenError::Post(err));
        }

        match self.deps.responses.wait(key, self.deps.open_timeout) {
            Some(Response::OpenResult { status }) if status == protocol::STATUS_SUCCESS as u32 => {}
            Some(Response::OpenResult { status }) => return Err(OpenError::Rejected(status)),
            Some(Response::Rescinded) => return Err(OpenError::Rescinded),
            Some(response) => {
                tracing::warn!(?response, "unexpected open response");
                return Err(OpenError::Timeout);
            }
            None => {
                // The host may still act on the request.
                self.post_close();
                return Err(OpenError::Timeout);
            }
        }

        let mut state = self.state.lock();
        if state.status == ChannelStatus::NotPresent {
            return Err(OpenError::Rescinded);
        }
        state.status = ChannelStatus::Open;
        state.gpadls = gpadls.clone();
        tracing::info!(
            channel_id = self.id().0,
            interface_id = %self.offer.interface_id,
            "channel open"
        );
        Ok(())
    }

    fn allocate(&self, len: usize) -> Result<Arc<DmaBuffer>, OpenError> {
        let buffer = self
            .deps
            .allocator
            .allocate_dma_buffer(len)
            .map_err(OpenError::Allocation)?;
        Ok(Arc::new(buffer))
    }

    fn register_gpadl(
        &self,
        buffer: &Arc<DmaBuffer>,
        gpadls: &mut Vec<GpadlId>,
    ) -> Result<GpadlId, OpenError> {
        let id = self
            .deps
            .gpadls
            .register(self.id(), buffer)
            .map_err(OpenError::Gpadl)?;
        gpadls.push(id);
        let mut state = self.state.lock();
        if state.status != ChannelStatus::NotPresent {
            state.status = ChannelStatus::GpadlConfigured;
        }
        Ok(id)
    }

    /// Stops interrupt delivery and drops the rings and callback.
    fn detach_rings(&self) {
        if let Some(rx) = self.rx.lock().take() {
            rx.set_interrupt_mask(true);
        }
        self.callback.lock().take();
        self.tx.lock().take();
    }

    /// Tears down `gpadls` and returns the channel to `Closed`, unless it was
    /// rescinded in the meantime.
    fn release(&self, gpadls: &[GpadlId]) {
        self.detach_rings();
        for &gpadl_id in gpadls {
            if let Err(err) = self.deps.gpadls.teardown(gpadl_id) {
                tracing::warn!(
                    channel_id = self.id().0,
                    gpadl_id = %gpadl_id,
                    error = &err as &dyn std::error::Error,
                    "failed to tear down ring gpadl"
                );
            }
        }
        self.codec.clear();
        let mut state = self.state.lock();
        state.gpadls.clear();
        if state.status != ChannelStatus::NotPresent {
            state.status = ChannelStatus::Closed;
        }
    }

    fn post_close(&self) {
        if let Err(err) = self
            .deps
            .transport
            .post_message(&OutgoingMessage::new(&protocol::CloseChannel {
                channel_id: self.id(),
            }))
        {
            tracing::warn!(
                channel_id = self.id().0,
                error = &err as &dyn std::error::Error,
                "failed to post close request"
            );
        }
    }

    /// Closes the channel, releasing its rings, GPADLs, and pending requests.
    /// Does nothing unless the channel is open.
    pub fn close(&self) {
        let _lifecycle = self.lifecycle.lock();
        let gpadls = {
            let state = self.state.lock();
            if state.status != ChannelStatus::Open {
                tracing::debug!(
                    channel_id = self.id().0,
                    status = ?state.status,
                    "channel not open"
                );
                return;
            }
            state.gpadls.clone()
        };

        // Stop new work from arriving before anything is torn down.
        self.detach_rings();
        self.post_close();
        self.release(&gpadls);
        tracing::info!(channel_id = self.id().0, "channel closed");
    }

    /// Handles the host rescinding the offer. Drops local state without
    /// waiting on the host.
    pub(crate) fn revoke(&self) {
        {
            let mut state = self.state.lock();
            state.status = ChannelStatus::NotPresent;
            state.gpadls.clear();
        }
        self.detach_rings();
        self.codec.clear();
        self.deps.gpadls.forget_channel(self.id());
        self.deps
            .responses
            .complete(ResponseKey::OpenResult(self.id()), Response::Rescinded);
        if let Err(err) = self
            .deps
            .transport
            .post_message(&OutgoingMessage::new(&protocol::RelIdReleased {
                channel_id: self.id(),
            }))
        {
            tracing::warn!(
                channel_id = self.id().0,
                error = &err as &dyn std::error::Error,
                "failed to release channel id"
            );
        }
        tracing::info!(channel_id = self.id().0, "channel rescinded");
    }

    fn signal_host(&self) {
        if let Err(err) = self.deps.transport.signal_event(self.offer.connection_id) {
            tracing::warn!(
                channel_id = self.id().0,
                connection_id = self.offer.connection_id,
                error = &err as &dyn std::error::Error,
                "failed to signal host"
            );
        }
    }

    fn write_packet(
        &self,
        ring: &OutgoingRing<DmaRingMem>,
        packet: &OutgoingPacket<'_>,
    ) -> Result<(), SendError> {
        match ring.write(packet) {
            Ok(signal) => {
                if signal {
                    self.signal_host();
                }
                Ok(())
            }
            Err(WriteError::Full(len)) => {
                tracing::trace!(channel_id = self.id().0, len, "transmit ring full");
                Err(SendError::RingFull(len))
            }
            Err(WriteError::Corrupt(err)) => Err(SendError::Ring(err)),
        }
    }

    /// Writes an in-band packet, returning its transaction id. With
    /// `request_completion`, the id stays pending until the host's completion
    /// arrives or the channel closes.
    pub fn write_inband_packet(
        &self,
        payload: &[u8],
        request_completion: bool,
    ) -> Result<u64, SendError> {
        let tx = self.tx.lock();
        let ring = tx.as_ref().ok_or(SendError::NotOpen)?;
        let packet = self.codec.encode_inband_request(payload, request_completion);
        self.write_packet(ring, &packet)
            .inspect_err(|_| self.codec.cancel(packet.transaction_id))?;
        Ok(packet.transaction_id)
    }

    /// Sends a completion for a request from the host.
    pub fn send_completion(&self, transaction_id: u64, payload: &[u8]) -> Result<(), SendError> {
        let tx = self.tx.lock();
        let ring = tx.as_ref().ok_or(SendError::NotOpen)?;
        self.write_packet(ring, &self.codec.encode_completion(transaction_id, payload))
    }

    /// Returns the frame length of the next received packet, or `None` if no
    /// packet is ready.
    pub fn peek_next_packet_len(&self) -> Result<Option<usize>, ReceiveError> {
        let result = match self.rx.lock().as_ref() {
            Some(ring) => ring
                .peek_next_packet_len()
                .map_err(|err| self.malformed(err.into()).into()),
            None => Err(ReceiveError::NotOpen),
        };
        self.run_deferred_drain();
        result
    }

    /// Reads the next packet into `dest` and decodes it.
    pub fn read_packet<'a>(&self, dest: &'a mut [u8]) -> Result<InboundPacket<'a>, ReceiveError> {
        let result = match self.rx.lock().as_ref() {
            Some(ring) => self.read_frame(ring, dest),
            None => Err(ReceiveError::NotOpen),
        };
        self.run_deferred_drain();
        let len = result?;
        let dest: &'a [u8] = dest;
        self.codec
            .decode_inbound_packet(&dest[..len])
            .map_err(|err| self.malformed(err).into())
    }

    fn read_frame(
        &self,
        ring: &IncomingRing<DmaRingMem>,
        dest: &mut [u8],
    ) -> Result<usize, ReceiveError> {
        match ring.read(dest) {
            Ok(read) => {
                if read.signal {
                    self.signal_host();
                }
                Ok(read.len)
            }
            Err(ReadError::Empty) => Err(ReceiveError::Empty),
            Err(ReadError::BufferTooSmall(len)) => Err(ReceiveError::BufferTooSmall(len)),
            Err(ReadError::Corrupt(err)) => {
                // The ring discarded the bad data; the writer may be waiting
                // for that space.
                if ring.writer_needs_signal() {
                    self.signal_host();
                }
                Err(self.malformed(err.into()).into())
            }
        }
    }

    fn malformed(&self, err: MalformedPacketError) -> MalformedPacketError {
        let count = self.malformed_packets.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            channel_id = self.id().0,
            count,
            error = &err as &dyn std::error::Error,
            "dropping malformed packet"
        );
        err
    }

    /// Locks the receive ring without waiting. On contention, asks the holder
    /// to drain the ring once it unlocks, then tries once more in case the
    /// holder unlocked before seeing the request.
    fn try_lock_rx(&self) -> Option<MutexGuard<'_, Option<IncomingRing<DmaRingMem>>>> {
        if let Some(rx) = self.rx.try_lock() {
            return Some(rx);
        }
        self.drain_requested.store(true, Ordering::SeqCst);
        self.rx.try_lock()
    }

    /// Drains on behalf of an interrupt that arrived while this thread held
    /// the receive ring. Must be called with the ring unlocked.
    fn run_deferred_drain(&self) {
        if self.drain_requested.swap(false, Ordering::SeqCst) {
            self.handle_interrupt();
        }
    }

    /// Drains the receive ring into the registered callback, returning the
    /// number of packets delivered.
    ///
    /// Never waits on another thread: if a guest thread is already using the
    /// ring, the drain is handed to that thread, which runs it after
    /// unlocking.
    pub fn handle_interrupt(&self) -> usize {
        let Some(callback) = self.callback.lock().clone() else {
            return 0;
        };
        let mut stack = [0u8; SMALL_PACKET_SIZE];
        let mut heap = Vec::new();
        let mut delivered = 0;
        loop {
            let Some(rx) = self.try_lock_rx() else {
                tracing::trace!(
                    channel_id = self.id().0,
                    "receive ring busy, drain deferred"
                );
                break;
            };
            let Some(ring) = rx.as_ref() else {
                break;
            };
            let len = match ring.peek_next_packet_len() {
                Ok(Some(len)) => len,
                Ok(None) => {
                    // A packet may have arrived after the check, with its
                    // interrupt deferred to this thread.
                    drop(rx);
                    if self.drain_requested.swap(false, Ordering::SeqCst) {
                        continue;
                    }
                    break;
                }
                Err(err) => {
                    self.malformed(err.into());
                    break;
                }
            };
            let dest: &mut [u8] = if len <= SMALL_PACKET_SIZE {
                &mut stack
            } else {
                heap.resize(len, 0);
                &mut heap
            };
            let result = self.read_frame(ring, dest);
            drop(rx);
            let len = match result {
                Ok(len) => len,
                Err(ReceiveError::Malformed(_)) => continue,
                Err(_) => break,
            };
            match self.codec.decode_inbound_packet(&dest[..len]) {
                Ok(packet) => {
                    callback.packet(self, &packet);
                    delivered += 1;
                }
                Err(err) => {
                    self.malformed(err);
                }
            }
        }
        delivered
    }
}
