// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Packet framing for channel traffic and transaction id correlation.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;
use vmbus_ring::parse_packet;
use vmbus_ring::IncomingPacketType;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingPacketType;

/// A packet from the host that could not be parsed. The packet is dropped and
/// the channel keeps running.
#[derive(Debug, Error)]
#[error("malformed packet")]
pub struct MalformedPacketError(#[from] vmbus_ring::Error);

impl MalformedPacketError {
    /// The underlying framing error.
    pub fn reason(&self) -> vmbus_ring::Error {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketKind {
    InBand,
    /// A completion for an earlier request. `matched` is false if no request
    /// with this transaction id was pending.
    Completion { matched: bool },
    GpaDirect,
    TransferPages { transfer_page_set_id: u16 },
}

/// A decoded packet from the receive ring.
#[derive(Debug)]
pub struct InboundPacket<'a> {
    pub kind: PacketKind,
    pub transaction_id: u64,
    pub completion_requested: bool,
    /// The frame length, including the descriptor.
    pub len: usize,
    pub payload: &'a [u8],
}

/// Assigns transaction ids to outgoing requests and matches completions to
/// them.
#[derive(Debug)]
pub struct PacketCodec {
    next_transaction_id: AtomicU64,
    pending: Mutex<HashSet<u64>>,
    unmatched_completions: AtomicU64,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            next_transaction_id: AtomicU64::new(1),
            pending: Default::default(),
            unmatched_completions: AtomicU64::new(0),
        }
    }

    /// Frames `payload` as an in-band packet with a fresh transaction id. If
    /// `expect_completion` is set, the id is recorded as pending before the
    /// packet is returned, so a completion can never race ahead of it.
    pub fn encode_inband_request<'a>(
        &self,
        payload: &'a [u8],
        expect_completion: bool,
    ) -> OutgoingPacket<'a> {
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        let typ = if expect_completion {
            self.pending.lock().insert(transaction_id);
            OutgoingPacketType::InBandWithCompletion
        } else {
            OutgoingPacketType::InBandNoCompletion
        };
        OutgoingPacket {
            transaction_id,
            typ,
            header: &[],
            payload,
        }
    }

    /// Frames a completion for a request from the host.
    pub fn encode_completion<'a>(
        &self,
        transaction_id: u64,
        payload: &'a [u8],
    ) -> OutgoingPacket<'a> {
        OutgoingPacket {
            transaction_id,
            typ: OutgoingPacketType::Completion,
            header: &[],
            payload,
        }
    }

    /// Forgets a pending request whose packet never reached the ring.
    pub fn cancel(&self, transaction_id: u64) {
        self.pending.lock().remove(&transaction_id);
    }

    /// Validates a frame read from the receive ring and decodes it. A
    /// completion removes its transaction id from the pending set; an
    /// unmatched completion is counted and logged.
    pub fn decode_inbound_packet<'a>(
        &self,
        frame: &'a [u8],
    ) -> Result<InboundPacket<'a>, MalformedPacketError> {
        let packet = parse_packet(frame)?;
        let kind = match packet.typ {
            IncomingPacketType::InBand => PacketKind::InBand,
            IncomingPacketType::Completion => {
                let matched = self.pending.lock().remove(&packet.transaction_id);
                if !matched {
                    self.unmatched_completions.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        transaction_id = packet.transaction_id,
                        "completion for unknown transaction"
                    );
                }
                PacketKind::Completion { matched }
            }
            IncomingPacketType::GpaDirect(..) => PacketKind::GpaDirect,
            IncomingPacketType::TransferPages(transfer_page_set_id, ..) => {
                PacketKind::TransferPages {
                    transfer_page_set_id,
                }
            }
        };
        Ok(InboundPacket {
            kind,
            transaction_id: packet.transaction_id,
            completion_requested: packet.completion_requested(),
            len: frame.len(),
            payload: packet.payload,
        })
    }

    /// Returns true if a completion for `transaction_id` is still expected.
    pub fn is_pending(&self, transaction_id: u64) -> bool {
        self.pending.lock().contains(&transaction_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// The number of completions that matched no pending request.
    pub fn unmatched_completions(&self) -> u64 {
        self.unmatched_completions.load(Ordering::Relaxed)
    }

    /// Discards all pending requests. Completions arriving later are treated
    /// as unmatched.
    pub fn clear(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "discarding pending requests");
            pending.clear();
        }
    }
}
