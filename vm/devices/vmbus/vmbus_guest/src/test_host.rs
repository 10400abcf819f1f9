// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A simulated host for exercising the guest engine.
//!
//! Replies to control messages synchronously through the guest's
//! [`MessageSink`], and maps open channels' rings through the DMA pool by page
//! number so that tests can act as the other ring endpoint.

use crate::HostTransport;
use crate::MessageSink;
use crate::RingLayout;
use crate::VmbusGuest;
use guest_dma::DmaPool;
use guest_dma::PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageHeader;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::VmbusMessage;
use vmbus_core::Guid;
use vmbus_core::OutgoingMessage;
use vmbus_ring::gparange::GpaRangeBuf;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingPacketType;
use vmbus_ring::OutgoingRing;
use vmbus_ring::PagedMemory;
use vmbus_ring::PagedRingMem;
use vmbus_ring::RingMem;
use vmbus_ring::CONTROL_WORD_COUNT;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// How the host answers a class of request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) enum Reply {
    #[default]
    Accept,
    /// Answer with a failure status.
    Reject(u32),
    /// Never answer.
    Silent,
}

/// A ring mapped by the host from a GPADL's page list.
pub(crate) struct HostRingPages {
    pool: DmaPool,
    // The control page, then the data pages.
    pfns: Vec<u64>,
}

impl PagedMemory for HostRingPages {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        self.pool
            .page_words(self.pfns[0])
            .unwrap()
            .first_chunk()
            .unwrap()
    }

    fn data_page_count(&self) -> usize {
        self.pfns.len() - 1
    }

    fn data(&self, page: usize) -> &[AtomicU8; PAGE_SIZE] {
        self.pool
            .page(self.pfns[1 + page % (self.pfns.len() - 1)])
            .unwrap()
    }
}

type HostRingMem = PagedRingMem<HostRingPages>;

/// The host's ends of an open channel's rings.
pub(crate) struct HostEndpoint {
    /// Guest to host.
    pub upstream: IncomingRing<HostRingMem>,
    /// Host to guest.
    pub downstream: OutgoingRing<HostRingMem>,
}

struct PartialGpadl {
    channel_id: ChannelId,
    count: u16,
    expected: usize,
    values: Vec<u64>,
}

#[derive(Default)]
struct HostState {
    posted: Vec<OutgoingMessage>,
    offers: Vec<protocol::OfferChannel>,
    gpadl_reply: Reply,
    teardown_reply: Reply,
    open_reply: Reply,
    partial: HashMap<GpadlId, PartialGpadl>,
    gpadls: HashMap<GpadlId, Vec<u64>>,
    open: HashMap<ChannelId, Arc<HostEndpoint>>,
}

pub(crate) struct TestHost {
    pool: DmaPool,
    sink: Mutex<Option<MessageSink>>,
    state: Mutex<HostState>,
    signals: AtomicUsize,
}

fn values(data: &[u8]) -> impl Iterator<Item = u64> + '_ {
    data.chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
}

impl TestHost {
    pub fn new(pool: DmaPool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sink: Mutex::new(None),
            state: Default::default(),
            signals: AtomicUsize::new(0),
        })
    }

    pub fn connect(&self, sink: MessageSink) {
        *self.sink.lock() = Some(sink);
    }

    pub fn set_gpadl_reply(&self, reply: Reply) {
        self.state.lock().gpadl_reply = reply;
    }

    pub fn set_teardown_reply(&self, reply: Reply) {
        self.state.lock().teardown_reply = reply;
    }

    pub fn set_open_reply(&self, reply: Reply) {
        self.state.lock().open_reply = reply;
    }

    /// Adds an offer, returned on the next request for offers.
    pub fn add_offer(&self, channel_id: u32, interface_id: Guid, instance_id: Guid) {
        let mut offer = protocol::OfferChannel::new_zeroed();
        offer.channel_id = ChannelId(channel_id);
        offer.interface_id = interface_id;
        offer.instance_id = instance_id;
        offer.connection_id = 0x2000 + channel_id;
        self.state.lock().offers.push(offer);
    }

    /// Delivers a message to the guest as if sent by the host.
    pub fn send<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(&self, message: &T) {
        self.deliver(vec![OutgoingMessage::new(message)]);
    }

    pub fn rescind(&self, channel_id: u32) {
        self.state.lock().open.remove(&ChannelId(channel_id));
        self.send(&protocol::RescindChannelOffer {
            channel_id: ChannelId(channel_id),
        });
    }

    fn deliver(&self, messages: Vec<OutgoingMessage>) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            for message in messages {
                sink.deliver(message.data());
            }
        }
    }

    /// The types of all messages posted by the guest, in order.
    pub fn posted_types(&self) -> Vec<MessageType> {
        self.state
            .lock()
            .posted
            .iter()
            .map(|m| {
                let (header, _) = MessageHeader::read_from_prefix(m.data()).unwrap();
                header.message_type()
            })
            .collect()
    }

    pub fn count_posted(&self, typ: MessageType) -> usize {
        self.posted_types().into_iter().filter(|t| *t == typ).count()
    }

    /// The last `OpenChannel` request posted by the guest.
    pub fn last_open_request(&self) -> Option<protocol::OpenChannel> {
        let state = self.state.lock();
        state.posted.iter().rev().find_map(|m| match Message::parse(m.data()) {
            Ok(Message::OpenChannel(open, _)) => Some(open),
            _ => None,
        })
    }

    /// The page numbers of each GPADL the host currently holds.
    pub fn gpadl_pages(&self, gpadl_id: GpadlId) -> Option<Vec<u64>> {
        self.state.lock().gpadls.get(&gpadl_id).cloned()
    }

    pub fn gpadl_count(&self) -> usize {
        self.state.lock().gpadls.len()
    }

    pub fn endpoint(&self, channel_id: u32) -> Option<Arc<HostEndpoint>> {
        self.state.lock().open.get(&ChannelId(channel_id)).cloned()
    }

    pub fn signal_count(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }

    fn map_ring(&self, pfns: &[u64]) -> HostRingMem {
        PagedRingMem::new(HostRingPages {
            pool: self.pool.clone(),
            pfns: pfns.to_vec(),
        })
    }

    fn handle(&self, state: &mut HostState, message: &OutgoingMessage) -> Vec<OutgoingMessage> {
        state.posted.push(message.clone());
        let mut replies = Vec::new();
        match Message::parse(message.data()).unwrap() {
            Message::RequestOffers(..) => {
                replies.extend(state.offers.iter().map(OutgoingMessage::new));
                replies.push(OutgoingMessage::new(&protocol::AllOffersDelivered {}));
            }
            Message::GpadlHeader(header, data) => {
                let partial = PartialGpadl {
                    channel_id: header.channel_id,
                    count: header.count,
                    expected: header.len as usize / 8,
                    values: values(data).collect(),
                };
                state.partial.insert(header.gpadl_id, partial);
                replies.extend(Self::gpadl_progress(state, header.gpadl_id));
            }
            Message::GpadlBody(body, data) => {
                let partial = state
                    .partial
                    .get_mut(&body.gpadl_id)
                    .expect("body for unknown gpadl");
                partial.values.extend(values(data));
                replies.extend(Self::gpadl_progress(state, body.gpadl_id));
            }
            Message::GpadlTeardown(teardown, _) => {
                if state.teardown_reply == Reply::Accept {
                    state.gpadls.remove(&teardown.gpadl_id);
                    replies.push(OutgoingMessage::new(&protocol::GpadlTorndown {
                        gpadl_id: teardown.gpadl_id,
                    }));
                }
            }
            Message::OpenChannel(open, _) => {
                let status = match state.open_reply {
                    Reply::Accept => {
                        let endpoint = self.open_endpoint(state, &open);
                        state.open.insert(open.channel_id, Arc::new(endpoint));
                        Some(protocol::STATUS_SUCCESS as u32)
                    }
                    Reply::Reject(status) => Some(status),
                    Reply::Silent => None,
                };
                if let Some(status) = status {
                    replies.push(OutgoingMessage::new(&protocol::OpenResult {
                        channel_id: open.channel_id,
                        open_id: open.open_id,
                        status,
                    }));
                }
            }
            Message::CloseChannel(close, _) => {
                state.open.remove(&close.channel_id);
            }
            Message::RelIdReleased(..) => {}
            msg => panic!("unexpected message from guest: {msg:?}"),
        }
        replies
    }

    fn gpadl_progress(state: &mut HostState, gpadl_id: GpadlId) -> Option<OutgoingMessage> {
        let partial = state.partial.get(&gpadl_id)?;
        assert!(partial.values.len() <= partial.expected);
        if partial.values.len() < partial.expected {
            return None;
        }
        let partial = state.partial.remove(&gpadl_id)?;
        let ranges = GpaRangeBuf::new(partial.count as usize, partial.values).unwrap();
        let range = ranges.iter().next().unwrap();
        let status = match state.gpadl_reply {
            Reply::Accept => {
                state.gpadls.insert(gpadl_id, range.gpns().to_vec());
                protocol::STATUS_SUCCESS
            }
            Reply::Reject(status) => status as i32,
            Reply::Silent => return None,
        };
        Some(OutgoingMessage::new(&protocol::GpadlCreated {
            channel_id: partial.channel_id,
            gpadl_id,
            status,
        }))
    }

    fn open_endpoint(&self, state: &HostState, open: &protocol::OpenChannel) -> HostEndpoint {
        let pages = &state.gpadls[&open.ring_buffer_gpadl_id];
        let (up, down) = if open.downstream_ring_buffer_gpadl_id == GpadlId(0) {
            pages.split_at(open.downstream_ring_buffer_page_offset as usize)
        } else {
            (
                pages.as_slice(),
                state.gpadls[&open.downstream_ring_buffer_gpadl_id].as_slice(),
            )
        };
        let upstream = IncomingRing::new(self.map_ring(up)).unwrap();
        // Ask the guest to signal new data.
        upstream.set_interrupt_mask(false);
        let downstream = OutgoingRing::new(self.map_ring(down)).unwrap();
        HostEndpoint {
            upstream,
            downstream,
        }
    }
}

impl HostEndpoint {
    /// Reads the next frame written by the guest.
    pub fn read_frame(&self) -> Option<Vec<u8>> {
        let len = self.upstream.peek_next_packet_len().unwrap()?;
        let mut frame = vec![0; len];
        self.upstream.read(&mut frame).unwrap();
        Some(frame)
    }

    pub fn write(&self, typ: OutgoingPacketType<'_>, transaction_id: u64, payload: &[u8]) -> bool {
        self.downstream
            .write(&OutgoingPacket {
                transaction_id,
                typ,
                header: &[],
                payload,
            })
            .unwrap()
    }

    /// Writes an in-band packet, then overwrites the 16-bit descriptor field
    /// at `field_offset` with `value`.
    pub fn write_corrupted(&self, payload: &[u8], field_offset: usize, value: u16) {
        let offset = self.downstream.mem().control()[0].load(Ordering::SeqCst);
        self.write(OutgoingPacketType::InBandNoCompletion, 0, payload);
        self.downstream
            .mem()
            .write_at(offset as usize + field_offset, &value.to_le_bytes());
    }
}

impl HostTransport for TestHost {
    fn post_message(&self, message: &OutgoingMessage) -> std::io::Result<()> {
        let replies = {
            let mut state = self.state.lock();
            self.handle(&mut state, message)
        };
        self.deliver(replies);
        Ok(())
    }

    fn signal_event(&self, _connection_id: u32) -> std::io::Result<()> {
        self.signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) const TEST_INTERFACE: Guid =
    Guid::from_static_str("f912ad6d-2b17-48ea-bd65-f927a61c7684");
pub(crate) const TEST_INSTANCE: Guid =
    Guid::from_static_str("d34b2567-b9b6-42b9-8778-0a4ec0b955bf");
pub(crate) const TEST_CHANNEL: ChannelId = ChannelId(1);

/// A guest connected to a host that has offered one channel.
pub(crate) struct TestEnv {
    pub pool: DmaPool,
    pub host: Arc<TestHost>,
    pub guest: VmbusGuest,
}

impl TestEnv {
    pub fn new(layout: RingLayout) -> Self {
        crate::init_tracing();
        let pool = DmaPool::new(0x1000, 64);
        let host = TestHost::new(pool.clone());
        host.add_offer(TEST_CHANNEL.0, TEST_INTERFACE, TEST_INSTANCE);
        let guest = VmbusGuest::builder(host.clone(), Arc::new(pool.clone()))
            .gpadl_timeout(Duration::from_millis(100))
            .teardown_timeout(Duration::from_millis(100))
            .open_timeout(Duration::from_millis(100))
            .ring_layout(layout)
            .build();
        host.connect(guest.message_sink());
        guest.request_offers().unwrap();
        assert!(guest.all_offers_delivered());
        Self { pool, host, guest }
    }
}
