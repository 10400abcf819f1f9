// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The guest side of a vmbus connection: channel offers, ring buffer GPADL
//! registration, channel open and close, and packet traffic on open channels.
//!
//! The host is reached through a [`HostTransport`], which posts control
//! messages and signals channel events. Messages from the host are fed back in
//! through [`VmbusGuest::handle_message`], and channel interrupts through
//! [`VmbusGuest::handle_channel_interrupt`]. Neither entry point blocks, so
//! both may be called from interrupt context. Operations that wait for the
//! host (GPADL registration and teardown, channel open) block the calling
//! thread with a bounded timeout.

#![forbid(unsafe_code)]

mod channel;
mod codec;
mod gpadl;
mod response;
mod ring_mem;
#[cfg(test)]
mod test_host;

pub use channel::Channel;
pub use channel::ChannelCallback;
pub use channel::ChannelStatus;
pub use channel::Offer;
pub use channel::OpenError;
pub use channel::ReceiveError;
pub use channel::SendError;
pub use codec::InboundPacket;
pub use codec::MalformedPacketError;
pub use codec::PacketCodec;
pub use codec::PacketKind;
pub use gpadl::GpadlError;
pub use gpadl::GpadlRegistry;
pub use gpadl::GPADL_START_HANDLE;
pub use ring_mem::DmaRingMem;
pub use ring_mem::DmaRingPages;

use channel::ChannelDeps;
use guest_dma::DmaAllocator;
use parking_lot::Mutex;
use response::Response;
use response::ResponseKey;
use response::ResponseTable;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::Message;
use vmbus_core::Guid;
use vmbus_core::OutgoingMessage;

/// The hypervisor services the guest uses to reach the host.
pub trait HostTransport: Send + Sync {
    /// Posts a control message to the host.
    fn post_message(&self, message: &OutgoingMessage) -> std::io::Result<()>;

    /// Signals the host that a channel's rings need attention.
    fn signal_event(&self, connection_id: u32) -> std::io::Result<()>;
}

/// How a channel's two rings are laid out in guest memory.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum RingLayout {
    /// Each ring has its own buffer and GPADL.
    #[default]
    Separate,
    /// Both rings share one buffer and GPADL, with the receive ring starting
    /// after the transmit ring.
    Shared,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a [`VmbusGuest`].
pub struct VmbusGuestBuilder {
    transport: Arc<dyn HostTransport>,
    allocator: Arc<dyn DmaAllocator>,
    gpadl_timeout: Duration,
    teardown_timeout: Duration,
    open_timeout: Duration,
    gpadl_start_handle: u32,
    ring_layout: RingLayout,
}

impl VmbusGuestBuilder {
    pub fn new(transport: Arc<dyn HostTransport>, allocator: Arc<dyn DmaAllocator>) -> Self {
        Self {
            transport,
            allocator,
            gpadl_timeout: DEFAULT_TIMEOUT,
            teardown_timeout: DEFAULT_TIMEOUT,
            open_timeout: DEFAULT_TIMEOUT,
            gpadl_start_handle: GPADL_START_HANDLE,
            ring_layout: RingLayout::default(),
        }
    }

    /// How long to wait for the host to create a GPADL.
    pub fn gpadl_timeout(mut self, timeout: Duration) -> Self {
        self.gpadl_timeout = timeout;
        self
    }

    /// How long to wait for the host to acknowledge a GPADL teardown before
    /// leaking it.
    pub fn teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// How long to wait for the result of an open request.
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// The first GPADL handle to issue.
    pub fn gpadl_start_handle(mut self, handle: u32) -> Self {
        self.gpadl_start_handle = handle;
        self
    }

    pub fn ring_layout(mut self, layout: RingLayout) -> Self {
        self.ring_layout = layout;
        self
    }

    pub fn build(self) -> VmbusGuest {
        let responses = Arc::new(ResponseTable::default());
        let gpadls = Arc::new(GpadlRegistry::new(
            self.transport.clone(),
            responses.clone(),
            self.gpadl_start_handle,
            self.gpadl_timeout,
            self.teardown_timeout,
        ));
        VmbusGuest {
            inner: Arc::new(GuestInner {
                deps: ChannelDeps {
                    transport: self.transport,
                    allocator: self.allocator,
                    gpadls,
                    responses,
                    open_timeout: self.open_timeout,
                    ring_layout: self.ring_layout,
                },
                channels: Mutex::new(HashMap::new()),
                offers_delivered: AtomicBool::new(false),
            }),
        }
    }
}

/// A guest vmbus connection.
#[derive(Clone)]
pub struct VmbusGuest {
    inner: Arc<GuestInner>,
}

struct GuestInner {
    deps: ChannelDeps,
    channels: Mutex<HashMap<ChannelId, Arc<Channel>>>,
    offers_delivered: AtomicBool,
}

/// Delivers host messages to a [`VmbusGuest`] without keeping it alive.
#[derive(Clone)]
pub struct MessageSink(Weak<GuestInner>);

impl MessageSink {
    /// Handles a message from the host. Returns false if the connection no
    /// longer exists.
    pub fn deliver(&self, data: &[u8]) -> bool {
        match self.0.upgrade() {
            Some(inner) => {
                inner.handle_message(data);
                true
            }
            None => false,
        }
    }
}

impl VmbusGuest {
    pub fn builder(
        transport: Arc<dyn HostTransport>,
        allocator: Arc<dyn DmaAllocator>,
    ) -> VmbusGuestBuilder {
        VmbusGuestBuilder::new(transport, allocator)
    }

    /// Returns a handle for the message delivery path.
    pub fn message_sink(&self) -> MessageSink {
        MessageSink(Arc::downgrade(&self.inner))
    }

    /// Asks the host to send its channel offers.
    pub fn request_offers(&self) -> std::io::Result<()> {
        self.inner.offers_delivered.store(false, Ordering::Relaxed);
        self.inner
            .deps
            .transport
            .post_message(&OutgoingMessage::new(&protocol::RequestOffers {}))
    }

    /// Returns true once the host has sent every offer it had at the time of
    /// the last [`Self::request_offers`].
    pub fn all_offers_delivered(&self) -> bool {
        self.inner.offers_delivered.load(Ordering::Acquire)
    }

    /// Handles a control message from the host.
    pub fn handle_message(&self, data: &[u8]) {
        self.inner.handle_message(data)
    }

    pub fn channel(&self, channel_id: ChannelId) -> Option<Arc<Channel>> {
        self.inner.channels.lock().get(&channel_id).cloned()
    }

    /// Finds the offered channel with the given interface id, preferring the
    /// primary channel over subchannels.
    pub fn find_channel(&self, interface_id: &Guid) -> Option<Arc<Channel>> {
        self.inner
            .channels
            .lock()
            .values()
            .filter(|c| &c.offer().interface_id == interface_id)
            .min_by_key(|c| (c.offer().subchannel_index, c.id()))
            .cloned()
    }

    /// The offered channels, ordered by channel id.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<_> = self.inner.channels.lock().values().cloned().collect();
        channels.sort_by_key(|c| c.id());
        channels
    }

    /// Drains the receive ring of a channel after the host signaled it.
    /// Returns the number of packets delivered.
    pub fn handle_channel_interrupt(&self, channel_id: ChannelId) -> usize {
        match self.channel(channel_id) {
            Some(channel) => channel.handle_interrupt(),
            None => {
                tracing::debug!(channel_id = channel_id.0, "interrupt for unknown channel");
                0
            }
        }
    }

    pub fn gpadls(&self) -> &GpadlRegistry {
        &self.inner.deps.gpadls
    }
}

impl GuestInner {
    fn handle_message(&self, data: &[u8]) {
        let msg = match Message::parse(data) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "invalid message from host"
                );
                return;
            }
        };
        tracing::trace!(?msg, "received message");

        match msg {
            Message::OfferChannel(offer, ..) => self.handle_offer(&offer),
            Message::RescindChannelOffer(rescind, ..) => self.handle_rescind(rescind.channel_id),
            Message::AllOffersDelivered(..) => {
                tracing::debug!("all offers delivered");
                self.offers_delivered.store(true, Ordering::Release);
            }
            Message::GpadlCreated(created, ..) => self.complete(
                ResponseKey::GpadlCreated(created.gpadl_id),
                Response::GpadlCreated {
                    status: created.status,
                },
            ),
            Message::GpadlTorndown(torndown, ..) => self.complete(
                ResponseKey::GpadlTorndown(torndown.gpadl_id),
                Response::GpadlTorndown,
            ),
            Message::OpenResult(result, ..) => self.complete(
                ResponseKey::OpenResult(result.channel_id),
                Response::OpenResult {
                    status: result.status,
                },
            ),
            // Messages that should only be received by the host.
            Message::RequestOffers(..)
            | Message::OpenChannel(..)
            | Message::CloseChannel(..)
            | Message::GpadlHeader(..)
            | Message::GpadlBody(..)
            | Message::GpadlTeardown(..)
            | Message::RelIdReleased(..) => {
                tracing::warn!(?msg, "unexpected message from host");
            }
        }
    }

    fn complete(&self, key: ResponseKey, response: Response) {
        if !self.deps.responses.complete(key, response) {
            tracing::warn!(?key, ?response, "dropping stale host response");
        }
    }

    fn handle_offer(&self, offer: &protocol::OfferChannel) {
        let offer = Offer::from(offer);
        let mut channels = self.channels.lock();
        if channels.contains_key(&offer.channel_id) {
            tracing::warn!(channel_id = offer.channel_id.0, "duplicate offer");
            return;
        }
        tracing::info!(
            channel_id = offer.channel_id.0,
            interface_id = %offer.interface_id,
            instance_id = %offer.instance_id,
            "channel offered"
        );
        let channel = Channel::new(offer, self.deps.clone());
        channels.insert(channel.id(), Arc::new(channel));
    }

    fn handle_rescind(&self, channel_id: ChannelId) {
        let Some(channel) = self.channels.lock().remove(&channel_id) else {
            tracing::warn!(channel_id = channel_id.0, "rescind for unknown channel");
            return;
        };
        channel.revoke();
    }
}

#[cfg(test)]
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_host::TestEnv;
    use crate::test_host::TEST_CHANNEL;
    use crate::test_host::TEST_INSTANCE;
    use crate::test_host::TEST_INTERFACE;
    use guest_dma::PAGE_SIZE;
    use protocol::GpadlId;
    use protocol::MessageType;

    #[test]
    fn test_offers() {
        let env = TestEnv::new(RingLayout::Separate);
        let channels = env.guest.channels();
        assert_eq!(channels.len(), 1);
        let offer = channels[0].offer();
        assert_eq!(offer.channel_id, TEST_CHANNEL);
        assert_eq!(offer.instance_id, TEST_INSTANCE);
        assert_eq!(channels[0].status(), ChannelStatus::Closed);

        let channel = env.guest.find_channel(&TEST_INTERFACE).unwrap();
        assert_eq!(channel.id(), TEST_CHANNEL);
        assert!(env.guest.find_channel(&TEST_INSTANCE).is_none());
    }

    #[test]
    fn test_duplicate_offer_keeps_channel() {
        let env = TestEnv::new(RingLayout::Separate);
        let channel = env.guest.channel(TEST_CHANNEL).unwrap();
        channel.open(PAGE_SIZE, PAGE_SIZE, None).unwrap();
        env.guest.request_offers().unwrap();
        assert!(Arc::ptr_eq(
            &env.guest.channel(TEST_CHANNEL).unwrap(),
            &channel
        ));
        assert_eq!(channel.status(), ChannelStatus::Open);
    }

    #[test]
    fn test_rescind() {
        let env = TestEnv::new(RingLayout::Separate);
        let channel = env.guest.channel(TEST_CHANNEL).unwrap();
        channel.open(PAGE_SIZE, PAGE_SIZE, None).unwrap();
        env.host.rescind(TEST_CHANNEL.0);

        assert!(env.guest.channel(TEST_CHANNEL).is_none());
        assert_eq!(channel.status(), ChannelStatus::NotPresent);
        assert_eq!(env.host.count_posted(MessageType::REL_ID_RELEASED), 1);
        assert!(env.guest.gpadls().live_gpadls().is_empty());
        assert_eq!(env.pool.allocated_pages(), 0);
        assert!(matches!(
            channel.write_inband_packet(&[0; 8], false),
            Err(SendError::NotOpen)
        ));
        assert!(matches!(
            channel.open(PAGE_SIZE, PAGE_SIZE, None),
            Err(OpenError::NotPresent(TEST_CHANNEL))
        ));
        // Closing a rescinded channel does not talk to the host.
        channel.close();
        assert_eq!(env.host.count_posted(MessageType::CLOSE_CHANNEL), 0);

        // Unknown channels are ignored.
        env.host.rescind(42);
        assert_eq!(env.guest.handle_channel_interrupt(ChannelId(42)), 0);
    }

    #[test]
    fn test_stale_and_invalid_messages() {
        let env = TestEnv::new(RingLayout::Separate);
        env.host.send(&protocol::GpadlCreated {
            channel_id: TEST_CHANNEL,
            gpadl_id: GpadlId(0x1234),
            status: protocol::STATUS_SUCCESS,
        });
        env.host.send(&protocol::GpadlTorndown {
            gpadl_id: GpadlId(0x1234),
        });
        env.host.send(&protocol::OpenResult {
            channel_id: TEST_CHANNEL,
            open_id: 1,
            status: protocol::STATUS_SUCCESS as u32,
        });
        // Guest-to-host messages and garbage are dropped.
        env.host.send(&protocol::CloseChannel {
            channel_id: TEST_CHANNEL,
        });
        env.guest.handle_message(&[0xff; 3]);
        env.guest.handle_message(&[99, 0, 0, 0, 0, 0, 0, 0]);

        assert!(env.guest.gpadls().live_gpadls().is_empty());
        let channel = env.guest.channel(TEST_CHANNEL).unwrap();
        assert_eq!(channel.status(), ChannelStatus::Closed);
        channel.open(PAGE_SIZE, PAGE_SIZE, None).unwrap();
        assert_eq!(channel.status(), ChannelStatus::Open);
    }

    #[test]
    fn test_sink_outlives_guest() {
        let env = TestEnv::new(RingLayout::Separate);
        let sink = env.guest.message_sink();
        let data = OutgoingMessage::new(&protocol::AllOffersDelivered {});
        assert!(sink.deliver(data.data()));
        drop(env);
        assert!(!sink.deliver(data.data()));
    }
}
