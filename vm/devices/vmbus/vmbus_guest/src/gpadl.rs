// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GPADL registration: describing a DMA buffer to the host by its page list
//! and negotiating a handle for it.

use crate::response::Response;
use crate::response::ResponseKey;
use crate::response::ResponseTable;
use crate::HostTransport;
use guest_dma::DmaBuffer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::OutgoingMessage;
use vmbus_ring::gparange::GpaRangeBuf;
use vmbus_ring::gparange::PagedRange;
use zerocopy::IntoBytes;

/// The first GPADL handle handed out by a registry. Lower values are left to
/// the host.
pub const GPADL_START_HANDLE: u32 = 0xE1E10;

#[derive(Debug, Error)]
pub enum GpadlError {
    #[error("timed out waiting for the host to create gpadl {0}")]
    Timeout(GpadlId),
    #[error("host rejected gpadl {gpadl_id} with status {status:#x}")]
    Rejected { gpadl_id: GpadlId, status: i32 },
    #[error("timed out waiting for the host to tear down gpadl {0}, handle leaked")]
    TeardownTimeout(GpadlId),
    #[error("channel {0} was rescinded")]
    Rescinded(ChannelId),
    #[error("buffer too large to describe in one gpadl")]
    TooLarge,
    #[error("failed to post gpadl message")]
    Post(#[source] std::io::Error),
}

#[derive(Debug)]
struct LiveGpadl {
    channel_id: ChannelId,
    // Keeps the pages pinned while the host may access them.
    buffer: Arc<DmaBuffer>,
}

#[derive(Debug, Default)]
struct RegistryState {
    live: HashMap<GpadlId, LiveGpadl>,
    leaked: HashMap<GpadlId, LiveGpadl>,
    in_flight: HashMap<GpadlId, (ChannelId, ResponseKey)>,
}

/// Issues GPADL handles and tracks the buffers registered under them.
///
/// Handles come from a counter owned by the registry and are never reissued,
/// including after teardown.
pub struct GpadlRegistry {
    transport: Arc<dyn HostTransport>,
    responses: Arc<ResponseTable>,
    next_handle: AtomicU32,
    create_timeout: Duration,
    teardown_timeout: Duration,
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for GpadlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpadlRegistry")
            .field("next_handle", &self.next_handle)
            .field("state", &self.state)
            .finish()
    }
}

impl GpadlRegistry {
    pub(crate) fn new(
        transport: Arc<dyn HostTransport>,
        responses: Arc<ResponseTable>,
        start_handle: u32,
        create_timeout: Duration,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            responses,
            next_handle: AtomicU32::new(start_handle),
            create_timeout,
            teardown_timeout,
            state: Default::default(),
        }
    }

    fn allocate_handle(&self) -> GpadlId {
        GpadlId(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers `buffer` with the host for use by `channel_id`, blocking
    /// until the host reports the result or the create timeout elapses.
    ///
    /// On success the registry holds a reference to the buffer until the
    /// GPADL is torn down.
    pub fn register(
        &self,
        channel_id: ChannelId,
        buffer: &Arc<DmaBuffer>,
    ) -> Result<GpadlId, GpadlError> {
        let pfns = buffer.pfns();
        let range = PagedRange::new(0, buffer.len(), &pfns).ok_or(GpadlError::TooLarge)?;
        let ranges: GpaRangeBuf = std::iter::once(range).collect();
        let values = ranges.range_buffer();
        let len: u16 = (values.len() * size_of::<u64>())
            .try_into()
            .map_err(|_| GpadlError::TooLarge)?;

        let gpadl_id = self.allocate_handle();
        tracing::debug!(
            channel_id = channel_id.0,
            gpadl_id = %gpadl_id,
            pages = pfns.len(),
            "registering gpadl"
        );

        let key = ResponseKey::GpadlCreated(gpadl_id);
        self.responses.expect(key);
        self.state.lock().in_flight.insert(gpadl_id, (channel_id, key));
        let result = self
            .post_gpadl(channel_id, gpadl_id, len, ranges.range_count() as u16, values)
            .map(|()| self.responses.wait(key, self.create_timeout));
        self.state.lock().in_flight.remove(&gpadl_id);

        match result {
            Err(err) => {
                self.responses.cancel(key);
                Err(GpadlError::Post(err))
            }
            Ok(Some(Response::GpadlCreated { status })) if status == protocol::STATUS_SUCCESS => {
                self.state.lock().live.insert(
                    gpadl_id,
                    LiveGpadl {
                        channel_id,
                        buffer: buffer.clone(),
                    },
                );
                tracing::debug!(channel_id = channel_id.0, gpadl_id = %gpadl_id, "gpadl created");
                Ok(gpadl_id)
            }
            Ok(Some(Response::GpadlCreated { status })) => {
                tracing::warn!(
                    channel_id = channel_id.0,
                    gpadl_id = %gpadl_id,
                    status,
                    "host rejected gpadl"
                );
                Err(GpadlError::Rejected { gpadl_id, status })
            }
            Ok(Some(Response::Rescinded)) => Err(GpadlError::Rescinded(channel_id)),
            Ok(Some(response)) => {
                tracing::warn!(?response, gpadl_id = %gpadl_id, "unexpected gpadl response");
                Err(GpadlError::Timeout(gpadl_id))
            }
            Ok(None) => {
                tracing::warn!(
                    channel_id = channel_id.0,
                    gpadl_id = %gpadl_id,
                    "timed out waiting for gpadl creation"
                );
                Err(GpadlError::Timeout(gpadl_id))
            }
        }
    }

    /// Sends the header message with as many values as fit, then body
    /// messages for the rest.
    fn post_gpadl(
        &self,
        channel_id: ChannelId,
        gpadl_id: GpadlId,
        len: u16,
        count: u16,
        values: &[u64],
    ) -> std::io::Result<()> {
        let (first, remaining) =
            values.split_at(values.len().min(protocol::GpadlHeader::MAX_DATA_VALUES));
        let header = protocol::GpadlHeader {
            channel_id,
            gpadl_id,
            len,
            count,
        };
        self.transport
            .post_message(&OutgoingMessage::with_data(&header, first.as_bytes()))?;

        let body = protocol::GpadlBody { rsvd: 0, gpadl_id };
        for chunk in remaining.chunks(protocol::GpadlBody::MAX_DATA_VALUES) {
            self.transport
                .post_message(&OutgoingMessage::with_data(&body, chunk.as_bytes()))?;
        }
        Ok(())
    }

    /// Tears down a GPADL, blocking until the host acknowledges it or the
    /// teardown timeout elapses.
    ///
    /// On timeout the handle and its buffer are moved to the leaked set: the
    /// host may still be using the pages, so they stay pinned and the handle
    /// is never reused.
    pub fn teardown(&self, gpadl_id: GpadlId) -> Result<(), GpadlError> {
        let Some(channel_id) = self.state.lock().live.get(&gpadl_id).map(|g| g.channel_id) else {
            tracing::debug!(gpadl_id = %gpadl_id, "gpadl already released");
            return Ok(());
        };

        tracing::debug!(channel_id = channel_id.0, gpadl_id = %gpadl_id, "tearing down gpadl");
        let key = ResponseKey::GpadlTorndown(gpadl_id);
        self.responses.expect(key);
        self.state.lock().in_flight.insert(gpadl_id, (channel_id, key));
        let result = self
            .transport
            .post_message(&OutgoingMessage::new(&protocol::GpadlTeardown {
                channel_id,
                gpadl_id,
            }))
            .map(|()| self.responses.wait(key, self.teardown_timeout));
        let mut state = self.state.lock();
        state.in_flight.remove(&gpadl_id);

        match result {
            Ok(Some(Response::GpadlTorndown)) => {
                state.live.remove(&gpadl_id);
                tracing::debug!(channel_id = channel_id.0, gpadl_id = %gpadl_id, "gpadl torn down");
                Ok(())
            }
            Ok(Some(Response::Rescinded)) => {
                // The host released the channel and its gpadls.
                state.live.remove(&gpadl_id);
                Ok(())
            }
            Err(_) | Ok(_) => {
                if result.is_err() {
                    self.responses.cancel(key);
                }
                if let Some(gpadl) = state.live.remove(&gpadl_id) {
                    state.leaked.insert(gpadl_id, gpadl);
                }
                tracing::warn!(
                    channel_id = channel_id.0,
                    gpadl_id = %gpadl_id,
                    "gpadl teardown not acknowledged, leaking handle and buffer"
                );
                Err(GpadlError::TeardownTimeout(gpadl_id))
            }
        }
    }

    /// Drops all GPADLs of a rescinded channel without talking to the host,
    /// failing any registration or teardown still waiting for a response.
    pub(crate) fn forget_channel(&self, channel_id: ChannelId) {
        let mut state = self.state.lock();
        state.live.retain(|_, g| g.channel_id != channel_id);
        let waiting: Vec<_> = state
            .in_flight
            .values()
            .filter(|(id, _)| *id == channel_id)
            .map(|(_, key)| *key)
            .collect();
        drop(state);
        for key in waiting {
            self.responses.complete(key, Response::Rescinded);
        }
    }

    /// The GPADLs currently registered with the host.
    pub fn live_gpadls(&self) -> Vec<GpadlId> {
        let mut ids: Vec<_> = self.state.lock().live.keys().copied().collect();
        ids.sort();
        ids
    }

    /// The GPADLs whose teardown was never acknowledged.
    pub fn leaked_gpadls(&self) -> Vec<GpadlId> {
        let mut ids: Vec<_> = self.state.lock().leaked.keys().copied().collect();
        ids.sort();
        ids
    }
}
