// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Correlation of host control-message responses with the guest operations
//! waiting for them.
//!
//! A waiter registers its key before posting the request, so a response that
//! arrives before the waiter blocks is not lost. Responses are keyed by GPADL
//! handle or channel id, never by arrival order.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ResponseKey {
    GpadlCreated(GpadlId),
    GpadlTorndown(GpadlId),
    OpenResult(ChannelId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Response {
    GpadlCreated { status: i32 },
    GpadlTorndown,
    OpenResult { status: u32 },
    /// The channel was rescinded while the request was outstanding.
    Rescinded,
}

#[derive(Debug, Default)]
pub(crate) struct ResponseTable {
    slots: Mutex<HashMap<ResponseKey, Option<Response>>>,
    cond: Condvar,
}

impl ResponseTable {
    /// Registers interest in `key`. Must be called before the request is
    /// posted.
    pub fn expect(&self, key: ResponseKey) {
        let old = self.slots.lock().insert(key, None);
        if old.is_some() {
            tracing::warn!(?key, "replaced an outstanding response wait");
        }
    }

    /// Stores a response for a registered waiter. Returns false if nobody is
    /// waiting for `key`, in which case the response is stale.
    ///
    /// Never blocks beyond the table lock, so it is safe to call from the
    /// message delivery path.
    pub fn complete(&self, key: ResponseKey, response: Response) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(&key) {
            Some(slot @ None) => {
                *slot = Some(response);
                self.cond.notify_all();
                true
            }
            Some(Some(_)) | None => false,
        }
    }

    /// Waits up to `timeout` for the response to `key`, removing the
    /// registration either way.
    pub fn wait(&self, key: ResponseKey, timeout: Duration) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();
        loop {
            match slots.get(&key) {
                Some(Some(_)) | None => break,
                Some(None) => {}
            }
            if self.cond.wait_until(&mut slots, deadline).timed_out() {
                break;
            }
        }
        slots.remove(&key).flatten()
    }

    /// Drops a registration whose request could not be posted.
    pub fn cancel(&self, key: ResponseKey) {
        self.slots.lock().remove(&key);
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.slots.lock().len()
    }
}
