// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ring buffer memory backed by a DMA buffer.

use guest_dma::DmaBuffer;
use guest_dma::PAGE_SIZE;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use vmbus_ring::PagedMemory;
use vmbus_ring::PagedRingMem;
use vmbus_ring::CONTROL_WORD_COUNT;

/// One ring within a DMA buffer: a control page at `first_page`, followed by
/// `data_pages` data pages.
///
/// Both rings of a channel may live in the same buffer, each holding a
/// reference to it.
#[derive(Debug, Clone)]
pub struct DmaRingPages {
    buffer: Arc<DmaBuffer>,
    first_page: usize,
    data_pages: usize,
}

/// Ring memory for a channel ring.
pub type DmaRingMem = PagedRingMem<DmaRingPages>;

impl DmaRingPages {
    /// Returns the ring starting at page `first_page` of `buffer`, or `None`
    /// if the buffer is too small to hold the control page and at least one
    /// data page.
    pub fn new(buffer: Arc<DmaBuffer>, first_page: usize, data_pages: usize) -> Option<Self> {
        if data_pages == 0 || first_page + 1 + data_pages > buffer.page_count() {
            return None;
        }
        Some(Self {
            buffer,
            first_page,
            data_pages,
        })
    }

    /// The buffer the ring lives in.
    pub fn buffer(&self) -> &Arc<DmaBuffer> {
        &self.buffer
    }
}

impl PagedMemory for DmaRingPages {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        self.buffer
            .page_words(self.first_page)
            .first_chunk()
            .expect("a page holds the control words")
    }

    fn data_page_count(&self) -> usize {
        self.data_pages
    }

    fn data(&self, page: usize) -> &[AtomicU8; PAGE_SIZE] {
        self.buffer
            .page(self.first_page + 1 + page % self.data_pages)
    }
}
