// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Physically contiguous, page-aligned memory for buffers shared with the
//! host.
//!
//! A [`DmaPool`] models a window of guest physical memory starting at a fixed
//! page number. Buffers carved out of it know both their virtual mapping (the
//! atomic byte views returned by [`DmaBuffer::page`]) and their guest physical
//! addresses, which is what the host needs in order to map the same pages.

// UNSAFETY: Reinterpreting the pool's 64-bit atomic words as byte and 32-bit
// atomics.
#![expect(unsafe_code)]

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// The 4KB page size used for all shared buffers.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

const WORDS_PER_PAGE: usize = PAGE_SIZE / size_of::<u64>();

/// An error allocating a DMA buffer.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("cannot allocate a zero-length dma buffer")]
    ZeroLength,
    #[error("out of contiguous memory: {requested} pages requested, {free} pages free")]
    OutOfMemory { requested: usize, free: usize },
}

/// An object that can allocate memory to share with the host.
pub trait DmaAllocator: Send + Sync {
    /// Allocates a zeroed, physically contiguous buffer of at least `len`
    /// bytes, rounded up to whole pages.
    fn allocate_dma_buffer(&self, len: usize) -> Result<DmaBuffer, AllocationError>;
}

/// A window of guest physical memory that DMA buffers are allocated from.
#[derive(Clone)]
pub struct DmaPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    base_pfn: u64,
    page_count: usize,
    words: Box<[AtomicU64]>,
    state: Mutex<AllocState>,
}

struct AllocState {
    bitmap: Vec<u64>,
    allocated: usize,
}

impl Debug for DmaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaPool")
            .field("base_pfn", &format_args!("{:#x}", self.inner.base_pfn))
            .field("page_count", &self.inner.page_count)
            .field("allocated", &self.allocated_pages())
            .finish()
    }
}

impl PoolInner {
    fn page_bytes(&self, index: usize) -> &[AtomicU8; PAGE_SIZE] {
        assert!(index < self.page_count, "page index out of range");
        let words = &self.words[index * WORDS_PER_PAGE..][..WORDS_PER_PAGE];
        // SAFETY: the slice covers exactly PAGE_SIZE bytes of atomic storage.
        // AtomicU8 has the same size as u8 and alignment 1, and atomics permit
        // shared mutation, so viewing the words as bytes is sound. Mixed-size
        // atomic accesses up to 8 bytes are tolerated by all supported
        // targets.
        unsafe { &*words.as_ptr().cast::<[AtomicU8; PAGE_SIZE]>() }
    }

    fn page_words(&self, index: usize) -> &[AtomicU32; PAGE_SIZE / 4] {
        assert!(index < self.page_count, "page index out of range");
        let words = &self.words[index * WORDS_PER_PAGE..][..WORDS_PER_PAGE];
        // SAFETY: as in `page_bytes`; the storage is 8-byte aligned, which
        // satisfies AtomicU32's alignment.
        unsafe { &*words.as_ptr().cast::<[AtomicU32; PAGE_SIZE / 4]>() }
    }

    fn page_index(&self, pfn: u64) -> Option<usize> {
        let index = usize::try_from(pfn.checked_sub(self.base_pfn)?).ok()?;
        (index < self.page_count).then_some(index)
    }
}

impl DmaPool {
    /// Creates a pool of `page_count` pages whose first page has guest page
    /// number `base_pfn`.
    pub fn new(base_pfn: u64, page_count: usize) -> Self {
        let mut words = Vec::new();
        words.resize_with(page_count * WORDS_PER_PAGE, Default::default);
        Self {
            inner: Arc::new(PoolInner {
                base_pfn,
                page_count,
                words: words.into_boxed_slice(),
                state: Mutex::new(AllocState {
                    bitmap: vec![0; page_count.div_ceil(64)],
                    allocated: 0,
                }),
            }),
        }
    }

    /// The page number of the first page in the pool.
    pub fn base_pfn(&self) -> u64 {
        self.inner.base_pfn
    }

    /// The total number of pages in the pool.
    pub fn page_count(&self) -> usize {
        self.inner.page_count
    }

    /// The number of pages currently handed out.
    pub fn allocated_pages(&self) -> usize {
        self.inner.state.lock().allocated
    }

    /// The number of pages not currently handed out. They are not necessarily
    /// contiguous.
    pub fn free_pages(&self) -> usize {
        self.inner.page_count - self.allocated_pages()
    }

    /// Allocates a zeroed buffer of `len` bytes rounded up to whole pages.
    pub fn alloc(&self, len: usize) -> Result<DmaBuffer, AllocationError> {
        if len == 0 {
            return Err(AllocationError::ZeroLength);
        }
        let count = len.div_ceil(PAGE_SIZE);

        // Find a contiguous free range by scanning the bitmap.
        let first_page = {
            let mut state = self.inner.state.lock();
            let mut i = 0;
            let mut contig = 0;
            while contig < count && i < self.inner.page_count {
                if state.bitmap[i / 64] & 1 << (i % 64) != 0 {
                    contig = 0;
                } else {
                    contig += 1;
                }
                i += 1;
            }
            if contig < count {
                return Err(AllocationError::OutOfMemory {
                    requested: count,
                    free: self.inner.page_count - state.allocated,
                });
            }
            let start = i - contig;
            for j in start..i {
                state.bitmap[j / 64] |= 1 << (j % 64);
            }
            state.allocated += count;
            start
        };

        let buffer = DmaBuffer {
            pool: self.inner.clone(),
            first_page,
            page_count: count,
        };
        buffer.fill(0);
        tracing::trace!(
            gpa = buffer.gpa(),
            pages = count,
            "allocated dma buffer"
        );
        Ok(buffer)
    }

    /// Returns the page with guest page number `pfn`, or `None` if it is
    /// outside the pool.
    pub fn page(&self, pfn: u64) -> Option<&[AtomicU8; PAGE_SIZE]> {
        let index = self.inner.page_index(pfn)?;
        Some(self.inner.page_bytes(index))
    }

    /// Returns the page with guest page number `pfn` as 32-bit words.
    pub fn page_words(&self, pfn: u64) -> Option<&[AtomicU32; PAGE_SIZE / 4]> {
        let index = self.inner.page_index(pfn)?;
        Some(self.inner.page_words(index))
    }
}

impl DmaAllocator for DmaPool {
    fn allocate_dma_buffer(&self, len: usize) -> Result<DmaBuffer, AllocationError> {
        self.alloc(len)
    }
}

/// A physically contiguous buffer allocated from a [`DmaPool`].
///
/// The pages return to the pool when the buffer is dropped or explicitly
/// released.
pub struct DmaBuffer {
    pool: Arc<PoolInner>,
    first_page: usize,
    page_count: usize,
}

impl Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("gpa", &format_args!("{:#x}", self.gpa()))
            .field("len", &format_args!("{:#x}", self.len()))
            .finish()
    }
}

impl DmaBuffer {
    /// The guest page number of the first page.
    pub fn first_pfn(&self) -> u64 {
        self.pool.base_pfn + self.first_page as u64
    }

    /// The guest physical address of the buffer.
    pub fn gpa(&self) -> u64 {
        self.first_pfn() * PAGE_SIZE64
    }

    /// The length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    /// Always false; buffers have at least one page.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The number of pages in the buffer.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// The guest page numbers backing the buffer, in order.
    pub fn pfns(&self) -> Vec<u64> {
        let first = self.first_pfn();
        (first..first + self.page_count as u64).collect()
    }

    /// Returns page `index` of the buffer.
    ///
    /// Panics if `index` is out of range.
    pub fn page(&self, index: usize) -> &[AtomicU8; PAGE_SIZE] {
        assert!(index < self.page_count, "page index out of range");
        self.pool.page_bytes(self.first_page + index)
    }

    /// Returns page `index` of the buffer as 32-bit words.
    ///
    /// Panics if `index` is out of range.
    pub fn page_words(&self, index: usize) -> &[AtomicU32; PAGE_SIZE / 4] {
        assert!(index < self.page_count, "page index out of range");
        self.pool.page_words(self.first_page + index)
    }

    /// Reads from the buffer at `offset` into `data`.
    pub fn read_at(&self, mut offset: usize, mut data: &mut [u8]) {
        assert!(offset + data.len() <= self.len(), "read out of range");
        while !data.is_empty() {
            let page_offset = offset % PAGE_SIZE;
            let len = data.len().min(PAGE_SIZE - page_offset);
            let (this, next) = data.split_at_mut(len);
            let page = self.page(offset / PAGE_SIZE);
            for (d, s) in this.iter_mut().zip(&page[page_offset..]) {
                *d = s.load(Ordering::Relaxed);
            }
            offset += len;
            data = next;
        }
    }

    /// Writes `data` into the buffer at `offset`.
    pub fn write_at(&self, mut offset: usize, mut data: &[u8]) {
        assert!(offset + data.len() <= self.len(), "write out of range");
        while !data.is_empty() {
            let page_offset = offset % PAGE_SIZE;
            let len = data.len().min(PAGE_SIZE - page_offset);
            let (this, next) = data.split_at(len);
            let page = self.page(offset / PAGE_SIZE);
            for (d, s) in page[page_offset..].iter().zip(this) {
                d.store(*s, Ordering::Relaxed);
            }
            offset += len;
            data = next;
        }
    }

    /// Fills the whole buffer with `value`.
    pub fn fill(&self, value: u8) {
        let word = u64::from_ne_bytes([value; 8]);
        let start = self.first_page * WORDS_PER_PAGE;
        for w in &self.pool.words[start..start + self.page_count * WORDS_PER_PAGE] {
            w.store(word, Ordering::Relaxed);
        }
    }

    /// Returns the pages to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        for page in self.first_page..self.first_page + self.page_count {
            state.bitmap[page / 64] &= !(1 << (page % 64));
        }
        state.allocated -= self.page_count;
        tracing::trace!(
            gpa = (self.pool.base_pfn + self.first_page as u64) * PAGE_SIZE64,
            pages = self.page_count,
            "released dma buffer"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rounds_to_pages() {
        let pool = DmaPool::new(0x100, 8);
        let buf = pool.alloc(5000).unwrap();
        assert_eq!(buf.len(), 2 * PAGE_SIZE);
        assert_eq!(buf.page_count(), 2);
        assert_eq!(buf.gpa(), 0x100 * PAGE_SIZE64);
        assert_eq!(buf.pfns(), vec![0x100, 0x101]);
        assert_eq!(pool.allocated_pages(), 2);
    }

    #[test]
    fn test_zero_length() {
        let pool = DmaPool::new(0, 4);
        assert!(matches!(pool.alloc(0), Err(AllocationError::ZeroLength)));
    }

    #[test]
    fn test_out_of_memory() {
        let pool = DmaPool::new(0, 4);
        let _a = pool.alloc(3 * PAGE_SIZE).unwrap();
        match pool.alloc(2 * PAGE_SIZE) {
            Err(AllocationError::OutOfMemory { requested, free }) => {
                assert_eq!(requested, 2);
                assert_eq!(free, 1);
            }
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn test_contiguous_after_fragmentation() {
        let pool = DmaPool::new(0x10, 6);
        let a = pool.alloc(PAGE_SIZE).unwrap();
        let b = pool.alloc(PAGE_SIZE).unwrap();
        let c = pool.alloc(PAGE_SIZE).unwrap();
        b.release();
        // The single free page between `a` and `c` is too small.
        let d = pool.alloc(2 * PAGE_SIZE).unwrap();
        assert_eq!(d.first_pfn(), 0x13);
        drop((a, c));
        assert_eq!(pool.allocated_pages(), 2);
        drop(d);
        assert_eq!(pool.free_pages(), 6);
    }

    #[test]
    fn test_reused_pages_are_zeroed() {
        let pool = DmaPool::new(0, 2);
        let buf = pool.alloc(PAGE_SIZE).unwrap();
        buf.fill(0xcc);
        buf.release();
        let buf = pool.alloc(PAGE_SIZE).unwrap();
        let mut data = [0xffu8; 64];
        buf.read_at(PAGE_SIZE - 64, &mut data);
        assert_eq!(data, [0; 64]);
    }

    #[test]
    fn test_access_by_pfn() {
        let pool = DmaPool::new(0x200, 4);
        let buf = pool.alloc(2 * PAGE_SIZE).unwrap();
        buf.write_at(PAGE_SIZE - 2, &[1, 2, 3, 4]);
        let page = pool.page(0x200).unwrap();
        assert_eq!(page[PAGE_SIZE - 1].load(Ordering::Relaxed), 2);
        let page = pool.page(0x201).unwrap();
        assert_eq!(page[1].load(Ordering::Relaxed), 4);
        assert!(pool.page(0x1ff).is_none());
        assert!(pool.page(0x204).is_none());

        buf.page_words(1)[0].store(0x1234_5678, Ordering::Relaxed);
        assert_eq!(
            pool.page_words(0x201).unwrap()[0].load(Ordering::Relaxed),
            0x1234_5678
        );
    }
}
