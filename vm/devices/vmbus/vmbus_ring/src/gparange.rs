// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Page-list ranges, as used by GPADL registration messages and GPA direct
//! packets.
//!
//! A range is encoded as a sequence of 64-bit values: a [`GpaRange`] header
//! holding the byte count and the byte offset into the first page, followed by
//! one guest page number for each page the range touches.

use crate::PAGE_SIZE;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaRange {
    pub len: u32,
    pub offset: u32,
}

impl GpaRange {
    fn to_u64(self) -> u64 {
        self.len as u64 | ((self.offset as u64) << 32)
    }

    fn from_u64(value: u64) -> Self {
        Self {
            len: value as u32,
            offset: (value >> 32) as u32,
        }
    }
}

/// A byte range described by a list of guest page numbers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PagedRange<'a> {
    offset: usize,
    len: usize,
    gpns: &'a [u64],
}

impl<'a> PagedRange<'a> {
    /// Returns a range of `len` bytes starting `offset` bytes into the first
    /// page of `gpns`, or `None` if `gpns` holds the wrong number of pages.
    pub fn new(offset: usize, len: usize, gpns: &'a [u64]) -> Option<Self> {
        if offset >= PAGE_SIZE || len == 0 || len > u32::MAX as usize {
            return None;
        }
        if (offset + len).div_ceil(PAGE_SIZE) != gpns.len() {
            return None;
        }
        Some(Self { offset, len, gpns })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn gpns(&self) -> &'a [u64] {
        self.gpns
    }

    /// The number of 64-bit values this range occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        1 + self.gpns.len()
    }
}

/// An owned, encoded list of ranges.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GpaRangeBuf {
    buf: Vec<u64>,
    count: usize,
}

impl GpaRangeBuf {
    /// Validates and wraps `count` encoded ranges.
    pub fn new(count: usize, buf: Vec<u64>) -> Result<Self, Error> {
        let mut rem: &[u64] = &buf;
        for _ in 0..count {
            let (_, rest) = parse(rem)?;
            rem = rest;
        }
        if !rem.is_empty() {
            return Err(Error::TrailingData);
        }
        Ok(Self { buf, count })
    }

    pub fn iter(&self) -> GpaRangeIter<'_> {
        GpaRangeIter {
            buf: &self.buf,
            count: self.count,
        }
    }

    pub fn range_count(&self) -> usize {
        self.count
    }

    /// The encoded values, ready to be copied into a message or packet.
    pub fn range_buffer(&self) -> &[u64] {
        &self.buf
    }
}

impl<'a> FromIterator<PagedRange<'a>> for GpaRangeBuf {
    fn from_iter<I: IntoIterator<Item = PagedRange<'a>>>(iter: I) -> Self {
        let mut buf = Vec::new();
        let mut count = 0;
        for range in iter {
            buf.push(
                GpaRange {
                    len: range.len() as u32,
                    offset: range.offset() as u32,
                }
                .to_u64(),
            );
            buf.extend_from_slice(range.gpns());
            count += 1;
        }
        Self { buf, count }
    }
}

#[derive(Clone, Debug)]
pub struct GpaRangeIter<'a> {
    buf: &'a [u64],
    count: usize,
}

impl<'a> Iterator for GpaRangeIter<'a> {
    type Item = PagedRange<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.count == 0 {
            return None;
        }
        // Already validated by GpaRangeBuf::new or built from valid ranges.
        let (range, rest) = parse(self.buf).ok()?;
        self.count -= 1;
        self.buf = rest;
        Some(range)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("empty range")]
    EmptyRange,
    #[error("empty byte count")]
    EmptyByteCount,
    #[error("range too small")]
    RangeTooSmall,
    #[error("data after the last range")]
    TrailingData,
    #[error("integer overflow")]
    Overflow,
}

fn parse(buf: &[u64]) -> Result<(PagedRange<'_>, &[u64]), Error> {
    let (hdr, gpns) = buf.split_first().ok_or(Error::EmptyRange)?;
    let hdr = GpaRange::from_u64(*hdr);
    if hdr.len == 0 {
        return Err(Error::EmptyByteCount);
    }
    let offset = hdr.offset & 0xfff;
    let pages = (hdr
        .len
        .checked_add(4095)
        .ok_or(Error::Overflow)?
        .checked_add(offset)
        .ok_or(Error::Overflow)?) as usize
        / PAGE_SIZE;
    if gpns.len() < pages {
        return Err(Error::RangeTooSmall);
    }
    let (gpns, rest) = gpns.split_at(pages);
    let range =
        PagedRange::new(offset as usize, hdr.len as usize, gpns).ok_or(Error::RangeTooSmall)?;
    Ok((range, rest))
}
