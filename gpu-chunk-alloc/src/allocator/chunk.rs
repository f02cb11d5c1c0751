// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::location::LocationId;
use crate::{
    layout::{align_up, DeviceLayout},
    DeviceSize,
};
use std::{collections::BTreeMap, ptr::NonNull};

/// Identifies a chunk within its allocator.
///
/// Chunk IDs are never reused by the same [`ChunkCreator`], so a stale ID can never be mistaken
/// for a different chunk.
///
/// [`ChunkCreator`]: super::ChunkCreator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub(crate) u64);

/// A contiguous range of free memory within a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FreeRange {
    /// The offset of the range from the start of the chunk.
    pub offset: DeviceSize,

    /// The size of the range in bytes.
    pub size: DeviceSize,
}

impl FreeRange {
    /// Returns the offset one past the end of the range.
    #[inline]
    pub fn end(&self) -> DeviceSize {
        self.offset + self.size
    }

    /// Tries to place a memory block of the given `layout` at the lowest aligned offset within
    /// the range.
    #[inline]
    pub fn fit(&self, layout: DeviceLayout) -> Option<Fit> {
        // This can't overflow because `DeviceLayout` guarantees that its alignment is smaller
        // than `DeviceLayout::MAX_SIZE`, and so are the offsets within a chunk.
        let offset = align_up(self.offset, layout.alignment());
        let end = offset.checked_add(layout.size())?;

        (end <= self.end()).then(|| Fit {
            offset,
            slack: self.end() - end,
        })
    }
}

/// Where a [`FitStrategy`] decided to place a memory block.
///
/// [`FitStrategy`]: super::FitStrategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fit {
    /// The aligned offset of the memory block from the start of the chunk.
    pub offset: DeviceSize,

    /// How many bytes of the chosen free range are left over behind the memory block.
    pub slack: DeviceSize,
}

/// Pointer to the start of a mapped chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MappedPtr(NonNull<u8>);

// SAFETY: The pointer refers to device memory owned by the chunk. Reads and writes through it are
// only exposed through `unsafe` accessors whose callers are responsible for synchronization.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    #[inline]
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        MappedPtr(ptr)
    }

    #[inline]
    pub(crate) fn as_non_null(self) -> NonNull<u8> {
        self.0
    }

    /// Returns the pointer `offset` bytes further.
    ///
    /// # Safety
    ///
    /// - `offset` must be within the chunk.
    #[inline]
    pub(crate) unsafe fn add(self, offset: DeviceSize) -> Self {
        MappedPtr(unsafe { self.0.add(offset as usize) })
    }
}

/// A suballocated interval of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Occupied {
    pub(crate) size: DeviceSize,
    pub(crate) location: LocationId,
}

/// One native memory allocation, subdivided into free and occupied intervals.
///
/// Both kinds of interval are kept in maps keyed by offset. Together they partition
/// `[0, size)`: every byte of the chunk belongs to exactly one interval, and no two free intervals
/// are ever next to each other because freeing always coalesces.
#[derive(Debug)]
pub(crate) struct Chunk<M> {
    id: ChunkId,
    memory: M,
    size: DeviceSize,
    mapped_ptr: Option<MappedPtr>,
    // Offset to size.
    free: BTreeMap<DeviceSize, DeviceSize>,
    occupied: BTreeMap<DeviceSize, Occupied>,
    // Total memory remaining in the chunk, including alignment padding.
    free_size: DeviceSize,
}

impl<M: Copy> Chunk<M> {
    pub(crate) fn new(
        id: ChunkId,
        memory: M,
        size: DeviceSize,
        mapped_ptr: Option<MappedPtr>,
    ) -> Self {
        debug_assert!(size != 0 && size <= DeviceLayout::MAX_SIZE);

        Chunk {
            id,
            memory,
            size,
            mapped_ptr,
            free: BTreeMap::from([(0, size)]),
            occupied: BTreeMap::new(),
            free_size: size,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> ChunkId {
        self.id
    }

    #[inline]
    pub(crate) fn memory(&self) -> M {
        self.memory
    }

    #[inline]
    pub(crate) fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub(crate) fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.mapped_ptr
    }

    #[inline]
    pub(crate) fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    #[inline]
    pub(crate) fn used_size(&self) -> DeviceSize {
        self.size - self.free_size
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }

    #[inline]
    pub(crate) fn allocation_count(&self) -> usize {
        self.occupied.len()
    }

    #[inline]
    pub(crate) fn free_interval_count(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn largest_free_interval(&self) -> DeviceSize {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Returns the free ranges in offset order.
    pub(crate) fn free_ranges(&self) -> impl Iterator<Item = FreeRange> + '_ {
        self.free
            .iter()
            .map(|(&offset, &size)| FreeRange { offset, size })
    }

    /// Returns the free ranges in offset order, cut off at `limit`.
    pub(crate) fn free_ranges_below(
        &self,
        limit: DeviceSize,
    ) -> impl Iterator<Item = FreeRange> + '_ {
        self.free.range(..limit).map(move |(&offset, &size)| FreeRange {
            offset,
            size: DeviceSize::min(offset + size, limit) - offset,
        })
    }

    /// Returns the occupied intervals in offset order.
    pub(crate) fn occupied(&self) -> impl Iterator<Item = (DeviceSize, Occupied)> + '_ {
        self.occupied.iter().map(|(&offset, &occupied)| (offset, occupied))
    }

    #[inline]
    pub(crate) fn occupied_at(&self, offset: DeviceSize) -> Option<Occupied> {
        self.occupied.get(&offset).copied()
    }

    /// Marks `offset..offset + size` as occupied by `location`. The range must lie within a single
    /// free interval.
    pub(crate) fn carve(&mut self, offset: DeviceSize, size: DeviceSize, location: LocationId) {
        let Some((&start, &len)) = self.free.range(..=offset).next_back() else {
            panic!("attempted to carve chunk {:?} at {} before any free range", self.id, offset);
        };

        let end = offset + size;
        let free_end = start + len;
        assert!(
            size != 0 && end <= free_end,
            "attempted to carve {}..{} out of chunk {:?}, but only {}..{} is free",
            offset,
            end,
            self.id,
            start,
            free_end,
        );

        self.free.remove(&start);

        if offset > start {
            self.free.insert(start, offset - start);
        }

        if free_end > end {
            self.free.insert(end, free_end - end);
        }

        self.occupied.insert(offset, Occupied { size, location });
        self.free_size -= size;
    }

    /// Returns the occupied interval at `offset` to the free list, coalescing it with free
    /// neighbours.
    pub(crate) fn release(&mut self, offset: DeviceSize) -> Option<Occupied> {
        let occupied = self.occupied.remove(&offset)?;
        let end = offset + occupied.size;
        let mut start = offset;
        let mut len = occupied.size;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }

        if let Some(next_len) = self.free.remove(&end) {
            len += next_len;
        }

        self.free.insert(start, len);
        self.free_size += occupied.size;

        Some(occupied)
    }

    /// Panics if the intervals don't partition the chunk or two free intervals are adjacent.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut intervals = self
            .free
            .iter()
            .map(|(&offset, &size)| (offset, size, true))
            .chain(
                self.occupied
                    .iter()
                    .map(|(&offset, occupied)| (offset, occupied.size, false)),
            )
            .collect::<Vec<_>>();
        intervals.sort_unstable_by_key(|&(offset, _, _)| offset);

        let mut cursor = 0;
        let mut prev_free = false;

        for (offset, size, is_free) in intervals {
            assert_eq!(offset, cursor, "gap or overlap at offset {offset}");
            assert!(size != 0);
            assert!(!(prev_free && is_free), "uncoalesced free intervals at {offset}");
            cursor = offset + size;
            prev_free = is_free;
        }

        assert_eq!(cursor, self.size);
        assert_eq!(self.free_size, self.free.values().sum::<DeviceSize>());
    }
}
