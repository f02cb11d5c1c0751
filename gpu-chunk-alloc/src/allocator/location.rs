// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    chunk::{ChunkId, MappedPtr},
    defrag::Epoch,
};
use crate::DeviceSize;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Identifies a memory location for its whole lifetime.
///
/// Unlike the placement, this never changes when the location is relocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationId(pub(crate) u64);

impl LocationId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        LocationId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies an allocator, so that memory locations can be routed back to the allocator they came
/// from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorId(pub(crate) u64);

impl AllocatorId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        AllocatorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a memory location currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    /// The chunk that the location is suballocated from.
    pub chunk: ChunkId,

    /// The offset of the location from the start of the chunk.
    pub offset: DeviceSize,

    /// The size of the location in bytes, as required by the resource.
    pub size: DeviceSize,

    pub(crate) mapped_ptr: Option<MappedPtr>,
}

/// A snapshot of a memory location, handed to a [`RelocationGuard`].
///
/// [`RelocationGuard`]: super::RelocationGuard
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocationInfo {
    pub id: LocationId,
    pub memory_type_index: u32,
    pub placement: Placement,

    /// The latest epoch the location was marked as used in, or [`None`] if it never was.
    pub last_use: Option<Epoch>,
}

/// A suballocation of a chunk, together with the native resource bound to it.
///
/// This is the only thing a client keeps after allocating. It can't be cloned, and the only way
/// to get rid of it properly is to give it back to the allocator it came from, which destroys the
/// resource and frees the memory. Dropping it instead leaks both.
///
/// The defragmenter may move the location to a different chunk or offset. When it does, it binds
/// a new resource at the new placement and swaps it in, so the placement and resource returned by
/// this handle are only stable between defragmentation passes.
pub struct MemoryLocation<R> {
    shared: Arc<LocationShared<R>>,
}

impl<R> MemoryLocation<R> {
    pub(crate) fn new(
        id: LocationId,
        allocator_id: AllocatorId,
        memory_type_index: u32,
        placement: Placement,
        resource: R,
    ) -> Self {
        MemoryLocation {
            shared: Arc::new(LocationShared {
                id,
                allocator_id,
                memory_type_index,
                state: RwLock::new(LocationState {
                    placement,
                    resource,
                }),
                last_use: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the ID of the location.
    #[inline]
    pub fn id(&self) -> LocationId {
        self.shared.id
    }

    /// Returns the ID of the allocator that the location belongs to.
    #[inline]
    pub fn allocator_id(&self) -> AllocatorId {
        self.shared.allocator_id
    }

    /// Returns the index of the memory type that the location is allocated from.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.shared.memory_type_index
    }

    /// Returns the current placement of the location.
    #[inline]
    pub fn placement(&self) -> Placement {
        self.shared.placement()
    }

    /// Returns the chunk that the location currently lives in.
    #[inline]
    pub fn chunk(&self) -> ChunkId {
        self.placement().chunk
    }

    /// Returns the offset of the location from the start of its chunk.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.placement().offset
    }

    /// Returns the size of the location in bytes.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.placement().size
    }

    /// Returns the native resource bound to the location.
    ///
    /// While the guard is held, defragmentation passes skip the location, the same as when the
    /// [`RelocationGuard`] reports it as in use.
    ///
    /// [`RelocationGuard`]: super::RelocationGuard
    #[inline]
    pub fn resource(&self) -> MappedRwLockReadGuard<'_, R> {
        RwLockReadGuard::map(self.shared.state.read(), |state| &state.resource)
    }

    /// Returns a pointer to the mapped memory of the location, or [`None`] if the memory type is
    /// not host-visible.
    ///
    /// The slice is `size()` bytes long. Reading or writing through it is only sound while the
    /// device isn't accessing the memory, and the pointer is invalidated when the location is
    /// relocated.
    #[inline]
    pub fn mapped_slice(&self) -> Option<NonNull<[u8]>> {
        let placement = self.placement();

        placement
            .mapped_ptr
            .map(|ptr| NonNull::slice_from_raw_parts(ptr.as_non_null(), placement.size as usize))
    }

    /// Records that work touching the resource was submitted in `epoch`.
    ///
    /// An [`EpochTracker`] refuses to relocate the location until `epoch` has completed. Marking
    /// an earlier epoch than the latest one has no effect.
    ///
    /// [`EpochTracker`]: super::EpochTracker
    #[inline]
    pub fn mark_used(&self, epoch: Epoch) {
        self.shared.last_use.fetch_max(epoch.get(), Ordering::AcqRel);
    }

    /// Returns the latest epoch the location was marked as used in.
    #[inline]
    pub fn last_use(&self) -> Option<Epoch> {
        self.shared.last_use()
    }

    /// Returns a snapshot of the location.
    #[inline]
    pub fn info(&self) -> LocationInfo {
        self.shared.info()
    }

    pub(crate) fn shared(&self) -> &Arc<LocationShared<R>> {
        &self.shared
    }

    pub(crate) fn into_shared(self) -> Arc<LocationShared<R>> {
        self.shared
    }
}

impl<R> Debug for MemoryLocation<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryLocation")
            .field("id", &self.shared.id)
            .field("allocator_id", &self.shared.allocator_id)
            .field("memory_type_index", &self.shared.memory_type_index)
            .field("placement", &self.placement())
            .field("last_use", &self.last_use())
            .finish_non_exhaustive()
    }
}

/// The part of a memory location that both the client's handle and the allocator refer to.
pub(crate) struct LocationShared<R> {
    id: LocationId,
    allocator_id: AllocatorId,
    memory_type_index: u32,
    // The placement and resource are swapped together during relocation.
    state: RwLock<LocationState<R>>,
    // 0 means never used.
    last_use: AtomicU64,
}

struct LocationState<R> {
    placement: Placement,
    resource: R,
}

impl<R> LocationShared<R> {
    pub(crate) fn placement(&self) -> Placement {
        self.state.read().placement
    }

    pub(crate) fn resource(&self) -> MappedRwLockReadGuard<'_, R> {
        RwLockReadGuard::map(self.state.read(), |state| &state.resource)
    }

    pub(crate) fn last_use(&self) -> Option<Epoch> {
        Epoch::new(self.last_use.load(Ordering::Acquire))
    }

    pub(crate) fn info(&self) -> LocationInfo {
        LocationInfo {
            id: self.id,
            memory_type_index: self.memory_type_index,
            placement: self.placement(),
            last_use: self.last_use(),
        }
    }

    /// Points the location at a new placement and resource, returning the old resource.
    ///
    /// Fails without blocking if the resource is currently borrowed, giving `resource` back.
    pub(crate) fn try_relocate(&self, placement: Placement, resource: R) -> Result<R, R> {
        let Some(mut state) = self.state.try_write() else {
            return Err(resource);
        };
        state.placement = placement;

        Ok(std::mem::replace(&mut state.resource, resource))
    }

    pub(crate) fn into_resource(self) -> R {
        self.state.into_inner().resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> MemoryLocation<u32> {
        MemoryLocation::new(
            LocationId::next(),
            AllocatorId::next(),
            0,
            Placement {
                chunk: ChunkId(3),
                offset: 256,
                size: 100,
                mapped_ptr: None,
            },
            7,
        )
    }

    #[test]
    fn ids_are_unique() {
        let a = LocationId::next();
        let b = LocationId::next();
        assert_ne!(a, b);
        assert_ne!(AllocatorId::next(), AllocatorId::next());
    }

    #[test]
    fn relocate_swaps_placement_and_resource() {
        let location = location();
        let id = location.id();
        let new_placement = Placement {
            chunk: ChunkId(1),
            offset: 0,
            ..location.placement()
        };

        let old = location.shared().try_relocate(new_placement, 8);

        assert_eq!(old, Ok(7));
        assert_eq!(*location.resource(), 8);
        assert_eq!(location.chunk(), ChunkId(1));
        assert_eq!(location.offset(), 0);
        assert_eq!(location.size(), 100);
        assert_eq!(location.id(), id);
    }

    #[test]
    fn relocate_fails_while_resource_is_borrowed() {
        let location = location();
        let placement = location.placement();
        let new_placement = Placement {
            offset: 0,
            ..placement
        };

        {
            let resource = location.resource();
            assert_eq!(location.shared().try_relocate(new_placement, 8), Err(8));
            assert_eq!(*resource, 7);
        }

        assert_eq!(location.placement(), placement);
        assert_eq!(location.shared().try_relocate(new_placement, 8), Ok(7));
        assert_eq!(location.offset(), 0);
    }

    #[test]
    fn mark_used_keeps_latest_epoch() {
        let location = location();
        assert_eq!(location.last_use(), None);

        location.mark_used(Epoch::new(5).unwrap());
        location.mark_used(Epoch::new(3).unwrap());
        assert_eq!(location.last_use(), Epoch::new(5));
        assert_eq!(location.info().last_use, Epoch::new(5));
    }

    #[test]
    fn unmapped_location_has_no_slice() {
        assert!(location().mapped_slice().is_none());
    }
}
