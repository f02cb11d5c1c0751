// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Chunk allocators for buffers and images.
//!
//! # Chunks
//!
//! A *chunk* is one native memory allocation. Each chunk keeps two maps keyed by offset: one of
//! its free intervals and one of its occupied intervals. Together they cover the whole chunk
//! without overlapping, and neighbouring free intervals are merged as soon as they appear, so
//! freeing every allocation of a chunk always leaves a single free interval behind.
//!
//! # Allocating
//!
//! A [`ChunkAllocator`] owns the chunks of one memory type that hold one kind of resource. When
//! asked for memory, it lets its [`FitStrategy`] look for room in each of its chunks in the order
//! they were created. Only if none of them has room does it ask its [`ChunkCreator`] for a new
//! chunk, which is sized to the allocator's chunk size or to the request if that is larger. The
//! native resource is then bound at the chosen offset and handed to the client inside a
//! [`MemoryLocation`].
//!
//! Buffers and images never share an allocator, which means they never share a chunk. That way
//! the buffer-image granularity of the device never needs to be taken into account.
//!
//! # Freeing
//!
//! A location is given back with [`ChunkAllocator::free`], which destroys the resource and
//! returns the interval to its chunk. Chunks that become empty are kept around up to
//! [`keep_empty_chunks`] of them, to avoid allocating and freeing native memory over and over when
//! the workload hovers around a chunk boundary. The rest are freed immediately.
//!
//! # Defragmentation
//!
//! See the [`defrag`] module.
//!
//! [`keep_empty_chunks`]: ChunkAllocatorCreateInfo::keep_empty_chunks

use self::{chunk::Chunk, defrag::Defragger, location::LocationShared};
pub use self::{
    chunk::{ChunkId, Fit, FreeRange},
    creator::{ChunkCreator, ChunkCreatorCreateInfo, ChunkLimit, HeapBudget},
    defrag::{
        DefragReport, DefragState, DefragmentationCreateInfo, Epoch, EpochTracker,
        RelocationGuard,
    },
    fit::{BestFit, FirstFit, FitStrategy, WorstFit},
    location::{AllocatorId, LocationId, LocationInfo, MemoryLocation, Placement},
};
use crate::{
    device::{DeviceError, MemoryDevice, MemoryRequirements},
    layout::{is_aligned, DeviceLayout},
    DeviceSize, NonExhaustive,
};
use foldhash::HashMap;
use log::{debug, error, warn};
use std::{
    cmp,
    error::Error,
    fmt::{self, Debug, Display},
    marker::PhantomData,
    ops::{Add, AddAssign},
    sync::Arc,
};

mod chunk;
mod creator;
pub mod defrag;
mod fit;
mod location;

/// A kind of native resource that a [`ChunkAllocator`] can bind to memory.
///
/// This is implemented by [`BufferKind`] and [`ImageKind`], and can't be implemented outside
/// this crate.
pub trait ResourceKind<D: MemoryDevice>: private::Sealed + Send + Sync + 'static {
    /// Everything needed to create the resource, minus the memory.
    type Descriptor: Clone + Debug + Send + Sync;

    /// The native resource.
    type Resource: Debug + Send + Sync;

    #[doc(hidden)]
    const NAME: &'static str;

    #[doc(hidden)]
    fn memory_requirements(
        device: &D,
        descriptor: &Self::Descriptor,
    ) -> Result<MemoryRequirements, DeviceError>;

    #[doc(hidden)]
    unsafe fn bind(
        device: &D,
        descriptor: &Self::Descriptor,
        memory: D::Memory,
        offset: DeviceSize,
    ) -> Result<Self::Resource, DeviceError>;

    #[doc(hidden)]
    unsafe fn destroy(device: &D, resource: Self::Resource);

    #[doc(hidden)]
    unsafe fn copy(
        device: &D,
        descriptor: &Self::Descriptor,
        src: &Self::Resource,
        dst: &Self::Resource,
    ) -> Result<(), DeviceError>;
}

mod private {
    pub trait Sealed {}
}

/// Buffers, as a [`ResourceKind`].
#[derive(Debug)]
pub enum BufferKind {}

impl private::Sealed for BufferKind {}

impl<D: MemoryDevice> ResourceKind<D> for BufferKind {
    type Descriptor = D::BufferDescriptor;
    type Resource = D::Buffer;

    const NAME: &'static str = "buffer";

    #[inline]
    fn memory_requirements(
        device: &D,
        descriptor: &Self::Descriptor,
    ) -> Result<MemoryRequirements, DeviceError> {
        device.buffer_memory_requirements(descriptor)
    }

    #[inline]
    unsafe fn bind(
        device: &D,
        descriptor: &Self::Descriptor,
        memory: D::Memory,
        offset: DeviceSize,
    ) -> Result<Self::Resource, DeviceError> {
        unsafe { device.bind_buffer(descriptor, memory, offset) }
    }

    #[inline]
    unsafe fn destroy(device: &D, resource: Self::Resource) {
        unsafe { device.destroy_buffer(resource) }
    }

    #[inline]
    unsafe fn copy(
        device: &D,
        descriptor: &Self::Descriptor,
        src: &Self::Resource,
        dst: &Self::Resource,
    ) -> Result<(), DeviceError> {
        unsafe { device.copy_buffer(descriptor, src, dst) }
    }
}

/// Images, as a [`ResourceKind`].
///
/// The memory requirements of an image depend on its format, extent and tiling, so they're only
/// known after asking the driver. Two images with the same extent can end up with different
/// alignments, and therefore at different places in a chunk.
#[derive(Debug)]
pub enum ImageKind {}

impl private::Sealed for ImageKind {}

impl<D: MemoryDevice> ResourceKind<D> for ImageKind {
    type Descriptor = D::ImageDescriptor;
    type Resource = D::Image;

    const NAME: &'static str = "image";

    #[inline]
    fn memory_requirements(
        device: &D,
        descriptor: &Self::Descriptor,
    ) -> Result<MemoryRequirements, DeviceError> {
        device.image_memory_requirements(descriptor)
    }

    #[inline]
    unsafe fn bind(
        device: &D,
        descriptor: &Self::Descriptor,
        memory: D::Memory,
        offset: DeviceSize,
    ) -> Result<Self::Resource, DeviceError> {
        unsafe { device.bind_image(descriptor, memory, offset) }
    }

    #[inline]
    unsafe fn destroy(device: &D, resource: Self::Resource) {
        unsafe { device.destroy_image(resource) }
    }

    #[inline]
    unsafe fn copy(
        device: &D,
        descriptor: &Self::Descriptor,
        src: &Self::Resource,
        dst: &Self::Resource,
    ) -> Result<(), DeviceError> {
        unsafe { device.copy_image(descriptor, src, dst) }
    }
}

/// A [`ChunkAllocator`] for buffers.
pub type BufferChunkAllocator<D> = ChunkAllocator<D, BufferKind>;

/// A [`ChunkAllocator`] for images.
pub type ImageChunkAllocator<D> = ChunkAllocator<D, ImageKind>;

/// Suballocates resources of kind `K` from chunks of one memory type.
///
/// See the [module-level documentation] for how allocation works.
///
/// All operations take `&mut self`. An allocator is meant to be driven from one thread, and a
/// defragmentation pass can never overlap an allocation or free on the same allocator. Allocators
/// sharing a [`ChunkCreator`] may live on different threads.
///
/// [module-level documentation]: self
pub struct ChunkAllocator<D: MemoryDevice, K: ResourceKind<D>> {
    id: AllocatorId,
    creator: Arc<ChunkCreator<D>>,
    chunk_size: DeviceSize,
    fit_strategy: Arc<dyn FitStrategy>,
    keep_empty_chunks: usize,
    // In creation order, which is also the order of their IDs.
    chunks: Vec<Chunk<D::Memory>>,
    locations: HashMap<LocationId, LocationRecord<K::Descriptor, K::Resource>>,
    defragger: Defragger,
    _marker: PhantomData<fn() -> K>,
}

/// What the allocator remembers about a live location, so that it can relocate it.
struct LocationRecord<T, R> {
    shared: Arc<LocationShared<R>>,
    descriptor: T,
    layout: DeviceLayout,
}

impl<D: MemoryDevice, K: ResourceKind<D>> ChunkAllocator<D, K> {
    /// Creates a new `ChunkAllocator` that gets its chunks from `creator`.
    pub fn new(
        creator: Arc<ChunkCreator<D>>,
        create_info: ChunkAllocatorCreateInfo,
    ) -> Result<Self, MemoryError> {
        let ChunkAllocatorCreateInfo {
            chunk_size,
            fit_strategy,
            keep_empty_chunks,
            defragger_enabled,
            defragmentation,
            _ne: _,
        } = create_info;

        if chunk_size == 0 || chunk_size > DeviceLayout::MAX_SIZE {
            return Err(MemoryError::InvalidArgument(
                "`chunk_size` must be greater than zero and not exceed `DeviceLayout::MAX_SIZE`",
            ));
        }

        let defragger = Defragger::new(defragger_enabled, defragmentation)?;

        Ok(ChunkAllocator {
            id: AllocatorId::next(),
            creator,
            chunk_size,
            fit_strategy,
            keep_empty_chunks,
            chunks: Vec::new(),
            locations: HashMap::default(),
            defragger,
            _marker: PhantomData,
        })
    }

    /// Returns the ID of the allocator.
    #[inline]
    pub fn id(&self) -> AllocatorId {
        self.id
    }

    /// Returns the creator that the allocator gets its chunks from.
    #[inline]
    pub fn creator(&self) -> &Arc<ChunkCreator<D>> {
        &self.creator
    }

    /// Returns the device.
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        self.creator.device()
    }

    /// Returns the index of the memory type that the allocator allocates from.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.creator.memory_type_index()
    }

    /// Returns the size of new chunks.
    #[inline]
    pub fn chunk_size(&self) -> DeviceSize {
        self.chunk_size
    }

    /// Returns the fit strategy.
    #[inline]
    pub fn fit_strategy(&self) -> &Arc<dyn FitStrategy> {
        &self.fit_strategy
    }

    /// Returns the number of chunks that the allocator currently owns.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Allocates memory for and binds a new resource created from `descriptor`.
    ///
    /// The size and alignment are those the device reports for the resource, with the alignment
    /// raised to the memory type's [`alignment`].
    ///
    /// # Errors
    ///
    /// - Returns [`InvalidArgument`] if the resource can't be bound to memory of this allocator's
    ///   memory type.
    /// - Returns [`Device`] if the memory requirements couldn't be queried.
    /// - See also [`allocate_with_layout`].
    ///
    /// [`alignment`]: crate::device::MemoryType::alignment
    /// [`InvalidArgument`]: MemoryError::InvalidArgument
    /// [`Device`]: MemoryError::Device
    /// [`allocate_with_layout`]: Self::allocate_with_layout
    pub fn allocate(
        &mut self,
        descriptor: K::Descriptor,
    ) -> Result<MemoryLocation<K::Resource>, MemoryError> {
        let requirements = K::memory_requirements(self.device(), &descriptor)
            .map_err(MemoryError::Device)?;

        if requirements.memory_type_bits & (1 << self.memory_type_index()) == 0 {
            return Err(MemoryError::InvalidArgument(
                "the resource can't be bound to memory of the allocator's memory type",
            ));
        }

        self.allocate_with_layout(requirements.layout, descriptor)
    }

    /// Allocates memory of the given `layout` and binds a new resource created from `descriptor`
    /// to it.
    ///
    /// The existing chunks are tried in the order they were created. If none of them has room, a
    /// new chunk of [`chunk_size`] bytes is created, or of exactly the required size if that's
    /// larger, and the allocation is retried against that chunk only.
    ///
    /// # Errors
    ///
    /// - Returns [`OutOfDeviceMemory`] if a new chunk was needed but couldn't be created.
    /// - Returns [`Bind`] if binding the resource failed. The memory is given back in that case,
    ///   including the new chunk if one was created for this allocation.
    ///
    /// # Panics
    ///
    /// - Panics if the fit strategy returns an offset that isn't aligned to the layout.
    ///
    /// [`chunk_size`]: ChunkAllocatorCreateInfo::chunk_size
    /// [`OutOfDeviceMemory`]: MemoryError::OutOfDeviceMemory
    /// [`Bind`]: MemoryError::Bind
    pub fn allocate_with_layout(
        &mut self,
        layout: DeviceLayout,
        descriptor: K::Descriptor,
    ) -> Result<MemoryLocation<K::Resource>, MemoryError> {
        let layout = layout
            .align_to(self.creator.memory_type().alignment)
            .ok_or(MemoryError::InvalidArgument(
                "the layout is too large once aligned to the memory type's alignment",
            ))?;

        let mut new_chunk = false;
        let (index, fit) = match self.find_fit(layout) {
            Some(found) => found,
            None => {
                let chunk = self
                    .creator
                    .create_chunk(cmp::max(self.chunk_size, layout.size()))?;
                self.chunks.push(chunk);
                new_chunk = true;

                let index = self.chunks.len() - 1;

                match self.fit_in(index, layout) {
                    Some(fit) => (index, fit),
                    None => {
                        self.destroy_chunk(index);

                        return Err(MemoryError::OutOfDeviceMemory);
                    }
                }
            }
        };

        let id = LocationId::next();
        let chunk = &mut self.chunks[index];
        chunk.carve(fit.offset, layout.size(), id);

        let bound =
            unsafe { K::bind(self.creator.device(), &descriptor, chunk.memory(), fit.offset) };
        let resource = match bound {
            Ok(resource) => resource,
            Err(err) => {
                chunk.release(fit.offset);

                if new_chunk {
                    self.destroy_chunk(index);
                }

                return Err(MemoryError::Bind(err));
            }
        };

        let placement = Placement {
            chunk: chunk.id(),
            offset: fit.offset,
            size: layout.size(),
            mapped_ptr: chunk.mapped_ptr().map(|ptr| unsafe { ptr.add(fit.offset) }),
        };
        let location =
            MemoryLocation::new(id, self.id, self.memory_type_index(), placement, resource);

        self.locations.insert(
            id,
            LocationRecord {
                shared: location.shared().clone(),
                descriptor,
                layout,
            },
        );

        debug!(
            "allocated {} {:?} at {}..{} of chunk {:?}",
            K::NAME,
            id,
            placement.offset,
            placement.offset + placement.size,
            placement.chunk,
        );

        Ok(location)
    }

    /// Returns the first chunk, in creation order, that the fit strategy finds room in.
    fn find_fit(&self, layout: DeviceLayout) -> Option<(usize, Fit)> {
        (0..self.chunks.len()).find_map(|index| Some((index, self.fit_in(index, layout)?)))
    }

    fn fit_in(&self, index: usize, layout: DeviceLayout) -> Option<Fit> {
        let fit = self
            .fit_strategy
            .find(&mut self.chunks[index].free_ranges(), layout)?;
        self.check_fit(fit, layout);

        Some(fit)
    }

    fn check_fit(&self, fit: Fit, layout: DeviceLayout) {
        assert!(
            is_aligned(fit.offset, layout.alignment()),
            "the fit strategy {:?} returned offset {}, which is not aligned to {:?}",
            self.fit_strategy,
            fit.offset,
            layout.alignment(),
        );
    }

    /// Destroys the resource of `location` and gives its memory back.
    ///
    /// If this leaves the chunk empty and more than [`keep_empty_chunks`] chunks are empty, the
    /// chunk is freed.
    ///
    /// # Errors
    ///
    /// Returns the location back inside a [`FreeError`] if it wasn't allocated by this allocator.
    ///
    /// # Panics
    ///
    /// - Panics in debug builds if the location wasn't allocated by this allocator.
    ///
    /// [`keep_empty_chunks`]: ChunkAllocatorCreateInfo::keep_empty_chunks
    pub fn free(
        &mut self,
        location: MemoryLocation<K::Resource>,
    ) -> Result<(), FreeError<K::Resource>> {
        let id = location.id();

        // Location IDs are unique process-wide, so this also rejects other allocators' locations.
        let Some(record) = self.locations.remove(&id) else {
            error!(
                "attempted to free {:?}, which was not allocated by allocator {:?}",
                id, self.id,
            );
            debug_assert!(
                false,
                "attempted to free a memory location that was not allocated by this allocator",
            );

            return Err(FreeError::new(location));
        };

        let placement = record.shared.placement();
        drop(record);

        let Some(shared) = Arc::into_inner(location.into_shared()) else {
            unreachable!("the allocator holds the only other reference to a location");
        };

        unsafe { K::destroy(self.creator.device(), shared.into_resource()) };

        let index = self.chunk_index(placement.chunk);
        self.chunks[index].release(placement.offset);

        debug!(
            "freed {} {:?} at {}..{} of chunk {:?}",
            K::NAME,
            id,
            placement.offset,
            placement.offset + placement.size,
            placement.chunk,
        );

        self.release_empty_chunks(self.keep_empty_chunks);

        Ok(())
    }

    /// Enables or disables defragmentation of this allocator.
    ///
    /// While disabled, [`run_defragmentation_pass`] does nothing and no location is ever moved.
    ///
    /// [`run_defragmentation_pass`]: Self::run_defragmentation_pass
    #[inline]
    pub fn enable_defragger(&mut self, enabled: bool) {
        self.defragger.set_enabled(enabled);
    }

    /// Returns whether defragmentation is enabled.
    #[inline]
    pub fn is_defragger_enabled(&self) -> bool {
        self.defragger.is_enabled()
    }

    /// Returns the state of the defragmenter.
    ///
    /// This is always [`DefragState::Idle`] outside of [`run_defragmentation_pass`].
    ///
    /// [`run_defragmentation_pass`]: Self::run_defragmentation_pass
    #[inline]
    pub fn defrag_state(&self) -> DefragState {
        self.defragger.state()
    }

    /// Frees every empty chunk, regardless of [`keep_empty_chunks`]. Returns how many chunks were
    /// freed.
    ///
    /// [`keep_empty_chunks`]: ChunkAllocatorCreateInfo::keep_empty_chunks
    pub fn shrink(&mut self) -> usize {
        self.release_empty_chunks(0)
    }

    /// Returns statistics about the chunks of the allocator.
    pub fn stats(&self) -> MemoryStats {
        self.chunks
            .iter()
            .map(|chunk| MemoryStats {
                chunk_count: 1,
                allocation_count: chunk.allocation_count(),
                allocated_size: chunk.size(),
                used_size: chunk.used_size(),
                free_size: chunk.free_size(),
                free_interval_count: chunk.free_interval_count(),
                largest_free_interval: chunk.largest_free_interval(),
            })
            .fold(MemoryStats::default(), Add::add)
    }

    fn chunk_index(&self, id: ChunkId) -> usize {
        self.chunks
            .binary_search_by_key(&id, Chunk::id)
            .unwrap_or_else(|_| panic!("chunk {:?} is not owned by allocator {:?}", id, self.id))
    }

    /// Frees empty chunks beyond the first `keep` of them. Returns how many were freed.
    fn release_empty_chunks(&mut self, keep: usize) -> usize {
        let mut kept = 0;
        let mut released = 0;
        let mut index = 0;

        while index < self.chunks.len() {
            if self.chunks[index].is_empty() && kept == keep {
                self.destroy_chunk(index);
                released += 1;
            } else {
                if self.chunks[index].is_empty() {
                    kept += 1;
                }

                index += 1;
            }
        }

        released
    }

    fn destroy_chunk(&mut self, index: usize) {
        let chunk = self.chunks.remove(index);

        // SAFETY: The chunk is empty, so nothing is bound to it anymore.
        unsafe { self.creator.destroy_chunk(chunk) };
    }

    /// Panics if any chunk is inconsistent or a live location doesn't match its interval.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut occupied = 0;

        for chunk in &self.chunks {
            chunk.assert_consistent();

            for (offset, interval) in chunk.occupied() {
                let record = &self.locations[&interval.location];
                let placement = record.shared.placement();
                assert_eq!(placement.chunk, chunk.id());
                assert_eq!(placement.offset, offset);
                assert_eq!(placement.size, interval.size);
                assert!(is_aligned(offset, record.layout.alignment()));
                occupied += 1;
            }
        }

        assert_eq!(occupied, self.locations.len());
        assert!(self.chunks.windows(2).all(|w| w[0].id() < w[1].id()));
    }
}

impl<D: MemoryDevice, K: ResourceKind<D>> Drop for ChunkAllocator<D, K> {
    fn drop(&mut self) {
        if !self.locations.is_empty() {
            warn!(
                "allocator {:?} dropped with {} {} locations outstanding, leaking their chunks",
                self.id,
                self.locations.len(),
                K::NAME,
            );
        }

        for chunk in self.chunks.drain(..) {
            if chunk.is_empty() {
                unsafe { self.creator.destroy_chunk(chunk) };
            }
        }
    }
}

impl<D: MemoryDevice, K: ResourceKind<D>> Debug for ChunkAllocator<D, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkAllocator")
            .field("id", &self.id)
            .field("kind", &K::NAME)
            .field("memory_type_index", &self.memory_type_index())
            .field("chunk_size", &self.chunk_size)
            .field("fit_strategy", &self.fit_strategy)
            .field("keep_empty_chunks", &self.keep_empty_chunks)
            .field("stats", &self.stats())
            .field("defragger", &self.defragger)
            .finish_non_exhaustive()
    }
}

/// Parameters to create a new [`ChunkAllocator`].
#[derive(Clone, Debug)]
pub struct ChunkAllocatorCreateInfo {
    /// The size of new chunks, unless a single allocation needs a larger one.
    ///
    /// The default value is 64 MiB.
    pub chunk_size: DeviceSize,

    /// Decides where in a chunk an allocation is placed.
    ///
    /// The default value is [`FirstFit`].
    pub fit_strategy: Arc<dyn FitStrategy>,

    /// How many empty chunks are kept instead of being freed.
    ///
    /// The default value is `1`.
    pub keep_empty_chunks: usize,

    /// Whether the allocator takes part in defragmentation passes.
    ///
    /// The default value is `false`.
    pub defragger_enabled: bool,

    /// How defragmentation passes behave.
    ///
    /// The default value is `DefragmentationCreateInfo::default()`.
    pub defragmentation: DefragmentationCreateInfo,

    pub _ne: NonExhaustive,
}

impl Default for ChunkAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        ChunkAllocatorCreateInfo {
            chunk_size: 64 * 1024 * 1024,
            fit_strategy: Arc::new(FirstFit),
            keep_empty_chunks: 1,
            defragger_enabled: false,
            defragmentation: DefragmentationCreateInfo::default(),
            _ne: NonExhaustive(()),
        }
    }
}

/// Statistics about the chunks of one or more allocators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryStats {
    /// The number of chunks.
    pub chunk_count: usize,

    /// The number of live allocations.
    pub allocation_count: usize,

    /// The total size of the chunks.
    pub allocated_size: DeviceSize,

    /// The number of bytes occupied by allocations.
    pub used_size: DeviceSize,

    /// The number of free bytes, including alignment padding between allocations.
    pub free_size: DeviceSize,

    /// The number of free intervals.
    pub free_interval_count: usize,

    /// The size of the largest free interval of any chunk.
    pub largest_free_interval: DeviceSize,
}

impl MemoryStats {
    /// Returns how much of the free memory is not part of the largest free interval, between `0.0`
    /// and `1.0`.
    ///
    /// This is `0.0` when there is no free memory at all.
    pub fn fragmentation(&self) -> f64 {
        if self.free_size == 0 {
            0.0
        } else {
            1.0 - self.largest_free_interval as f64 / self.free_size as f64
        }
    }
}

impl Add for MemoryStats {
    type Output = Self;

    #[inline]
    fn add(mut self, rhs: Self) -> Self {
        self += rhs;

        self
    }
}

impl AddAssign for MemoryStats {
    fn add_assign(&mut self, rhs: Self) {
        self.chunk_count += rhs.chunk_count;
        self.allocation_count += rhs.allocation_count;
        self.allocated_size += rhs.allocated_size;
        self.used_size += rhs.used_size;
        self.free_size += rhs.free_size;
        self.free_interval_count += rhs.free_interval_count;
        self.largest_free_interval =
            cmp::max(self.largest_free_interval, rhs.largest_free_interval);
    }
}

/// Error that can be returned when allocating memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// The heap is exhausted, the chunk limit was reached or the driver ran out of memory.
    OutOfDeviceMemory,

    /// A parameter was invalid.
    InvalidArgument(&'static str),

    /// A memory location was given to an allocator that didn't allocate it.
    InvalidHandle,

    /// Binding the resource to memory failed.
    Bind(DeviceError),

    /// Another call to the device failed.
    Device(DeviceError),
}

impl Error for MemoryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Bind(err) | Self::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDeviceMemory => f.write_str("out of device memory"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::InvalidHandle => {
                f.write_str("the memory location was not allocated by this allocator")
            }
            Self::Bind(_) => f.write_str("binding the resource to memory failed"),
            Self::Device(_) => f.write_str("a device operation failed"),
        }
    }
}

/// Error returned by [`ChunkAllocator::free`], which gives the rejected location back.
pub struct FreeError<R> {
    location: MemoryLocation<R>,
}

impl<R> FreeError<R> {
    pub(crate) fn new(location: MemoryLocation<R>) -> Self {
        FreeError { location }
    }

    /// Returns the location that couldn't be freed.
    #[inline]
    pub fn into_location(self) -> MemoryLocation<R> {
        self.location
    }
}

impl<R> Debug for FreeError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeError")
            .field("location", &self.location)
            .finish()
    }
}

impl<R> Error for FreeError<R> {}

impl<R> Display for FreeError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} was not allocated by the allocator it was given to",
            self.location.id(),
        )
    }
}

impl<R> From<FreeError<R>> for MemoryError {
    #[inline]
    fn from(_: FreeError<R>) -> Self {
        MemoryError::InvalidHandle
    }
}
