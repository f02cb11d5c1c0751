// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A front-end that picks memory types and creates allocators as they're needed.

use crate::{
    allocator::{
        AllocatorId, BufferKind, ChunkAllocator, ChunkAllocatorCreateInfo, ChunkCreator,
        ChunkCreatorCreateInfo, ChunkLimit, DefragReport, DefragmentationCreateInfo, FirstFit,
        FitStrategy, FreeError, HeapBudget, ImageKind, MemoryError, MemoryLocation, MemoryStats,
        RelocationGuard, ResourceKind,
    },
    device::{MemoryDevice, MemoryType},
    DeviceSize, NonExhaustive,
};
use ash::vk;
use foldhash::HashMap;
use log::{debug, error};
use smallvec::SmallVec;
use std::{collections::hash_map::Entry, fmt::Debug, hash::Hash, sync::Arc};

/// Identifies the buffer allocators of a [`MemoryManager`].
///
/// Buffers with the same `BufferType` share chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferType {
    /// How the buffers are used.
    pub usage: vk::BufferUsageFlags,

    /// The property flags that the memory of the buffers must have.
    pub memory_flags: vk::MemoryPropertyFlags,
}

/// Identifies the image allocators of a [`MemoryManager`].
///
/// Images with the same `ImageType` share chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageType {
    /// How the images are used.
    pub usage: vk::ImageUsageFlags,

    /// The property flags that the memory of the images must have.
    pub memory_flags: vk::MemoryPropertyFlags,
}

/// Owns one allocator per resource type and memory type, and one [`ChunkCreator`] per memory
/// type that all allocators of that memory type share.
///
/// The creators of memory types in the same heap share a [`HeapBudget`], and all creators share
/// one [`ChunkLimit`], so the manager as a whole never exceeds a heap's capacity or the device's
/// allocation count.
///
/// Allocators are created the first time they're needed. When allocating, the memory types that
/// the resource supports and that have the requested property flags are tried in order of
/// preference, and the next one is only tried if the previous one ran out of memory.
#[derive(Debug)]
pub struct MemoryManager<D: MemoryDevice> {
    device: Arc<D>,
    creators: Vec<Arc<ChunkCreator<D>>>,
    buffers: AllocatorSet<D, BufferKind, BufferType>,
    images: AllocatorSet<D, ImageKind, ImageType>,
}

impl<D: MemoryDevice> MemoryManager<D> {
    /// Creates a new `MemoryManager` with a [`ChunkCreator`] for each memory type of `device`.
    pub fn new(device: Arc<D>, create_info: MemoryManagerCreateInfo) -> Result<Self, MemoryError> {
        let MemoryManagerCreateInfo {
            buffer_chunk_size,
            image_chunk_size,
            fit_strategy,
            keep_empty_chunks,
            max_chunk_count,
            defragmentation,
            _ne: _,
        } = create_info;

        let chunk_limit = ChunkLimit::new(
            max_chunk_count.unwrap_or_else(|| device.max_memory_allocation_count()),
        )?;
        // Memory types of the same heap report the same capacity, so the first one is used.
        let mut heap_budgets: HashMap<u32, Arc<HeapBudget>> = HashMap::default();

        let creators = device
            .memory_types()
            .iter()
            .enumerate()
            .map(|(memory_type_index, memory_type)| {
                let heap_budget = heap_budgets
                    .entry(memory_type.heap_index)
                    .or_insert_with(|| {
                        HeapBudget::new(memory_type.heap_index, memory_type.heap_capacity)
                    })
                    .clone();

                ChunkCreator::new(
                    device.clone(),
                    memory_type_index as u32,
                    ChunkCreatorCreateInfo {
                        heap_budget: Some(heap_budget),
                        chunk_limit: Some(chunk_limit.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let allocator_create_info = |chunk_size| ChunkAllocatorCreateInfo {
            chunk_size,
            fit_strategy: fit_strategy.clone(),
            keep_empty_chunks,
            defragger_enabled: false,
            defragmentation: defragmentation.clone(),
            ..Default::default()
        };

        Ok(MemoryManager {
            buffers: AllocatorSet::new(allocator_create_info(buffer_chunk_size)),
            images: AllocatorSet::new(allocator_create_info(image_chunk_size)),
            device,
            creators,
        })
    }

    /// Returns the device.
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Returns the chunk creator of the memory type at `memory_type_index`.
    #[inline]
    pub fn creator(&self, memory_type_index: u32) -> Option<&Arc<ChunkCreator<D>>> {
        self.creators.get(memory_type_index as usize)
    }

    /// Allocates memory for and binds a new buffer created from `descriptor`.
    pub fn allocate_buffer(
        &mut self,
        buffer_type: BufferType,
        descriptor: D::BufferDescriptor,
    ) -> Result<MemoryLocation<D::Buffer>, MemoryError> {
        self.buffers.allocate(
            &self.creators,
            buffer_type,
            buffer_type.memory_flags,
            descriptor,
        )
    }

    /// Allocates memory for and binds a new image created from `descriptor`.
    pub fn allocate_image(
        &mut self,
        image_type: ImageType,
        descriptor: D::ImageDescriptor,
    ) -> Result<MemoryLocation<D::Image>, MemoryError> {
        self.images.allocate(
            &self.creators,
            image_type,
            image_type.memory_flags,
            descriptor,
        )
    }

    /// Frees a buffer allocated with [`allocate_buffer`].
    ///
    /// # Panics
    ///
    /// - Panics in debug builds if the location wasn't allocated by this manager.
    ///
    /// [`allocate_buffer`]: Self::allocate_buffer
    pub fn free_buffer(
        &mut self,
        location: MemoryLocation<D::Buffer>,
    ) -> Result<(), FreeError<D::Buffer>> {
        self.buffers.free(location)
    }

    /// Frees an image allocated with [`allocate_image`].
    ///
    /// # Panics
    ///
    /// - Panics in debug builds if the location wasn't allocated by this manager.
    ///
    /// [`allocate_image`]: Self::allocate_image
    pub fn free_image(
        &mut self,
        location: MemoryLocation<D::Image>,
    ) -> Result<(), FreeError<D::Image>> {
        self.images.free(location)
    }

    /// Enables or disables defragmentation for all allocators, including those created later.
    pub fn enable_defragger(&mut self, enabled: bool) {
        self.buffers.enable_defragger(enabled);
        self.images.enable_defragger(enabled);
    }

    /// Runs a defragmentation pass over every allocator and returns the combined report.
    pub fn run_defragmentation_pass<G>(&mut self, guard: &G) -> DefragReport
    where
        G: RelocationGuard + ?Sized,
    {
        let mut report = DefragReport::default();

        for allocator in self.buffers.allocators.values_mut() {
            report += allocator.run_defragmentation_pass(guard);
        }

        for allocator in self.images.allocators.values_mut() {
            report += allocator.run_defragmentation_pass(guard);
        }

        report
    }

    /// Frees every empty chunk of every allocator. Returns how many chunks were freed.
    pub fn shrink(&mut self) -> usize {
        self.buffers
            .allocators
            .values_mut()
            .map(ChunkAllocator::shrink)
            .chain(self.images.allocators.values_mut().map(ChunkAllocator::shrink))
            .sum()
    }

    /// Returns the combined statistics of every allocator.
    pub fn stats(&self) -> MemoryStats {
        self.buffer_stats() + self.image_stats()
    }

    /// Returns the combined statistics of the buffer allocators.
    pub fn buffer_stats(&self) -> MemoryStats {
        self.buffers.stats()
    }

    /// Returns the combined statistics of the image allocators.
    pub fn image_stats(&self) -> MemoryStats {
        self.images.stats()
    }

    /// Returns the number of allocators that have been created.
    pub fn allocator_count(&self) -> usize {
        self.buffers.allocators.len() + self.images.allocators.len()
    }
}

/// The allocators of one resource kind, keyed by resource type and memory type index.
#[derive(Debug)]
struct AllocatorSet<D: MemoryDevice, K: ResourceKind<D>, T> {
    create_info: ChunkAllocatorCreateInfo,
    allocators: HashMap<(T, u32), ChunkAllocator<D, K>>,
    routes: HashMap<AllocatorId, (T, u32)>,
}

impl<D, K, T> AllocatorSet<D, K, T>
where
    D: MemoryDevice,
    K: ResourceKind<D>,
    T: Copy + Eq + Hash + Debug,
{
    fn new(create_info: ChunkAllocatorCreateInfo) -> Self {
        AllocatorSet {
            create_info,
            allocators: HashMap::default(),
            routes: HashMap::default(),
        }
    }

    fn allocate(
        &mut self,
        creators: &[Arc<ChunkCreator<D>>],
        resource_type: T,
        required_flags: vk::MemoryPropertyFlags,
        descriptor: K::Descriptor,
    ) -> Result<MemoryLocation<K::Resource>, MemoryError> {
        let Some(device) = creators.first().map(|creator| creator.device()) else {
            return Err(MemoryError::InvalidArgument("the device has no memory types"));
        };
        let requirements =
            K::memory_requirements(device, &descriptor).map_err(MemoryError::Device)?;
        let memory_types = device.memory_types();
        let candidates =
            rank_memory_types(memory_types, requirements.memory_type_bits, required_flags);

        if candidates.is_empty() {
            return Err(MemoryError::InvalidArgument(
                "no memory type supports the resource and has the required property flags",
            ));
        }

        for memory_type_index in candidates {
            let allocator = self.get_or_create(creators, resource_type, memory_type_index)?;

            match allocator.allocate_with_layout(requirements.layout, descriptor.clone()) {
                Err(MemoryError::OutOfDeviceMemory) => {
                    debug!(
                        "memory type {} is out of memory for {:?}, trying the next one",
                        memory_type_index, resource_type,
                    );
                }
                result => return result,
            }
        }

        Err(MemoryError::OutOfDeviceMemory)
    }

    fn get_or_create(
        &mut self,
        creators: &[Arc<ChunkCreator<D>>],
        resource_type: T,
        memory_type_index: u32,
    ) -> Result<&mut ChunkAllocator<D, K>, MemoryError> {
        let key = (resource_type, memory_type_index);

        match self.allocators.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let allocator = ChunkAllocator::new(
                    creators[memory_type_index as usize].clone(),
                    self.create_info.clone(),
                )?;
                debug!(
                    "created {} allocator {:?} for {:?} in memory type {}",
                    K::NAME,
                    allocator.id(),
                    resource_type,
                    memory_type_index,
                );
                self.routes.insert(allocator.id(), key);

                Ok(entry.insert(allocator))
            }
        }
    }

    fn free(
        &mut self,
        location: MemoryLocation<K::Resource>,
    ) -> Result<(), FreeError<K::Resource>> {
        let allocator = self
            .routes
            .get(&location.allocator_id())
            .and_then(|key| self.allocators.get_mut(key));

        match allocator {
            Some(allocator) => allocator.free(location),
            None => {
                error!(
                    "attempted to free {:?}, which belongs to unknown allocator {:?}",
                    location.id(),
                    location.allocator_id(),
                );
                debug_assert!(
                    false,
                    "attempted to free a memory location that was not allocated by this manager",
                );

                Err(FreeError::new(location))
            }
        }
    }

    fn enable_defragger(&mut self, enabled: bool) {
        self.create_info.defragger_enabled = enabled;

        for allocator in self.allocators.values_mut() {
            allocator.enable_defragger(enabled);
        }
    }

    fn stats(&self) -> MemoryStats {
        self.allocators
            .values()
            .map(ChunkAllocator::stats)
            .fold(MemoryStats::default(), |a, b| a + b)
    }
}

/// Returns the indices of the memory types allowed by `memory_type_bits` that have all of
/// `required_flags`, best first.
///
/// Memory types with fewer flags beyond the required ones come first, so that for example memory
/// that doesn't need to be host-visible doesn't take up the host-visible device-local heap. Ties
/// go to the lower index, which is the order the driver lists them in.
pub fn rank_memory_types(
    memory_types: &[MemoryType],
    memory_type_bits: u32,
    required_flags: vk::MemoryPropertyFlags,
) -> SmallVec<[u32; 8]> {
    let mut candidates = memory_types
        .iter()
        .enumerate()
        .filter(|&(index, memory_type)| {
            index < 32
                && memory_type_bits & (1 << index) != 0
                && memory_type.property_flags.contains(required_flags)
        })
        .map(|(index, memory_type)| {
            let extra_flags = memory_type.property_flags & !required_flags;

            (extra_flags.as_raw().count_ones(), index as u32)
        })
        .collect::<SmallVec<[_; 8]>>();
    candidates.sort_unstable();

    candidates.into_iter().map(|(_, index)| index).collect()
}

/// Parameters to create a new [`MemoryManager`].
#[derive(Clone, Debug)]
pub struct MemoryManagerCreateInfo {
    /// The chunk size of buffer allocators.
    ///
    /// The default value is 64 MiB.
    pub buffer_chunk_size: DeviceSize,

    /// The chunk size of image allocators.
    ///
    /// The default value is 64 MiB.
    pub image_chunk_size: DeviceSize,

    /// The fit strategy of every allocator.
    ///
    /// The default value is [`FirstFit`].
    pub fit_strategy: Arc<dyn FitStrategy>,

    /// How many empty chunks each allocator keeps.
    ///
    /// The default value is `1`.
    pub keep_empty_chunks: usize,

    /// The maximum number of chunks across all memory types.
    ///
    /// The default value is [`None`], which uses the device's limit.
    pub max_chunk_count: Option<u32>,

    /// How defragmentation passes behave.
    ///
    /// The default value is `DefragmentationCreateInfo::default()`.
    pub defragmentation: DefragmentationCreateInfo,

    pub _ne: NonExhaustive,
}

impl Default for MemoryManagerCreateInfo {
    #[inline]
    fn default() -> Self {
        MemoryManagerCreateInfo {
            buffer_chunk_size: 64 * 1024 * 1024,
            image_chunk_size: 64 * 1024 * 1024,
            fit_strategy: Arc::new(FirstFit),
            keep_empty_chunks: 1,
            max_chunk_count: None,
            defragmentation: DefragmentationCreateInfo::default(),
            _ne: NonExhaustive(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::DeviceAlignment,
        tests::{
            device_local_type, host_visible_type, MockBufferDesc, MockDevice, MockFormat,
            MockImageDesc,
        },
    };

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;

    fn memory_type(
        property_flags: vk::MemoryPropertyFlags,
        heap_capacity: DeviceSize,
    ) -> MemoryType {
        MemoryType {
            property_flags,
            heap_index: 0,
            heap_capacity,
            alignment: DeviceAlignment::MIN,
        }
    }

    fn manager(device: &Arc<MockDevice>, chunk_size: DeviceSize) -> MemoryManager<MockDevice> {
        MemoryManager::new(
            device.clone(),
            MemoryManagerCreateInfo {
                buffer_chunk_size: chunk_size,
                image_chunk_size: chunk_size,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn buffer_type(memory_flags: vk::MemoryPropertyFlags) -> BufferType {
        BufferType {
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            memory_flags,
        }
    }

    #[test]
    fn ranking() {
        let coherent = vk::MemoryPropertyFlags::HOST_COHERENT;
        let memory_types = [
            memory_type(DEVICE_LOCAL | HOST_VISIBLE | coherent, 1),
            memory_type(DEVICE_LOCAL, 1),
            memory_type(HOST_VISIBLE | coherent, 1),
            memory_type(DEVICE_LOCAL, 1),
        ];

        assert_eq!(
            rank_memory_types(&memory_types, u32::MAX, DEVICE_LOCAL).as_slice(),
            [1, 3, 0],
        );
        assert_eq!(
            rank_memory_types(&memory_types, u32::MAX, HOST_VISIBLE).as_slice(),
            [2, 0],
        );
        assert_eq!(
            rank_memory_types(&memory_types, 0b0001, DEVICE_LOCAL).as_slice(),
            [0],
        );
        assert_eq!(
            rank_memory_types(&memory_types, u32::MAX, vk::MemoryPropertyFlags::empty())
                .as_slice(),
            [1, 3, 2, 0],
        );
        assert!(rank_memory_types(&memory_types, 0b0100, DEVICE_LOCAL).is_empty());
    }

    #[test]
    fn falls_back_to_next_memory_type() {
        let device = MockDevice::new(vec![
            device_local_type(2048, 1),
            MemoryType {
                heap_index: 1,
                ..memory_type(DEVICE_LOCAL | HOST_VISIBLE, 1 << 20)
            },
        ]);
        let mut manager = manager(&device, 1024);
        let buffer_type = buffer_type(DEVICE_LOCAL);

        let locations = (0..3)
            .map(|_| {
                manager
                    .allocate_buffer(buffer_type, MockBufferDesc::new(1024))
                    .unwrap()
            })
            .collect::<Vec<_>>();

        assert_eq!(locations[0].memory_type_index(), 0);
        assert_eq!(locations[1].memory_type_index(), 0);
        assert_eq!(locations[2].memory_type_index(), 1);
        assert_eq!(manager.allocator_count(), 2);
        assert_eq!(manager.stats().allocation_count, 3);

        for location in locations {
            manager.free_buffer(location).unwrap();
        }

        assert_eq!(manager.stats().allocation_count, 0);
        assert_eq!(device.live_resource_count(), 0);
    }

    #[test]
    fn out_of_memory_everywhere() {
        let device = MockDevice::new(vec![device_local_type(1024, 1), device_local_type(1024, 1)]);
        let mut manager = manager(&device, 1024);

        assert_eq!(
            manager
                .allocate_buffer(buffer_type(DEVICE_LOCAL), MockBufferDesc::new(4096))
                .unwrap_err(),
            MemoryError::OutOfDeviceMemory,
        );
        assert_eq!(manager.stats(), MemoryStats::default());
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn other_errors_do_not_fall_back() {
        let device = MockDevice::new(vec![
            device_local_type(1 << 20, 1),
            device_local_type(1 << 20, 1),
        ]);
        let mut manager = manager(&device, 1024);

        device.set_fail_bind(true);
        assert!(matches!(
            manager.allocate_buffer(buffer_type(DEVICE_LOCAL), MockBufferDesc::new(64)),
            Err(MemoryError::Bind(_)),
        ));
        // Only the first memory type was tried.
        assert_eq!(manager.allocator_count(), 1);
    }

    #[test]
    fn no_suitable_memory_type() {
        let device = MockDevice::new(vec![device_local_type(1 << 20, 1)]);
        let mut manager = manager(&device, 1024);

        assert!(matches!(
            manager.allocate_buffer(buffer_type(HOST_VISIBLE), MockBufferDesc::new(64)),
            Err(MemoryError::InvalidArgument(_)),
        ));

        let descriptor = MockBufferDesc {
            memory_type_bits: 0,
            ..MockBufferDesc::new(64)
        };
        assert!(matches!(
            manager.allocate_buffer(buffer_type(DEVICE_LOCAL), descriptor),
            Err(MemoryError::InvalidArgument(_)),
        ));
        assert_eq!(manager.allocator_count(), 0);
    }

    #[test]
    fn buffers_and_images_never_share_chunks() {
        let device = MockDevice::new(vec![host_visible_type(1 << 20, 1)]);
        let mut manager = manager(&device, 4096);

        let buffer = manager
            .allocate_buffer(buffer_type(HOST_VISIBLE), MockBufferDesc::new(64))
            .unwrap();
        let image = manager
            .allocate_image(
                ImageType {
                    usage: vk::ImageUsageFlags::SAMPLED,
                    memory_flags: HOST_VISIBLE,
                },
                MockImageDesc {
                    width: 8,
                    height: 8,
                    format: MockFormat::Rgba8,
                },
            )
            .unwrap();

        assert_ne!(buffer.allocator_id(), image.allocator_id());
        assert_eq!(manager.buffer_stats().chunk_count, 1);
        assert_eq!(manager.image_stats().chunk_count, 1);
        assert_eq!(device.live_memory_count(), 2);

        // Both allocators share the creator of the memory type.
        assert_eq!(manager.creator(0).unwrap().chunk_count(), 2);

        manager.free_buffer(buffer).unwrap();
        manager.free_image(image).unwrap();
        assert_eq!(manager.shrink(), 2);
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn buffer_types_get_separate_allocators() {
        let device = MockDevice::new(vec![device_local_type(1 << 20, 1)]);
        let mut manager = manager(&device, 4096);

        let vertex = manager
            .allocate_buffer(buffer_type(DEVICE_LOCAL), MockBufferDesc::new(64))
            .unwrap();
        let uniform = manager
            .allocate_buffer(
                BufferType {
                    usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                    memory_flags: DEVICE_LOCAL,
                },
                MockBufferDesc::new(64),
            )
            .unwrap();

        assert_ne!(vertex.allocator_id(), uniform.allocator_id());
        assert_eq!(manager.allocator_count(), 2);

        manager.free_buffer(vertex).unwrap();
        manager.free_buffer(uniform).unwrap();
    }

    #[test]
    fn defragmentation_through_manager() {
        let device = MockDevice::new(vec![device_local_type(1 << 20, 1)]);
        let mut manager = manager(&device, 800);
        let buffer_type = buffer_type(DEVICE_LOCAL);

        let mut locations = (0..8)
            .map(|_| {
                manager
                    .allocate_buffer(buffer_type, MockBufferDesc::new(100))
                    .unwrap()
            })
            .collect::<Vec<_>>();

        for i in [6, 4, 2, 0] {
            manager.free_buffer(locations.remove(i)).unwrap();
        }

        let always = |_: &crate::allocator::LocationInfo| true;
        assert_eq!(manager.run_defragmentation_pass(&always).relocations, 0);

        manager.enable_defragger(true);
        let report = manager.run_defragmentation_pass(&always);
        assert_eq!(report.relocations, 4);
        assert_eq!(manager.stats().free_interval_count, 1);

        for location in locations {
            manager.free_buffer(location).unwrap();
        }
    }

    #[test]
    fn memory_types_of_one_heap_share_its_capacity() {
        let device = MockDevice::with_max_memory_allocation_count(
            vec![device_local_type(2048, 1), device_local_type(2048, 1)],
            2,
        );
        let mut manager = manager(&device, 2048);
        let buffer_type = buffer_type(DEVICE_LOCAL);

        let (a, b) = (manager.creator(0).unwrap(), manager.creator(1).unwrap());
        assert!(Arc::ptr_eq(a.heap_budget(), b.heap_budget()));
        assert!(Arc::ptr_eq(a.chunk_limit(), b.chunk_limit()));
        assert_eq!(a.heap_budget().capacity(), 2048);
        assert_eq!(a.chunk_limit().max_chunk_count(), 2);

        let location = manager
            .allocate_buffer(buffer_type, MockBufferDesc::new(2048))
            .unwrap();
        assert_eq!(location.memory_type_index(), 0);

        // The second memory type has no room left either.
        assert_eq!(
            manager
                .allocate_buffer(buffer_type, MockBufferDesc::new(2048))
                .unwrap_err(),
            MemoryError::OutOfDeviceMemory,
        );
        assert_eq!(device.live_memory_count(), 1);
        assert_eq!(manager.creator(1).unwrap().remaining_capacity(), 0);

        manager.free_buffer(location).unwrap();
        assert_eq!(manager.shrink(), 1);
        assert_eq!(manager.creator(1).unwrap().remaining_capacity(), 2048);
    }

    #[test]
    fn chunk_limit_applies_across_memory_types() {
        let device = MockDevice::with_max_memory_allocation_count(
            vec![
                device_local_type(512, 1),
                MemoryType {
                    heap_index: 1,
                    ..device_local_type(1 << 20, 1)
                },
            ],
            2,
        );
        let mut manager = manager(&device, 512);
        let buffer_type = buffer_type(DEVICE_LOCAL);

        let locations = (0..2)
            .map(|_| {
                manager
                    .allocate_buffer(buffer_type, MockBufferDesc::new(512))
                    .unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(locations[0].memory_type_index(), 0);
        assert_eq!(locations[1].memory_type_index(), 1);
        assert!(!Arc::ptr_eq(
            manager.creator(0).unwrap().heap_budget(),
            manager.creator(1).unwrap().heap_budget(),
        ));

        // The second heap has plenty of room, but the device is out of chunks.
        assert_eq!(
            manager
                .allocate_buffer(buffer_type, MockBufferDesc::new(512))
                .unwrap_err(),
            MemoryError::OutOfDeviceMemory,
        );
        assert_eq!(device.live_memory_count(), 2);

        for location in locations {
            manager.free_buffer(location).unwrap();
        }
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic)]
    fn unknown_allocator_is_rejected() {
        let device = MockDevice::new(vec![device_local_type(1 << 20, 1)]);
        let mut a = manager(&device, 1024);
        let mut b = manager(&device, 1024);

        let location = a
            .allocate_buffer(buffer_type(DEVICE_LOCAL), MockBufferDesc::new(64))
            .unwrap();
        let location = b.free_buffer(location).unwrap_err().into_location();
        a.free_buffer(location).unwrap();
    }
}
