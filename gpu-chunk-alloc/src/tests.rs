// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(test)]

//! A device that keeps its "device memory" in host memory, so that allocators can be tested
//! without a GPU.

use crate::{
    allocator::{
        BufferChunkAllocator, ChunkAllocatorCreateInfo, ChunkCreator, FitStrategy,
        ImageChunkAllocator,
    },
    device::{DeviceError, MemoryDevice, MemoryRequirements, MemoryType},
    layout::{DeviceAlignment, DeviceLayout},
    DeviceSize,
};
use ash::vk;
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

pub(crate) fn host_visible_type(heap_capacity: DeviceSize, alignment: DeviceSize) -> MemoryType {
    MemoryType {
        property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT,
        heap_index: 0,
        heap_capacity,
        alignment: DeviceAlignment::new(alignment).unwrap(),
    }
}

pub(crate) fn device_local_type(heap_capacity: DeviceSize, alignment: DeviceSize) -> MemoryType {
    MemoryType {
        property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        heap_index: 0,
        heap_capacity,
        alignment: DeviceAlignment::new(alignment).unwrap(),
    }
}

pub(crate) fn buffer_allocator(
    device: &Arc<MockDevice>,
    chunk_size: DeviceSize,
    fit_strategy: Arc<dyn FitStrategy>,
) -> BufferChunkAllocator<MockDevice> {
    let creator = ChunkCreator::new(device.clone(), 0, Default::default()).unwrap();

    BufferChunkAllocator::new(
        creator,
        ChunkAllocatorCreateInfo {
            chunk_size,
            fit_strategy,
            ..Default::default()
        },
    )
    .unwrap()
}

pub(crate) fn image_allocator(
    device: &Arc<MockDevice>,
    chunk_size: DeviceSize,
    fit_strategy: Arc<dyn FitStrategy>,
) -> ImageChunkAllocator<MockDevice> {
    let creator = ChunkCreator::new(device.clone(), 0, Default::default()).unwrap();

    ImageChunkAllocator::new(
        creator,
        ChunkAllocatorCreateInfo {
            chunk_size,
            fit_strategy,
            ..Default::default()
        },
    )
    .unwrap()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MockMemory(u64);

/// A buffer or image bound to mock memory.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MockResource {
    pub(crate) memory: MockMemory,
    pub(crate) offset: DeviceSize,
    pub(crate) size: DeviceSize,
}

#[derive(Clone, Debug)]
pub(crate) struct MockBufferDesc {
    pub(crate) size: DeviceSize,
    pub(crate) alignment: DeviceSize,
    pub(crate) memory_type_bits: u32,
}

impl MockBufferDesc {
    pub(crate) fn new(size: DeviceSize) -> Self {
        MockBufferDesc {
            size,
            alignment: 1,
            memory_type_bits: u32::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MockFormat {
    R8,
    Rgba8,
    Rgba32Float,
}

impl MockFormat {
    pub(crate) fn bytes_per_pixel(self) -> DeviceSize {
        match self {
            MockFormat::R8 => 1,
            MockFormat::Rgba8 => 4,
            MockFormat::Rgba32Float => 16,
        }
    }

    pub(crate) fn alignment(self) -> DeviceSize {
        match self {
            MockFormat::R8 => 64,
            MockFormat::Rgba8 => 256,
            MockFormat::Rgba32Float => 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct MockImageDesc {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: MockFormat,
}

struct Allocation {
    data: NonNull<[u8]>,
    memory_type_index: u32,
}

// SAFETY: The allocation is only accessed through `MockDevice`, which synchronizes it.
unsafe impl Send for Allocation {}

#[derive(Debug, Default)]
struct Failures {
    allocate: AtomicBool,
    map: AtomicBool,
    bind: AtomicBool,
    copy: AtomicBool,
}

/// A `MemoryDevice` whose memory lives on the host heap.
pub(crate) struct MockDevice {
    memory_types: Vec<MemoryType>,
    max_memory_allocation_count: u32,
    next_memory: AtomicUsize,
    allocations: Mutex<HashMap<u64, Allocation>>,
    live_resources: AtomicUsize,
    copies: AtomicUsize,
    failures: Failures,
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("memory_types", &self.memory_types)
            .field("live_memory_count", &self.live_memory_count())
            .field("live_resource_count", &self.live_resource_count())
            .finish_non_exhaustive()
    }
}

impl MockDevice {
    pub(crate) fn new(memory_types: Vec<MemoryType>) -> Arc<Self> {
        Self::with_max_memory_allocation_count(memory_types, 4096)
    }

    pub(crate) fn with_max_memory_allocation_count(
        memory_types: Vec<MemoryType>,
        max_memory_allocation_count: u32,
    ) -> Arc<Self> {
        Arc::new(MockDevice {
            memory_types,
            max_memory_allocation_count,
            next_memory: AtomicUsize::new(1),
            allocations: Mutex::new(HashMap::default()),
            live_resources: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
            failures: Failures::default(),
        })
    }

    pub(crate) fn live_memory_count(&self) -> usize {
        self.allocations.lock().len()
    }

    pub(crate) fn live_resource_count(&self) -> usize {
        self.live_resources.load(Ordering::Acquire)
    }

    /// Returns how many copies completed successfully.
    pub(crate) fn copy_count(&self) -> usize {
        self.copies.load(Ordering::Acquire)
    }

    pub(crate) fn set_fail_allocate(&self, fail: bool) {
        self.failures.allocate.store(fail, Ordering::Release);
    }

    pub(crate) fn set_fail_map(&self, fail: bool) {
        self.failures.map.store(fail, Ordering::Release);
    }

    pub(crate) fn set_fail_bind(&self, fail: bool) {
        self.failures.bind.store(fail, Ordering::Release);
    }

    pub(crate) fn set_fail_copy(&self, fail: bool) {
        self.failures.copy.store(fail, Ordering::Release);
    }

    fn resource_ptr(&self, resource: &MockResource) -> *mut u8 {
        let allocations = self.allocations.lock();
        let allocation = &allocations[&resource.memory.0];
        assert!(resource.offset + resource.size <= allocation.data.len() as DeviceSize);

        unsafe { allocation.data.cast::<u8>().as_ptr().add(resource.offset as usize) }
    }

    /// Reads back the memory that `resource` is bound to.
    pub(crate) fn read(&self, resource: &MockResource) -> Vec<u8> {
        let ptr = self.resource_ptr(resource);

        unsafe { std::slice::from_raw_parts(ptr, resource.size as usize) }.to_vec()
    }

    /// Overwrites the beginning of the memory that `resource` is bound to.
    pub(crate) fn write(&self, resource: &MockResource, data: &[u8]) {
        assert!(data.len() as DeviceSize <= resource.size);
        let ptr = self.resource_ptr(resource);

        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
    }

    fn bind(
        &self,
        memory: MockMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<MockResource, DeviceError> {
        if self.failures.bind.load(Ordering::Acquire) {
            return Err(DeviceError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }

        let resource = MockResource {
            memory,
            offset,
            size,
        };
        // Checks that the range is inside the memory.
        self.resource_ptr(&resource);
        self.live_resources.fetch_add(1, Ordering::AcqRel);

        Ok(resource)
    }

    fn copy(&self, src: &MockResource, dst: &MockResource) -> Result<(), DeviceError> {
        if self.failures.copy.load(Ordering::Acquire) {
            return Err(DeviceError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }

        assert_eq!(src.size, dst.size);
        let src_ptr = self.resource_ptr(src);
        let dst_ptr = self.resource_ptr(dst);

        // The ranges may overlap when a resource moves within its chunk.
        unsafe { ptr::copy(src_ptr, dst_ptr, src.size as usize) };
        self.copies.fetch_add(1, Ordering::AcqRel);

        Ok(())
    }

    fn destroy(&self, _resource: MockResource) {
        self.live_resources.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        for (_, allocation) in self.allocations.get_mut().drain() {
            drop(unsafe { Box::from_raw(allocation.data.as_ptr()) });
        }
    }
}

unsafe impl MemoryDevice for MockDevice {
    type Memory = MockMemory;
    type Buffer = MockResource;
    type Image = MockResource;
    type BufferDescriptor = MockBufferDesc;
    type ImageDescriptor = MockImageDesc;

    fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    fn max_memory_allocation_count(&self) -> u32 {
        self.max_memory_allocation_count
    }

    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<MockMemory, DeviceError> {
        assert!((memory_type_index as usize) < self.memory_types.len());

        if self.failures.allocate.load(Ordering::Acquire) {
            return Err(DeviceError::OutOfDeviceMemory);
        }

        let mut allocations = self.allocations.lock();

        if allocations.len() >= self.max_memory_allocation_count as usize {
            return Err(DeviceError::TooManyObjects);
        }

        let size = usize::try_from(size).map_err(|_| DeviceError::OutOfHostMemory)?;
        let data = NonNull::from(Box::leak(vec![0u8; size].into_boxed_slice()));
        let id = self.next_memory.fetch_add(1, Ordering::Relaxed) as u64;
        allocations.insert(
            id,
            Allocation {
                data,
                memory_type_index,
            },
        );

        Ok(MockMemory(id))
    }

    unsafe fn free_memory(&self, memory: MockMemory) {
        let allocation = self
            .allocations
            .lock()
            .remove(&memory.0)
            .expect("freed memory that doesn't exist");

        drop(unsafe { Box::from_raw(allocation.data.as_ptr()) });
    }

    unsafe fn map_memory(
        &self,
        memory: MockMemory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, DeviceError> {
        if self.failures.map.load(Ordering::Acquire) {
            return Err(DeviceError::MemoryMapFailed);
        }

        let allocations = self.allocations.lock();
        let allocation = &allocations[&memory.0];
        assert_eq!(allocation.data.len() as DeviceSize, size);

        if !self.memory_types[allocation.memory_type_index as usize].is_host_visible() {
            return Err(DeviceError::MemoryMapFailed);
        }

        Ok(allocation.data.cast())
    }

    fn buffer_memory_requirements(
        &self,
        descriptor: &MockBufferDesc,
    ) -> Result<MemoryRequirements, DeviceError> {
        let layout = DeviceLayout::from_size_alignment(descriptor.size, descriptor.alignment)
            .ok_or(DeviceError::Unsupported)?;

        Ok(MemoryRequirements {
            layout,
            memory_type_bits: descriptor.memory_type_bits,
        })
    }

    fn image_memory_requirements(
        &self,
        descriptor: &MockImageDesc,
    ) -> Result<MemoryRequirements, DeviceError> {
        let size = DeviceSize::from(descriptor.width)
            * DeviceSize::from(descriptor.height)
            * descriptor.format.bytes_per_pixel();
        let layout = DeviceLayout::from_size_alignment(size, descriptor.format.alignment())
            .ok_or(DeviceError::Unsupported)?;

        Ok(MemoryRequirements {
            layout,
            memory_type_bits: u32::MAX,
        })
    }

    unsafe fn bind_buffer(
        &self,
        descriptor: &MockBufferDesc,
        memory: MockMemory,
        offset: DeviceSize,
    ) -> Result<MockResource, DeviceError> {
        assert_eq!(offset % descriptor.alignment, 0);

        self.bind(memory, offset, descriptor.size)
    }

    unsafe fn bind_image(
        &self,
        descriptor: &MockImageDesc,
        memory: MockMemory,
        offset: DeviceSize,
    ) -> Result<MockResource, DeviceError> {
        let requirements = self.image_memory_requirements(descriptor)?;
        assert_eq!(offset % requirements.layout.alignment().as_devicesize(), 0);

        self.bind(memory, offset, requirements.layout.size())
    }

    unsafe fn destroy_buffer(&self, buffer: MockResource) {
        self.destroy(buffer);
    }

    unsafe fn destroy_image(&self, image: MockResource) {
        self.destroy(image);
    }

    unsafe fn copy_buffer(
        &self,
        _descriptor: &MockBufferDesc,
        src: &MockResource,
        dst: &MockResource,
    ) -> Result<(), DeviceError> {
        self.copy(src, dst)
    }

    unsafe fn copy_image(
        &self,
        _descriptor: &MockImageDesc,
        src: &MockResource,
        dst: &MockResource,
    ) -> Result<(), DeviceError> {
        self.copy(src, dst)
    }
}
