// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The native side of memory management: device memory, resources and the calls that tie them
//! together.
//!
//! The allocators in this crate never talk to a graphics API directly. Everything they need from
//! the driver goes through the [`MemoryDevice`] trait, which [`AshDevice`] implements for Vulkan.
//!
//! [`AshDevice`]: vulkan::AshDevice

use crate::{
    layout::{DeviceAlignment, DeviceLayout},
    DeviceSize,
};
use ash::vk;
use std::{
    error::Error,
    fmt::{self, Debug, Display},
    hash::Hash,
    ptr::NonNull,
};

pub mod vulkan;

/// Static properties of one memory type of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    /// The properties of this memory type.
    pub property_flags: vk::MemoryPropertyFlags,

    /// The index of the memory heap that this memory type corresponds to.
    pub heap_index: u32,

    /// The size of the memory heap in bytes. All chunks of this memory type together can never
    /// exceed this.
    pub heap_capacity: DeviceSize,

    /// The alignment that every suballocation of this memory type is rounded up to, on top of
    /// what the resource itself requires.
    ///
    /// This is the non-coherent atom size for memory types that are host-visible but not
    /// host-coherent, so that flushing one allocation never touches its neighbours.
    pub alignment: DeviceAlignment,
}

impl MemoryType {
    /// Returns whether memory of this type can be mapped into host address space.
    #[inline]
    pub fn is_host_visible(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
}

/// Memory requirements of a resource, as reported by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// The size and alignment of the memory that the resource needs.
    pub layout: DeviceLayout,

    /// Bitmask of the memory types that the resource can be bound to. Bit *i* is set if memory
    /// type *i* is supported.
    pub memory_type_bits: u32,
}

/// The native memory and resource operations the allocators are built on.
///
/// # Safety
///
/// - `allocate_memory` must return memory of the requested memory type that is at least `size`
///   bytes large and whose start is aligned to every alignment the device can report in
///   [`MemoryRequirements`].
/// - `map_memory` must return a pointer to the start of the whole allocation that stays valid
///   until the memory is freed.
/// - `bind_buffer` and `bind_image` must bind the new resource to exactly
///   `offset..offset + requirements.layout.size()` of `memory`, and to nothing else.
/// - `copy_buffer` and `copy_image` must have completed on the device when they return.
pub unsafe trait MemoryDevice: Send + Sync + 'static {
    /// A handle to one native memory allocation.
    type Memory: Copy + Eq + Hash + Debug + Send + Sync;

    /// A native buffer bound to memory.
    type Buffer: Debug + Send + Sync;

    /// A native image bound to memory.
    type Image: Debug + Send + Sync;

    /// Everything needed to create a buffer, minus the memory.
    type BufferDescriptor: Clone + Debug + Send + Sync;

    /// Everything needed to create an image, minus the memory.
    type ImageDescriptor: Clone + Debug + Send + Sync;

    /// Returns the memory types of the device, indexed by memory type index.
    fn memory_types(&self) -> &[MemoryType];

    /// Returns how many native memory allocations may exist at once.
    fn max_memory_allocation_count(&self) -> u32;

    /// Allocates `size` bytes of memory of the given memory type.
    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<Self::Memory, DeviceError>;

    /// Frees memory returned by `allocate_memory`.
    ///
    /// # Safety
    ///
    /// - `memory` must have been returned by `allocate_memory` and not been freed yet.
    /// - No resource that is still in use may be bound to `memory`.
    unsafe fn free_memory(&self, memory: Self::Memory);

    /// Maps the whole of `memory` into host address space.
    ///
    /// # Safety
    ///
    /// - `memory` must be of a host-visible memory type and must not be mapped already.
    unsafe fn map_memory(
        &self,
        memory: Self::Memory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, DeviceError>;

    /// Queries the memory requirements of a buffer created from `descriptor`.
    fn buffer_memory_requirements(
        &self,
        descriptor: &Self::BufferDescriptor,
    ) -> Result<MemoryRequirements, DeviceError>;

    /// Queries the memory requirements of an image created from `descriptor`.
    ///
    /// These depend on the image's format and extent, so two images of the same size can still
    /// need different alignments.
    fn image_memory_requirements(
        &self,
        descriptor: &Self::ImageDescriptor,
    ) -> Result<MemoryRequirements, DeviceError>;

    /// Creates a buffer from `descriptor` and binds it to `memory` at `offset`.
    ///
    /// # Safety
    ///
    /// - The range starting at `offset` must be inside `memory`, satisfy the buffer's memory
    ///   requirements and not be bound to any other resource.
    unsafe fn bind_buffer(
        &self,
        descriptor: &Self::BufferDescriptor,
        memory: Self::Memory,
        offset: DeviceSize,
    ) -> Result<Self::Buffer, DeviceError>;

    /// Creates an image from `descriptor` and binds it to `memory` at `offset`.
    ///
    /// # Safety
    ///
    /// - The range starting at `offset` must be inside `memory`, satisfy the image's memory
    ///   requirements and not be bound to any other resource.
    unsafe fn bind_image(
        &self,
        descriptor: &Self::ImageDescriptor,
        memory: Self::Memory,
        offset: DeviceSize,
    ) -> Result<Self::Image, DeviceError>;

    /// Destroys a buffer returned by `bind_buffer`.
    ///
    /// # Safety
    ///
    /// - `buffer` must not be in use by the device.
    unsafe fn destroy_buffer(&self, buffer: Self::Buffer);

    /// Destroys an image returned by `bind_image`.
    ///
    /// # Safety
    ///
    /// - `image` must not be in use by the device.
    unsafe fn destroy_image(&self, image: Self::Image);

    /// Copies all contents of `src` into `dst` and waits for the copy to finish. Both buffers were
    /// created from `descriptor`.
    ///
    /// # Safety
    ///
    /// - Neither buffer may be in use by the device.
    unsafe fn copy_buffer(
        &self,
        descriptor: &Self::BufferDescriptor,
        src: &Self::Buffer,
        dst: &Self::Buffer,
    ) -> Result<(), DeviceError>;

    /// Copies all contents of `src` into `dst` and waits for the copy to finish. Both images were
    /// created from `descriptor`.
    ///
    /// # Safety
    ///
    /// - Neither image may be in use by the device.
    unsafe fn copy_image(
        &self,
        descriptor: &Self::ImageDescriptor,
        src: &Self::Image,
        dst: &Self::Image,
    ) -> Result<(), DeviceError>;
}

/// Error that can be returned by a [`MemoryDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceError {
    /// There is not enough memory on the host.
    OutOfHostMemory,

    /// There is not enough memory on the device.
    OutOfDeviceMemory,

    /// Too many native objects exist already.
    TooManyObjects,

    /// Failed to map memory.
    MemoryMapFailed,

    /// The device can't do what was asked of it, for example because a resource is not
    /// supported with the given parameters.
    Unsupported,

    /// Any other error reported by Vulkan.
    Vulkan(vk::Result),
}

impl DeviceError {
    /// Returns whether the error means that memory or native objects ran out, as opposed to the
    /// request being wrong.
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfHostMemory | Self::OutOfDeviceMemory | Self::TooManyObjects,
        )
    }
}

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MemoryMapFailed,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED | vk::Result::ERROR_FEATURE_NOT_PRESENT => {
                Self::Unsupported
            }
            result => Self::Vulkan(result),
        }
    }
}

impl Error for DeviceError {}

impl Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfHostMemory => f.write_str("out of host memory"),
            Self::OutOfDeviceMemory => f.write_str("out of device memory"),
            Self::TooManyObjects => f.write_str("too many native objects exist already"),
            Self::MemoryMapFailed => f.write_str("failed to map memory"),
            Self::Unsupported => f.write_str("the operation is not supported by the device"),
            Self::Vulkan(result) => write!(f, "Vulkan error, VkResult value {}", result.as_raw()),
        }
    }
}
