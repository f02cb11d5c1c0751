// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! [`MemoryDevice`] for Vulkan, on top of `ash`.
//!
//! Buffers and images are always created with `TRANSFER_SRC` and `TRANSFER_DST` usage on top of
//! what their descriptor asks for, so that the defragmenter can copy them. Copies are recorded
//! into a single command buffer owned by the [`AshDevice`], submitted to the queue it was created
//! with and waited on before returning.

use super::{DeviceError, MemoryDevice, MemoryRequirements, MemoryType};
use crate::{
    layout::{DeviceAlignment, DeviceLayout},
    DeviceSize, NonExhaustive,
};
use ash::vk;
use parking_lot::Mutex;
use std::{
    cmp,
    fmt::{Debug, Formatter, Result as FmtResult},
    ptr::NonNull,
    sync::Arc,
};

/// A Vulkan device, as seen by the allocators.
pub struct AshDevice {
    device: ash::Device,
    memory_types: Vec<MemoryType>,
    max_memory_allocation_count: u32,
    transfer: Mutex<TransferContext>,
}

struct TransferContext {
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl AshDevice {
    /// Creates a new `AshDevice`.
    ///
    /// The memory types are read from `physical_device`. Only three quarters of the device's
    /// `max_memory_allocation_count` are made available to chunks, leaving room for allocations
    /// made outside of the allocators.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, and must outlive the returned
    ///   object and everything allocated through it.
    /// - `create_info.queue` must be a queue of `device` from the family
    ///   `create_info.queue_family_index`, and that family must support transfer operations.
    /// - The queue must not be used by anything else while a defragmentation pass is running.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        create_info: AshDeviceCreateInfo,
    ) -> Result<Arc<Self>, DeviceError> {
        let AshDeviceCreateInfo {
            queue_family_index,
            queue,
            _ne: _,
        } = create_info;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let memory_types =
            memory_types(&memory_properties, properties.limits.non_coherent_atom_size);

        let transfer = unsafe { TransferContext::new(&device, queue_family_index, queue) }?;

        Ok(Arc::new(AshDevice {
            device,
            memory_types,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count * 3 / 4,
            transfer: Mutex::new(transfer),
        }))
    }

    /// Returns the `ash` device.
    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn create_buffer(&self, descriptor: &AshBufferDescriptor) -> Result<vk::Buffer, DeviceError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(with_transfer_usage(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        Ok(unsafe { self.device.create_buffer(&create_info, None) }?)
    }

    fn create_image(&self, descriptor: &AshImageDescriptor) -> Result<vk::Image, DeviceError> {
        let create_info = vk::ImageCreateInfo::default()
            .flags(descriptor.flags)
            .image_type(descriptor.image_type)
            .format(descriptor.format)
            .extent(descriptor.extent)
            .mip_levels(descriptor.mip_levels)
            .array_layers(descriptor.array_layers)
            .samples(descriptor.samples)
            .tiling(descriptor.tiling)
            .usage(
                descriptor.usage
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        Ok(unsafe { self.device.create_image(&create_info, None) }?)
    }

    /// Records commands with `record`, submits them and waits for them to complete.
    unsafe fn submit_and_wait(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<(), DeviceError> {
        let transfer = self.transfer.lock();
        let command_buffer = transfer.command_buffer;

        unsafe {
            self.device.reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )
        }?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }?;
        record(&self.device, command_buffer);
        unsafe { self.device.end_command_buffer(command_buffer) }?;

        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            self.device
                .queue_submit(transfer.queue, &[submit_info], transfer.fence)
        }?;

        let waited = unsafe {
            self.device
                .wait_for_fences(&[transfer.fence], true, u64::MAX)
        };
        let reset = unsafe { self.device.reset_fences(&[transfer.fence]) };

        waited?;
        reset?;

        Ok(())
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        let transfer = self.transfer.get_mut();

        unsafe {
            self.device.destroy_fence(transfer.fence, None);
            // Frees the command buffer too.
            self.device.destroy_command_pool(transfer.command_pool, None);
        }
    }
}

impl Debug for AshDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("AshDevice")
            .field("handle", &self.device.handle())
            .field("memory_types", &self.memory_types)
            .field(
                "max_memory_allocation_count",
                &self.max_memory_allocation_count,
            )
            .finish_non_exhaustive()
    }
}

impl TransferContext {
    unsafe fn new(
        device: &ash::Device,
        queue_family_index: u32,
        queue: vk::Queue,
    ) -> Result<Self, DeviceError> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }?;

        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.allocate_command_buffers(&allocate_info) } {
            Ok(command_buffers) => command_buffers[0],
            Err(err) => {
                unsafe { device.destroy_command_pool(command_pool, None) };

                return Err(err.into());
            }
        };

        let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { device.destroy_command_pool(command_pool, None) };

                return Err(err.into());
            }
        };

        Ok(TransferContext {
            queue,
            command_pool,
            command_buffer,
            fence,
        })
    }
}

unsafe impl MemoryDevice for AshDevice {
    type Memory = vk::DeviceMemory;
    type Buffer = vk::Buffer;
    type Image = vk::Image;
    type BufferDescriptor = AshBufferDescriptor;
    type ImageDescriptor = AshImageDescriptor;

    #[inline]
    fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    #[inline]
    fn max_memory_allocation_count(&self) -> u32 {
        self.max_memory_allocation_count
    }

    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<vk::DeviceMemory, DeviceError> {
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        Ok(unsafe { self.device.allocate_memory(&allocate_info, None) }?)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        // Freeing also unmaps the memory.
        unsafe { self.device.free_memory(memory, None) };
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, DeviceError> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
        }?;

        NonNull::new(ptr.cast()).ok_or(DeviceError::MemoryMapFailed)
    }

    fn buffer_memory_requirements(
        &self,
        descriptor: &AshBufferDescriptor,
    ) -> Result<MemoryRequirements, DeviceError> {
        let buffer = self.create_buffer(descriptor)?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        unsafe { self.device.destroy_buffer(buffer, None) };

        memory_requirements(requirements)
    }

    fn image_memory_requirements(
        &self,
        descriptor: &AshImageDescriptor,
    ) -> Result<MemoryRequirements, DeviceError> {
        let image = self.create_image(descriptor)?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        unsafe { self.device.destroy_image(image, None) };

        memory_requirements(requirements)
    }

    unsafe fn bind_buffer(
        &self,
        descriptor: &AshBufferDescriptor,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<vk::Buffer, DeviceError> {
        let buffer = self.create_buffer(descriptor)?;

        match unsafe { self.device.bind_buffer_memory(buffer, memory, offset) } {
            Ok(()) => Ok(buffer),
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };

                Err(err.into())
            }
        }
    }

    unsafe fn bind_image(
        &self,
        descriptor: &AshImageDescriptor,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<vk::Image, DeviceError> {
        let image = self.create_image(descriptor)?;

        match unsafe { self.device.bind_image_memory(image, memory, offset) } {
            Ok(()) => Ok(image),
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };

                Err(err.into())
            }
        }
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    unsafe fn copy_buffer(
        &self,
        descriptor: &AshBufferDescriptor,
        src: &vk::Buffer,
        dst: &vk::Buffer,
    ) -> Result<(), DeviceError> {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: descriptor.size,
        };

        unsafe {
            self.submit_and_wait(|device, command_buffer| {
                device.cmd_copy_buffer(command_buffer, *src, *dst, &[region]);
            })
        }
    }

    unsafe fn copy_image(
        &self,
        descriptor: &AshImageDescriptor,
        src: &vk::Image,
        dst: &vk::Image,
    ) -> Result<(), DeviceError> {
        match descriptor.layout {
            // The contents are undefined anyway, and the new image starts out undefined as well.
            vk::ImageLayout::UNDEFINED => return Ok(()),
            // There's no way to transition back into this layout.
            vk::ImageLayout::PREINITIALIZED => return Err(DeviceError::Unsupported),
            _ => {}
        }

        let regions = (0..descriptor.mip_levels)
            .map(|mip_level| {
                let subresource = vk::ImageSubresourceLayers {
                    aspect_mask: descriptor.aspect,
                    mip_level,
                    base_array_layer: 0,
                    layer_count: descriptor.array_layers,
                };

                vk::ImageCopy {
                    src_subresource: subresource,
                    src_offset: vk::Offset3D::default(),
                    dst_subresource: subresource,
                    dst_offset: vk::Offset3D::default(),
                    extent: mip_extent(descriptor.extent, mip_level),
                }
            })
            .collect::<Vec<_>>();

        let range = vk::ImageSubresourceRange {
            aspect_mask: descriptor.aspect,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        };
        let barrier = |image, old_layout, new_layout, src_access_mask, dst_access_mask| {
            vk::ImageMemoryBarrier::default()
                .src_access_mask(src_access_mask)
                .dst_access_mask(dst_access_mask)
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
        };

        let before = [
            barrier(
                *src,
                descriptor.layout,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::MEMORY_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            ),
            barrier(
                *dst,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        ];
        let after = [
            barrier(
                *src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                descriptor.layout,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::empty(),
            ),
            barrier(
                *dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                descriptor.layout,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            ),
        ];

        unsafe {
            self.submit_and_wait(|device, command_buffer| {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &before,
                );
                device.cmd_copy_image(
                    command_buffer,
                    *src,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    *dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &regions,
                );
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &after,
                );
            })
        }
    }
}

/// Everything needed to create a buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AshBufferDescriptor {
    /// The size of the buffer in bytes.
    pub size: DeviceSize,

    /// How the buffer is going to be used.
    pub usage: vk::BufferUsageFlags,
}

/// Everything needed to create an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AshImageDescriptor {
    pub flags: vk::ImageCreateFlags,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,

    /// The layout that the image is in whenever a defragmentation pass runs. A relocated image is
    /// left in this layout.
    ///
    /// If this is `UNDEFINED`, the contents are not copied when the image is relocated.
    pub layout: vk::ImageLayout,

    /// The aspects of the image to copy when it is relocated.
    pub aspect: vk::ImageAspectFlags,
}

impl Default for AshImageDescriptor {
    #[inline]
    fn default() -> Self {
        AshImageDescriptor {
            flags: vk::ImageCreateFlags::empty(),
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::UNDEFINED,
            extent: vk::Extent3D {
                width: 0,
                height: 0,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::empty(),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }
}

/// Parameters to create a new [`AshDevice`].
#[derive(Clone, Debug)]
pub struct AshDeviceCreateInfo {
    /// The queue family of `queue`.
    ///
    /// The default value is `0`.
    pub queue_family_index: u32,

    /// The queue that relocation copies are submitted to.
    ///
    /// There is no default value.
    pub queue: vk::Queue,

    pub _ne: NonExhaustive,
}

impl Default for AshDeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        AshDeviceCreateInfo {
            queue_family_index: 0,
            queue: vk::Queue::null(),
            _ne: NonExhaustive(()),
        }
    }
}

/// Converts the memory properties of a physical device.
///
/// Memory types that are host-visible but not host-coherent are aligned to
/// `non_coherent_atom_size`, so that flushing or invalidating one allocation never touches
/// another.
fn memory_types(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: DeviceSize,
) -> Vec<MemoryType> {
    let atom_size = DeviceAlignment::new(non_coherent_atom_size).unwrap_or(DeviceAlignment::MIN);

    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .map(|memory_type| {
            let property_flags = memory_type.property_flags;
            let is_non_coherent = property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                && !property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT);

            MemoryType {
                property_flags,
                heap_index: memory_type.heap_index,
                heap_capacity: memory_properties.memory_heaps[memory_type.heap_index as usize]
                    .size,
                alignment: if is_non_coherent {
                    atom_size
                } else {
                    DeviceAlignment::MIN
                },
            }
        })
        .collect()
}

fn memory_requirements(
    requirements: vk::MemoryRequirements,
) -> Result<MemoryRequirements, DeviceError> {
    let layout = DeviceLayout::from_size_alignment(requirements.size, requirements.alignment)
        .ok_or(DeviceError::Unsupported)?;

    Ok(MemoryRequirements {
        layout,
        memory_type_bits: requirements.memory_type_bits,
    })
}

fn with_transfer_usage(usage: vk::BufferUsageFlags) -> vk::BufferUsageFlags {
    usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
}

fn mip_extent(extent: vk::Extent3D, mip_level: u32) -> vk::Extent3D {
    let level = |dimension: u32| cmp::max(dimension.checked_shr(mip_level).unwrap_or(0), 1);

    vk::Extent3D {
        width: level(extent.width),
        height: level(extent.height),
        depth: level(extent.depth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_types_from_properties() {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            memory_heap_count: 2,
            ..Default::default()
        };
        properties.memory_heaps[0].size = 8 << 30;
        properties.memory_heaps[1].size = 256 << 20;
        properties.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        properties.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_CACHED,
            heap_index: 1,
        };
        properties.memory_types[2] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };

        let memory_types = memory_types(&properties, 64);

        assert_eq!(memory_types.len(), 3);
        assert_eq!(memory_types[0].heap_capacity, 8 << 30);
        assert_eq!(memory_types[0].alignment, DeviceAlignment::MIN);
        assert!(!memory_types[0].is_host_visible());
        // Non-coherent memory is aligned to the atom size.
        assert_eq!(memory_types[1].alignment.as_devicesize(), 64);
        assert_eq!(memory_types[1].heap_capacity, 256 << 20);
        assert_eq!(memory_types[2].alignment, DeviceAlignment::MIN);
    }

    #[test]
    fn requirements_conversion() {
        let requirements = memory_requirements(vk::MemoryRequirements {
            size: 1000,
            alignment: 256,
            memory_type_bits: 0b101,
        })
        .unwrap();
        assert_eq!(requirements.layout.size(), 1000);
        assert_eq!(requirements.layout.alignment().as_devicesize(), 256);
        assert_eq!(requirements.memory_type_bits, 0b101);

        assert_eq!(
            memory_requirements(vk::MemoryRequirements {
                size: 0,
                alignment: 1,
                memory_type_bits: 1,
            }),
            Err(DeviceError::Unsupported),
        );
    }

    #[test]
    fn mip_extents() {
        let extent = vk::Extent3D {
            width: 256,
            height: 64,
            depth: 1,
        };

        assert_eq!(mip_extent(extent, 0), extent);
        assert_eq!(
            mip_extent(extent, 3),
            vk::Extent3D {
                width: 32,
                height: 8,
                depth: 1,
            },
        );
        assert_eq!(
            mip_extent(extent, 7),
            vk::Extent3D {
                width: 2,
                height: 1,
                depth: 1,
            },
        );
        assert_eq!(mip_extent(extent, 40).width, 1);
    }

    #[test]
    fn transfer_usage_is_added() {
        let usage = with_transfer_usage(vk::BufferUsageFlags::VERTEX_BUFFER);

        assert!(usage.contains(
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST
        ));
    }
}
