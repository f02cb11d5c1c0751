// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Chunk-based suballocation of device memory for buffers and images.
//!
//! Allocating device memory is expensive, and drivers only allow a low number of live
//! allocations at any time. This crate therefore allocates memory in large *chunks* and divides
//! each chunk into many resource-sized intervals, tracking which intervals are free and merging
//! neighbouring free intervals back together when resources are freed.
//!
//! # Brief summary
//!
//! - A [`MemoryDevice`] is the native side: it allocates and frees device memory, binds buffers
//!   and images to it and copies their contents. [`AshDevice`] implements it for Vulkan, and any
//!   other backend can be plugged in.
//!
//! - A [`ChunkCreator`] allocates chunks of one memory type. It is shared between every allocator
//!   using that memory type and is the single place where the heap's capacity and the number of
//!   live chunks are accounted.
//!
//! - A [`ChunkAllocator`] owns the chunks for one memory type and one kind of resource. Use the
//!   [`BufferChunkAllocator`] and [`ImageChunkAllocator`] aliases. Where inside the chunks a
//!   resource is placed is decided by a [`FitStrategy`].
//!
//! - Every allocation returns a [`MemoryLocation`], which is the only thing the client keeps. The
//!   [defragmenter] may move the allocation behind the client's back, but only when the client's
//!   [`RelocationGuard`] says the resource is no longer in use, and it always updates the
//!   location in place.
//!
//! - If you just want buffers and images without thinking about memory types, use the
//!   [`MemoryManager`].
//!
//! [`MemoryDevice`]: device::MemoryDevice
//! [`AshDevice`]: device::vulkan::AshDevice
//! [`ChunkCreator`]: allocator::ChunkCreator
//! [`ChunkAllocator`]: allocator::ChunkAllocator
//! [`BufferChunkAllocator`]: allocator::BufferChunkAllocator
//! [`ImageChunkAllocator`]: allocator::ImageChunkAllocator
//! [`FitStrategy`]: allocator::FitStrategy
//! [`MemoryLocation`]: allocator::MemoryLocation
//! [defragmenter]: allocator::defrag
//! [`RelocationGuard`]: allocator::RelocationGuard
//! [`MemoryManager`]: manager::MemoryManager

pub use ash;
/// Represents memory size and offset values on a device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;
use std::num::NonZeroU64;

pub mod allocator;
pub mod device;
pub mod layout;
pub mod manager;
mod tests;

/// A [`DeviceSize`] that is known not to equal zero.
pub type NonZeroDeviceSize = NonZeroU64;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());
