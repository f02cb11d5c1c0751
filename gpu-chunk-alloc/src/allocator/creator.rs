// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    chunk::{Chunk, ChunkId, MappedPtr},
    MemoryError,
};
use crate::{
    device::{MemoryDevice, MemoryType},
    layout::DeviceLayout,
    DeviceSize, NonExhaustive,
};
use log::info;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Allocates chunks of one memory type.
///
/// Every allocator that uses a given memory type should share the same `ChunkCreator`. The
/// creator in turn draws from a [`HeapBudget`] shared by all memory types of its heap, and from a
/// [`ChunkLimit`] shared by the whole device. Allocators on different threads can create chunks at
/// the same time without being able to overcommit the heap or the device between them.
#[derive(Debug)]
pub struct ChunkCreator<D: MemoryDevice> {
    device: Arc<D>,
    memory_type_index: u32,
    memory_type: MemoryType,
    heap_budget: Arc<HeapBudget>,
    chunk_limit: Arc<ChunkLimit>,
    next_chunk_id: AtomicU64,
    // Only the chunks of this creator. Always locked after the budget and the limit.
    state: Mutex<CreatorState>,
}

#[derive(Debug, Default)]
struct CreatorState {
    allocated_size: DeviceSize,
    chunk_count: u32,
}

impl<D: MemoryDevice> ChunkCreator<D> {
    /// Creates a new `ChunkCreator` for the memory type at `memory_type_index`.
    pub fn new(
        device: Arc<D>,
        memory_type_index: u32,
        create_info: ChunkCreatorCreateInfo,
    ) -> Result<Arc<Self>, MemoryError> {
        let ChunkCreatorCreateInfo {
            max_chunk_count,
            heap_budget,
            chunk_limit,
            _ne: _,
        } = create_info;

        let memory_type = *device
            .memory_types()
            .get(memory_type_index as usize)
            .ok_or(MemoryError::InvalidArgument(
                "`memory_type_index` is not less than the number of memory types of the device",
            ))?;

        let heap_budget = match heap_budget {
            Some(heap_budget) if heap_budget.heap_index != memory_type.heap_index => {
                return Err(MemoryError::InvalidArgument(
                    "`heap_budget` belongs to a different heap than the memory type",
                ));
            }
            Some(heap_budget) => heap_budget,
            None => HeapBudget::new(memory_type.heap_index, memory_type.heap_capacity),
        };

        let chunk_limit = match (chunk_limit, max_chunk_count) {
            (Some(_), Some(_)) => {
                return Err(MemoryError::InvalidArgument(
                    "`max_chunk_count` and `chunk_limit` can't both be provided",
                ));
            }
            (Some(chunk_limit), None) => chunk_limit,
            (None, max_chunk_count) => ChunkLimit::new(
                max_chunk_count.unwrap_or_else(|| device.max_memory_allocation_count()),
            )?,
        };

        Ok(Arc::new(ChunkCreator {
            device,
            memory_type_index,
            memory_type,
            heap_budget,
            chunk_limit,
            next_chunk_id: AtomicU64::new(0),
            state: Mutex::new(CreatorState::default()),
        }))
    }

    /// Returns the device that chunks are allocated from.
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Returns the index of the memory type that chunks are allocated from.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Returns the properties of the memory type that chunks are allocated from.
    #[inline]
    pub fn memory_type(&self) -> &MemoryType {
        &self.memory_type
    }

    /// Returns the budget of the heap that chunks are allocated from.
    #[inline]
    pub fn heap_budget(&self) -> &Arc<HeapBudget> {
        &self.heap_budget
    }

    /// Returns the limit on the number of chunks that this creator counts against.
    #[inline]
    pub fn chunk_limit(&self) -> &Arc<ChunkLimit> {
        &self.chunk_limit
    }

    /// Returns the maximum number of chunks that may exist at once, counting those of every
    /// creator sharing the same [`ChunkLimit`].
    #[inline]
    pub fn max_chunk_count(&self) -> u32 {
        self.chunk_limit.max_chunk_count()
    }

    /// Returns the number of chunks of this creator that currently exist.
    #[inline]
    pub fn chunk_count(&self) -> u32 {
        self.state.lock().chunk_count
    }

    /// Returns the total size of the chunks of this creator that currently exist.
    #[inline]
    pub fn allocated_size(&self) -> DeviceSize {
        self.state.lock().allocated_size
    }

    /// Returns how much of the heap's capacity is still available for new chunks, from this
    /// creator or any other one sharing the heap.
    #[inline]
    pub fn remaining_capacity(&self) -> DeviceSize {
        self.heap_budget.remaining_capacity()
    }

    /// Allocates a new chunk of `size` bytes.
    ///
    /// The capacity is reserved before the native allocation is made and given back if it fails,
    /// so that a failed call leaves the accounting as it was.
    pub(crate) fn create_chunk(&self, size: DeviceSize) -> Result<Chunk<D::Memory>, MemoryError> {
        if size == 0 || size > DeviceLayout::MAX_SIZE {
            return Err(MemoryError::InvalidArgument(
                "chunk size must be greater than zero and not exceed `DeviceLayout::MAX_SIZE`",
            ));
        }

        {
            let mut chunk_count = self.chunk_limit.chunk_count.lock();
            let mut allocated_size = self.heap_budget.allocated_size.lock();

            if *chunk_count >= self.chunk_limit.max_chunk_count
                || size > self.heap_budget.capacity - *allocated_size
            {
                return Err(MemoryError::OutOfDeviceMemory);
            }

            *chunk_count += 1;
            *allocated_size += size;

            let mut state = self.state.lock();
            state.chunk_count += 1;
            state.allocated_size += size;
        }

        match self.allocate_chunk(size) {
            Ok(chunk) => {
                info!(
                    "created chunk {:?} of {} bytes in memory type {}",
                    chunk.id(),
                    size,
                    self.memory_type_index,
                );

                Ok(chunk)
            }
            Err(err) => {
                self.give_back(size);

                Err(err)
            }
        }
    }
    fn allocate_chunk(&self, size: DeviceSize) -> Result<Chunk<D::Memory>, MemoryError> {
        let memory = self
            .device
            .allocate_memory(self.memory_type_index, size)
            .map_err(|err| {
                if err.is_out_of_memory() {
                    MemoryError::OutOfDeviceMemory
                } else {
                    MemoryError::Device(err)
                }
            })?;

        let mapped_ptr = if self.memory_type.is_host_visible() {
            match unsafe { self.device.map_memory(memory, size) } {
                Ok(ptr) => Some(MappedPtr::new(ptr)),
                Err(err) => {
                    unsafe { self.device.free_memory(memory) };

                    return Err(MemoryError::Device(err));
                }
            }
        } else {
            None
        };

        let id = ChunkId(self.next_chunk_id.fetch_add(1, Ordering::Relaxed));

        Ok(Chunk::new(id, memory, size, mapped_ptr))
    }

    /// Frees the native memory of `chunk` and gives back its capacity.
    ///
    /// # Safety
    ///
    /// - `chunk` must have been created by `self`.
    /// - No resource may be bound to the chunk anymore.
    pub(crate) unsafe fn destroy_chunk(&self, chunk: Chunk<D::Memory>) {
        debug_assert!(chunk.is_empty());

        unsafe { self.device.free_memory(chunk.memory()) };
        self.give_back(chunk.size());

        info!(
            "destroyed chunk {:?} of {} bytes in memory type {}",
            chunk.id(),
            chunk.size(),
            self.memory_type_index,
        );
    }

    fn give_back(&self, size: DeviceSize) {
        let mut chunk_count = self.chunk_limit.chunk_count.lock();
        let mut allocated_size = self.heap_budget.allocated_size.lock();
        *chunk_count -= 1;
        *allocated_size -= size;

        let mut state = self.state.lock();
        state.chunk_count -= 1;
        state.allocated_size -= size;
    }
}

/// The capacity of one memory heap, shared by the [`ChunkCreator`]s of every memory type that
/// lives in it.
#[derive(Debug)]
pub struct HeapBudget {
    heap_index: u32,
    capacity: DeviceSize,
    allocated_size: Mutex<DeviceSize>,
}

impl HeapBudget {
    /// Creates a new `HeapBudget` for the heap at `heap_index`, with nothing allocated yet.
    #[inline]
    pub fn new(heap_index: u32, capacity: DeviceSize) -> Arc<Self> {
        Arc::new(HeapBudget {
            heap_index,
            capacity,
            allocated_size: Mutex::new(0),
        })
    }

    /// Returns the index of the heap.
    #[inline]
    pub fn heap_index(&self) -> u32 {
        self.heap_index
    }

    /// Returns the size of the heap in bytes.
    #[inline]
    pub fn capacity(&self) -> DeviceSize {
        self.capacity
    }

    /// Returns the total size of the chunks that currently exist in the heap.
    #[inline]
    pub fn allocated_size(&self) -> DeviceSize {
        *self.allocated_size.lock()
    }

    /// Returns how much of the heap is still available for new chunks.
    #[inline]
    pub fn remaining_capacity(&self) -> DeviceSize {
        self.capacity - *self.allocated_size.lock()
    }
}

/// The maximum number of chunks that may exist at once, shared by [`ChunkCreator`]s.
///
/// Drivers limit the number of live memory allocations per device rather than per memory type,
/// so every creator of a device should count against the same `ChunkLimit`.
#[derive(Debug)]
pub struct ChunkLimit {
    max_chunk_count: u32,
    chunk_count: Mutex<u32>,
}

impl ChunkLimit {
    /// Creates a new `ChunkLimit` that allows `max_chunk_count` chunks.
    pub fn new(max_chunk_count: u32) -> Result<Arc<Self>, MemoryError> {
        if max_chunk_count == 0 {
            return Err(MemoryError::InvalidArgument(
                "`max_chunk_count` must be greater than zero",
            ));
        }

        Ok(Arc::new(ChunkLimit {
            max_chunk_count,
            chunk_count: Mutex::new(0),
        }))
    }

    /// Returns the maximum number of chunks.
    #[inline]
    pub fn max_chunk_count(&self) -> u32 {
        self.max_chunk_count
    }

    /// Returns the number of chunks that currently exist.
    #[inline]
    pub fn chunk_count(&self) -> u32 {
        *self.chunk_count.lock()
    }
}

/// Parameters to create a new [`ChunkCreator`].
#[derive(Clone, Debug)]
pub struct ChunkCreatorCreateInfo {
    /// The maximum number of chunks that may exist at the same time.
    ///
    /// If this is [`None`], the device's [`max_memory_allocation_count`] is used.
    ///
    /// The default value is [`None`].
    ///
    /// [`max_memory_allocation_count`]: MemoryDevice::max_memory_allocation_count
    pub max_chunk_count: Option<u32>,

    /// The budget of the heap that the memory type lives in.
    ///
    /// If this is [`None`], the creator gets a budget of its own with the heap's full capacity.
    /// It must be shared between the creators of all memory types of the same heap, or together
    /// they can overcommit it.
    ///
    /// The default value is [`None`].
    pub heap_budget: Option<Arc<HeapBudget>>,

    /// The limit that chunks are counted against.
    ///
    /// If this is [`None`], the creator gets a limit of its own from `max_chunk_count`. Can't be
    /// provided together with `max_chunk_count`.
    ///
    /// The default value is [`None`].
    pub chunk_limit: Option<Arc<ChunkLimit>>,

    pub _ne: NonExhaustive,
}

impl Default for ChunkCreatorCreateInfo {
    #[inline]
    fn default() -> Self {
        ChunkCreatorCreateInfo {
            max_chunk_count: None,
            heap_budget: None,
            chunk_limit: None,
            _ne: NonExhaustive(()),
        }
    }
}
