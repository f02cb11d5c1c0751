// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Compaction of fragmented chunks.
//!
//! Allocations of varying sizes and lifetimes leave holes behind in their chunks. Over time the
//! free memory of an allocator can be plentiful but split into pieces too small to be useful. A
//! defragmentation pass moves live allocations towards the front of the allocator, into earlier
//! chunks or to lower offsets of the same chunk, so that free memory collects in larger intervals
//! and at the back, where whole chunks can become empty and be freed.
//!
//! # Passes
//!
//! A pass is started explicitly with [`ChunkAllocator::run_defragmentation_pass`], typically
//! between frames. It goes through the following states:
//!
//! - [`Scanning`]: every chunk gets a fragmentation score, and chunks with at least two free
//!   intervals whose score reaches the [`fragmentation_threshold`] are selected.
//! - [`Relocating`]: the live allocations of the selected chunks are visited in order. For each,
//!   the [`FitStrategy`] looks for a destination that lies strictly before the allocation. If one
//!   is found, a new resource is bound there, the contents are copied over and the
//!   [`MemoryLocation`] is pointed at its new placement. An allocation that can't be moved is
//!   skipped for the rest of the pass.
//! - [`Idle`]: empty chunks beyond the retention policy are freed.
//!
//! Relocating is never fatal. If binding or copying fails, the destination is given back, the
//! failure is logged and the pass continues with the next allocation.
//!
//! # In-flight work
//!
//! The allocator has no idea whether the device is still using a resource. Moving a resource out
//! from under a command buffer that hasn't finished executing corrupts memory silently, so every
//! relocation has to be approved by the [`RelocationGuard`] given to the pass. The guard can be a
//! plain closure, or an [`EpochTracker`] if the renderer tags its uses of each location with the
//! frame they were submitted in.
//!
//! [`Scanning`]: DefragState::Scanning
//! [`Relocating`]: DefragState::Relocating
//! [`Idle`]: DefragState::Idle
//! [`fragmentation_threshold`]: DefragmentationCreateInfo::fragmentation_threshold
//! [`FitStrategy`]: super::FitStrategy
//! [`MemoryLocation`]: super::MemoryLocation

use super::{
    chunk::{Chunk, Fit, Occupied},
    location::{LocationInfo, Placement},
    ChunkAllocator, MemoryError, ResourceKind,
};
use crate::{device::MemoryDevice, layout::DeviceLayout, DeviceSize, NonExhaustive};
use log::{debug, trace, warn};
use smallvec::SmallVec;
use std::{
    num::NonZeroU64,
    ops::AddAssign,
    sync::atomic::{AtomicU64, Ordering},
};

impl<D: MemoryDevice, K: ResourceKind<D>> ChunkAllocator<D, K> {
    /// Runs one defragmentation pass over the allocator.
    ///
    /// Only locations that `guard` approves of are moved. Does nothing if the defragmenter is
    /// disabled. See the [module-level documentation] for details.
    ///
    /// [module-level documentation]: self
    pub fn run_defragmentation_pass<G>(&mut self, guard: &G) -> DefragReport
    where
        G: RelocationGuard + ?Sized,
    {
        let mut report = DefragReport::default();

        if !self.defragger.enabled {
            trace!("defragmentation of allocator {:?} is disabled", self.id);

            return report;
        }

        self.defragger.transition(DefragState::Scanning);

        let selected = self
            .chunks
            .iter()
            .filter(|chunk| self.defragger.is_fragmented(chunk))
            .map(Chunk::id)
            .collect::<SmallVec<[_; 8]>>();
        report.chunks_scanned = self.chunks.len();
        report.chunks_selected = selected.len();

        self.defragger.transition(DefragState::Relocating);

        'chunks: for chunk_id in selected {
            let index = self.chunk_index(chunk_id);
            let occupied = self.chunks[index]
                .occupied()
                .collect::<SmallVec<[_; 16]>>();

            for (offset, interval) in occupied {
                if report.relocations >= self.defragger.max_relocations_per_pass {
                    break 'chunks;
                }

                self.relocate(index, offset, interval, guard, &mut report);
            }
        }

        self.defragger.transition(DefragState::Idle);

        report.chunks_released = self.release_empty_chunks(self.keep_empty_chunks);

        debug!(
            "defragmentation pass of allocator {:?}: {:?}",
            self.id, report,
        );

        report
    }

    fn relocate<G>(
        &mut self,
        index: usize,
        offset: DeviceSize,
        interval: Occupied,
        guard: &G,
        report: &mut DefragReport,
    ) where
        G: RelocationGuard + ?Sized,
    {
        let record = &self.locations[&interval.location];

        if !guard.is_safe_to_relocate(&record.shared.info()) {
            trace!("{:?} is in use, not relocating it", interval.location);
            report.skipped_in_use += 1;

            return;
        }

        let layout = record.layout;
        let Some((dst_index, fit)) = self.find_destination(index, offset, layout) else {
            report.skipped_no_destination += 1;

            return;
        };

        let dst = &mut self.chunks[dst_index];
        dst.carve(fit.offset, layout.size(), interval.location);

        let device = self.creator.device();
        let record = &self.locations[&interval.location];

        let new_resource = match unsafe {
            K::bind(device, &record.descriptor, dst.memory(), fit.offset)
        } {
            Ok(resource) => resource,
            Err(err) => {
                warn!(
                    "failed to bind {:?} at its new placement, not relocating it: {}",
                    interval.location, err,
                );
                dst.release(fit.offset);
                report.failed += 1;

                return;
            }
        };

        let copied = {
            let old_resource = record.shared.resource();

            unsafe { K::copy(device, &record.descriptor, &old_resource, &new_resource) }
        };

        if let Err(err) = copied {
            warn!(
                "failed to copy {:?} to its new placement, not relocating it: {}",
                interval.location, err,
            );
            unsafe { K::destroy(device, new_resource) };
            dst.release(fit.offset);
            report.failed += 1;

            return;
        }

        let placement = Placement {
            chunk: dst.id(),
            offset: fit.offset,
            size: layout.size(),
            mapped_ptr: dst.mapped_ptr().map(|ptr| unsafe { ptr.add(fit.offset) }),
        };
        let old_resource = match record.shared.try_relocate(placement, new_resource) {
            Ok(old_resource) => old_resource,
            Err(new_resource) => {
                trace!("{:?} is borrowed, not relocating it", interval.location);
                unsafe { K::destroy(device, new_resource) };
                dst.release(fit.offset);
                report.skipped_in_use += 1;

                return;
            }
        };
        unsafe { K::destroy(device, old_resource) };

        let src_chunk = self.chunks[index].id();
        self.chunks[index].release(offset);

        report.relocations += 1;
        report.bytes_relocated += layout.size();

        trace!(
            "relocated {:?} from {}..{} of chunk {:?} to {}..{} of chunk {:?}",
            interval.location,
            offset,
            offset + layout.size(),
            src_chunk,
            placement.offset,
            placement.offset + placement.size,
            placement.chunk,
        );
    }

    /// Looks for room for a memory block that currently lives at `offset` of the chunk at `index`,
    /// in an earlier chunk or further to the front of the same one.
    fn find_destination(
        &self,
        index: usize,
        offset: DeviceSize,
        layout: DeviceLayout,
    ) -> Option<(usize, Fit)> {
        let earlier = (0..index)
            .find_map(|dst_index| Some((dst_index, self.fit_in(dst_index, layout)?)));

        earlier.or_else(|| {
            let fit = self
                .fit_strategy
                .find(&mut self.chunks[index].free_ranges_below(offset), layout)?;
            self.check_fit(fit, layout);

            Some((index, fit))
        })
    }
}

/// The state of the defragmenter of an allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DefragState {
    /// No pass is running.
    #[default]
    Idle,

    /// Chunks are being scored.
    Scanning,

    /// Locations of the selected chunks are being moved.
    Relocating,
}

/// The per-allocator defragmentation settings and state.
#[derive(Debug)]
pub(crate) struct Defragger {
    pub(crate) enabled: bool,
    state: DefragState,
    fragmentation_threshold: f64,
    usable_size: DeviceSize,
    pub(crate) max_relocations_per_pass: usize,
}

impl Defragger {
    pub(crate) fn new(
        enabled: bool,
        create_info: DefragmentationCreateInfo,
    ) -> Result<Self, MemoryError> {
        let DefragmentationCreateInfo {
            fragmentation_threshold,
            usable_size,
            max_relocations_per_pass,
            _ne: _,
        } = create_info;

        if !(0.0..=1.0).contains(&fragmentation_threshold) {
            return Err(MemoryError::InvalidArgument(
                "`fragmentation_threshold` must be between 0.0 and 1.0",
            ));
        }

        Ok(Defragger {
            enabled,
            state: DefragState::Idle,
            fragmentation_threshold,
            usable_size,
            max_relocations_per_pass,
        })
    }

    #[inline]
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[inline]
    pub(crate) fn state(&self) -> DefragState {
        self.state
    }

    fn transition(&mut self, state: DefragState) {
        trace!("defragmenter: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Scores how fragmented the free memory of `chunk` is, between `0.0` and `1.0`.
    ///
    /// This is the larger of how much free memory lies outside the largest free interval, and how
    /// much lies in intervals too small to be useful.
    pub(crate) fn fragmentation_score<M: Copy>(&self, chunk: &Chunk<M>) -> f64 {
        let free_size = chunk.free_size();

        if free_size == 0 {
            return 0.0;
        }

        let unusable_size: DeviceSize = chunk
            .free_ranges()
            .filter(|range| range.size < self.usable_size)
            .map(|range| range.size)
            .sum();
        let free_size = free_size as f64;

        f64::max(
            1.0 - chunk.largest_free_interval() as f64 / free_size,
            unusable_size as f64 / free_size,
        )
    }

    fn is_fragmented<M: Copy>(&self, chunk: &Chunk<M>) -> bool {
        chunk.free_interval_count() >= 2
            && self.fragmentation_score(chunk) >= self.fragmentation_threshold
    }
}

/// Parameters for the defragmentation passes of an allocator.
#[derive(Clone, Debug)]
pub struct DefragmentationCreateInfo {
    /// Chunks whose fragmentation score reaches this value are compacted.
    ///
    /// Must be between `0.0` and `1.0`.
    ///
    /// The default value is `0.25`.
    pub fragmentation_threshold: f64,

    /// Free intervals smaller than this are considered too small to be useful.
    ///
    /// The default value is 4 KiB.
    pub usable_size: DeviceSize,

    /// The maximum number of locations moved in one pass.
    ///
    /// The default value is [`usize::MAX`].
    pub max_relocations_per_pass: usize,

    pub _ne: NonExhaustive,
}

impl Default for DefragmentationCreateInfo {
    #[inline]
    fn default() -> Self {
        DefragmentationCreateInfo {
            fragmentation_threshold: 0.25,
            usable_size: 4 * 1024,
            max_relocations_per_pass: usize::MAX,
            _ne: NonExhaustive(()),
        }
    }
}

/// What a defragmentation pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DefragReport {
    pub chunks_scanned: usize,
    pub chunks_selected: usize,
    pub relocations: usize,
    pub bytes_relocated: DeviceSize,

    /// Locations that the guard didn't allow to be moved.
    pub skipped_in_use: usize,

    /// Locations for which there was no room further to the front.
    pub skipped_no_destination: usize,

    /// Locations whose relocation failed on the device.
    pub failed: usize,

    /// Chunks that were freed after the pass.
    pub chunks_released: usize,
}

impl AddAssign for DefragReport {
    fn add_assign(&mut self, rhs: Self) {
        self.chunks_scanned += rhs.chunks_scanned;
        self.chunks_selected += rhs.chunks_selected;
        self.relocations += rhs.relocations;
        self.bytes_relocated += rhs.bytes_relocated;
        self.skipped_in_use += rhs.skipped_in_use;
        self.skipped_no_destination += rhs.skipped_no_destination;
        self.failed += rhs.failed;
        self.chunks_released += rhs.chunks_released;
    }
}

/// Decides whether the device is done with a location, so that it can be moved.
pub trait RelocationGuard {
    /// Returns `true` if no work that is still pending on the device uses `location`.
    fn is_safe_to_relocate(&self, location: &LocationInfo) -> bool;
}

impl<F> RelocationGuard for F
where
    F: Fn(&LocationInfo) -> bool + ?Sized,
{
    #[inline]
    fn is_safe_to_relocate(&self, location: &LocationInfo) -> bool {
        self(location)
    }
}

/// A frame number, used to tell when the device is done with a location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(NonZeroU64);

impl Epoch {
    /// Creates an `Epoch` from its number, returning [`None`] if it's zero.
    #[inline]
    pub const fn new(epoch: u64) -> Option<Self> {
        match NonZeroU64::new(epoch) {
            Some(epoch) => Some(Epoch(epoch)),
            None => None,
        }
    }

    /// Returns the number of the epoch.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// A [`RelocationGuard`] that tracks which epochs the device has finished.
///
/// Use it like this:
///
/// 1. Call [`begin_epoch`] at the start of each frame.
/// 2. Call [`MemoryLocation::mark_used`] with that epoch for every location that the frame's
///    commands touch.
/// 3. Call [`complete`] once the fence of the frame's submission has signaled.
///
/// A location can then be relocated if it was never marked as used, or if the latest epoch it was
/// marked with has completed.
///
/// [`begin_epoch`]: Self::begin_epoch
/// [`complete`]: Self::complete
/// [`MemoryLocation::mark_used`]: super::MemoryLocation::mark_used
#[derive(Debug, Default)]
pub struct EpochTracker {
    current: AtomicU64,
    completed: AtomicU64,
}

impl EpochTracker {
    /// Creates a new `EpochTracker` where no epoch has begun yet.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a new epoch and returns it. The first epoch is `1`.
    #[inline]
    pub fn begin_epoch(&self) -> Epoch {
        let previous = self.current.fetch_add(1, Ordering::AcqRel);

        Epoch(NonZeroU64::MIN.saturating_add(previous))
    }

    /// Returns the latest epoch that has begun.
    #[inline]
    pub fn current_epoch(&self) -> Option<Epoch> {
        Epoch::new(self.current.load(Ordering::Acquire))
    }

    /// Marks `epoch` and every epoch before it as completed.
    #[inline]
    pub fn complete(&self, epoch: Epoch) {
        self.completed.fetch_max(epoch.get(), Ordering::AcqRel);
    }

    /// Returns the latest completed epoch.
    #[inline]
    pub fn completed_epoch(&self) -> Option<Epoch> {
        Epoch::new(self.completed.load(Ordering::Acquire))
    }

    /// Returns whether `epoch` has completed.
    #[inline]
    pub fn is_complete(&self, epoch: Epoch) -> bool {
        epoch.get() <= self.completed.load(Ordering::Acquire)
    }
}

impl RelocationGuard for EpochTracker {
    #[inline]
    fn is_safe_to_relocate(&self, location: &LocationInfo) -> bool {
        location
            .last_use
            .map_or(true, |epoch| self.is_complete(epoch))
    }
}
