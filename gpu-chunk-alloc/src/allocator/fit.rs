// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Strategies deciding where inside a chunk a memory block is placed.

use super::chunk::{Fit, FreeRange};
use crate::layout::DeviceLayout;
use std::fmt::Debug;

/// Decides which free range of a chunk a new memory block is carved from.
///
/// The allocator calls [`find`] once per chunk, in chunk creation order, and takes the first
/// chunk for which it returns a fit. The strategy only ever sees the free ranges of one chunk at a
/// time.
///
/// The allocator asserts that the returned
/// [`Fit::offset`] is a multiple of `layout.alignment()` and that the block lies entirely inside
/// one of the given free ranges. Breaking that is a bug in the strategy and panics.
///
/// [`find`]: Self::find
pub trait FitStrategy: Debug + Send + Sync {
    /// Picks a place for a memory block of the given `layout` among `free_ranges`, which are given
    /// in offset order, or returns [`None`] if none of them can hold it.
    ///
    /// Among candidates that the strategy considers equally good, the one with the lowest offset
    /// must win.
    fn find(
        &self,
        free_ranges: &mut dyn Iterator<Item = FreeRange>,
        layout: DeviceLayout,
    ) -> Option<Fit>;
}

/// Places a memory block in the first free range that can hold it.
///
/// This is the cheapest strategy since it stops at the first match. Over time it tends to leave
/// small leftovers near the start of each chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FirstFit;

impl FitStrategy for FirstFit {
    fn find(
        &self,
        free_ranges: &mut dyn Iterator<Item = FreeRange>,
        layout: DeviceLayout,
    ) -> Option<Fit> {
        for range in free_ranges {
            if let Some(fit) = range.fit(layout) {
                return Some(fit);
            }
        }

        None
    }
}

/// Places a memory block in the free range that leaves the least slack behind.
///
/// This has to look at every free range of the chunk unless it finds an exact fit, but keeps the
/// larger free ranges intact for larger requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BestFit;

impl FitStrategy for BestFit {
    fn find(
        &self,
        free_ranges: &mut dyn Iterator<Item = FreeRange>,
        layout: DeviceLayout,
    ) -> Option<Fit> {
        let mut best: Option<Fit> = None;

        for range in free_ranges {
            let Some(fit) = range.fit(layout) else {
                continue;
            };

            if best.map_or(true, |best| fit.slack < best.slack) {
                best = Some(fit);

                if fit.slack == 0 {
                    break;
                }
            }
        }

        best
    }
}

/// Places a memory block in the free range that leaves the most slack behind.
///
/// The leftover is then as large as it can be, which makes it more likely to be usable for a later
/// request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorstFit;

impl FitStrategy for WorstFit {
    fn find(
        &self,
        free_ranges: &mut dyn Iterator<Item = FreeRange>,
        layout: DeviceLayout,
    ) -> Option<Fit> {
        let mut worst: Option<Fit> = None;

        for range in free_ranges {
            let Some(fit) = range.fit(layout) else {
                continue;
            };

            // Strictly greater, so that the lowest offset wins ties.
            if worst.map_or(true, |worst| fit.slack > worst.slack) {
                worst = Some(fit);
            }
        }

        worst
    }
}
