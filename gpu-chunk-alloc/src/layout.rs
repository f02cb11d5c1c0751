// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Sizes and alignments of memory blocks within a chunk.

use crate::{DeviceSize, NonZeroDeviceSize};
use std::{
    cmp,
    error::Error,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
};

/// An alignment of device memory, stored as a [`DeviceSize`] that is guaranteed to be a power of
/// two.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DeviceAlignment(NonZeroDeviceSize);

impl DeviceAlignment {
    /// The smallest possible alignment, 1.
    pub const MIN: Self = Self(NonZeroDeviceSize::MIN);

    /// The largest possible alignment, 2<sup>63</sup>.
    pub const MAX: Self = match NonZeroDeviceSize::new(1 << 63) {
        Some(alignment) => Self(alignment),
        None => unreachable!(),
    };

    /// Tries to create a `DeviceAlignment` from a [`DeviceSize`], returning [`None`] if it's not a
    /// power of two.
    #[inline]
    pub const fn new(alignment: DeviceSize) -> Option<Self> {
        if alignment.is_power_of_two() {
            match NonZeroDeviceSize::new(alignment) {
                Some(alignment) => Some(Self(alignment)),
                None => None,
            }
        } else {
            None
        }
    }

    /// Returns the alignment as a [`DeviceSize`].
    #[inline]
    pub const fn as_devicesize(self) -> DeviceSize {
        self.0.get()
    }

    /// Returns the base-2 logarithm of the alignment.
    #[inline]
    pub const fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }
}

impl Debug for DeviceAlignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:?} (1 << {:?})", self.0, self.log2())
    }
}

impl Default for DeviceAlignment {
    #[inline]
    fn default() -> Self {
        DeviceAlignment::MIN
    }
}

impl TryFrom<DeviceSize> for DeviceAlignment {
    type Error = TryFromIntError;

    #[inline]
    fn try_from(alignment: DeviceSize) -> Result<Self, Self::Error> {
        DeviceAlignment::new(alignment).ok_or(TryFromIntError)
    }
}

impl From<DeviceAlignment> for DeviceSize {
    #[inline]
    fn from(alignment: DeviceAlignment) -> Self {
        alignment.as_devicesize()
    }
}

/// The size and alignment of a block of device memory.
///
/// Unlike `std`'s `Layout`, a `DeviceLayout` is required to have non-zero size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceLayout {
    size: NonZeroDeviceSize,
    alignment: DeviceAlignment,
}

impl DeviceLayout {
    /// The maximum size of a memory block after its layout's size has been rounded up to the
    /// nearest multiple of its layout's alignment.
    ///
    /// Every offset and size handled by the allocators stays below this bound, which is what
    /// keeps their arithmetic from overflowing.
    pub const MAX_SIZE: DeviceSize = DeviceAlignment::MAX.as_devicesize() - 1;

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` is zero, `alignment` is not a power of two, or if `size` would
    /// exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the nearest multiple of `alignment`.
    #[inline]
    pub const fn from_size_alignment(size: DeviceSize, alignment: DeviceSize) -> Option<Self> {
        if let (Some(size), Some(alignment)) = (
            NonZeroDeviceSize::new(size),
            DeviceAlignment::new(alignment),
        ) {
            DeviceLayout::new(size, alignment)
        } else {
            None
        }
    }

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` would exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the
    /// nearest multiple of `alignment`.
    #[inline]
    pub const fn new(size: NonZeroDeviceSize, alignment: DeviceAlignment) -> Option<Self> {
        // `DeviceLayout::MAX_SIZE` is `DeviceAlignment::MAX - 1`, so this can't overflow.
        if size.get() > DeviceLayout::MAX_SIZE - (alignment.as_devicesize() - 1) {
            None
        } else {
            Some(DeviceLayout { size, alignment })
        }
    }

    /// Returns the minimum size in bytes for a memory block of this layout.
    #[inline]
    pub const fn size(&self) -> DeviceSize {
        self.size.get()
    }

    /// Returns the minimum alignment for a memory block of this layout.
    #[inline]
    pub const fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }

    /// Creates a new `DeviceLayout` from `self` that is also aligned to `alignment` at minimum.
    ///
    /// Returns [`None`] if `self.size()` would overflow [`DeviceLayout::MAX_SIZE`] when rounded up
    /// to the nearest multiple of `alignment`.
    #[inline]
    pub fn align_to(&self, alignment: DeviceAlignment) -> Option<Self> {
        DeviceLayout::new(self.size, cmp::max(self.alignment, alignment))
    }
}

/// Error that can happen when trying to convert an integer to a `DeviceAlignment`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TryFromIntError;

impl Error for TryFromIntError {}

impl Display for TryFromIntError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str("attempted to convert a non-power-of-two integer to a `DeviceAlignment`")
    }
}

/// Rounds `val` up to the nearest multiple of `alignment`.
///
/// > **Note**: Assumes `val` doesn't exceed [`DeviceLayout::MAX_SIZE`].
#[inline(always)]
pub const fn align_up(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    align_down(val + alignment.as_devicesize() - 1, alignment)
}

/// Rounds `val` down to the nearest multiple of `alignment`.
#[inline(always)]
pub const fn align_down(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    val & !(alignment.as_devicesize() - 1)
}

/// Checks whether `val` is a multiple of `alignment`.
#[inline(always)]
pub const fn is_aligned(val: DeviceSize, alignment: DeviceAlignment) -> bool {
    val & (alignment.as_devicesize() - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_must_be_power_of_two() {
        assert!(DeviceAlignment::new(0).is_none());
        assert!(DeviceAlignment::new(3).is_none());
        assert!(DeviceAlignment::new(96).is_none());
        assert_eq!(DeviceAlignment::new(256).unwrap().log2(), 8);
        assert_eq!(DeviceAlignment::MAX.as_devicesize(), 1 << 63);
        assert!(DeviceAlignment::try_from(1000).is_err());
    }

    #[test]
    fn layout_rejects_zero_size_and_overflow() {
        assert!(DeviceLayout::from_size_alignment(0, 1).is_none());
        assert!(DeviceLayout::from_size_alignment(16, 3).is_none());
        assert!(DeviceLayout::from_size_alignment(DeviceLayout::MAX_SIZE, 1).is_some());
        assert!(DeviceLayout::from_size_alignment(DeviceLayout::MAX_SIZE, 2).is_none());

        let layout = DeviceLayout::from_size_alignment(300, 4).unwrap();
        let aligned = layout.align_to(DeviceAlignment::new(256).unwrap()).unwrap();
        assert_eq!(aligned.size(), 300);
        assert_eq!(aligned.alignment().as_devicesize(), 256);
        // Aligning to something smaller keeps the larger alignment.
        assert_eq!(aligned.align_to(DeviceAlignment::MIN), Some(aligned));
    }

    #[test]
    fn rounding() {
        let a = DeviceAlignment::new(64).unwrap();

        assert_eq!(align_up(0, a), 0);
        assert_eq!(align_up(1, a), 64);
        assert_eq!(align_up(64, a), 64);
        assert_eq!(align_up(65, a), 128);
        assert_eq!(align_down(127, a), 64);
        assert!(is_aligned(192, a));
        assert!(!is_aligned(200, a));
    }
}
