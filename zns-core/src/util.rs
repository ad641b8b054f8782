// vim: tw=80
//! Block arithmetic shared by the channel and the devices

use std::ops::{Add, Div, Sub};

/// Position of the single set bit of a power-of-two block size.
///
/// `lba_size` must be a power of two.  That's a precondition of every
/// [`DeviceGeometry`](crate::device::DeviceGeometry) and is not rechecked here.
pub const fn msb(lba_size: u64) -> u32 {
    lba_size.trailing_zeros()
}

/// Round `size` up to the next multiple of `1 << lba_msb`.
///
/// Clears the low bits, then adds one block back if any of them were set.
pub const fn align_up(size: u64, lba_msb: u32) -> u64 {
    let aligned = (size >> lba_msb) << lba_msb;
    aligned + (((aligned != size) as u64) << lba_msb)
}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

// LCOV_EXCL_STOP
