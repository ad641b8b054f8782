// vim: tw=80
//! The raw zoned-device interface consumed by
//! [`Channel`](crate::channel::Channel)
//!
//! Everything that crosses this interface is in *physical* block addresses and
//! whole blocks.  Translating from the caller's byte-granular, logical view is
//! the channel's job.

#[cfg(test)] use mockall::automock;

use crate::{
    types::*,
    util::*,
};

/// Geometry of a zoned device.
///
/// `lba_size` and `zone_size` must both be powers of two, and `zone_cap` may
/// not exceed `zone_size`.  The blocks between `zone_cap` and `zone_size` of
/// each zone are padding that can never be written.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceGeometry {
    /// Bytes per block
    pub lba_size: u64,
    /// Physical blocks per zone, including padding
    pub zone_size: u64,
    /// Usable blocks per zone
    pub zone_cap: u64,
    /// First physical block of the device
    pub min_lba: LbaT,
    /// One past the last physical block of the device
    pub max_lba: LbaT,
}

impl DeviceGeometry {
    /// Bit position of `lba_size`
    pub const fn lba_msb(&self) -> u32 {
        msb(self.lba_size)
    }

    /// Translate a logical block address into a physical one.
    ///
    /// Logical addresses are contiguous across the usable part of each zone.
    pub const fn lba_to_pba(&self, lba: LbaT) -> LbaT {
        (lba / self.zone_cap) * self.zone_size + lba % self.zone_cap
    }

    /// Translate a physical block address into a logical one.
    ///
    /// The physical address just past a zone's capacity, which is where a full
    /// zone's write pointer rests, maps to the start of the next logical zone.
    pub const fn pba_to_lba(&self, pba: LbaT) -> LbaT {
        (pba / self.zone_size) * self.zone_cap + pba % self.zone_size
    }

    /// Check the documented invariants.
    ///
    /// Devices call this once when they're opened.  Nothing downstream
    /// rechecks it.
    pub fn validate(&self) -> Result<()> {
        if !self.lba_size.is_power_of_two() ||
            !self.zone_size.is_power_of_two() ||
            self.zone_cap == 0 ||
            self.zone_cap > self.zone_size ||
            self.min_lba > self.max_lba ||
            self.min_lba % self.zone_size != 0 ||
            self.max_lba % self.zone_size != 0
        {
            tracing::warn!(geometry = ?self, "invalid device geometry");
            return Err(Error::InvalidArguments);
        }
        Ok(())
    }

    /// Number of zones on the device
    pub const fn zones(&self) -> ZoneT {
        (self.max_lba - self.min_lba) / self.zone_size
    }
}

/// A driver-level queue pair, used to submit commands to the device.
///
/// A queue pair is exclusively owned and never driven by two threads at once.
/// Dropping it releases it back to the driver.
#[cfg_attr(test, automock)]
pub trait QPair: Send {
    /// Append whole blocks to the zone whose write pointer is `*lba`.
    ///
    /// On success, `*lba` is advanced to the zone's new write pointer.
    fn append(&mut self, lba: &mut LbaT, buf: &[u8]) -> Result<()>;

    /// Read whole blocks starting at `lba`.
    fn read(&mut self, lba: LbaT, buf: &mut [u8]) -> Result<()>;

    /// Rewind the write pointer of the zone starting at `slba`.
    fn reset_zone(&mut self, slba: LbaT) -> Result<()>;

    /// Rewind the write pointer of every zone on the device.
    fn reset_all_zones(&mut self) -> Result<()>;

    /// Report the write pointer of the zone starting at `slba`.
    fn zone_head(&mut self, slba: LbaT) -> Result<LbaT>;

    /// Transition the zone starting at `slba` to Full, regardless of its
    /// write pointer.
    fn finish_zone(&mut self, slba: LbaT) -> Result<()>;
}

/// A zoned device, as seen by the
/// [`ChannelFactory`](crate::channel_factory::ChannelFactory).
#[cfg_attr(test, automock(type QPair = MockQPair;))]
pub trait Device: Send + Sync {
    type QPair: QPair;

    /// The device's geometry.  It may not change while the device is open.
    fn geometry(&self) -> DeviceGeometry;

    /// Allocate a new queue pair from the driver.
    fn create_qpair(&self) -> Result<Self::QPair>;
}

// LCOV_EXCL_STOP
