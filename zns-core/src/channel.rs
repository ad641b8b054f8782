// vim: tw=80
//! Alignment-aware I/O over a single queue pair
//!
//! A [`Channel`] lets its owner read and write arbitrary byte ranges, and
//! manage zones, within a fixed range of a zoned device.  The device only ever
//! sees whole-block commands in physical addresses.  The caller only ever sees
//! logical addresses, which skip each zone's unusable padding.

use std::{
    cmp,
    collections::BTreeMap,
    mem,
};

use divbuf::DivBufShared;

use crate::{
    channel_factory::Lease,
    device::*,
    types::*,
    util::*,
    zone::*,
};

/// Cumulative statistics of a `Channel`
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Stats {
    bytes_written: u64,
    append_operations: u64,
    bytes_read: u64,
    read_operations: u64,
    zones_reset: u64,
}

/// Buffered and direct I/O to one range of a zoned device.
///
/// A `Channel` exclusively owns its queue pair, so it may be moved between
/// threads but never shared by them.  Every method is synchronous.
///
/// The range `[min_lba, max_lba)` is given in physical addresses and should be
/// zone-aligned.  All other addresses are logical.
pub struct Channel<Q: QPair> {
    qpair: Q,
    geometry: DeviceGeometry,
    lba_msb: u32,
    min_lba: LbaT,
    max_lba: LbaT,
    /// The range spans the whole device, so one bulk reset is safe.
    can_access_all: bool,
    /// Zones discovered so far, keyed by zone number.
    zones: BTreeMap<ZoneT, Zone>,
    /// Exactly one block, for staging partial blocks.
    spill: Box<[u8]>,
    /// Bounce buffer for direct I/O.  Only retained with `preserve_buffer`.
    bounce: Vec<u8>,
    preserve_buffer: bool,
    queue_depth: u32,
    stats: Stats,
    /// Slot in the issuing factory's pool.  Must drop after `qpair`.
    _lease: Option<Lease>,
}

impl<Q: QPair> Channel<Q> {
    /// Create a channel restricted to the physical range `[min_lba, max_lba)`.
    ///
    /// An inverted range is clamped to an empty one at `max_lba`, disabling
    /// all I/O rather than trusting an inconsistent caller.
    pub fn new(qpair: Q, geometry: DeviceGeometry, min_lba: LbaT,
               max_lba: LbaT) -> Result<Self>
    {
        debug_assert_eq!(min_lba % geometry.zone_size, 0);
        debug_assert_eq!(max_lba % geometry.zone_size, 0);
        let min_lba = if min_lba > max_lba {
            tracing::error!(min_lba, max_lba,
                "inverted channel range; blocking all I/O");
            max_lba
        } else {
            min_lba
        };
        let can_access_all = min_lba == geometry.min_lba &&
            max_lba == geometry.max_lba;
        let spill = alloc_zeroed(geometry.lba_size as usize)?
            .into_boxed_slice();
        Ok(Channel {
            qpair,
            geometry,
            lba_msb: geometry.lba_msb(),
            min_lba,
            max_lba,
            can_access_all,
            zones: BTreeMap::new(),
            spill,
            bounce: Vec::new(),
            preserve_buffer: false,
            queue_depth: 1,
            stats: Stats::default(),
            _lease: None,
        })
    }

    /// Create a channel spanning the whole device.
    ///
    /// Such a channel still resets zones one at a time.  Only a channel
    /// created by [`Channel::new`] with the device's full range may use the
    /// device's bulk reset.
    pub fn whole_device(qpair: Q, geometry: DeviceGeometry) -> Result<Self> {
        let mut channel = Self::new(qpair, geometry, geometry.min_lba,
                                    geometry.max_lba)?;
        channel.can_access_all = false;
        Ok(channel)
    }

    /// Retain the direct-I/O bounce buffer between calls instead of
    /// allocating a fresh one each time.
    pub fn with_preserve_buffer(mut self, preserve_buffer: bool) -> Self {
        self.preserve_buffer = preserve_buffer;
        if !preserve_buffer {
            self.bounce = Vec::new();
        }
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: u32) -> Self {
        self.queue_depth = cmp::max(queue_depth, 1);
        self
    }

    pub(crate) fn with_lease(mut self, lease: Lease) -> Self {
        self._lease = Some(lease);
        self
    }

    /// Round `size` up to a whole number of blocks.
    pub fn align_size(&self, size: usize) -> usize {
        align_up(size as u64, self.lba_msb) as usize
    }

    pub fn append_operations(&self) -> u64 {
        self.stats.append_operations
    }

    pub fn bytes_read(&self) -> u64 {
        self.stats.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes_written
    }

    pub fn can_access_all(&self) -> bool {
        self.can_access_all
    }

    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    /// Remaining writable logical blocks in this channel's range.
    ///
    /// Zones that haven't been seen yet are queried from the device.
    pub fn lbas_left(&mut self) -> Result<LbaT> {
        let mut left = 0;
        for zone in self.zone_range() {
            if !self.zones.contains_key(&zone) {
                self.zone_head(zone * self.geometry.zone_cap)?;
            }
            left += self.zones.get(&zone).map_or(0, Zone::lbas_left);
        }
        Ok(left)
    }

    /// Usable logical blocks in this channel's range.
    pub fn max_lbas(&self) -> LbaT {
        (self.max_lba - self.min_lba) / self.geometry.zone_size *
            self.geometry.zone_cap
    }

    /// First physical block of the channel's range
    pub fn min_lba(&self) -> LbaT {
        self.min_lba
    }

    /// One past the last physical block of the channel's range
    pub fn max_lba(&self) -> LbaT {
        self.max_lba
    }

    pub fn preserve_buffer(&self) -> bool {
        self.preserve_buffer
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    pub fn read_operations(&self) -> u64 {
        self.stats.read_operations
    }

    pub fn zones_reset(&self) -> u64 {
        self.stats.zones_reset
    }

    pub fn translate_lba_to_pba(&self, lba: LbaT) -> LbaT {
        self.geometry.lba_to_pba(lba)
    }

    pub fn translate_pba_to_lba(&self, pba: LbaT) -> LbaT {
        self.geometry.pba_to_lba(pba)
    }

    /// Write the whole of `buffer` at `*lba`.
    ///
    /// See [`flush_buffer_section`](Self::flush_buffer_section).
    pub fn flush_buffer(&mut self, lba: &mut LbaT, buffer: &DivBufShared)
        -> Result<()>
    {
        let len = buffer.len();
        self.flush_buffer_section(lba, buffer, 0, len, true)
    }

    /// Write `section_size` bytes, starting at `section_addr` of `buffer`, to
    /// the logical address `*lba`.
    ///
    /// On return `*lba` points past the written data.  A trailing partial
    /// block is zero-padded to a whole block through the channel's scratch
    /// block.  `is_aligned` asserts that `section_size` is a whole number of
    /// blocks.
    ///
    /// `buffer` must have room for the section rounded up to a whole block.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` if the section doesn't fit in `buffer` or the write
    /// doesn't fit in the channel.  Nothing is written in that case.
    /// `IoError` if any device append fails.  The aligned prefix and the
    /// padded tail are both attempted either way, so after an error the
    /// write pointer must be re-queried with [`zone_head`](Self::zone_head).
    #[tracing::instrument(skip(self, buffer))]
    pub fn flush_buffer_section(
        &mut self,
        lba: &mut LbaT,
        buffer: &DivBufShared,
        section_addr: usize,
        section_size: usize,
        is_aligned: bool
    ) -> Result<()>
    {
        let aligned_size = self.check_section(buffer.len(), section_addr,
                                              section_size, is_aligned)?;
        self.check_range(*lba, aligned_size)?;
        let db = buffer.try_const().map_err(|_| {
            tracing::warn!("buffer is mutably borrowed");
            Error::InvalidArguments
        })?;
        let section = &db[section_addr..section_addr + section_size];
        if aligned_size == section_size {
            return self.append_blocks(lba, section);
        }

        let lba_size = self.geometry.lba_size as usize;
        let prefix_size = aligned_size - lba_size;
        let (prefix, tail) = section.split_at(prefix_size);
        let prefix_r = if prefix_size > 0 {
            self.append_blocks(lba, prefix)
        } else {
            Ok(())
        };
        let mut spill = mem::take(&mut self.spill);
        spill[..tail.len()].copy_from_slice(tail);
        spill[tail.len()..].fill(0);
        let tail_r = self.append_blocks(lba, &spill);
        self.spill = spill;
        prefix_r.and(tail_r)
    }

    /// Read `section_size` bytes from the logical address `lba` into
    /// `buffer`, starting at `section_addr`.
    ///
    /// A trailing partial block is read whole into the channel's scratch
    /// block, and only its needed prefix is copied out.  Argument checks are
    /// the same as for
    /// [`flush_buffer_section`](Self::flush_buffer_section).
    #[tracing::instrument(skip(self, buffer))]
    pub fn read_into_buffer(
        &mut self,
        lba: LbaT,
        buffer: &DivBufShared,
        section_addr: usize,
        section_size: usize,
        is_aligned: bool
    ) -> Result<()>
    {
        let aligned_size = self.check_section(buffer.len(), section_addr,
                                              section_size, is_aligned)?;
        self.check_range(lba, aligned_size)?;
        let mut dbm = buffer.try_mut().map_err(|_| {
            tracing::warn!("buffer is already borrowed");
            Error::InvalidArguments
        })?;
        let section = &mut dbm[section_addr..section_addr + section_size];
        if aligned_size == section_size {
            return self.read_blocks(lba, section);
        }

        let lba_size = self.geometry.lba_size as usize;
        let prefix_size = aligned_size - lba_size;
        let (prefix, tail) = section.split_at_mut(prefix_size);
        let prefix_r = if prefix_size > 0 {
            self.read_blocks(lba, prefix)
        } else {
            Ok(())
        };
        let tail_lba = lba + (prefix_size as u64 >> self.lba_msb);
        let mut spill = mem::take(&mut self.spill);
        let r = prefix_r.and(self.read_blocks(tail_lba, &mut spill));
        if r.is_ok() {
            tail.copy_from_slice(&spill[..tail.len()]);
        }
        self.spill = spill;
        r
    }

    /// Write `buffer` at `*lba` without a staged buffer.
    ///
    /// The data is copied into a temporary whole-block buffer, zero-padded,
    /// and appended in one go.  Best for small, infrequent writes.
    #[tracing::instrument(skip(self, buffer))]
    pub fn direct_append(&mut self, lba: &mut LbaT, buffer: &[u8],
                         is_aligned: bool) -> Result<()>
    {
        let aligned_size = self.check_aligned(buffer.len(), is_aligned)?;
        self.check_range(*lba, aligned_size)?;
        let mut block = self.take_bounce(aligned_size)?;
        block[..buffer.len()].copy_from_slice(buffer);
        block[buffer.len()..aligned_size].fill(0);
        let r = self.append_blocks(lba, &block[..aligned_size]);
        self.give_bounce(block);
        r
    }

    /// Read `buffer.len()` bytes from `lba` without a staged buffer.
    ///
    /// Whole blocks are read into a temporary buffer and the requested prefix
    /// is copied out.  `buffer` is untouched on error.
    #[tracing::instrument(skip(self, buffer))]
    pub fn direct_read(&mut self, lba: LbaT, buffer: &mut [u8],
                       is_aligned: bool) -> Result<()>
    {
        let aligned_size = self.check_aligned(buffer.len(), is_aligned)?;
        self.check_range(lba, aligned_size)?;
        let mut block = self.take_bounce(aligned_size)?;
        let r = self.read_blocks(lba, &mut block[..aligned_size]);
        if r.is_ok() {
            buffer.copy_from_slice(&block[..buffer.len()]);
        }
        self.give_bounce(block);
        r
    }

    /// Reset the zone starting at the logical address `slba`.
    #[tracing::instrument(skip(self))]
    pub fn reset_zone(&mut self, slba: LbaT) -> Result<()> {
        let zone = self.check_zone(slba)?;
        self.reset_zone_unchecked(zone)
    }

    /// Reset every zone in the channel's range.
    ///
    /// Without access to the whole device, zones are reset one by one, and
    /// the first failure stops the loop.  Earlier resets are not undone, so
    /// after an error every zone in the range must be treated as possibly
    /// reset.
    #[tracing::instrument(skip(self))]
    pub fn reset_all_zones(&mut self) -> Result<()> {
        if self.can_access_all {
            self.zones.clear();
            self.qpair.reset_all_zones().inspect_err(|e| {
                tracing::error!("bulk zone reset failed: {e}");
            })?;
            self.stats.zones_reset += self.geometry.zones();
            Ok(())
        } else {
            for zone in self.zone_range() {
                self.reset_zone_unchecked(zone)?;
            }
            Ok(())
        }
    }

    /// Query the logical write pointer of the zone starting at `slba`.
    #[tracing::instrument(skip(self))]
    pub fn zone_head(&mut self, slba: LbaT) -> Result<LbaT> {
        let zone = self.check_zone(slba)?;
        let pba = self.geometry.lba_to_pba(slba);
        let head = self.qpair.zone_head(pba).map_err(|e| {
            self.zones.remove(&zone);
            tracing::error!("zone head query failed: {e}");
            e
        })?;
        let wp = self.geometry.pba_to_lba(head);
        let zone_cap = self.geometry.zone_cap;
        self.zones.entry(zone)
            .and_modify(|z| z.wp = wp)
            .or_insert(Zone {
                slba,
                wp,
                zone_cap,
                finished: false,
                appended: false
            });
        Ok(wp)
    }

    /// Finish the zone starting at `slba`, forbidding further appends until
    /// it's reset.
    #[tracing::instrument(skip(self))]
    pub fn finish_zone(&mut self, slba: LbaT) -> Result<()> {
        let zone = self.check_zone(slba)?;
        let pba = self.geometry.lba_to_pba(slba);
        match self.qpair.finish_zone(pba) {
            Ok(()) => {
                let zone_cap = self.geometry.zone_cap;
                let appended = self.zones.get(&zone)
                    .is_some_and(|z| z.appended);
                self.zones.insert(zone, Zone {
                    slba,
                    wp: slba + zone_cap,
                    zone_cap,
                    finished: true,
                    appended
                });
                Ok(())
            }
            Err(e) => {
                self.zones.remove(&zone);
                tracing::error!("finish zone failed: {e}");
                Err(e)
            }
        }
    }

    /// Describe the zone starting at `slba`, querying the device if it isn't
    /// already cached.
    pub fn zone(&mut self, slba: LbaT) -> Result<Zone> {
        let zone = self.check_zone(slba)?;
        if let Some(z) = self.zones.get(&zone) {
            return Ok(*z);
        }
        self.zone_head(slba)?;
        self.zones.get(&zone).copied().ok_or(Error::IoError)
    }

    /// Append whole blocks, one device command per zone touched.
    fn append_blocks(&mut self, lba: &mut LbaT, data: &[u8]) -> Result<()> {
        let zone_cap = self.geometry.zone_cap;
        let mut remaining = data;
        while !remaining.is_empty() {
            let zone = *lba / zone_cap;
            let blocks = cmp::min(
                remaining.len() as u64 >> self.lba_msb,
                zone_cap - *lba % zone_cap
            );
            let (chunk, rest) = remaining.split_at((blocks << self.lba_msb)
                                                   as usize);
            let mut pba = self.geometry.lba_to_pba(*lba);
            if let Err(e) = self.qpair.append(&mut pba, chunk) {
                self.zones.remove(&zone);
                tracing::error!(lba = *lba, blocks, "append failed: {e}");
                return Err(e);
            }
            self.stats.append_operations += 1;
            self.stats.bytes_written += chunk.len() as u64;
            *lba = self.geometry.pba_to_lba(pba);
            let wp = *lba;
            self.zones.entry(zone)
                .and_modify(|z| {
                    z.wp = wp;
                    z.appended = true;
                }).or_insert(Zone {
                    slba: zone * zone_cap,
                    wp,
                    zone_cap,
                    finished: false,
                    appended: true
                });
            remaining = rest;
        }
        Ok(())
    }

    /// Round `size` up to whole blocks, rejecting a broken `is_aligned`
    /// promise.
    fn check_aligned(&self, size: usize, is_aligned: bool) -> Result<usize> {
        let aligned_size = self.align_size(size);
        if is_aligned && aligned_size != size {
            tracing::warn!(size, "section is not block-aligned");
            return Err(Error::InvalidArguments);
        }
        Ok(aligned_size)
    }

    /// Validate a section of a staged buffer, which must have room for the
    /// section's padding, and return its size rounded up to whole blocks.
    fn check_section(&self, buffer_len: usize, section_addr: usize,
                     section_size: usize, is_aligned: bool) -> Result<usize>
    {
        let aligned_size = self.check_aligned(section_size, is_aligned)?;
        match section_addr.checked_add(aligned_size) {
            Some(end) if end <= buffer_len => Ok(aligned_size),
            _ => {
                tracing::warn!(section_addr, section_size, buffer_len,
                    "section exceeds buffer");
                Err(Error::InvalidArguments)
            }
        }
    }

    /// Check that `aligned_size` bytes at logical `lba` lie in this channel.
    fn check_range(&self, lba: LbaT, aligned_size: usize) -> Result<()> {
        let blocks = aligned_size as u64 >> self.lba_msb;
        let min = self.geometry.pba_to_lba(self.min_lba);
        let max = self.geometry.pba_to_lba(self.max_lba);
        match lba.checked_add(blocks) {
            Some(end) if lba >= min && end <= max => Ok(()),
            _ => {
                tracing::warn!(lba, blocks, min, max,
                    "I/O outside of channel range");
                Err(Error::InvalidArguments)
            }
        }
    }

    /// Check that `slba` starts a zone in this channel, and return its number.
    fn check_zone(&self, slba: LbaT) -> Result<ZoneT> {
        let zone = slba / self.geometry.zone_cap;
        if slba % self.geometry.zone_cap != 0 ||
            !self.zone_range().contains(&zone)
        {
            tracing::warn!(slba, "not a zone in the channel's range");
            return Err(Error::InvalidArguments);
        }
        Ok(zone)
    }

    fn give_bounce(&mut self, block: Vec<u8>) {
        if self.preserve_buffer {
            self.bounce = block;
        }
    }

    /// Read whole blocks, one device command per zone touched.
    fn read_blocks(&mut self, mut lba: LbaT, data: &mut [u8]) -> Result<()> {
        let zone_cap = self.geometry.zone_cap;
        let mut remaining = data;
        while !remaining.is_empty() {
            let blocks = cmp::min(
                remaining.len() as u64 >> self.lba_msb,
                zone_cap - lba % zone_cap
            );
            let (chunk, rest) = remaining
                .split_at_mut((blocks << self.lba_msb) as usize);
            let pba = self.geometry.lba_to_pba(lba);
            self.qpair.read(pba, chunk).inspect_err(|e| {
                tracing::error!(lba, blocks, "read failed: {e}");
            })?;
            self.stats.read_operations += 1;
            self.stats.bytes_read += chunk.len() as u64;
            lba += blocks;
            remaining = rest;
        }
        Ok(())
    }

    fn reset_zone_unchecked(&mut self, zone: ZoneT) -> Result<()> {
        // Whatever happens, the cached write pointer is now stale
        self.zones.remove(&zone);
        let pba = zone * self.geometry.zone_size;
        self.qpair.reset_zone(pba).inspect_err(|e| {
            tracing::error!(zone, "zone reset failed: {e}");
        })?;
        self.stats.zones_reset += 1;
        Ok(())
    }

    /// Get a whole-block buffer of at least `size` bytes for direct I/O.
    fn take_bounce(&mut self, size: usize) -> Result<Vec<u8>> {
        if self.preserve_buffer && self.bounce.len() >= size {
            return Ok(mem::take(&mut self.bounce));
        }
        alloc_zeroed(size)
    }

    /// Zone numbers in the channel's range
    fn zone_range(&self) -> std::ops::Range<ZoneT> {
        let zone_size = self.geometry.zone_size;
        (self.min_lba / zone_size)..(self.max_lba / zone_size)
    }
}

/// Allocate a zeroed buffer, reporting failure instead of aborting.
fn alloc_zeroed(size: usize) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(size).map_err(|e| {
        tracing::error!("cannot allocate {size} bytes: {e}");
        Error::IoError
    })?;
    v.resize(size, 0);
    Ok(v)
}

// LCOV_EXCL_STOP
