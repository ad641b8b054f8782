// vim: tw=80
//! Issues [`Channel`]s, and bare queue pairs, from one zoned device
//!
//! Every channel and raw queue pair occupies one slot of a fixed-size pool.
//! Slots are returned automatically when the channel or queue pair drops.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    channel::Channel,
    config::Config,
    device::*,
    types::*,
};

/// Capacity-checked count of outstanding queue pairs
#[derive(Debug)]
struct QPairPool {
    max: usize,
    count: Mutex<usize>,
}

impl QPairPool {
    fn new(max: usize) -> Self {
        QPairPool { max, count: Mutex::new(0) }
    }

    /// Claim a slot, or fail if all are in use.
    fn alloc(self: &Arc<Self>) -> Result<Lease> {
        let mut count = self.lock();
        if *count >= self.max {
            tracing::error!(max = self.max, "Too many channels");
            return Err(Error::InvalidArguments);
        }
        *count += 1;
        tracing::debug!(count = *count, "allocated queue pair slot");
        Ok(Lease { pool: self.clone() })
    }

    fn count(&self) -> usize {
        *self.lock()
    }

    fn free(&self) {
        let mut count = self.lock();
        debug_assert!(*count > 0, "freed more queue pairs than allocated");
        *count = count.saturating_sub(1);
        tracing::debug!(count = *count, "freed queue pair slot");
    }

    /// The counter stays consistent even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One claimed slot of a [`QPairPool`].  Dropping it frees the slot.
#[derive(Debug)]
pub(crate) struct Lease {
    pool: Arc<QPairPool>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.free();
    }
}

/// A driver queue pair issued without a [`Channel`] wrapper.
///
/// Dereferences to the driver's queue pair.  Dropping it releases the queue
/// pair and then its factory slot.
pub struct RawQPair<Q: QPair> {
    qpair: Q,
    _lease: Lease,
}

impl<Q: QPair> Deref for RawQPair<Q> {
    type Target = Q;

    fn deref(&self) -> &Q {
        &self.qpair
    }
}

impl<Q: QPair> DerefMut for RawQPair<Q> {
    fn deref_mut(&mut self) -> &mut Q {
        &mut self.qpair
    }
}

/// Owns a zoned device and hands out [`Channel`]s over its zones.
///
/// A `ChannelFactory` may be shared between threads.  The channels it issues
/// may be moved to other threads, but each must be driven by only one thread
/// at a time.
pub struct ChannelFactory<D: Device> {
    device: D,
    geometry: DeviceGeometry,
    pool: Arc<QPairPool>,
}

impl<D: Device> ChannelFactory<D> {
    /// Allow at most `max_channel_count` channels and raw queue pairs to be
    /// outstanding at once.
    pub fn new(device: D, max_channel_count: usize) -> Self {
        let geometry = device.geometry();
        ChannelFactory {
            device,
            geometry,
            pool: Arc::new(QPairPool::new(max_channel_count)),
        }
    }

    pub fn from_config(device: D, config: &Config) -> Self {
        Self::new(device, config.max_channel_count)
    }

    /// Number of outstanding channels and raw queue pairs
    pub fn channel_count(&self) -> usize {
        self.pool.count()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    pub fn max_channel_count(&self) -> usize {
        self.pool.max
    }

    /// Create a channel over zones `[min_zone, max_zone)`.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` if the zone range is inverted or extends past the
    /// device, or if the channel budget is exhausted.  `IoError` if the driver
    /// can't supply a queue pair.
    #[tracing::instrument(skip(self))]
    pub fn register_channel(
        &self,
        min_zone: ZoneT,
        max_zone: ZoneT,
        preserve_buffer: bool,
        queue_depth: u32
    ) -> Result<Channel<D::QPair>>
    {
        let zone_size = self.geometry.zone_size;
        let range = min_zone.checked_mul(zone_size)
            .zip(max_zone.checked_mul(zone_size));
        let (min_lba, max_lba) = match range {
            Some((min_lba, max_lba)) if min_lba <= max_lba &&
                min_lba >= self.geometry.min_lba &&
                max_lba <= self.geometry.max_lba => (min_lba, max_lba),
            _ => {
                tracing::warn!(min_zone, max_zone,
                    "zone range is not inside the device");
                return Err(Error::InvalidArguments);
            }
        };
        let (qpair, lease) = self.alloc_qpair()?;
        let channel = Channel::new(qpair, self.geometry, min_lba, max_lba)?
            .with_preserve_buffer(preserve_buffer)
            .with_queue_depth(queue_depth)
            .with_lease(lease);
        Ok(channel)
    }

    /// Create a channel over every zone of the device.
    pub fn register_whole_channel(&self, preserve_buffer: bool,
                                  queue_depth: u32)
        -> Result<Channel<D::QPair>>
    {
        let zone_size = self.geometry.zone_size;
        self.register_channel(self.geometry.min_lba / zone_size,
                              self.geometry.max_lba / zone_size,
                              preserve_buffer,
                              queue_depth)
    }

    /// Issue a bare queue pair, subject to the same budget as channels.
    pub fn register_raw_qpair(&self) -> Result<RawQPair<D::QPair>> {
        let (qpair, lease) = self.alloc_qpair()?;
        Ok(RawQPair { qpair, _lease: lease })
    }

    /// Destroy a channel, releasing its queue pair and its slot.
    ///
    /// Equivalent to dropping it.
    pub fn unregister_channel(&self, channel: Channel<D::QPair>) {
        drop(channel);
    }

    /// Release a bare queue pair and its slot.
    ///
    /// Equivalent to dropping it.
    pub fn unregister_raw_qpair(&self, qpair: RawQPair<D::QPair>) {
        drop(qpair);
    }

    fn alloc_qpair(&self) -> Result<(D::QPair, Lease)> {
        let lease = self.pool.alloc()?;
        // On failure the lease drops here, and frees its slot
        let qpair = self.device.create_qpair().inspect_err(|e| {
            tracing::error!("cannot create queue pair: {e}");
        })?;
        Ok((qpair, lease))
    }
}

// LCOV_EXCL_STOP
