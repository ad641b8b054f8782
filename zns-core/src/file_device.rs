// vim: tw=80
//! A zoned device emulated on a regular file
//!
//! The file is divided into equal zones, but only the first `zone_cap` blocks
//! of each may be written.  Write pointers are kept in memory only, so every
//! zone is empty when the device is opened.

use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use nix::{
    errno::Errno,
    libc::off_t,
    sys::uio::{pread, pwrite},
};

use crate::{
    device::*,
    types::*,
};

#[derive(Debug)]
struct Inner {
    file: File,
    geometry: DeviceGeometry,
    path: PathBuf,
    /// Physical write pointer of each zone
    wps: Mutex<Vec<LbaT>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Vec<LbaT>> {
        self.wps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Byte offset of a block
    fn offset(&self, lba: LbaT) -> Result<off_t> {
        lba.checked_mul(self.geometry.lba_size)
            .and_then(|o| off_t::try_from(o).ok())
            .ok_or(Error::IoError)
    }

    /// Zone number of `slba`, which must be the first block of a zone.
    fn zone_start(&self, slba: LbaT) -> Result<usize> {
        let g = &self.geometry;
        if slba % g.zone_size != 0 || slba < g.min_lba || slba >= g.max_lba {
            tracing::error!(slba, "not the start of a zone");
            return Err(Error::IoError);
        }
        Ok(((slba - g.min_lba) / g.zone_size) as usize)
    }

    fn read_at(&self, mut buf: &mut [u8], mut offset: off_t) -> Result<()> {
        while !buf.is_empty() {
            match pread(&self.file, buf, offset) {
                Ok(0) => {
                    tracing::error!(offset, "unexpected end of file");
                    return Err(Error::IoError);
                }
                Ok(n) => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as off_t;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into())
            }
        }
        Ok(())
    }

    fn write_at(&self, mut buf: &[u8], mut offset: off_t) -> Result<()> {
        while !buf.is_empty() {
            match pwrite(&self.file, buf, offset) {
                Ok(0) => {
                    tracing::error!(offset, "device accepted no data");
                    return Err(Error::IoError);
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as off_t;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into())
            }
        }
        Ok(())
    }
}

/// A zoned device backed by a file or device node.
///
/// Cloning it is cheap, and all clones share the same write pointers.
#[derive(Clone, Debug)]
pub struct FileDevice {
    inner: Arc<Inner>,
}

impl FileDevice {
    /// Open an existing file as a zoned device.
    ///
    /// Any trailing partial zone is ignored.
    ///
    /// * `lba_size`:   Bytes per block.  Must be a power of two.
    /// * `zone_size`:  Blocks per zone.  Must be a power of two.
    /// * `zone_cap`:   Writable blocks at the start of each zone.
    pub fn open<P: AsRef<Path>>(path: P, lba_size: u64, zone_size: u64,
                                zone_cap: u64) -> Result<Self>
    {
        let pathbuf = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&pathbuf)?;
        let len = file.seek(SeekFrom::End(0))?;
        let zone_bytes = lba_size.checked_mul(zone_size)
            .filter(|&b| b > 0)
            .ok_or(Error::InvalidArguments)?;
        let zones = len / zone_bytes;
        let geometry = DeviceGeometry {
            lba_size,
            zone_size,
            zone_cap,
            min_lba: 0,
            max_lba: zones * zone_size
        };
        geometry.validate()?;
        if zones == 0 {
            tracing::warn!(path = %pathbuf.display(), len,
                "file is too small for even one zone");
            return Err(Error::InvalidArguments);
        }
        let wps = (0..zones).map(|z| z * zone_size).collect();
        tracing::debug!(path = %pathbuf.display(), zones, "opened device");
        let inner = Arc::new(Inner {
            file,
            geometry,
            path: pathbuf,
            wps: Mutex::new(wps)
        });
        Ok(FileDevice{inner})
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Device for FileDevice {
    type QPair = FileQPair;

    fn geometry(&self) -> DeviceGeometry {
        self.inner.geometry
    }

    fn create_qpair(&self) -> Result<FileQPair> {
        Ok(FileQPair { inner: self.inner.clone() })
    }
}

/// A queue pair of a [`FileDevice`]
#[derive(Debug)]
pub struct FileQPair {
    inner: Arc<Inner>,
}

impl QPair for FileQPair {
    fn append(&mut self, lba: &mut LbaT, buf: &[u8]) -> Result<()> {
        let g = self.inner.geometry;
        if buf.len() as u64 % g.lba_size != 0 {
            tracing::error!(len = buf.len(), "append of a partial block");
            return Err(Error::IoError);
        }
        let blocks = buf.len() as u64 / g.lba_size;
        let slba = *lba - *lba % g.zone_size;
        let zone = self.inner.zone_start(slba)?;
        // Hold the lock across the write, so racing appends can't interleave
        let mut wps = self.inner.lock();
        if *lba != wps[zone] {
            tracing::error!(lba = *lba, wp = wps[zone],
                "append is not at the write pointer");
            return Err(Error::IoError);
        }
        if *lba + blocks > slba + g.zone_cap {
            tracing::error!(lba = *lba, blocks, "append exceeds zone capacity");
            return Err(Error::IoError);
        }
        self.inner.write_at(buf, self.inner.offset(*lba)?)?;
        wps[zone] += blocks;
        *lba = wps[zone];
        Ok(())
    }

    fn read(&mut self, lba: LbaT, buf: &mut [u8]) -> Result<()> {
        let g = self.inner.geometry;
        let blocks = buf.len() as u64 / g.lba_size;
        if buf.len() as u64 % g.lba_size != 0 || lba < g.min_lba ||
            lba.checked_add(blocks).map_or(true, |end| end > g.max_lba)
        {
            tracing::error!(lba, len = buf.len(), "invalid read");
            return Err(Error::IoError);
        }
        self.inner.read_at(buf, self.inner.offset(lba)?)
    }

    fn reset_zone(&mut self, slba: LbaT) -> Result<()> {
        let zone = self.inner.zone_start(slba)?;
        self.inner.lock()[zone] = slba;
        Ok(())
    }

    fn reset_all_zones(&mut self) -> Result<()> {
        let g = self.inner.geometry;
        for (z, wp) in self.inner.lock().iter_mut().enumerate() {
            *wp = g.min_lba + z as LbaT * g.zone_size;
        }
        Ok(())
    }

    fn zone_head(&mut self, slba: LbaT) -> Result<LbaT> {
        let zone = self.inner.zone_start(slba)?;
        Ok(self.inner.lock()[zone])
    }

    fn finish_zone(&mut self, slba: LbaT) -> Result<()> {
        let zone = self.inner.zone_start(slba)?;
        self.inner.lock()[zone] = slba + self.inner.geometry.zone_cap;
        Ok(())
    }
}

// LCOV_EXCL_STOP
