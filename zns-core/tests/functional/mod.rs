// vim: tw=80
//! Functional tests that drive real channels over a file-backed device

use std::{fs, path::PathBuf};

use tempfile::{Builder, TempDir};

use zns_core::{
    LbaT,
    channel_factory::ChannelFactory,
    file_device::FileDevice,
};

/// Bytes per block of every test device
const LBA_SIZE: usize = 512;
/// Physical blocks per zone
const ZONE_SIZE: LbaT = 64;
/// Usable blocks per zone
const ZONE_CAP: LbaT = 48;
/// Zones per device
const ZONES: u64 = 8;

struct Harness {
    factory: ChannelFactory<FileDevice>,
    path: PathBuf,
    _tempdir: TempDir,
}

fn harness(max_channel_count: usize) -> Harness {
    let tempdir = Builder::new()
        .prefix("zns_core_functional_test")
        .tempdir()
        .unwrap();
    let path = tempdir.path().join("dev");
    let file = fs::File::create(&path).unwrap();
    file.set_len(ZONES * ZONE_SIZE * LBA_SIZE as u64).unwrap();
    let device = FileDevice::open(&path, LBA_SIZE as u64, ZONE_SIZE, ZONE_CAP)
        .unwrap();
    let factory = ChannelFactory::new(device, max_channel_count);
    Harness { factory, path, _tempdir: tempdir }
}

/// Deterministic contents that differ for every offset and every `tag`
fn mkbuf(tag: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ (i >> 8) as u8 ^ tag)
        .collect()
}

mod channel_factory;
