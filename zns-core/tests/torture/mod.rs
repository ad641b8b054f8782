// vim: tw=80
//! Write and read random-length records through a channel and verify their
//! integrity.

use std::{
    env,
    fs,
    str::FromStr,
};

use divbuf::DivBufShared;
use rand::{
    Rng,
    RngCore,
    SeedableRng,
    thread_rng
};
use rstest::rstest;
use rand_xorshift::XorShiftRng;
use tempfile::{Builder, TempDir};

use zns_core::{
    LbaT,
    channel_factory::ChannelFactory,
    file_device::FileDevice,
};

fn test_scale() -> f64 {
    env::var("ZNS_TORTURE_SCALE")
        .map(|s| f64::from_str(&s)
             .expect("ZNS_TORTURE_SCALE must be a float")
         ).unwrap_or(1.0)
}

struct Harness {
    factory: ChannelFactory<FileDevice>,
    _tempdir: TempDir,
}

fn harness(lba_size: u64, zone_size: u64, zone_cap: u64, zones: u64)
    -> Harness
{
    let tempdir = Builder::new()
        .prefix("test_zns_core_torture")
        .tempdir()
        .unwrap();
    let path = tempdir.path().join("dev");
    let file = fs::File::create(&path).unwrap();
    file.set_len(zones * zone_size * lba_size).unwrap();
    let device = FileDevice::open(&path, lba_size, zone_size, zone_cap)
        .unwrap();
    let factory = ChannelFactory::new(device, 1);
    Harness { factory, _tempdir: tempdir }
}

/// Deterministic contents unique to each logical byte offset and pass
fn mkbuf(pass: usize, lba: LbaT, lba_size: usize, len: usize) -> Vec<u8> {
    let base = lba as usize * lba_size;
    (0..len).map(|i| {
        let ofs = base + i;
        (ofs ^ (ofs >> 8) ^ (ofs >> 16) ^ pass.wrapping_mul(0x5b)) as u8
    }).collect()
}

fn do_test(h: Harness, max_record: usize, passes: usize,
           seed: Option<[u8; 16]>)
{
    let seed = seed.unwrap_or_else(|| {
        let mut seed = [0u8; 16];
        let mut seeder = thread_rng();
        seeder.fill_bytes(&mut seed);
        seed
    });
    println!("Using seed {:?}", &seed);
    // Use XorShiftRng because it's deterministic and seedable
    let mut rng = XorShiftRng::from_seed(seed);

    let mut c = h.factory.register_whole_channel(false, 1).unwrap();
    let lba_size = c.geometry().lba_size as usize;
    let max_record_lbas = c.align_size(max_record) as LbaT / lba_size as LbaT;
    let passes = ((passes as f64 * test_scale()) as usize).max(1);

    for pass in 0..passes {
        c.reset_all_zones().unwrap();
        let mut lba = 0;
        let mut records = Vec::new();

        // Fill the channel with records
        while lba + max_record_lbas <= c.max_lbas() {
            let len = rng.gen_range(1..=max_record);
            let data = mkbuf(pass, lba, lba_size, len);
            let start = lba;
            tracing::debug!("pass {pass}: writing {len} bytes at {lba}");
            if rng.gen_bool(0.25) {
                c.direct_append(&mut lba, &data, false).unwrap();
            } else {
                // Stage the record at a random offset within a larger buffer
                let addr = rng.gen_range(0..4);
                let mut v = vec![0xffu8; addr + c.align_size(len)];
                v[addr..addr + len].copy_from_slice(&data);
                let dbs = DivBufShared::from(v);
                c.flush_buffer_section(&mut lba, &dbs, addr, len, false)
                    .unwrap();
            }
            assert_eq!(lba - start,
                       c.align_size(len) as LbaT / lba_size as LbaT);
            records.push((start, data));
        }
        assert_eq!(c.lbas_left().unwrap(), c.max_lbas() - lba);

        // Then read them all back, in a random order
        for _ in 0..records.len() {
            let (start, ref data) = records[rng.gen_range(0..records.len())];
            let len = data.len();
            if rng.gen_bool(0.5) {
                let mut buf = vec![0u8; len];
                c.direct_read(start, &mut buf, false).unwrap();
                assert!(&buf == data, "mismatch at lba {start}");
            } else {
                let dbs = DivBufShared::from(vec![0u8; c.align_size(len)]);
                c.read_into_buffer(start, &dbs, 0, len, false).unwrap();
                let db = dbs.try_const().unwrap();
                assert!(db[..len] == data[..], "mismatch at lba {start}");
            }
        }
    }
    assert_eq!(c.zones_reset(), passes as u64 * c.geometry().zones());
}

/// Zone capacity equal to zone size
#[rstest]
#[case(None)]
#[case(Some([0x1a, 0x2b, 0x3c, 0x4d, 0x5e, 0x6f, 0x70, 0x81,
             0x92, 0xa3, 0xb4, 0xc5, 0xd6, 0xe7, 0xf8, 0x09]))]
#[test_log::test]
fn no_padding(#[case] seed: Option<[u8; 16]>) {
    do_test(harness(512, 128, 128, 16), 4000, 2, seed);
}

/// Records much larger than a zone's padding
#[rstest]
#[case(None)]
#[test_log::test]
fn padded(#[case] seed: Option<[u8; 16]>) {
    do_test(harness(512, 128, 100, 16), 9000, 2, seed);
}

/// Records that span several zones
#[rstest]
#[case(None)]
#[test_log::test]
fn multi_zone(#[case] seed: Option<[u8; 16]>) {
    do_test(harness(4096, 16, 5, 32), 40_000, 2, seed);
}
