// vim: tw=80
use std::thread;

use divbuf::DivBufShared;
use pretty_assertions::assert_eq;
use rstest::rstest;

use zns_core::{
    Error,
    LbaT,
    config::Config,
    device::{Device, QPair},
    file_device::FileDevice,
};

use super::*;

#[test]
fn budget() {
    let h = harness(2);
    let c0 = h.factory.register_channel(0, 1, false, 1).unwrap();
    let c1 = h.factory.register_channel(1, 2, false, 1).unwrap();
    assert_eq!(h.factory.register_channel(2, 3, false, 1).err(),
               Some(Error::InvalidArguments));
    assert_eq!(h.factory.register_raw_qpair().err(),
               Some(Error::InvalidArguments));
    h.factory.unregister_channel(c0);
    let c2 = h.factory.register_channel(2, 3, false, 1).unwrap();
    assert_eq!(h.factory.channel_count(), 2);
    drop(c1);
    drop(c2);
    assert_eq!(h.factory.channel_count(), 0);
}

#[rstest]
#[case::inverted(3, 2)]
#[case::past_end(0, ZONES + 1)]
fn bad_range(#[case] min_zone: LbaT, #[case] max_zone: LbaT) {
    let h = harness(2);
    assert_eq!(h.factory.register_channel(min_zone, max_zone, false, 1).err(),
               Some(Error::InvalidArguments));
    assert_eq!(h.factory.channel_count(), 0);
}

/// A raw queue pair shares the device with channels
#[test]
fn raw_qpair() {
    let h = harness(2);
    let mut c = h.factory.register_channel(0, 1, false, 1).unwrap();
    let mut raw = h.factory.register_raw_qpair().unwrap();
    let mut lba = 0;
    c.direct_append(&mut lba, &[5u8; 10], false).unwrap();
    assert_eq!(raw.zone_head(0), Ok(1));
    let mut buf = vec![0u8; LBA_SIZE];
    raw.read(0, &mut buf).unwrap();
    assert_eq!(&buf[..10], &[5u8; 10]);
    h.factory.unregister_raw_qpair(raw);
    assert_eq!(h.factory.channel_count(), 1);
}

#[test]
fn from_config() {
    let h = harness(1);
    let config = Config::from_yaml("max_channel_count: 3\n").unwrap();
    let device = FileDevice::open(&h.path, LBA_SIZE as u64, ZONE_SIZE,
                                  ZONE_CAP).unwrap();
    let factory = ChannelFactory::from_config(device, &config);
    assert_eq!(factory.max_channel_count(), 3);
    assert_eq!(factory.geometry(), &factory.device().geometry());
    let channels = (0..3).map(|z| {
        factory.register_channel(z, z + 1, config.preserve_buffer,
                                 config.queue_depth).unwrap()
    }).collect::<Vec<_>>();
    assert!(factory.register_whole_channel(false, 1).is_err());
    drop(channels);
    assert!(factory.register_whole_channel(false, 1).is_ok());
}

/// Channels over disjoint zones may be driven from different threads at once
#[test]
fn concurrent_channels() {
    let h = harness(ZONES as usize);
    let factory = &h.factory;
    thread::scope(|s| {
        for zone in 0..ZONES {
            s.spawn(move || {
                let mut c = factory.register_channel(zone, zone + 1, false, 1)
                    .unwrap();
                let slba = zone * ZONE_CAP;
                let mut lba = slba;
                let mut records = Vec::new();
                for i in 0..10u8 {
                    let data = mkbuf(i ^ zone as u8, 1000 + 37 * i as usize);
                    let mut v = data.clone();
                    v.resize(c.align_size(data.len()), 0);
                    let dbs = DivBufShared::from(v);
                    let start = lba;
                    c.flush_buffer_section(&mut lba, &dbs, 0, data.len(), false)
                        .unwrap();
                    records.push((start, data));
                }
                for (start, data) in records {
                    let mut buf = vec![0u8; data.len()];
                    c.direct_read(start, &mut buf, false).unwrap();
                    assert_eq!(buf, data);
                }
                assert_eq!(c.zone_head(slba), Ok(lba));
            });
        }
    });
    assert_eq!(h.factory.channel_count(), 0);
}
