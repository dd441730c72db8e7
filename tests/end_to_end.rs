use std::fs;

use usrp_record::{
    device::RoutingTable,
    plan::{AcquisitionPlan, CaptureOptions, ClockPlan, SampleTarget},
    radio::{ClockSource, Radio},
    record::run_record,
    sample::WireFormat,
    sim::{SimConfig, SimRadio},
    sink::{channel_path, metadata_path},
    Error,
};

fn options(prefix: &str) -> CaptureOptions {
    CaptureOptions {
        device: "type=sim,addr0=192.168.40.2".to_owned(),
        prefix: prefix.to_owned(),
        channels: 4,
        rate: 10e6,
        freq: 1.4e9,
        gain: 30.0,
        bandwidth: 0.0,
        target: SampleTarget::Seconds(1.0),
        samples_per_block: None,
        format: WireFormat::Sc16,
        clock: ClockPlan {
            reference: ClockSource::Gpsdo,
            time_source: ClockSource::Gpsdo,
            lock_wait: 5,
        },
        start_offset: std::time::Duration::from_millis(1900),
    }
}

#[test]
fn four_channels_for_one_second() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("run").to_string_lossy().into_owned();
    let table = RoutingTable::builtin().unwrap();
    let plan = AcquisitionPlan::from_options(&options(&prefix), &table).unwrap();
    assert_eq!(plan.total_samples, 10_000_000);

    let mut radio = SimRadio::new(SimConfig {
        gps_lock_after: Some(2),
        ..Default::default()
    });
    let mut clock = radio.clock();
    let rec = run_record(&mut radio, &mut clock, &plan, &table).unwrap();

    assert_eq!(rec.summary.samples, 10_000_000);
    for chan in 0..4 {
        let len = fs::metadata(channel_path(&prefix, chan)).unwrap().len();
        assert_eq!(len, 40_000_000);
    }
    let text = fs::read_to_string(metadata_path(&prefix)).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines.contains(&"Channels: 4"));
    assert!(lines.contains(&"Fs: 10.000000 Msps"));
    assert!(lines.contains(&"BW: 10.000000 MHz"));
    assert!(lines.contains(&"Lock status: locked"));
    assert!(lines.contains(&"Chan 2 Antenna: RX1"));
    assert!(lines.iter().any(|l| l.starts_with("GPS time: ")));
}

#[test]
fn five_channels_need_two_boards() {
    let mut opts = options("unused");
    opts.channels = 5;
    let table = RoutingTable::builtin().unwrap();
    assert!(matches!(
        AcquisitionPlan::from_options(&opts, &table),
        Err(Error::IncompatibleDevice { needed: 2, boards: 1, .. })
    ));
}

#[test]
fn eight_channels_across_two_boards() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("twin").to_string_lossy().into_owned();
    let mut opts = options(&prefix);
    opts.device = "type=sim,addr0=192.168.40.2,addr1=192.168.40.3".to_owned();
    opts.channels = 8;
    opts.rate = 1e6;
    opts.target = SampleTarget::Samples(4096);
    let table = RoutingTable::builtin().unwrap();
    let plan = AcquisitionPlan::from_options(&opts, &table).unwrap();

    let mut radio = SimRadio::from_args(&plan.device).unwrap();
    let mut clock = radio.clock();
    let rec = run_record(&mut radio, &mut clock, &plan, &table).unwrap();
    assert_eq!(rec.bytes, vec![4096 * 4; 8]);

    // Both boards were zeroed on the same edge
    let t0 = radio.time_now(0).unwrap().to_seconds();
    let t1 = radio.time_now(1).unwrap().to_seconds();
    assert!((t0 - t1).abs() < 1.0);
    assert_eq!(radio.rx_subdev_spec(1).unwrap(), "A:0 A:1 B:0 B:1");
}
