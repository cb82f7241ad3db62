//! Full scans over channel files on disk.

use std::f64::consts::PI;
use std::path::Path;

use omegascan_core::checkpoint::ScanCheckpoint;
use omegascan_core::datasource::{write_channel_file, ChannelFileSource, MemorySource};
use omegascan_core::orchestrator::{ChannelState, ScanOrchestrator, ScanSummary, SkipReason};
use omegascan_core::products::{read_map, ProductPool};
use omegascan_core::qtransform::QTransform;
use omegascan_core::report::JsonReport;
use omegascan_core::types::{ScanOptions, TimeSeries};
use omegascan_core::ScanConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const FS: f64 = 16384.0;
const T0: f64 = -33.0;
const DURATION: f64 = 66.0;

const CONFIG: &str = "\
[primary]
channel = X1:PRIMARY
matched-filter-length = 1
duration = 64
fftlength = 8
resample = 4096

[aux]
name = Auxiliary channels
q-range = 4,64
frequency-range = 10,2048
duration = 64
fftlength = 8
resample = 4096
plot-time-durations = 1,4
channels = X1:INJECTED
    X1:NOISE
";

const NATIVE_CONFIG: &str = "\
[aux]
q-range = 4,64
frequency-range = 10,2048
duration = 64
fftlength = 8
plot-time-durations = 1
channels = X1:PULSE
    X1:WHITE
";

fn noise(name: &str, seed: u64) -> TimeSeries {
    gaussian_noise(name, seed, 0.1)
}

fn gaussian_noise(name: &str, seed: u64, sigma: f64) -> TimeSeries {
    let mut rng = StdRng::seed_from_u64(seed);
    let dist = Normal::new(0.0, sigma).unwrap();
    let n = (FS * DURATION) as usize;
    TimeSeries::new(name, T0, FS, (0..n).map(|_| dist.sample(&mut rng)).collect())
}

/// Unit-amplitude sine-Gaussian centred on GPS 0.
fn inject(series: &mut TimeSeries, frequency: f64, tau: f64) {
    for (i, v) in series.data.iter_mut().enumerate() {
        let t = T0 + i as f64 / FS;
        if t.abs() < 10.0 * tau {
            *v += (2.0 * PI * frequency * t).sin() * (-(t / tau).powi(2)).exp();
        }
    }
}

/// Unit-amplitude Gaussian pulse centred on GPS 0.
fn inject_pulse(series: &mut TimeSeries, tau: f64) {
    for (i, v) in series.data.iter_mut().enumerate() {
        let t = T0 + i as f64 / FS;
        if t.abs() < 10.0 * tau {
            *v += (-(t / tau).powi(2)).exp();
        }
    }
}

fn write_frames(dir: &Path) {
    let mut injected = noise("X1:INJECTED", 1);
    inject(&mut injected, 250.0, 0.01);
    let mut primary = noise("X1:PRIMARY", 2);
    inject(&mut primary, 250.0, 0.01);
    let noise_only = noise("X1:NOISE", 3);

    for series in [&injected, &primary, &noise_only] {
        let file = format!("{}.chan", series.name.replace(':', "_"));
        write_channel_file(&dir.join(file), series, 32).unwrap();
    }
}

fn options() -> ScanOptions {
    ScanOptions {
        gps: 0.0,
        fthresh: 1e-10,
        nt: 200,
        nf: 100,
        nproc: 2,
        ..ScanOptions::default()
    }
}

fn scan(frames: &Path, out: &Path, options: ScanOptions) -> ScanSummary {
    let config = ScanConfig::parse(CONFIG, None).unwrap();
    let plots = out.join("plots");
    std::fs::create_dir_all(&plots).unwrap();
    let pool = ProductPool::new(&plots, options.nproc);

    ScanOrchestrator::new(
        config,
        options,
        QTransform::new(),
        Box::new(ChannelFileSource::from_dir(frames).unwrap()),
        Box::new(MemorySource::new()),
        Box::new(JsonReport::new(out.join("summary.json"))),
    )
    .with_checkpoint(out.join("summary.csv"))
    .with_products(pool)
    .run()
    .unwrap()
}

#[test]
fn test_injection_is_recorded_and_noise_is_skipped() {
    let frames = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_frames(frames.path());

    let summary = scan(frames.path(), out.path(), options());

    assert_eq!(summary.state("X1:INJECTED"), Some(&ChannelState::Recorded));
    assert!(matches!(
        summary.state("X1:NOISE"),
        Some(ChannelState::Skipped(SkipReason::Insignificant { .. }))
    ));

    let record = summary.table.get("X1:INJECTED").unwrap();
    assert!(record.central_time.abs() <= 0.05, "central time {}", record.central_time);
    assert!(
        (100.0..600.0).contains(&record.central_frequency),
        "central frequency {}",
        record.central_frequency
    );
    assert!(record.snr > 10.0, "snr {}", record.snr);

    let correlation = record.correlation.as_ref().unwrap();
    assert!(correlation.delay_ms.abs() <= 5, "delay {} ms", correlation.delay_ms);
    assert!(correlation.peak > 0.0);
    assert!(!summary.table.contains("X1:NOISE"));

    // One whitened and one raw map per plot duration.
    assert_eq!(summary.products.written, 4);
    let (map, _) = read_map(&out.path().join("plots").join("X1-INJECTED-qscan_whitened-1.qmap")).unwrap();
    assert_eq!(map.nt(), 200);
    assert_eq!(map.nf(), 100);
    assert_eq!(map.t0, -0.5);
    assert!(map.max_energy() > 0.0);

    // The checkpoint on disk carries the same table.
    let (table, completed) = ScanCheckpoint::new(out.path().join("summary.csv"), true).load().unwrap();
    assert_eq!(completed, vec!["X1:INJECTED"]);
    assert_eq!(&table, &summary.table);
}

#[test]
fn test_resumed_scan_restores_recorded_channels() {
    let frames = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_frames(frames.path());

    let first = scan(frames.path(), out.path(), options());
    let resumed = scan(frames.path(), out.path(), options());

    assert_eq!(resumed.state("X1:INJECTED"), Some(&ChannelState::CheckpointHit));
    assert_eq!(resumed.table, first.table);
    // Nothing new was recorded, so no maps were written.
    assert_eq!(resumed.products.written, 0);
    assert_eq!(resumed.recorded(), 0);
}

#[test]
fn test_gaussian_pulse_in_white_noise_at_native_rate() {
    let out = tempfile::tempdir().unwrap();
    let mut pulse = gaussian_noise("X1:PULSE", 11, 1.0);
    inject_pulse(&mut pulse, 0.01);
    let white = gaussian_noise("X1:WHITE", 12, 1.0);
    let source = MemorySource::new().with_series(pulse).with_series(white);

    let summary = ScanOrchestrator::new(
        ScanConfig::parse(NATIVE_CONFIG, None).unwrap(),
        ScanOptions {
            correlate: false,
            ..options()
        },
        QTransform::new(),
        Box::new(source),
        Box::new(MemorySource::new()),
        Box::new(JsonReport::new(out.path().join("summary.json"))),
    )
    .run()
    .unwrap();

    assert_eq!(summary.state("X1:PULSE"), Some(&ChannelState::Recorded));
    let record = summary.table.get("X1:PULSE").unwrap();
    assert!(record.central_time.abs() <= 0.05, "central time {}", record.central_time);
    assert!(record.snr > 5.0, "snr {}", record.snr);
    assert!(record.correlation.is_none());

    assert!(matches!(
        summary.state("X1:WHITE"),
        Some(ChannelState::Skipped(SkipReason::Insignificant { .. }))
    ));
    assert_eq!(summary.table.len(), 1);
}
