//! End-to-end acquisition scenarios against the simulated hardware.
//!
//! Scan sizes and dwell times are scaled so a full suite run stays in the
//! seconds range while still exercising multi-tile scans, pixel-tile
//! fallbacks, leech scheduling and cancellation mid-scan.

use acq_core::flow::SyncEvent;
use acq_core::hw::{Actuator, Detector, Emitter};
use acq_core::metadata::Polarization;
use acq_core::AcqError;
use acq_engine::{
    AcquisitionEngine, AnchorDriftCorrector, ProbeCurrentAcquirer, RasterStream, StreamKind,
    StreamSpec,
};
use acq_driver_sim::{
    SimAnalogDetector, SimCamera, SimCountingDetector, SimProbeCurrent, SimStage,
    SimStreakCamera, SimTimeCorrelator,
};
use serial_test::serial;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("acq_engine=info")
        .try_init();
}

const RESULT_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_acq_cl_se() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 1200);
    let cl = SimAnalogDetector::new("cl-detector", 3000);

    let mut spec = StreamSpec::new(
        "cl+se",
        StreamKind::SemMd,
        emitter.clone(),
        vec![se.clone(), cl.clone()],
    );
    spec.repetition = (500, 700);
    spec.roi = [0.0, 0.2, 0.3, 0.6];
    spec.dwell_time = Some(Duration::from_micros(1));
    spec.tints[1] = Some((0, 255, 128));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();

    assert!(err.is_none());
    assert_eq!(data.len(), 2);
    for da in &data {
        assert_eq!(da.shape(), &[700, 500]);
    }
    assert_eq!(data[0].metadata.pos, data[1].metadata.pos);
    assert_eq!(data[1].metadata.user_tint, Some((0, 255, 128)));
    // averaging a constant signal reproduces it exactly
    assert_eq!(data[0].data.at(&[0, 0]), 1200.0);
    assert_eq!(data[1].data.at(&[699, 499]), 3000.0);
    // emitter parked at its resting position afterwards
    assert!(emitter.is_parked());
    assert_eq!(emitter.position(), emitter.resting_position());
    assert!(!emitter.is_scanning_indicated());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_acq_spec_fuzzing() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 800);
    let spec_cam = SimCamera::spectrum("spectrometer", 64);

    let mut spec = StreamSpec::new(
        "spectrum",
        StreamKind::SemSpectrum,
        emitter,
        vec![se, spec_cam],
    );
    spec.repetition = (5, 6);
    spec.roi = [0.15, 0.6, 0.8, 0.8];
    spec.integration_time = Some(Duration::from_millis(2));
    spec.fuzzing = true;
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();

    assert!(err.is_none());
    assert_eq!(data.len(), 2);

    // SEM channel on the fuzz-refined grid
    let sem = &data[0];
    assert!(sem.shape()[0] >= 12 && sem.shape()[1] >= 10);

    // spectrum cube is CTZYX with T = Z = 1
    let cube = &data[1];
    assert_eq!(cube.shape().len(), 5);
    assert!(cube.shape()[0] > 1);
    assert_eq!(&cube.shape()[1..], &[1, 1, 6, 5]);
    assert_eq!(cube.metadata.dims.as_deref(), Some("CTZYX"));
    assert!(cube.metadata.wavelength_list.is_some());

    // fuzzing halves the SEM pixel size relative to the camera channel
    let spx = cube.metadata.pixel_size.unwrap();
    let fpx = sem.metadata.pixel_size.unwrap();
    assert!((spx.0 / fpx.0 - 2.0).abs() < 1e-9);
    assert!((spx.1 / fpx.1 - 2.0).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_acq_arpol() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 900);
    let ar_cam = SimCamera::image("ar-camera", 32, 24);

    let mut spec = StreamSpec::new("arpol", StreamKind::SemAr, emitter, vec![se, ar_cam]);
    spec.repetition = (1, 1);
    spec.roi = [0.4, 0.4, 0.6, 0.6];
    spec.integration_time = Some(Duration::from_millis(2));
    spec.acquire_all_pol = true;
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();

    assert!(err.is_none());
    // one SEM plane plus six polarized AR images
    assert_eq!(data.len(), 7);
    assert_eq!(data[0].shape(), &[1, 1]);
    for (i, pol) in Polarization::ALL.iter().enumerate() {
        let img = &data[1 + i];
        assert_eq!(img.shape(), &[24, 32]);
        assert_eq!(img.metadata.pol_mode, Some(*pol));
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_acq_drift_leech() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 1500);
    let cl = SimAnalogDetector::new("cl-detector", 2500);
    let ebic = SimAnalogDetector::new("ebic-detector", 500);

    let drift = AnchorDriftCorrector::new(
        emitter.clone(),
        se.clone(),
        [0.525, 0.525, 0.6, 0.6],
        Duration::from_micros(1),
        Duration::from_millis(60),
    )
    .with_resolution(16);

    let mut spec = StreamSpec::new(
        "se+cl+ebic",
        StreamKind::SemMd,
        emitter,
        vec![se, cl, ebic],
    );
    spec.repetition = (100, 80);
    spec.roi = [0.1, 0.1, 0.9, 0.9];
    spec.dwell_time = Some(Duration::from_micros(50));
    spec.leeches = vec![Box::new(drift)];
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();

    assert!(err.is_none());
    // three primaries plus the anchor drift series
    assert_eq!(data.len(), 4);
    let pos = data[0].metadata.pos;
    assert_eq!(data[1].metadata.pos, pos);
    assert_eq!(data[2].metadata.pos, pos);

    let series = &data[3];
    assert!(series.shape()[0] >= 2, "series shape {:?}", series.shape());
    assert_eq!(series.shape()[1], 2);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_acq_probe_current_leech() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 1000);
    let cl = SimAnalogDetector::new("cl-detector", 2000);
    let probe = SimProbeCurrent::new("faraday", 2e-9);

    let mut spec = StreamSpec::new("pc", StreamKind::SemMd, emitter, vec![se, cl]);
    spec.repetition = (40, 30);
    spec.dwell_time = Some(Duration::from_micros(20));
    spec.leeches = vec![Box::new(ProbeCurrentAcquirer::new(
        probe,
        Duration::from_millis(8),
    ))];
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();

    assert!(err.is_none());
    assert_eq!(data.len(), 2);
    let series = data[0]
        .metadata
        .ebeam_current_time
        .as_ref()
        .expect("probe current series on the primary output");
    // brackets the scan: start sample plus at least the end sample
    assert!(series.len() >= 2);
    assert!(series.iter().all(|(_, a)| (*a - 2e-9).abs() < 1e-10));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_acq_spec_sstage_cancel_and_reacquire() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let stage = SimStage::new("scan-stage", (-1e-3, 1e-3));
    let pre_position = stage.position().await.unwrap();

    let build = |n: (usize, usize)| {
        let se = SimAnalogDetector::new("se-detector", 700);
        let cam = SimCamera::spectrum("spectrometer", 32);
        let mut spec = StreamSpec::new(
            "sstage-spectrum",
            StreamKind::SemSpectrum,
            emitter.clone(),
            vec![se, cam],
        );
        spec.repetition = n;
        spec.roi = [0.3, 0.3, 0.7, 0.7];
        spec.integration_time = Some(Duration::from_millis(2));
        spec.scan_stage = Some(stage.clone());
        RasterStream::new(spec).unwrap()
    };

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(build((5, 6))).unwrap();

    // let a few pixels complete, then cancel mid-way
    tokio::time::sleep(Duration::from_millis(25)).await;
    future.cancel();
    let err = future.result(RESULT_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, AcqError::Cancelled));

    // the stage is back where it started (well within 100 nm)
    let after = stage.position().await.unwrap();
    for (axis, v) in &after {
        assert!(
            (v - pre_position[axis]).abs() < 100e-9,
            "{axis} not restored: {v}"
        );
    }

    // a subsequent short acquisition on the same hardware succeeds
    let future = engine.acquire(build((2, 2))).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());
    assert_eq!(data.len(), 2);
    assert_eq!(&data[1].shape()[3..], &[2, 2]);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_streak_integration() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();

    let acquire_with = |integration: Duration| {
        let se = SimAnalogDetector::new("se-detector", 600);
        let streak = SimStreakCamera::new("streak", 16, 8)
            .with_max_exposure(Duration::from_millis(10));
        let mut spec = StreamSpec::new(
            "streak",
            StreamKind::SemTemporalSpectrum,
            emitter.clone(),
            vec![se, streak],
        );
        spec.repetition = (2, 2);
        spec.roi = [0.4, 0.4, 0.6, 0.6];
        spec.integration_time = Some(integration);
        RasterStream::new(spec).unwrap()
    };
    let engine = AcquisitionEngine::new();

    // single exposure within the device maximum
    let future = engine.acquire(acquire_with(Duration::from_millis(10))).unwrap();
    let (single, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());

    // double the exposure: realized as two summed sub-exposures
    let future = engine.acquire(acquire_with(Duration::from_millis(20))).unwrap();
    let (integrated, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());

    let s = &single[1];
    let d = &integrated[1];
    assert_eq!(d.metadata.integration_count, Some(2));
    assert_eq!(d.metadata.baseline, s.metadata.baseline);
    assert_eq!(&d.shape()[..2], &[16, 8]);
    // accumulator widened beyond the single readout dtype
    assert!(d.data.dtype() > s.data.dtype());
    assert!(d.data.sum_f64() > s.data.sum_f64());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_temporal_histogram_shape() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 400);
    let correlator = SimTimeCorrelator::new("correlator", 48);

    let mut spec = StreamSpec::new(
        "temporal",
        StreamKind::SemTemporal,
        emitter,
        vec![se, correlator],
    );
    spec.repetition = (3, 2);
    spec.integration_time = Some(Duration::from_millis(2));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();

    assert!(err.is_none());
    let cube = &data[1];
    assert_eq!(cube.shape(), &[1, 48, 1, 2, 3]);
    assert!(cube.metadata.time_list.is_some());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_counting_lead_in_discarded() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 1000);
    let pmt = SimCountingDetector::new("counting-pmt", 5).with_lead_in();

    let mut spec = StreamSpec::new("counting", StreamKind::SemMd, emitter, vec![se, pmt]);
    spec.repetition = (8, 4);
    spec.dwell_time = Some(Duration::from_micros(10));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());

    // counts integrate (sum, no division): 5 counts per sub-sample; the
    // junk lead-in sample must not leak into any pixel
    let counts = &data[1].data;
    let per_pixel = counts.at(&[0, 0]);
    assert!(per_pixel >= 5.0, "lead-in swallowed real counts");
    for y in 0..4 {
        for x in 0..8 {
            assert_eq!(counts.at(&[y, x]), per_pixel, "pixel ({y},{x})");
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_sync_event_gates_scan_start() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 1000);
    let event = SyncEvent::new("scan-go");
    se.data().synchronized_on(Some(event.clone()));

    let mut spec = StreamSpec::new("gated", StreamKind::Sem, emitter, vec![se.clone()]);
    spec.repetition = (8, 8);
    spec.dwell_time = Some(Duration::from_micros(10));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();

    // without a notify the acquisition must stay blocked
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!future.done());

    event.notify();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());
    assert_eq!(data[0].shape(), &[8, 8]);

    se.data().synchronized_on(None);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_new_position_events_count() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 1000);

    let mut spec = StreamSpec::new("np", StreamKind::Sem, emitter.clone(), vec![se]);
    spec.repetition = (10, 8);
    spec.dwell_time = Some(Duration::from_millis(1));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (_, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());

    // events were queued once per pixel, margin columns excluded
    let event = emitter.new_position_event();
    let mut fired = 0u64;
    while event.wait_timeout(Duration::from_millis(10)).await {
        fired += 1;
    }
    assert_eq!(fired + future.skipped_position_events(), 10 * 8);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_estimate_within_bounds() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 1000);

    let mut spec = StreamSpec::new("est", StreamKind::Sem, emitter, vec![se]);
    spec.repetition = (200, 150);
    spec.dwell_time = Some(Duration::from_micros(5));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let estimate = engine.estimate_acquisition_time(&stream).unwrap();

    let started = Instant::now();
    let future = engine.acquire(stream).unwrap();
    let (_, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());
    let measured = started.elapsed();

    let ratio = estimate.as_secs_f64() / measured.as_secs_f64();
    assert!(
        (0.5..=1.5).contains(&ratio),
        "estimate {estimate:?} vs measured {measured:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_retry_on_transient_write_failure() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    emitter.fail_next_writes(2);
    let se = SimAnalogDetector::new("se-detector", 1000);

    let mut spec = StreamSpec::new("retry", StreamKind::Sem, emitter, vec![se]);
    spec.repetition = (16, 16);
    spec.dwell_time = Some(Duration::from_micros(10));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    // two under-runs are absorbed by the tile retry budget
    assert!(err.is_none());
    assert_eq!(data[0].shape(), &[16, 16]);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_rotation_zero_is_bit_exact() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();

    let acquire_rot = |rotation: f64| {
        let se = SimAnalogDetector::new("se-detector", 1234);
        let mut spec = StreamSpec::new("rot", StreamKind::Sem, emitter.clone(), vec![se]);
        spec.repetition = (12, 9);
        spec.rotation = rotation;
        spec.dwell_time = Some(Duration::from_micros(10));
        RasterStream::new(spec).unwrap()
    };

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(acquire_rot(0.0)).unwrap();
    let (before, _) = future.result(RESULT_TIMEOUT).await.unwrap();

    // a rotated scan in between must not perturb later unrotated scans
    let future = engine.acquire(acquire_rot(0.5)).unwrap();
    future.result(RESULT_TIMEOUT).await.unwrap();

    let future = engine.acquire(acquire_rot(0.0)).unwrap();
    let (after, _) = future.result(RESULT_TIMEOUT).await.unwrap();

    assert_eq!(before[0].data, after[0].data);
    assert_eq!(before[0].metadata.rotation, Some(0.0));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_validation_rejections() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let flat_emitter = emitter.without_vector_mode();
    let se = SimAnalogDetector::new("se-detector", 100);
    let cam = SimCamera::spectrum("spectrometer", 16);

    // rotation without vector mode
    let mut spec = StreamSpec::new("r", StreamKind::Sem, flat_emitter, vec![se.clone()]);
    spec.repetition = (4, 4);
    spec.rotation = 0.2;
    spec.dwell_time = Some(Duration::from_micros(1));
    let stream = RasterStream::new(spec).unwrap();
    let engine = AcquisitionEngine::new();
    assert!(matches!(
        engine.acquire(stream),
        Err(AcqError::Validation(_))
    ));

    // scan stage with a non-camera detector
    let mut spec = StreamSpec::new(
        "s",
        StreamKind::SemMd,
        emitter.clone(),
        vec![se.clone(), SimAnalogDetector::new("cl", 10)],
    );
    spec.dwell_time = Some(Duration::from_micros(1));
    spec.scan_stage = Some(SimStage::new("st", (-1e-3, 1e-3)));
    assert!(matches!(
        RasterStream::new(spec),
        Err(AcqError::Validation(_))
    ));

    // roi outside the stage range fails before any motion
    let tiny_stage = SimStage::new("tiny", (-1e-9, 1e-9));
    let mut spec = StreamSpec::new(
        "t",
        StreamKind::SemSpectrum,
        emitter,
        vec![se, cam],
    );
    spec.repetition = (4, 4);
    spec.roi = [0.0, 0.0, 1.0, 1.0];
    spec.integration_time = Some(Duration::from_millis(1));
    spec.scan_stage = Some(tiny_stage);
    let stream = RasterStream::new(spec).unwrap();
    assert!(matches!(
        engine.acquire(stream),
        Err(AcqError::Validation(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_final_arrays_published_on_flows() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 1000);
    let cl = SimAnalogDetector::new("cl-detector", 2000);

    let se_flow = se.data().clone();
    let cl_flow = cl.data().clone();

    let mut spec = StreamSpec::new("flows", StreamKind::SemMd, emitter, vec![se, cl]);
    spec.repetition = (6, 4);
    spec.dwell_time = Some(Duration::from_micros(10));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let se_get = tokio::spawn(async move { se_flow.get().await });
    let cl_get = tokio::spawn(async move { cl_flow.get().await });
    // give the single-shot getters time to subscribe
    tokio::time::sleep(Duration::from_millis(20)).await;

    let future = engine.acquire(stream).unwrap();
    let (_, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());

    let se_da = se_get.await.unwrap().unwrap();
    let cl_da = cl_get.await.unwrap().unwrap();
    assert_eq!(se_da.shape(), &[4, 6]);
    assert_eq!(cl_da.data.at(&[0, 0]), 2000.0);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_inverted_detector() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 100).with_inverted(true);

    let mut spec = StreamSpec::new("inv", StreamKind::Sem, emitter, vec![se]);
    spec.repetition = (4, 4);
    spec.dwell_time = Some(Duration::from_micros(10));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());
    // 4095 (max value) - 100
    assert_eq!(data[0].data.at(&[0, 0]), 3995.0);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_repetition_round_trip() {
    let emitter = acq_driver_sim::SimEmitter::new();
    let se = SimAnalogDetector::new("se-detector", 1);
    let mut spec = StreamSpec::new("rt", StreamKind::Sem, emitter, vec![se]);
    spec.repetition = (37, 23);
    spec.dwell_time = Some(Duration::from_micros(1));
    let stream = RasterStream::new(spec).unwrap();
    assert_eq!(stream.repetition, (37, 23));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_scanning_indicator_grace_and_fast_release() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new()
        .with_indicator_grace(Duration::from_millis(200));

    let build = |rep: (usize, usize), dwell: Duration| {
        let se = SimAnalogDetector::new("se-detector", 1000);
        let mut spec = StreamSpec::new("ttl", StreamKind::Sem, emitter.clone(), vec![se]);
        spec.repetition = rep;
        spec.dwell_time = Some(dwell);
        RasterStream::new(spec).unwrap()
    };
    let engine = AcquisitionEngine::new();

    // normal completion releases gracefully: the lines stay asserted for
    // the grace period so a follow-up scan does not thrash them
    let future = engine.acquire(build((8, 8), Duration::from_micros(10))).unwrap();
    let (_, err) = future.result(RESULT_TIMEOUT).await.unwrap();
    assert!(err.is_none());
    assert!(emitter.is_scanning_indicated());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!emitter.is_scanning_indicated());

    // an aborted scan releases immediately (fast park path)
    let future = engine.acquire(build((50, 50), Duration::from_micros(100))).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(emitter.is_scanning_indicated());
    future.cancel();
    let err = future.result(RESULT_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, AcqError::Cancelled));
    assert!(!emitter.is_scanning_indicated());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_hw_error_state_after_exhausted_retries() {
    init_tracing();
    let emitter = acq_driver_sim::SimEmitter::new();
    // more failures than the retry budget
    emitter.fail_next_writes(100);
    let se = SimAnalogDetector::new("se-detector", 1000);

    let mut spec = StreamSpec::new("hw", StreamKind::Sem, emitter, vec![se]);
    spec.repetition = (4, 4);
    spec.dwell_time = Some(Duration::from_micros(10));
    let stream = RasterStream::new(spec).unwrap();

    let engine = AcquisitionEngine::new();
    let future = engine.acquire(stream).unwrap();
    let (data, err) = future.result(RESULT_TIMEOUT).await.unwrap();

    assert!(data.is_empty());
    assert!(matches!(err, Some(AcqError::Hardware(_))));
    assert!(matches!(
        &*engine.state().borrow(),
        acq_engine::EngineState::HwError(_)
    ));
}
