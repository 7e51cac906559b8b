//! Integration tests for the read-frame stage.
//!
//! Every test drives a `CameraInput` against streams in a private
//! `StreamRegistry`, publishing frames the way a camera driver would.

use aol_stream::{DataType, ImageShape, PixelBuffer, StreamError, StreamImage, StreamRegistry};
use aoloop_camin::camin::total::wait_for_computed;
use aoloop_camin::camin::{CameraInput, FrameOutcome, FrameRequest, LoopStage, TimingSlot};
use aoloop_camin::config::{CameraInputConfig, SampleKind, SimulationConfig};
use aoloop_camin::error::CaminError;
use aoloop_camin::sim::SimulatedCamera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

/// 4x4 frame with values 1..=16.
fn ramp_u16() -> PixelBuffer {
    PixelBuffer::U16((1..=16).collect())
}

fn f32_data(image: &StreamImage) -> Vec<f32> {
    image.read().as_f32().unwrap().to_vec()
}

fn setup(loop_index: u32, datatype: DataType, shape: ImageShape) -> (StreamRegistry, Arc<StreamImage>, CameraInputConfig) {
    let registry = StreamRegistry::new();
    let config = CameraInputConfig::for_loop(loop_index);
    let source = registry.create(&config.source_name(), datatype, shape).unwrap();
    (registry, source, config)
}

fn processed(outcome: FrameOutcome) -> (bool, u32, f32) {
    match outcome {
        FrameOutcome::Processed {
            timed_out,
            slot,
            total_flux,
            ..
        } => (timed_out, slot, total_flux),
        FrameOutcome::Stopped => panic!("expected a processed frame"),
    }
}

#[test]
fn test_zero_dark_ramp_normalized() {
    let (registry, source, config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    registry
        .create_with_data(&config.dark_name(), ImageShape::new_2d(4, 4), PixelBuffer::F32(vec![0.0; 16]))
        .unwrap();

    let mut camin = CameraInput::new(config.clone(), registry.clone());
    camin.initialize(false).unwrap();
    source.publish_frame(0, &ramp_u16()).unwrap();

    let request = FrameRequest {
        normalize: true,
        ..Default::default()
    };
    let (timed_out, slot, total) = processed(camin.read_frame(request).unwrap());
    assert!(!timed_out);
    assert_eq!(slot, 0);
    assert_eq!(total, 136.0);

    let imwfs0 = registry.open(&config.imwfs0_name()).unwrap();
    let expected: Vec<f32> = (1..=16).map(|v| v as f32).collect();
    assert_eq!(f32_data(&imwfs0), expected);
    assert_eq!(imwfs0.cnt0(), 1);

    let imwfs0tot = registry.open(&config.imwfs0tot_name()).unwrap();
    assert_eq!(f32_data(&imwfs0tot), vec![136.0]);
    assert_eq!(imwfs0tot.cnt0(), 1);

    let imwfs1 = registry.open(&config.imwfs1_name()).unwrap();
    let sum: f32 = f32_data(&imwfs1).iter().sum();
    assert!((sum - 1.0).abs() < 1e-5);
    assert!((camin.coefficients().alpha() - 1.0 / 136.0).abs() < 1e-9);
}

#[test]
fn test_normalization_disabled_still_totals() {
    let (registry, source, config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    let mut camin = CameraInput::new(config.clone(), registry.clone());
    camin.initialize(false).unwrap();
    source.publish_frame(0, &ramp_u16()).unwrap();

    let (_, _, total) = processed(camin.read_frame(FrameRequest::default()).unwrap());
    assert_eq!(total, 136.0);
    assert_eq!(camin.coefficients().factor, 1.0);

    // No dark frame: imWFS0 is the raw frame as float, imWFS1 a copy of it.
    let imwfs0 = f32_data(&registry.open(&config.imwfs0_name()).unwrap());
    let imwfs1 = f32_data(&registry.open(&config.imwfs1_name()).unwrap());
    assert_eq!(imwfs0, imwfs1);
    assert_eq!(imwfs0[15], 16.0);
}

#[test]
fn test_norm_floor_coefficients() {
    let (registry, source, mut config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    config.norm_floor = 1.0;
    let mut camin = CameraInput::new(config, registry);
    camin.initialize(false).unwrap();
    source.publish_frame(0, &ramp_u16()).unwrap();

    let request = FrameRequest {
        normalize: true,
        ..Default::default()
    };
    camin.read_frame(request).unwrap();
    let coefficients = camin.coefficients();
    assert!((coefficients.factor - 1.0 / 152.0).abs() < 1e-9);
    assert!((coefficients.beta() + 136.0 / 152.0).abs() < 1e-6);
}

#[test]
fn test_dark_and_mask_applied() {
    let (registry, source, config) = setup(1, DataType::I16, ImageShape::new_2d(2, 2));
    registry
        .create_with_data(
            &config.dark_name(),
            ImageShape::new_2d(2, 2),
            PixelBuffer::F32(vec![1.0, 1.0, 2.0, 2.0]),
        )
        .unwrap();
    registry
        .create_with_data(
            &config.mask_name(),
            ImageShape::new_2d(2, 2),
            PixelBuffer::F32(vec![1.0, 0.0, 1.0, 0.0]),
        )
        .unwrap();

    let mut camin = CameraInput::new(config.clone(), registry.clone());
    camin.initialize(false).unwrap();
    source.publish_frame(0, &PixelBuffer::I16(vec![-5, 10, 20, 30])).unwrap();

    let (_, _, total) = processed(camin.read_frame(FrameRequest::default()).unwrap());
    let imwfs0 = f32_data(&registry.open(&config.imwfs0_name()).unwrap());
    assert_eq!(imwfs0, vec![-6.0, 9.0, 18.0, 28.0]);
    assert_eq!(total, 12.0);
}

#[test]
fn test_pooled_matches_inline() {
    let registry = StreamRegistry::new();
    let shape = ImageShape::new_2d(13, 7);
    let frame = PixelBuffer::U16((0..91).map(|i| (i * 37 % 1000) as u16).collect());
    let dark = PixelBuffer::F32((0..91).map(|i| (i % 5) as f32 * 0.5).collect());

    let mut outputs = Vec::new();
    for (loop_index, threads) in [(0u32, 4usize), (3, 4)] {
        let config = CameraInputConfig {
            dark_subtract_threads: threads,
            ..CameraInputConfig::for_loop(loop_index)
        };
        let source = registry.create(&config.source_name(), DataType::U16, shape).unwrap();
        registry.create_with_data(&config.dark_name(), shape, dark.clone()).unwrap();

        let mut camin = CameraInput::new(config.clone(), registry.clone());
        camin.initialize(false).unwrap();
        source.publish_frame(0, &frame).unwrap();
        camin.read_frame(FrameRequest::default()).unwrap();

        // Loop 0 always subtracts inline.
        assert_eq!(camin.dark_workers(), if loop_index == 0 { 0 } else { threads });
        outputs.push(f32_data(&registry.open(&config.imwfs0_name()).unwrap()));
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn test_ring_slot_from_cnt1() {
    let (registry, source, config) = setup(1, DataType::F32, ImageShape::new_ring(2, 1, 3));
    let mut camin = CameraInput::new(config.clone(), registry.clone());
    camin.initialize(false).unwrap();

    source.publish_frame(1, &PixelBuffer::F32(vec![3.0, 4.0])).unwrap();
    let (_, slot, total) = processed(camin.read_frame(FrameRequest::default()).unwrap());
    assert_eq!(slot, 1);
    assert_eq!(total, 7.0);

    // Unstamped slot: the last one is read.
    source.publish_frame(2, &PixelBuffer::F32(vec![5.0, 6.0])).unwrap();
    source.set_cnt1(-1);
    let (_, slot, total) = processed(camin.read_frame(FrameRequest::default()).unwrap());
    assert_eq!(slot, 2);
    assert_eq!(total, 11.0);
}

#[test]
fn test_slot_out_of_range_is_fatal() {
    let (registry, source, config) = setup(1, DataType::U16, ImageShape::new_ring(2, 2, 2));
    let mut camin = CameraInput::new(config, registry);
    camin.initialize(false).unwrap();
    source.publish_frame(0, &PixelBuffer::U16(vec![1; 4])).unwrap();
    source.set_cnt1(7);

    let err = camin.read_frame(FrameRequest::default()).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        CaminError::Stream(StreamError::SliceOutOfRange { slot: 7, depth: 2, .. })
    ));
}

#[test]
fn test_missing_source_is_fatal() {
    let registry = StreamRegistry::new();
    let mut camin = CameraInput::new(CameraInputConfig::for_loop(5), registry);
    let err = camin.read_frame(FrameRequest::default()).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, CaminError::Stream(StreamError::NotFound(ref name)) if name == "aol5_wfsim"));
    assert!(!camin.is_initialized());
}

#[test]
fn test_dark_shape_mismatch_is_fatal() {
    let (registry, _source, config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    registry
        .create(&config.dark_name(), DataType::F32, ImageShape::new_2d(3, 3))
        .unwrap();
    let mut camin = CameraInput::new(config, registry);
    let err = camin.initialize(false).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, CaminError::ShapeMismatch { actual_x: 3, actual_y: 3, .. }));
}

#[test]
fn test_integer_dark_rejected() {
    let (registry, _source, config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    registry
        .create(&config.dark_name(), DataType::U16, ImageShape::new_2d(4, 4))
        .unwrap();
    let mut camin = CameraInput::new(config, registry);
    assert!(matches!(
        camin.initialize(false),
        Err(CaminError::TypeMismatch { expected: DataType::F32, actual: DataType::U16, .. })
    ));
}

#[test]
fn test_bounded_wait_reuses_resident_frame() {
    let (registry, source, mut config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    config.regulated_timing = true;
    config.wait_estimate_samples = 2;
    let mut camin = CameraInput::new(config.clone(), registry.clone());
    camin.initialize(false).unwrap();

    for _ in 0..2 {
        source.publish_frame(0, &ramp_u16()).unwrap();
        let (timed_out, _, _) = processed(camin.read_frame(FrameRequest::default()).unwrap());
        assert!(!timed_out);
    }
    assert!(camin.wait_estimate().is_bootstrapped());

    let imwfs0 = registry.open(&config.imwfs0_name()).unwrap();
    let before = imwfs0.cnt0();
    let (timed_out, _, total) = processed(camin.read_frame(FrameRequest::default()).unwrap());
    assert!(timed_out);
    assert_eq!(total, 136.0);
    assert_eq!(imwfs0.cnt0(), before + 1);
}

#[test]
fn test_async_total_runs_in_background() {
    let (registry, source, mut config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    config.total_async = true;
    let mut camin = CameraInput::new(config.clone(), registry.clone());
    camin.initialize(false).unwrap();
    let imwfs0tot = registry.open(&config.imwfs0tot_name()).unwrap();

    // First total is always computed inline.
    source.publish_frame(0, &ramp_u16()).unwrap();
    let (_, _, total) = processed(camin.read_frame(FrameRequest::default()).unwrap());
    assert_eq!(total, 136.0);
    assert!(camin.totalizer().is_none());
    assert_eq!(imwfs0tot.cnt0(), 1);

    let doubled = PixelBuffer::U16((1..=16).map(|v| v * 2).collect());
    source.publish_frame(0, &doubled).unwrap();
    camin.read_frame(FrameRequest::default()).unwrap();

    let totalizer = camin.totalizer().unwrap();
    assert_eq!(totalizer.trigger_count(), 1);
    assert!(wait_for_computed(totalizer, 1, Duration::from_secs(2)));
    assert_eq!(camin.total_flux(), 272.0);
    assert_eq!(f32_data(&imwfs0tot), vec![272.0]);
    assert_eq!(imwfs0tot.cnt0(), 2);
}

#[test]
fn test_response_matrix_skips_telemetry() {
    let (registry, source, config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    let mut camin = CameraInput::new(config.clone(), registry.clone());
    camin.initialize(true).unwrap();
    // The calibration semaphore is taken.
    assert_ne!(source.claim_semaphore(9), Some(9));

    source.publish_frame(0, &ramp_u16()).unwrap();
    let request = FrameRequest {
        response_matrix: true,
        normalize: true,
        ..Default::default()
    };
    processed(camin.read_frame(request).unwrap());

    let looptiming = registry.open(&config.looptiming_name()).unwrap();
    assert_eq!(looptiming.cnt0(), 0);
    assert!(f32_data(&looptiming).iter().all(|&v| v == 0.0));
    assert_eq!(registry.open(&config.imwfs1_name()).unwrap().cnt0(), 1);
}

#[test]
fn test_timing_and_status_recorded() {
    let (registry, source, config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    let mut camin = CameraInput::new(config.clone(), registry.clone());
    let status = camin.status();
    camin.initialize(false).unwrap();
    let looptiming = registry.open(&config.looptiming_name()).unwrap();
    looptiming.set_cnt1(41);

    source.publish_frame(0, &ramp_u16()).unwrap();
    camin.read_frame(FrameRequest::default()).unwrap();

    assert_eq!(status.stage(), LoopStage::Normalize as u32);
    assert_eq!(status.progress(), 2);
    assert_eq!(looptiming.cnt0(), 1);
    let timing = f32_data(&looptiming);
    assert!(timing[TimingSlot::Done as usize] >= timing[TimingSlot::ComputeTotal as usize]);
    assert!(timing[TimingSlot::Normalize as usize] >= 0.0);
    assert_eq!(registry.open(&config.imwfs0_name()).unwrap().cnt1(), 41);
}

#[test]
fn test_stop_interrupts_blocking_wait() {
    let (registry, _source, config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    let mut camin = CameraInput::new(config, registry);
    camin.initialize(false).unwrap();

    let stop = camin.stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        stop.store(true, Ordering::Release);
    });
    let outcome = camin.read_frame(FrameRequest::default()).unwrap();
    stopper.join().unwrap();
    assert_eq!(outcome, FrameOutcome::Stopped);
}

#[test]
fn test_shutdown_releases_semaphore() {
    let (registry, source, config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    let mut camin = CameraInput::new(config, registry);
    camin.initialize(false).unwrap();
    camin.shutdown();
    assert!(!camin.is_initialized());
    assert_eq!(source.claim_semaphore(8), Some(8));
}

#[test]
#[traced_test]
fn test_missed_frames_are_reported() {
    let (registry, source, config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    let mut camin = CameraInput::new(config, registry);
    camin.initialize(false).unwrap();

    source.publish_frame(0, &ramp_u16()).unwrap();
    source.publish_frame(0, &ramp_u16()).unwrap();
    camin.read_frame(FrameRequest::default()).unwrap();
    assert!(logs_contain("Missed frame"));
}

#[test]
#[traced_test]
fn test_init_sem_discards_pending_posts() {
    let (registry, source, mut config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    config.regulated_timing = true;
    config.wait_estimate_samples = 1;
    let mut camin = CameraInput::new(config, registry);
    camin.initialize(false).unwrap();

    source.publish_frame(0, &ramp_u16()).unwrap();
    processed(camin.read_frame(FrameRequest::default()).unwrap());

    // Posted frame is drained before waiting, so the bounded wait expires.
    source.publish_frame(0, &ramp_u16()).unwrap();
    let request = FrameRequest {
        init_sem: true,
        ..Default::default()
    };
    let (timed_out, _, _) = processed(camin.read_frame(request).unwrap());
    assert!(timed_out);
    assert!(logs_contain("Reinitialized source semaphore"));
    assert!(logs_contain("Frame wait timed out"));
}

#[test]
fn test_simulated_camera_dark_removes_background() {
    let registry = StreamRegistry::new();
    let config = CameraInputConfig {
        dark_subtract_threads: 3,
        ..CameraInputConfig::for_loop(2)
    };
    let sim_config = SimulationConfig {
        size_x: 8,
        size_y: 8,
        depth: 3,
        datatype: SampleKind::F32,
        amplitude: 0.0,
        ..Default::default()
    };
    let camera = SimulatedCamera::new(&registry, &config.source_name(), sim_config).unwrap();
    registry
        .create_with_data(
            &config.dark_name(),
            ImageShape::new_2d(8, 8),
            PixelBuffer::F32(camera.dark_frame()),
        )
        .unwrap();

    let mut camin = CameraInput::new(config.clone(), registry.clone());
    camin.initialize(false).unwrap();
    for n in 1..=4u64 {
        camera.publish_next().unwrap();
        match camin.read_frame(FrameRequest::default()).unwrap() {
            FrameOutcome::Processed {
                slot,
                source_cnt0,
                pixel_stream_slice,
                total_flux,
                ..
            } => {
                assert_eq!(u64::from(slot), n % 3);
                assert_eq!(source_cnt0, n);
                assert_eq!(pixel_stream_slice, (n % 3) as i64);
                assert_eq!(total_flux, 0.0);
            }
            FrameOutcome::Stopped => panic!("expected a processed frame"),
        }
    }
    assert_eq!(camin.dark_workers(), 3);
}

#[test]
fn test_drop_leaves_shared_stop_flag_alone() {
    let registry = StreamRegistry::new();
    let stop = Arc::new(AtomicBool::new(false));
    let mut sources = Vec::new();
    let mut loops = Vec::new();
    for loop_index in [1u32, 2] {
        let config = CameraInputConfig::for_loop(loop_index);
        sources.push(
            registry
                .create(&config.source_name(), DataType::U16, ImageShape::new_2d(4, 4))
                .unwrap(),
        );
        let mut camin = CameraInput::new(config, registry.clone()).with_stop_flag(Arc::clone(&stop));
        camin.initialize(false).unwrap();
        loops.push(camin);
    }

    let mut second = loops.pop().unwrap();
    drop(loops);
    assert!(!stop.load(Ordering::Acquire));

    // The surviving loop still blocks until its frame arrives.
    let source = Arc::clone(&sources[1]);
    let publisher = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        source.publish_frame(0, &ramp_u16()).unwrap();
    });
    let (timed_out, _, total) = processed(second.read_frame(FrameRequest::default()).unwrap());
    publisher.join().unwrap();
    assert!(!timed_out);
    assert_eq!(total, 136.0);
}

#[test]
fn test_async_trigger_backlog_is_capped() {
    let (registry, source, mut config) = setup(1, DataType::U16, ImageShape::new_2d(4, 4));
    config.total_async = true;
    config.total_trigger_cap = 1;
    let mut camin = CameraInput::new(config, registry);
    camin.initialize(false).unwrap();

    for n in 1..=20u64 {
        source.publish_frame(0, &ramp_u16()).unwrap();
        processed(camin.read_frame(FrameRequest::default()).unwrap());
        if let Some(totalizer) = camin.totalizer() {
            assert_eq!(totalizer.trigger_cap(), 1);
            assert!(totalizer.pending() <= 1, "pending {} after frame {n}", totalizer.pending());
            assert_eq!(totalizer.trigger_count(), n - 1);
        }
    }
    assert!(camin.totalizer().is_some());
}
