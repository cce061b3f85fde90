//! End-to-end run over synthetic cameras and stub models.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::Result;

use gate_lpr::config::CameraConfig;
use gate_lpr::detect::postprocess::RawOutput;
use gate_lpr::events::{EventDispatcher, EventSettings, MemorySink};
use gate_lpr::plate::CHAR_NAMES;
use gate_lpr::scheduler::{CameraRegistry, FleetScheduler};
use gate_lpr::{BoundingBox, DetectorSettings, InferenceBackend, ModelDescriptor, StubBackend};

const PLATE_CLASSES: usize = 6;
const CHAR_CLASSES: usize = 23;

fn camera(id: &str, url: &str, gate: Option<&str>) -> CameraConfig {
    CameraConfig {
        camera_id: id.to_string(),
        url: Some(url.to_string()),
        host: None,
        port: 554,
        path: String::new(),
        username: String::new(),
        password: String::new(),
        gate_id: gate.map(str::to_string),
    }
}

fn descriptor(path: &str, size: (u32, u32), num_classes: usize) -> ModelDescriptor {
    ModelDescriptor {
        path: PathBuf::from(path),
        image_size: size,
        stride: 32,
        num_classes,
        slots: 2,
    }
}

/// Plate model that sees a plate only in 800-pixel-wide frames.
fn plate_backend() -> Result<Box<dyn InferenceBackend>> {
    Ok(Box::new(StubBackend::with_responder(|input| {
        let letterbox = &input.letterbox;
        if letterbox.source_width != 800 {
            return RawOutput::empty(PLATE_CLASSES);
        }
        let (x1, y1) = letterbox.map_point(300.0, 400.0);
        let (x2, y2) = letterbox.map_point(500.0, 450.0);
        RawOutput::from_boxes(PLATE_CLASSES, &[(BoundingBox::new(x1, y1, x2, y2), 0, 0.9)])
    })))
}

/// Character model that reads the same plate from every crop.
fn char_backend() -> Result<Box<dyn InferenceBackend>> {
    Ok(Box::new(StubBackend::with_responder(|input| {
        let letterbox = &input.letterbox;
        let boxes: Vec<_> = "a123bc77"
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let x = 12.0 + i as f32 * 24.0;
                let (x1, y1) = letterbox.map_point(x, 10.0);
                let (x2, y2) = letterbox.map_point(x + 20.0, 40.0);
                let class_id = CHAR_NAMES.find(c).unwrap_or(0);
                (BoundingBox::new(x1, y1, x2, y2), class_id, 0.9)
            })
            .collect();
        RawOutput::from_boxes(CHAR_CLASSES, &boxes)
    })))
}

#[test]
fn vehicle_pass_produces_one_notification() -> Result<()> {
    let registry = Arc::new(CameraRegistry::open(
        &[
            camera("entry", "stub://entry?fps=40&width=800&height=600", Some("north")),
            camera("exit", "stub://exit?fps=40&width=640&height=480", None),
        ],
        &DetectorSettings::default(),
        Duration::from_secs(1),
    )?);

    let sink = MemorySink::new();
    let dispatcher = EventDispatcher::new(
        EventSettings::default(),
        Box::new(sink.clone()),
        registry.gates(),
    );
    let (event_tx, event_rx) = mpsc::channel();
    let dispatch_handle = dispatcher.spawn(event_rx)?;

    let mut scheduler = FleetScheduler::with_backends(
        registry.clone(),
        (descriptor("stub://plate", (640, 640), PLATE_CLASSES), plate_backend),
        (descriptor("stub://char", (320, 320), CHAR_CLASSES), char_backend),
        event_tx,
        Duration::from_millis(1),
    )?;

    let deadline = Instant::now() + Duration::from_secs(20);
    while sink.sent().is_empty() && Instant::now() < deadline {
        if scheduler.step() == Default::default() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    // The car keeps dwelling in front of the camera.
    let dwell = Instant::now() + Duration::from_millis(300);
    while Instant::now() < dwell {
        scheduler.step();
        std::thread::sleep(Duration::from_millis(1));
    }
    scheduler.drain();

    let stats = scheduler.stats();
    assert!(stats.events >= 1);
    assert!(stats.plate_submitted >= 5);
    assert!(stats.char_submitted >= 5);
    {
        let entry = registry.find("entry").expect("entry camera");
        assert!(entry.detector().is_occupied());
        let exit = registry.find("exit").expect("exit camera");
        assert!(!exit.detector().is_occupied());
        assert!(exit.detector().tracked_frames() <= 20);
    }

    drop(scheduler);
    let dispatch_stats = dispatch_handle.join().expect("dispatcher thread");
    registry.close_all();

    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(dispatch_stats.forwarded, 1);
    assert_eq!(dispatch_stats.received, stats.events);
    assert_eq!(sent[0].camera_id, "entry");
    assert_eq!(sent[0].license_plate, "A123BC77");
    assert_eq!(sent[0].gate_id.as_deref(), Some("north"));
    assert!(sent[0].is_new_event);
    assert!(sent[0]
        .image
        .as_deref()
        .is_some_and(|url| url.starts_with("data:image/jpeg;base64,")));
    Ok(())
}

#[test]
fn run_returns_when_shutdown_is_requested() -> Result<()> {
    let registry = Arc::new(CameraRegistry::open(
        &[camera("exit", "stub://exit?fps=40&width=320&height=240", None)],
        &DetectorSettings::default(),
        Duration::from_secs(1),
    )?);
    let (event_tx, event_rx) = mpsc::channel();
    let mut scheduler = FleetScheduler::with_backends(
        registry.clone(),
        (descriptor("stub://plate", (320, 320), PLATE_CLASSES), plate_backend),
        (descriptor("stub://char", (320, 320), CHAR_CLASSES), char_backend),
        event_tx,
        Duration::from_millis(1),
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let stopper = {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            shutdown.store(true, Ordering::SeqCst);
        })
    };
    scheduler.run(&shutdown);
    stopper.join().expect("stopper thread");

    assert!(scheduler.stats().plate_submitted > 0);
    assert_eq!(scheduler.stats().events, 0);
    drop(scheduler);
    assert!(event_rx.recv().is_err());
    registry.close_all();
    Ok(())
}
