use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;

use gate_lpr::detector::{Detector, DetectorSettings};
use gate_lpr::events::{EventDispatcher, EventSettings, MemorySink, PlateEvent};
use gate_lpr::ingest::{RtspConfig, Stream};
use gate_lpr::plate::{taxonomy, CHAR_NAMES};
use gate_lpr::{BoundingBox, Detection, DetectionResult};

const FRAME_W: u32 = 800;
const FRAME_H: u32 = 600;

fn image() -> Arc<RgbImage> {
    Arc::new(RgbImage::new(FRAME_W, FRAME_H))
}

fn plate_at(x: f32, y: f32) -> DetectionResult {
    DetectionResult {
        detections: vec![Detection {
            bbox: BoundingBox::new(x, y, x + 200.0, y + 50.0),
            class_id: 0,
            confidence: 0.9,
            polygon: None,
        }],
    }
}

/// Eight equal-height glyphs laid out along a 224x48 crop.
fn glyphs(text: &str, confidence: f32) -> DetectionResult {
    let detections = text
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let x1 = 12.0 + i as f32 * 24.0;
            Detection {
                bbox: BoundingBox::new(x1, 10.0, x1 + 20.0, 40.0),
                class_id: CHAR_NAMES.find(c).expect("known glyph"),
                confidence,
                polygon: None,
            }
        })
        .collect();
    DetectionResult { detections }
}

/// Run one frame through both stages at a fixed plate position.
fn observe(
    det: &mut Detector,
    id: u64,
    at: (f32, f32),
    text: &str,
    confidence: f32,
) -> Option<PlateEvent> {
    det.request_frame(id, image());
    det.on_plate_detection(id, &plate_at(at.0, at.1));
    let (queued, _crop) = det.next_awaiting().expect("frame awaiting recognition");
    assert_eq!(queued, id);
    det.on_character_detection(id, &glyphs(text, confidence))
}

#[test]
fn majority_read_fires_and_throttle_forwards_it_once() {
    let mut det = Detector::new("entry", DetectorSettings::default());
    let noise = ["b100ce12", "b200ce12", "b300ce12", "b400ce12"];
    let mut events = Vec::new();
    let mut noise_iter = noise.iter();
    for id in 0..10 {
        let event = if id % 5 == 1 || id % 5 == 3 {
            let text = noise_iter.next().expect("four noise frames");
            observe(&mut det, id, (100.0, 100.0), text, 0.3)
        } else {
            observe(&mut det, id, (100.0, 100.0), "a123bc77", 0.9)
        };
        events.extend(event);
    }

    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.plate == "A123BC77"));
    let consensus = det.consensus().expect("votes");
    assert_eq!(consensus.best, "A123BC77");
    assert_eq!(consensus.count, 6);
    assert!(consensus.relative_confidence > 80.0);

    let sink = MemorySink::new();
    let mut dispatcher = EventDispatcher::new(
        EventSettings::default(),
        Box::new(sink.clone()),
        Default::default(),
    );
    let now = Instant::now();
    for event in &events {
        dispatcher.dispatch(event, now);
    }
    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].license_plate, "A123BC77");
    assert!(sent[0].is_new_event);
}

#[test]
fn too_few_reads_never_fire() {
    let mut det = Detector::new("entry", DetectorSettings::default());
    let mut noise = (1..=7).map(|n| format!("b{}00ce12", n));
    for id in 0..10 {
        let event = if id % 3 == 0 && id < 9 {
            observe(&mut det, id, (100.0, 100.0), "a123bc77", 0.95)
        } else {
            let text = noise.next().expect("seven noise frames");
            observe(&mut det, id, (100.0, 100.0), &text, 0.3)
        };
        assert!(event.is_none(), "frame {} fired", id);
    }
    let consensus = det.consensus().expect("votes");
    assert_eq!(consensus.best, "A123BC77");
    assert_eq!(consensus.count, 3);
}

#[test]
fn split_vote_never_fires() {
    let mut det = Detector::new("entry", DetectorSettings::default());
    let reads = ["a123bc77", "b456ce12", "c789ek34", "e321hm56"];
    for id in 0..20u64 {
        let text = reads[id as usize % reads.len()];
        assert!(observe(&mut det, id, (100.0, 100.0), text, 0.9).is_none());
    }
    let consensus = det.consensus().expect("votes");
    assert_eq!(consensus.count, 5);
    assert!((consensus.relative_confidence - 25.0).abs() < 0.01);
}

#[test]
fn even_two_way_split_goes_to_the_first_read() {
    let mut det = Detector::new("entry", DetectorSettings::default());
    for id in 0..10u64 {
        let text = if id % 2 == 0 { "a123bc77" } else { "b456ce12" };
        observe(&mut det, id, (100.0, 100.0), text, 0.9);
    }
    let consensus = det.consensus().expect("votes");
    assert_eq!(consensus.best, "A123BC77");
    assert_eq!(consensus.count, 5);
    assert!((consensus.relative_confidence - 50.0).abs() < 0.01);
    assert!(det.consider_event().is_some());
}

#[test]
fn evidence_before_a_jump_never_counts() {
    let mut det = Detector::new("entry", DetectorSettings::default());
    for id in 0..4 {
        assert!(observe(&mut det, id, (50.0, 50.0), "a123bc77", 0.9).is_none());
    }
    // Far corner of the frame: more than 40% of the diagonal away.
    for id in 4..8 {
        assert!(observe(&mut det, id, (550.0, 500.0), "a123bc77", 0.9).is_none());
        assert!(!det.is_tracked(0));
    }
    assert_eq!(det.consensus().expect("votes").count, 4);

    let event = observe(&mut det, 8, (560.0, 505.0), "a123bc77", 0.9).expect("fifth read");
    assert_eq!(event.count, 5);
}

#[test]
fn evicted_frames_are_ignored_and_state_stays_bounded() {
    let mut det = Detector::new("entry", DetectorSettings::default());
    for id in 0..1_000u64 {
        det.request_frame(id, image());
        if id % 2 == 0 {
            det.on_plate_detection(id, &plate_at(100.0, 100.0));
        }
        assert!(det.tracked_frames() <= 20);
    }
    assert!(!det.is_tracked(979));
    assert!(det.is_tracked(980));

    // Late answers for long-gone frames change nothing.
    let before: Vec<u64> = det.timeline().collect();
    det.on_plate_detection(3, &plate_at(700.0, 500.0));
    assert!(det.on_character_detection(4, &glyphs("a123bc77", 0.9)).is_none());
    assert_eq!(det.timeline().collect::<Vec<_>>(), before);
    assert!(det.consensus().is_none());

    let mut drained = 0;
    while det.next_awaiting().is_some() {
        drained += 1;
    }
    assert!(drained <= 20);
}

#[test]
fn disconnect_mid_read_starves_without_firing() -> anyhow::Result<()> {
    let config = RtspConfig::from_url("stub://entry?fps=50&width=800&height=600&frames=3")?;
    let stream = Stream::open("entry", config, Duration::from_secs(30))?;
    let mut det = Detector::new("entry", DetectorSettings::default());

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut id = 0;
    while stream.stats().reconnects == 0 && Instant::now() < deadline {
        if let Some(frame) = stream.pop_frame() {
            det.request_frame(id, frame);
            det.on_plate_detection(id, &plate_at(4.0, 4.0));
            let (queued, _) = det.next_awaiting().expect("awaiting");
            assert!(det.on_character_detection(queued, &glyphs("a123bc77", 0.9)).is_none());
            id += 1;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(stream.stats().reconnects, 1);
    assert!(id <= 3);

    // Reconnect is pending: nothing arrives and nothing fires.
    for _ in 0..20 {
        assert!(stream.pop_frame().is_none());
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(det.consider_event().is_none());
    assert!(det.is_starving_at(Instant::now() + Duration::from_secs(1)));
    assert!(det.is_high_priority_at(Instant::now() + Duration::from_secs(1)));

    stream.close();
    Ok(())
}

#[test]
fn classification_is_idempotent() {
    for text in [
        "a123bc77", "A123BC777", "ab12377", "1234ab77", "123d45677", "a123477", "a1234777",
    ] {
        let parsed = taxonomy::parse(text).expect("valid plate");
        let again = taxonomy::parse(&parsed.text).expect("still valid");
        assert_eq!(parsed.kind, again.kind, "{}", text);
        assert_eq!(parsed.text, again.text);
        assert_eq!(taxonomy::classify(&parsed.text), Some(parsed.kind));
    }
    for text in ["a123bc7", "d123bc77", "", "a123bc77a"] {
        assert!(!taxonomy::is_valid(text), "{}", text);
    }
}
