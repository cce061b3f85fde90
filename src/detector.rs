//! Per-camera detector.
//!
//! Keeps a short timeline of recent frames for one camera, tracks whether a
//! plate is currently in view, and decides when the evidence accumulated over
//! the timeline is strong enough to report a plate.
//!
//! The consensus is a confidence-weighted plurality vote: every frame with a
//! localized plate and a valid recognized string votes for that string with
//! weight `plate confidence x mean character confidence`. A string wins when
//! its share of the total weight exceeds `conf_threshold` percent and it was
//! seen in at least `count_threshold` frames.
//!
//! Detector state is not synchronized; the scheduler keeps each detector
//! behind its own mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::detect::DetectionResult;
use crate::events::PlateEvent;
use crate::frame::{Frame, FrameId};
use crate::plate::{CharacterCandidate, PlateCandidate};

pub const DEFAULT_STARVING_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_CONF_THRESHOLD: f32 = 35.0;
pub const DEFAULT_COUNT_THRESHOLD: usize = 5;
pub const DEFAULT_JUMP_THRESHOLD: f32 = 0.40;
pub const DEFAULT_TIMELINE_LEN: usize = 20;
pub const DEFAULT_AWAITING_LEN: usize = 20;

/// Normalized region of the frame in which plates are accepted.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecognitionBorders {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

impl RecognitionBorders {
    /// Whether a normalized point lies inside the region.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        (self.x_min..=self.x_max).contains(&x) && (self.y_min..=self.y_max).contains(&y)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
    pub starving_delay: Duration,
    /// Minimum winning share of the vote, in percent.
    pub conf_threshold: f32,
    pub count_threshold: usize,
    /// Maximum plate movement between localizations, as a fraction of the
    /// frame diagonal.
    pub jump_threshold: f32,
    pub timeline_len: usize,
    pub awaiting_len: usize,
    /// Region-of-interest filter. `None` accepts plates anywhere.
    pub recognition_borders: Option<RecognitionBorders>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            starving_delay: DEFAULT_STARVING_DELAY,
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            count_threshold: DEFAULT_COUNT_THRESHOLD,
            jump_threshold: DEFAULT_JUMP_THRESHOLD,
            timeline_len: DEFAULT_TIMELINE_LEN,
            awaiting_len: DEFAULT_AWAITING_LEN,
            recognition_borders: None,
        }
    }
}

/// Outcome of the vote over the current timeline.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsensusResult {
    pub best: String,
    /// Winner's share of the total weight, in percent.
    pub relative_confidence: f32,
    /// Number of frames that voted for the winner.
    pub count: usize,
}

pub struct Detector {
    camera_id: String,
    settings: DetectorSettings,
    frames: HashMap<FrameId, Frame>,
    timeline: VecDeque<FrameId>,
    awaiting: VecDeque<FrameId>,
    last_detection_at: Instant,
    last_position: Option<(f32, f32)>,
    occupied: bool,
}

impl Detector {
    pub fn new(camera_id: impl Into<String>, settings: DetectorSettings) -> Self {
        Self {
            camera_id: camera_id.into(),
            timeline: VecDeque::with_capacity(settings.timeline_len + 1),
            awaiting: VecDeque::with_capacity(settings.awaiting_len),
            settings,
            frames: HashMap::new(),
            last_detection_at: Instant::now(),
            last_position: None,
            occupied: false,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// A plate was localized in the most recently processed frame.
    pub fn is_occupied(&self) -> bool {
        self.occupied
    }

    pub fn is_starving(&self) -> bool {
        self.is_starving_at(Instant::now())
    }

    /// No successful localization for longer than the starving delay.
    pub fn is_starving_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_detection_at) > self.settings.starving_delay
    }

    pub fn is_high_priority(&self) -> bool {
        self.is_high_priority_at(Instant::now())
    }

    pub fn is_high_priority_at(&self, now: Instant) -> bool {
        self.occupied || self.is_starving_at(now)
    }

    pub fn is_tracked(&self, id: FrameId) -> bool {
        self.frames.contains_key(&id)
    }

    pub fn tracked_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn timeline(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.timeline.iter().copied()
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(&id)
    }

    /// True when a tracked frame is waiting for character recognition.
    pub fn has_awaiting(&self) -> bool {
        self.awaiting.iter().any(|id| self.frames.contains_key(id))
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Register a frame about to be sent to the plate stage.
    pub fn request_frame(&mut self, id: FrameId, image: Arc<RgbImage>) {
        self.request_frame_at(id, image, Instant::now());
    }

    pub fn request_frame_at(&mut self, id: FrameId, image: Arc<RgbImage>, captured_at: Instant) {
        self.frames.insert(id, Frame::new(id, image, captured_at));
        self.timeline.push_back(id);
        while self.timeline.len() > self.settings.timeline_len {
            if let Some(evicted) = self.timeline.pop_front() {
                self.frames.remove(&evicted);
            }
        }
    }

    /// Record the plate stage's answer for frame `id`.
    pub fn on_plate_detection(&mut self, id: FrameId, result: &DetectionResult) {
        let Some(frame) = self.frames.get_mut(&id) else {
            log::debug!("{}: plate result for evicted frame {} ignored", self.camera_id, id);
            return;
        };

        let Some(best) = result.best() else {
            frame.mark_no_plate();
            self.occupied = false;
            return;
        };

        if let Some(borders) = &self.settings.recognition_borders {
            let (cx, cy) = best.bbox.center();
            let (w, h) = frame.image.dimensions();
            if !borders.contains(cx / w.max(1) as f32, cy / h.max(1) as f32) {
                log::debug!(
                    "{}: frame {} plate at ({:.0}, {:.0}) outside recognition borders",
                    self.camera_id,
                    id,
                    cx,
                    cy
                );
                frame.mark_rejected();
                self.occupied = false;
                return;
            }
        }

        let Some(plate) = PlateCandidate::from_detection(&frame.image, best) else {
            log::debug!("{}: frame {} plate geometry degenerate", self.camera_id, id);
            frame.mark_no_plate();
            self.occupied = false;
            return;
        };

        let position = (plate.bbox.x1, plate.bbox.y1);
        let (w, h) = frame.image.dimensions();
        let diagonal = (w as f32).hypot(h as f32).max(1.0);
        let captured_at = frame.captured_at;
        frame.set_plate(plate);

        if let Some(last) = self.last_position {
            let movement = (position.0 - last.0).hypot(position.1 - last.1) / diagonal;
            if movement > self.settings.jump_threshold {
                log::warn!(
                    "{}: plate moved {:.2} of the frame diagonal, clearing timeline",
                    self.camera_id,
                    movement
                );
                self.restart_timeline(id);
            }
        }

        if self.awaiting.len() >= self.settings.awaiting_len {
            self.awaiting.pop_front();
        }
        self.awaiting.push_back(id);
        self.last_detection_at = captured_at;
        self.last_position = Some(position);
        self.occupied = true;
    }

    /// Drop every frame except `keep`.
    fn restart_timeline(&mut self, keep: FrameId) {
        self.timeline.clear();
        self.timeline.push_back(keep);
        self.frames.retain(|id, _| *id == keep);
        let frames = &self.frames;
        self.awaiting.retain(|id| frames.contains_key(id));
    }

    /// Oldest frame waiting for character recognition, with its crop.
    pub fn next_awaiting(&mut self) -> Option<(FrameId, Arc<RgbImage>)> {
        while let Some(id) = self.awaiting.pop_front() {
            if let Some(crop) = self.frames.get(&id).and_then(Frame::crop) {
                return Some((id, crop));
            }
        }
        None
    }

    /// Record the character stage's answer for frame `id` and re-run the
    /// consensus.
    pub fn on_character_detection(&mut self, id: FrameId, result: &DetectionResult) -> Option<PlateEvent> {
        let Some(frame) = self.frames.get_mut(&id) else {
            log::debug!("{}: character result for evicted frame {} ignored", self.camera_id, id);
            return None;
        };
        if !result.is_empty() {
            let (cw, ch) = match frame.plate() {
                Some(plate) => plate.crop.dimensions(),
                None => return None,
            };
            let recognition = CharacterCandidate::new(&result.detections, cw, ch);
            if let Some(text) = recognition.string() {
                log::debug!("{}: frame {} read {}", self.camera_id, id, text);
            }
            frame.set_recognition(recognition);
        }
        self.consider_event()
    }

    /// Vote over the current timeline. `None` when no frame has a valid read.
    pub fn consensus(&self) -> Option<ConsensusResult> {
        // (string, weight, count) in first-seen order, so ties go to the
        // earliest string.
        let mut tally: Vec<(&str, f32, usize)> = Vec::new();
        for id in &self.timeline {
            let Some((text, weight)) = self.frames.get(id).and_then(Frame::vote) else {
                continue;
            };
            match tally.iter_mut().find(|(s, _, _)| *s == text) {
                Some(entry) => {
                    entry.1 += weight;
                    entry.2 += 1;
                }
                None => tally.push((text, weight, 1)),
            }
        }

        let total: f32 = tally.iter().map(|(_, w, _)| w).sum();
        if total <= 0.0 {
            return None;
        }
        let mut best = tally.first()?;
        for entry in &tally[1..] {
            if entry.1 > best.1 {
                best = entry;
            }
        }
        Some(ConsensusResult {
            best: best.0.to_string(),
            relative_confidence: best.1 / total * 100.0,
            count: best.2,
        })
    }

    /// Event for the current consensus winner, if it clears both thresholds.
    pub fn consider_event(&self) -> Option<PlateEvent> {
        let consensus = self.consensus()?;
        if consensus.relative_confidence <= self.settings.conf_threshold
            || consensus.count < self.settings.count_threshold
        {
            return None;
        }
        let latest = self.timeline.back().and_then(|id| self.frames.get(id))?;
        Some(PlateEvent {
            camera_id: self.camera_id.clone(),
            plate: consensus.best,
            relative_confidence: consensus.relative_confidence,
            count: consensus.count,
            image: latest.image.clone(),
            detected_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};
    use crate::plate::CHAR_NAMES;

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

    fn chars(text: &str) -> DetectionResult {
        let detections = text
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let x1 = 12.0 + i as f32 * 24.0;
                Detection {
                    bbox: BoundingBox::new(x1, 10.0, x1 + 20.0, 40.0),
                    class_id: CHAR_NAMES.find(c).unwrap(),
                    confidence: 0.9,
                    polygon: None,
                }
            })
            .collect();
        DetectionResult { detections }
    }

    fn image() -> Arc<RgbImage> {
        Arc::new(RgbImage::new(800, 600))
    }

    #[test]
    fn timeline_evicts_oldest_frames() {
        let mut det = Detector::new("cam", DetectorSettings::default());
        for id in 0..25 {
            det.request_frame(id, image());
        }
        assert_eq!(det.tracked_frames(), DEFAULT_TIMELINE_LEN);
        assert!(!det.is_tracked(4));
        assert!(det.is_tracked(5));

        det.on_plate_detection(0, &plate_at(100.0, 100.0));
        assert!(!det.is_occupied());
        assert!(!det.has_awaiting());
    }

    #[test]
    fn localization_queues_frame_and_sets_occupied() {
        let mut det = Detector::new("cam", DetectorSettings::default());
        det.request_frame(1, image());
        det.on_plate_detection(1, &plate_at(100.0, 100.0));
        assert!(det.is_occupied());
        let (id, crop) = det.next_awaiting().unwrap();
        assert_eq!(id, 1);
        assert_eq!(crop.dimensions(), (224, 48));
        assert!(det.next_awaiting().is_none());

        det.request_frame(2, image());
        det.on_plate_detection(2, &DetectionResult::empty());
        assert!(!det.is_occupied());
        assert!(det.frame(2).unwrap().is_no_plate());
    }

    #[test]
    fn starving_after_delay_without_plates() {
        let det = Detector::new("cam", DetectorSettings::default());
        let now = Instant::now();
        assert!(det.is_starving_at(now + Duration::from_millis(600)));
        assert!(det.is_high_priority_at(now + Duration::from_millis(600)));
    }

    #[test]
    fn character_result_triggers_event_after_enough_reads() {
        let mut det = Detector::new("cam", DetectorSettings::default());
        let mut events = Vec::new();
        for id in 0..5 {
            det.request_frame(id, image());
            det.on_plate_detection(id, &plate_at(100.0, 100.0));
            let (queued, _) = det.next_awaiting().unwrap();
            events.extend(det.on_character_detection(queued, &chars("a123bc77")));
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].plate, "A123BC77");
        assert_eq!(events[0].count, 5);
        assert_eq!(events[0].camera_id, "cam");
    }

    #[test]
    fn jump_clears_previous_evidence() {
        let mut det = Detector::new("cam", DetectorSettings::default());
        for id in 0..4 {
            det.request_frame(id, image());
            det.on_plate_detection(id, &plate_at(50.0, 50.0));
            assert!(det.on_character_detection(id, &chars("a123bc77")).is_none());
        }
        det.request_frame(10, image());
        det.on_plate_detection(10, &plate_at(550.0, 500.0));
        assert_eq!(det.timeline().collect::<Vec<_>>(), vec![10]);
        assert!(!det.is_tracked(0));
        assert!(det.on_character_detection(10, &chars("a123bc77")).is_none());
        assert_eq!(det.consensus().unwrap().count, 1);
    }

    #[test]
    fn plates_outside_borders_are_rejected() {
        let settings = DetectorSettings {
            recognition_borders: Some(RecognitionBorders {
                x_min: 0.5,
                x_max: 1.0,
                y_min: 0.0,
                y_max: 1.0,
            }),
            ..DetectorSettings::default()
        };
        let mut det = Detector::new("cam", settings);
        det.request_frame(1, image());
        det.on_plate_detection(1, &plate_at(10.0, 100.0));
        assert!(det.frame(1).unwrap().is_rejected());
        assert!(!det.is_occupied());

        det.request_frame(2, image());
        det.on_plate_detection(2, &plate_at(500.0, 100.0));
        assert!(det.is_occupied());
    }
}
