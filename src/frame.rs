//! Frames tracked by a camera's detector.
//!
//! A `Frame` is one captured image plus whatever the two inference stages have
//! reported for it so far. Frames are owned by their `Detector` and dropped
//! when they fall out of its timeline.

use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;

use crate::plate::{CharacterCandidate, PlateCandidate};

/// Frame identifier, unique for the lifetime of the process.
pub type FrameId = u64;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Frame {
    pub id: FrameId,
    pub image: Arc<RgbImage>,
    pub captured_at: Instant,

    /// Best localization, with its rectified crop.
    plate: Option<PlateCandidate>,
    /// Character-stage result for `plate`'s crop.
    recognition: Option<CharacterCandidate>,
    /// The plate stage answered and found nothing.
    no_plate: bool,
    /// A plate was found but filtered out (region-of-interest hook).
    rejected: bool,
}

impl Frame {
    pub fn new(id: FrameId, image: Arc<RgbImage>, captured_at: Instant) -> Self {
        Self {
            id,
            image,
            captured_at,
            plate: None,
            recognition: None,
            no_plate: false,
            rejected: false,
        }
    }

    pub fn plate(&self) -> Option<&PlateCandidate> {
        self.plate.as_ref()
    }

    pub fn recognition(&self) -> Option<&CharacterCandidate> {
        self.recognition.as_ref()
    }

    pub fn is_no_plate(&self) -> bool {
        self.no_plate
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    /// Rectified plate crop, once the plate stage has localized a plate.
    pub fn crop(&self) -> Option<Arc<RgbImage>> {
        self.plate.as_ref().map(|p| p.crop.clone())
    }

    pub(crate) fn set_plate(&mut self, plate: PlateCandidate) {
        self.plate = Some(plate);
        self.no_plate = false;
    }

    pub(crate) fn mark_no_plate(&mut self) {
        self.no_plate = true;
    }

    pub(crate) fn mark_rejected(&mut self) {
        self.rejected = true;
    }

    pub(crate) fn set_recognition(&mut self, recognition: CharacterCandidate) {
        self.recognition = Some(recognition);
    }

    /// This frame's vote in the consensus: the recognized string and its
    /// weight (localization confidence times mean character confidence).
    pub fn vote(&self) -> Option<(&str, f32)> {
        let plate = self.plate.as_ref()?;
        let recognition = self.recognition.as_ref()?;
        let text = recognition.string()?;
        let mean = recognition.mean_confidence()?;
        Some((text, plate.confidence * mean))
    }
}
