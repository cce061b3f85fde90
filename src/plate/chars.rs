//! Character ordering and digit/letter disambiguation.
//!
//! The character model sees a rectified plate crop and returns one box per
//! glyph. This module puts the boxes in reading order (one or two lines), drops
//! glyphs clipped by the crop edge, and fixes the usual `0/o`, `9/p`, `8/b`,
//! `7/t` confusions from glyph height: on regional plates the series letters
//! and region digits are printed smaller than the main number.

use crate::detect::{BoundingBox, Detection};

use super::taxonomy::{self, ParsedPlate};

/// Glyph per character-model class id.
pub const CHAR_NAMES: &str = "0123456789abcdehkmoptxy";

/// Fewer glyphs than this cannot form any known plate; no analysis is done.
pub const MIN_CHARS: usize = 6;
/// Glyphs closer than this fraction of the crop to an edge are dropped.
const EDGE_GAP: f32 = 0.01;
/// Minimum normalized height difference separating small and big glyphs.
const SIZE_GAP: f32 = 0.07;
/// Leading size pattern of diplomatic plates, which are never corrected.
const DIPLOMATIC_SIZES: [SizeClass; 4] = [
    SizeClass::Big,
    SizeClass::Big,
    SizeClass::Big,
    SizeClass::Small,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Big,
}

fn fix_small(c: char) -> char {
    match c {
        '0' => 'o',
        '9' => 'p',
        '8' => 'b',
        '7' => 't',
        other => other,
    }
}

fn fix_big(c: char) -> char {
    match c {
        'o' => '0',
        'p' => '9',
        'b' => '8',
        't' => '7',
        other => other,
    }
}

/// One glyph box on the plate crop.
#[derive(Clone, Debug, PartialEq)]
pub struct CharacterDetection {
    pub bbox: BoundingBox,
    /// Glyph the model reported.
    pub name: char,
    /// Glyph after size-based correction.
    pub analyzed: char,
    pub confidence: f32,
    /// Box size relative to the crop.
    pub norm_width: f32,
    pub norm_height: f32,
    pub touching_edge: bool,
    /// 0 for the top (or only) line, 1 for the bottom line.
    pub line: usize,
    /// Reading position, counted across both lines.
    pub position: usize,
    pub size: Option<SizeClass>,
}

/// Character-stage result for one plate crop.
#[derive(Clone, Debug)]
pub struct CharacterCandidate {
    chars: Vec<CharacterDetection>,
    double_line: bool,
    plate: Option<ParsedPlate>,
}

impl CharacterCandidate {
    /// Analyze character detections on a `crop_width x crop_height` crop.
    pub fn new(detections: &[Detection], crop_width: u32, crop_height: u32) -> Self {
        let (w, h) = (crop_width.max(1) as f32, crop_height.max(1) as f32);
        let mut chars: Vec<CharacterDetection> = detections
            .iter()
            .filter_map(|det| {
                let name = CHAR_NAMES.chars().nth(det.class_id)?;
                Some(CharacterDetection {
                    bbox: det.bbox,
                    name,
                    analyzed: name,
                    confidence: det.confidence,
                    norm_width: det.bbox.width() / w,
                    norm_height: det.bbox.height() / h,
                    touching_edge: false,
                    line: 0,
                    position: 0,
                    size: None,
                })
            })
            .collect();

        if chars.len() < MIN_CHARS {
            return Self {
                chars,
                double_line: false,
                plate: None,
            };
        }

        for ch in chars.iter_mut() {
            ch.touching_edge = touches_edge(&ch.bbox, w, h);
        }
        let double_line = order(&mut chars);
        assign_sizes(&mut chars);

        // Clipped glyphs still vote on line layout and size classes, but are
        // not part of the string.
        let mut kept: Vec<CharacterDetection> =
            chars.into_iter().filter(|ch| !ch.touching_edge).collect();
        kept.sort_by_key(|ch| ch.position);

        let diplomatic_layout = kept.len() >= DIPLOMATIC_SIZES.len()
            && kept
                .iter()
                .zip(DIPLOMATIC_SIZES)
                .all(|(ch, size)| ch.size == Some(size));
        if !double_line && !diplomatic_layout {
            correct(&mut kept);
        }

        let text: String = kept.iter().map(|ch| ch.analyzed).collect();
        let plate = taxonomy::parse(&text);

        Self {
            chars: kept,
            double_line,
            plate,
        }
    }

    /// Glyphs in reading order, edge-clipped ones removed.
    pub fn chars(&self) -> &[CharacterDetection] {
        &self.chars
    }

    pub fn is_double_line(&self) -> bool {
        self.double_line
    }

    /// Parsed plate, if the glyphs form exactly one known layout.
    pub fn plate(&self) -> Option<&ParsedPlate> {
        self.plate.as_ref()
    }

    /// Recognized plate text (uppercase), if valid.
    pub fn string(&self) -> Option<&str> {
        self.plate.as_ref().map(|p| p.text.as_str())
    }

    pub fn mean_confidence(&self) -> Option<f32> {
        if self.chars.is_empty() {
            return None;
        }
        Some(self.chars.iter().map(|ch| ch.confidence).sum::<f32>() / self.chars.len() as f32)
    }
}

fn touches_edge(bbox: &BoundingBox, w: f32, h: f32) -> bool {
    bbox.x1 <= EDGE_GAP * w
        || bbox.y1 <= EDGE_GAP * h
        || bbox.x2 >= w - EDGE_GAP * w
        || bbox.y2 >= h - EDGE_GAP * h
}

/// Assign line and reading position. Returns true for a two-line layout.
fn order(chars: &mut [CharacterDetection]) -> bool {
    let n = chars.len() as f32;
    let middle = chars.iter().map(|ch| ch.bbox.y1).sum::<f32>() / n;
    let mean_height = chars.iter().map(|ch| ch.bbox.height()).sum::<f32>() / n;
    let top = chars.iter().map(|ch| ch.bbox.y1).fold(f32::MAX, f32::min);
    let bottom = chars.iter().map(|ch| ch.bbox.y1).fold(f32::MIN, f32::max);
    let double_line = bottom - top > mean_height;

    let mut indices: Vec<usize> = (0..chars.len()).collect();
    let line_of = |ch: &CharacterDetection| usize::from(double_line && ch.bbox.y1 >= middle);
    indices.sort_by(|&a, &b| {
        line_of(&chars[a])
            .cmp(&line_of(&chars[b]))
            .then(chars[a].bbox.x1.total_cmp(&chars[b].bbox.x1))
    });
    for (position, idx) in indices.into_iter().enumerate() {
        let line = line_of(&chars[idx]);
        chars[idx].line = line;
        chars[idx].position = position;
    }
    double_line
}

/// Split glyphs into small and big at the largest height gap, if it is wide
/// enough to be a real size difference.
fn assign_sizes(chars: &mut [CharacterDetection]) {
    let mut by_height: Vec<usize> = (0..chars.len()).collect();
    by_height.sort_by(|&a, &b| chars[a].norm_height.total_cmp(&chars[b].norm_height));

    let mut gap = (0, f32::MIN);
    for (i, pair) in by_height.windows(2).enumerate() {
        let diff = chars[pair[1]].norm_height - chars[pair[0]].norm_height;
        if diff > gap.1 {
            gap = (i, diff);
        }
    }
    if gap.1 < SIZE_GAP {
        return;
    }
    for (rank, idx) in by_height.into_iter().enumerate() {
        chars[idx].size = Some(if rank <= gap.0 {
            SizeClass::Small
        } else {
            SizeClass::Big
        });
    }
}

/// Position-aware digit/letter correction for single-line regional plates.
fn correct(chars: &mut [CharacterDetection]) {
    let n = chars.len();
    for (i, ch) in chars.iter_mut().enumerate() {
        let analyzed = if i + 2 < n {
            // Third from last may be the first digit of a three-digit region.
            if i + 3 == n && matches!(ch.name, '9' | '7') {
                continue;
            }
            match ch.size {
                Some(SizeClass::Small) if i != 2 && i != 3 => fix_small(ch.name),
                Some(SizeClass::Big) => fix_big(ch.name),
                _ => ch.name,
            }
        } else {
            match ch.size {
                Some(SizeClass::Small) => fix_big(ch.name),
                _ => ch.name,
            }
        };
        if analyzed != ch.name {
            ch.analyzed = analyzed;
            // Corrected glyphs are trusted half as much.
            ch.confidence = (1.0 - 2.0 * (1.0 - ch.confidence)).max(0.0);
        }
    }
}
