//! Plate rectification.
//!
//! Turns one plate localization (box plus optional mask outline) into a
//! frontal crop for the character stage. The outline is simplified, reduced to
//! its convex hull and fitted with a minimum-area rectangle. The rectangle's
//! top and bottom edges are then extended to the vertical sides of the
//! detection box, and the resulting quadrilateral is warped onto a 224x48
//! canvas (224x96 for two-line or rotated plates).

use std::sync::Arc;

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::geometry::{approximate_polygon_dp, arc_length, convex_hull, min_area_rect};
use imageproc::point::Point;

use crate::detect::{BoundingBox, Detection};

pub const CROP_WIDTH: u32 = 224;
pub const CROP_HEIGHT: u32 = 48;
const BORDER_W: f32 = 8.0;
const BORDER_H: f32 = 4.0;
/// Width/height below which a plate is treated as a square two-line plate.
const NARROW_ASPECT: f32 = 1.8;
/// Localization class of plates the detector marks as rotated.
const ROTATED_CLASS: usize = 1;
/// Douglas-Peucker tolerance as a fraction of the outline length.
const SIMPLIFY_EPSILON: f64 = 0.001;

type Corner = (f32, f32);

/// A localized plate together with its rectified crop.
#[derive(Clone, Debug)]
pub struct PlateCandidate {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub confidence: f32,
    /// Simplified convex outline. Empty when the detector gave no mask.
    pub polygon: Vec<Corner>,
    /// `[tl, tr, br, bl]` in source coordinates.
    pub corners: [Corner; 4],
    /// True when the crop uses the doubled height.
    pub tall: bool,
    pub crop: Arc<RgbImage>,
}

impl PlateCandidate {
    /// Rectify `detection` out of `image`. Returns `None` for degenerate
    /// geometry.
    pub fn from_detection(image: &RgbImage, detection: &Detection) -> Option<Self> {
        let bbox = detection.bbox;
        if bbox.width() < 1.0 || bbox.height() < 1.0 {
            return None;
        }

        let polygon = detection
            .polygon
            .as_deref()
            .map(simplify_outline)
            .unwrap_or_default();
        let rect = if polygon.len() >= 3 {
            rotated_rect(&polygon)
        } else {
            box_corners(&bbox)
        };
        let corners = snap_to_box(order_clockwise(rect), &bbox);

        let [tl, tr, _, bl] = corners;
        let side = bl.1 - tl.1;
        let too_narrow = side > 0.0 && (tr.0 - tl.0) / side < NARROW_ASPECT;
        let tall = detection.class_id == ROTATED_CLASS || too_narrow;
        let height = if tall { CROP_HEIGHT * 2 } else { CROP_HEIGHT };

        let crop = warp_crop(image, &corners, CROP_WIDTH, height)?;
        Some(Self {
            bbox,
            class_id: detection.class_id,
            confidence: detection.confidence,
            polygon,
            corners,
            tall,
            crop: Arc::new(crop),
        })
    }
}

fn simplify_outline(points: &[(f32, f32)]) -> Vec<Corner> {
    let contour: Vec<Point<i32>> = points
        .iter()
        .map(|&(x, y)| Point::new(x.round() as i32, y.round() as i32))
        .collect();
    if contour.len() < 3 {
        return Vec::new();
    }
    let epsilon = SIMPLIFY_EPSILON * arc_length(&contour, true);
    // Simplified as an open polyline. In closed mode the result loses its last
    // vertex unless the first point is repeated, and a repeated point makes
    // the first split line degenerate.
    let simplified = approximate_polygon_dp(&contour, epsilon, false);
    convex_hull(&simplified[..])
        .into_iter()
        .map(|p| (p.x as f32, p.y as f32))
        .collect()
}

fn rotated_rect(polygon: &[Corner]) -> [Corner; 4] {
    let points: Vec<Point<i32>> = polygon
        .iter()
        .map(|&(x, y)| Point::new(x as i32, y as i32))
        .collect();
    min_area_rect(&points[..]).map(|p| (p.x as f32, p.y as f32))
}

fn box_corners(bbox: &BoundingBox) -> [Corner; 4] {
    [
        (bbox.x1, bbox.y1),
        (bbox.x2, bbox.y1),
        (bbox.x2, bbox.y2),
        (bbox.x1, bbox.y2),
    ]
}

/// Order four points as `[tl, tr, br, bl]`.
///
/// The two leftmost points give `tl`/`bl` by height; of the two rightmost,
/// the one farther from `tl` is `br`.
pub fn order_clockwise(mut points: [Corner; 4]) -> [Corner; 4] {
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    let (mut left, right) = ([points[0], points[1]], [points[2], points[3]]);
    left.sort_by(|a, b| a.1.total_cmp(&b.1));
    let [tl, bl] = left;

    let dist = |p: Corner| (p.0 - tl.0).hypot(p.1 - tl.1);
    let (br, tr) = if dist(right[0]) >= dist(right[1]) {
        (right[0], right[1])
    } else {
        (right[1], right[0])
    };
    [tl, tr, br, bl]
}

/// Intersection of line `p1-p2` with line `p3-p4`; `None` when parallel.
pub fn line_intersection(p1: Corner, p2: Corner, p3: Corner, p4: Corner) -> Option<Corner> {
    let a1 = p2.1 - p1.1;
    let b1 = p1.0 - p2.0;
    let c1 = a1 * p1.0 + b1 * p1.1;

    let a2 = p4.1 - p3.1;
    let b2 = p3.0 - p4.0;
    let c2 = a2 * p3.0 + b2 * p3.1;

    let det = a1 * b2 - a2 * b1;
    if det.abs() < f32::EPSILON {
        return None;
    }
    Some(((b2 * c1 - b1 * c2) / det, (a1 * c2 - a2 * c1) / det))
}

/// Extend the rectangle's top and bottom edges to the box's vertical sides.
fn snap_to_box(rect: [Corner; 4], bbox: &BoundingBox) -> [Corner; 4] {
    let [tl, tr, br, bl] = rect;
    let left = ((bbox.x1, bbox.y1), (bbox.x1, bbox.y2));
    let right = ((bbox.x2, bbox.y1), (bbox.x2, bbox.y2));
    [
        line_intersection(tl, tr, left.0, left.1).unwrap_or(tl),
        line_intersection(tl, tr, right.0, right.1).unwrap_or(tr),
        line_intersection(br, bl, right.0, right.1).unwrap_or(br),
        line_intersection(br, bl, left.0, left.1).unwrap_or(bl),
    ]
}

fn warp_crop(image: &RgbImage, corners: &[Corner; 4], width: u32, height: u32) -> Option<RgbImage> {
    let (w, h) = (width as f32, height as f32);
    let target = [
        (BORDER_W, BORDER_H),
        (w - BORDER_W, BORDER_H),
        (w - BORDER_W, h - BORDER_H),
        (BORDER_W, h - BORDER_H),
    ];
    let projection = Projection::from_control_points(*corners, target)?;
    let mut crop = RgbImage::new(width, height);
    warp_into(
        image,
        &projection,
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut crop,
    );
    Some(crop)
}
