//! Box and mask post-processing for YOLO-style detector heads.
//!
//! Predictions arrive as `[1, 4 + nc + nm, N]`: box center/size, one score per
//! class, then `nm` mask coefficients. Segmentation heads add prototypes shaped
//! `[1, nm, mh, mw]`. Anything that does not fit this layout is reported as an
//! empty result.

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};

use super::letterbox::Letterbox;
use super::result::{BoundingBox, Detection, DetectionResult};

pub const CONF_THRESHOLD: f32 = 0.25;
pub const IOU_THRESHOLD: f32 = 0.2;
pub const MAX_DETECTIONS: usize = 300;

/// Raw tensors produced by one inference request.
#[derive(Clone, Debug, Default)]
pub struct RawOutput {
    pub predictions: Vec<f32>,
    pub predictions_shape: Vec<usize>,
    pub prototypes: Option<(Vec<f32>, Vec<usize>)>,
}

impl RawOutput {
    /// Output with no candidate boxes for a model with `num_classes` classes.
    pub fn empty(num_classes: usize) -> Self {
        Self {
            predictions: Vec::new(),
            predictions_shape: vec![1, 4 + num_classes, 0],
            prototypes: None,
        }
    }

    /// Build a detection-only output from `(box, class, score)` triples given
    /// in model-input coordinates.
    pub fn from_boxes(num_classes: usize, boxes: &[(BoundingBox, usize, f32)]) -> Self {
        let rows = 4 + num_classes;
        let n = boxes.len();
        let mut predictions = vec![0.0f32; rows * n];
        for (i, (bbox, class_id, score)) in boxes.iter().enumerate() {
            let (cx, cy) = bbox.center();
            predictions[i] = cx;
            predictions[n + i] = cy;
            predictions[2 * n + i] = bbox.width();
            predictions[3 * n + i] = bbox.height();
            if *class_id < num_classes {
                predictions[(4 + class_id) * n + i] = *score;
            }
        }
        Self {
            predictions,
            predictions_shape: vec![1, rows, n],
            prototypes: None,
        }
    }
}

/// Decode, suppress, and rescale. Malformed output yields an empty result.
pub fn postprocess(output: &RawOutput, num_classes: usize, letterbox: &Letterbox) -> DetectionResult {
    match decode(output, num_classes, letterbox) {
        Ok(result) => result,
        Err(err) => {
            log::warn!("malformed inference output treated as empty: {}", err);
            DetectionResult::empty()
        }
    }
}

struct Candidate {
    bbox: BoundingBox,
    class_id: usize,
    confidence: f32,
    coefficients: Vec<f32>,
}

fn decode(output: &RawOutput, num_classes: usize, letterbox: &Letterbox) -> Result<DetectionResult> {
    let shape = &output.predictions_shape;
    if shape.len() != 3 || shape[0] != 1 {
        return Err(anyhow!("unexpected prediction shape {:?}", shape));
    }
    let (rows, n) = (shape[1], shape[2]);
    if rows < 4 + num_classes {
        return Err(anyhow!(
            "prediction rows {} too few for {} classes",
            rows,
            num_classes
        ));
    }
    if output.predictions.len() != rows * n {
        return Err(anyhow!(
            "prediction buffer has {} values, shape {:?} needs {}",
            output.predictions.len(),
            shape,
            rows * n
        ));
    }
    let num_masks = rows - 4 - num_classes;
    let at = |row: usize, i: usize| output.predictions[row * n + i];

    let mut candidates = Vec::new();
    for i in 0..n {
        let (class_id, confidence) = (0..num_classes)
            .map(|c| (c, at(4 + c, i)))
            .fold((0, f32::NEG_INFINITY), |best, cur| {
                if cur.1 > best.1 {
                    cur
                } else {
                    best
                }
            });
        if !confidence.is_finite() || confidence <= CONF_THRESHOLD {
            continue;
        }
        let bbox = BoundingBox::from_center(at(0, i), at(1, i), at(2, i), at(3, i));
        let coefficients = (0..num_masks).map(|k| at(4 + num_classes + k, i)).collect();
        candidates.push(Candidate {
            bbox,
            class_id,
            confidence,
            coefficients,
        });
    }

    let kept = non_max_suppression(candidates, IOU_THRESHOLD, MAX_DETECTIONS);

    let masks = match (&output.prototypes, num_masks) {
        (Some((protos, proto_shape)), nm) if nm > 0 => Some(Prototypes::new(protos, proto_shape, nm)?),
        _ => None,
    };

    let detections = kept
        .into_iter()
        .map(|cand| {
            let polygon = masks.as_ref().and_then(|protos| {
                protos
                    .polygon(&cand.coefficients, &cand.bbox, letterbox)
                    .filter(|points| points.len() >= 3)
            });
            let (x1, y1) = letterbox.unmap_point(cand.bbox.x1, cand.bbox.y1);
            let (x2, y2) = letterbox.unmap_point(cand.bbox.x2, cand.bbox.y2);
            Detection {
                bbox: BoundingBox::new(x1, y1, x2, y2).rounded(),
                class_id: cand.class_id,
                confidence: cand.confidence,
                polygon,
            }
        })
        .collect();

    Ok(DetectionResult { detections })
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou: f32, max_det: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Candidate> = Vec::new();
    for cand in candidates {
        if kept.len() >= max_det {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == cand.class_id && k.bbox.iou(&cand.bbox) > iou);
        if !suppressed {
            kept.push(cand);
        }
    }
    kept
}

struct Prototypes<'a> {
    data: &'a [f32],
    num_masks: usize,
    height: usize,
    width: usize,
}

impl<'a> Prototypes<'a> {
    fn new(data: &'a [f32], shape: &[usize], num_masks: usize) -> Result<Self> {
        if shape.len() != 4 || shape[0] != 1 || shape[1] != num_masks {
            return Err(anyhow!(
                "prototype shape {:?} does not match {} mask coefficients",
                shape,
                num_masks
            ));
        }
        let (height, width) = (shape[2], shape[3]);
        if data.len() != num_masks * height * width || height == 0 || width == 0 {
            return Err(anyhow!("prototype buffer does not match shape {:?}", shape));
        }
        Ok(Self {
            data,
            num_masks,
            height,
            width,
        })
    }

    /// Largest outer contour of the mask inside `bbox`, in source coordinates.
    fn polygon(
        &self,
        coefficients: &[f32],
        bbox: &BoundingBox,
        letterbox: &Letterbox,
    ) -> Option<Vec<(f32, f32)>> {
        let sx = self.width as f32 / letterbox.width.max(1) as f32;
        let sy = self.height as f32 / letterbox.height.max(1) as f32;
        let x_lo = (bbox.x1 * sx).floor().max(0.0) as usize;
        let y_lo = (bbox.y1 * sy).floor().max(0.0) as usize;
        let x_hi = ((bbox.x2 * sx).ceil() as usize).min(self.width);
        let y_hi = ((bbox.y2 * sy).ceil() as usize).min(self.height);
        if x_lo >= x_hi || y_lo >= y_hi {
            return None;
        }

        let plane = self.height * self.width;
        // One pixel of background border so contours close inside the image.
        let mut mask = GrayImage::new(self.width as u32 + 2, self.height as u32 + 2);
        for y in y_lo..y_hi {
            for x in x_lo..x_hi {
                let idx = y * self.width + x;
                let logit: f32 = (0..self.num_masks)
                    .map(|k| coefficients[k] * self.data[k * plane + idx])
                    .sum();
                if logit > 0.0 {
                    // sigmoid(logit) > 0.5
                    mask.put_pixel(x as u32 + 1, y as u32 + 1, Luma([255]));
                }
            }
        }

        let contour = find_contours::<i32>(&mask)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .max_by_key(|c| c.points.len())?;

        Some(
            contour
                .points
                .iter()
                .map(|p| {
                    let ix = (p.x - 1) as f32 / sx;
                    let iy = (p.y - 1) as f32 / sy;
                    letterbox.unmap_point(ix, iy)
                })
                .collect(),
        )
    }
}
