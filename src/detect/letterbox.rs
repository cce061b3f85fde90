//! Letterbox resize and tensor packing.
//!
//! Frames are scaled to fit the model input while keeping their aspect ratio,
//! then padded with mid-gray up to the next multiple of the model stride. The
//! padding geometry is kept so boxes can be mapped back onto the source image.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// Padding value used by the detector training pipeline.
pub const PAD_VALUE: u8 = 114;

/// Geometry of a letterboxed image relative to its source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_left: u32,
    pub pad_top: u32,
    /// Size of the resized image inside the padding.
    pub inner_width: u32,
    pub inner_height: u32,
    /// Letterboxed (model input) size.
    pub width: u32,
    pub height: u32,
    /// Source image size.
    pub source_width: u32,
    pub source_height: u32,
}

impl Letterbox {
    /// Compute the letterbox of a `source_w x source_h` image for a model of
    /// `target = (width, height)` and `stride`.
    pub fn compute(source_w: u32, source_h: u32, target: (u32, u32), stride: u32) -> Self {
        let (tw, th) = (target.0.max(1), target.1.max(1));
        let stride = stride.max(1);
        let scale = (tw as f32 / source_w.max(1) as f32).min(th as f32 / source_h.max(1) as f32);
        let nw = ((scale * source_w as f32 + 1e-3) as u32).clamp(1, tw);
        let nh = ((scale * source_h as f32 + 1e-3) as u32).clamp(1, th);

        let horizontal = (tw - nw) % stride;
        let vertical = (th - nh) % stride;

        Self {
            scale,
            pad_left: horizontal / 2,
            pad_top: vertical / 2,
            inner_width: nw,
            inner_height: nh,
            width: nw + horizontal,
            height: nh + vertical,
            source_width: source_w,
            source_height: source_h,
        }
    }

    /// Map a point from model-input space back to source space, clipped to the
    /// source bounds.
    pub fn unmap_point(&self, x: f32, y: f32) -> (f32, f32) {
        let scale = if self.scale > 0.0 { self.scale } else { 1.0 };
        let sx = ((x - self.pad_left as f32) / scale).clamp(0.0, self.source_width as f32);
        let sy = ((y - self.pad_top as f32) / scale).clamp(0.0, self.source_height as f32);
        (sx, sy)
    }

    /// Map a point from source space into model-input space.
    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale + self.pad_left as f32,
            y * self.scale + self.pad_top as f32,
        )
    }
}

/// Model input: 1x3xHxW RGB, values in `0..=1`, plus the letterbox it came from.
#[derive(Clone, Debug)]
pub struct InputTensor {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub letterbox: Letterbox,
}

impl InputTensor {
    pub fn shape(&self) -> [usize; 4] {
        [1, 3, self.height as usize, self.width as usize]
    }
}

/// Letterbox `image` to the model input geometry.
pub fn letterbox_image(image: &RgbImage, target: (u32, u32), stride: u32) -> (RgbImage, Letterbox) {
    let geometry = Letterbox::compute(image.width(), image.height(), target, stride);
    let resized = imageops::resize(
        image,
        geometry.inner_width,
        geometry.inner_height,
        FilterType::Triangle,
    );

    let mut canvas = RgbImage::from_pixel(geometry.width, geometry.height, Rgb([PAD_VALUE; 3]));
    imageops::replace(
        &mut canvas,
        &resized,
        geometry.pad_left as i64,
        geometry.pad_top as i64,
    );
    (canvas, geometry)
}

/// Pack an RGB image into a planar CHW float tensor.
pub fn image_to_tensor(image: &RgbImage, letterbox: Letterbox) -> InputTensor {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; plane * 3];
    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = (y * width + x) as usize;
        for channel in 0..3 {
            data[channel * plane + idx] = pixel[channel] as f32 / 255.0;
        }
    }
    InputTensor {
        data,
        width,
        height,
        letterbox,
    }
}

/// Letterbox and pack in one step.
pub fn prepare_input(image: &RgbImage, target: (u32, u32), stride: u32) -> InputTensor {
    let (boxed, letterbox) = letterbox_image(image, target, stride);
    image_to_tensor(&boxed, letterbox)
}
