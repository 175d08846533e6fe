//! ImageNet-style preprocessing.
//!
//! Training images get a random resized crop and a random horizontal flip;
//! evaluation images are resized so the shorter side is `size / 0.875` and
//! center cropped. Both produce CHW floats in [0, 1]; normalisation happens
//! on the whole batch in [`crate::ImageBatcher`].

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::Rng;

/// Per-channel mean of ImageNet
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation of ImageNet
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Fraction of the resized image kept by the evaluation center crop
pub const EVAL_CROP_FRACTION: f64 = 0.875;

const CROP_SCALE: (f64, f64) = (0.2, 1.0);
const CROP_RATIO: (f64, f64) = (3.0 / 4.0, 4.0 / 3.0);
const CROP_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    /// Random resized crop + horizontal flip
    Train { size: u32 },
    /// Resize + center crop
    Eval { size: u32 },
}

impl Transform {
    pub fn size(&self) -> u32 {
        match self {
            Transform::Train { size } | Transform::Eval { size } => *size,
        }
    }

    /// Whether the output depends only on the input image.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Transform::Eval { .. })
    }

    pub fn apply<R: Rng>(&self, image: &RgbImage, rng: &mut R) -> Vec<f32> {
        let out = match self {
            Transform::Train { size } => {
                let (x, y, w, h) = random_resized_crop_box(image.width(), image.height(), rng);
                let crop = imageops::crop_imm(image, x, y, w, h).to_image();
                let resized = imageops::resize(&crop, *size, *size, FilterType::Triangle);
                if rng.gen_bool(0.5) {
                    imageops::flip_horizontal(&resized)
                } else {
                    resized
                }
            }
            Transform::Eval { size } => {
                let short = (*size as f64 / EVAL_CROP_FRACTION) as u32;
                let resized = resize_shorter_side(image, short.max(*size));
                center_crop(&resized, *size)
            }
        };
        to_chw(&out)
    }
}

/// Picks a crop covering 20%..100% of the area with aspect ratio 3/4..4/3,
/// falling back to the largest centered crop within the ratio bounds.
fn random_resized_crop_box<R: Rng>(width: u32, height: u32, rng: &mut R) -> (u32, u32, u32, u32) {
    let area = (width * height) as f64;
    let (log_lo, log_hi) = (CROP_RATIO.0.ln(), CROP_RATIO.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * rng.gen_range(CROP_SCALE.0..=CROP_SCALE.1);
        let aspect = rng.gen_range(log_lo..=log_hi).exp();
        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;
        if w > 0 && h > 0 && w <= width && h <= height {
            let x = rng.gen_range(0..=width - w);
            let y = rng.gen_range(0..=height - h);
            return (x, y, w, h);
        }
    }

    let ratio = width as f64 / height as f64;
    let (w, h) = if ratio < CROP_RATIO.0 {
        (width, (width as f64 / CROP_RATIO.0).round() as u32)
    } else if ratio > CROP_RATIO.1 {
        ((height as f64 * CROP_RATIO.1).round() as u32, height)
    } else {
        (width, height)
    };
    let (w, h) = (w.clamp(1, width), h.clamp(1, height));
    ((width - w) / 2, (height - h) / 2, w, h)
}

fn resize_shorter_side(image: &RgbImage, short: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let (nw, nh) = if w <= h {
        (short, ((short as u64 * h as u64) / w as u64) as u32)
    } else {
        (((short as u64 * w as u64) / h as u64) as u32, short)
    };
    if (nw, nh) == (w, h) {
        return image.clone();
    }
    imageops::resize(image, nw, nh, FilterType::Triangle)
}

fn center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let (cw, ch) = (size.min(w), size.min(h));
    let x = ((w - cw) as f64 / 2.0).round() as u32;
    let y = ((h - ch) as f64 / 2.0).round() as u32;
    let crop = imageops::crop_imm(image, x, y, cw, ch).to_image();
    if (cw, ch) == (size, size) {
        crop
    } else {
        imageops::resize(&crop, size, size, FilterType::Triangle)
    }
}

/// Converts an RGB image to a flattened CHW float array in [0, 1].
pub fn to_chw(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (i, pixel) in image.pixels().enumerate() {
        data[i] = pixel[0] as f32 / 255.0;
        data[plane + i] = pixel[1] as f32 / 255.0;
        data[2 * plane + i] = pixel[2] as f32 / 255.0;
    }

    data
}
