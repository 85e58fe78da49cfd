//! Per-split image transforms and tensor conversion
//!
//! The train split gets a random augmentation pipeline (flip, rotation,
//! resized crop, colour jitter); validation and test are only resized. Every
//! transform draws its randomness from a caller-supplied generator so that
//! materialization stays reproducible.

use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::AugmentationConfig;

const CROP_RATIO: (f64, f64) = (3.0 / 4.0, 4.0 / 3.0);
const CROP_ATTEMPTS: usize = 10;

/// A transform applied to a decoded RGB image before tensor conversion
pub trait ImageTransform: Send + Sync {
    /// Transform `image`, drawing any randomness from `rng`
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> RgbImage;

    /// Output edge length in pixels (outputs are square)
    fn output_size(&self) -> u32;
}

/// Deterministic resize used for validation and test images
#[derive(Debug, Clone)]
pub struct EvalTransform {
    size: u32,
}

impl EvalTransform {
    /// Create a resize-only transform producing `size`×`size` images
    pub fn new(size: u32) -> Self {
        Self { size }
    }
}

impl ImageTransform for EvalTransform {
    fn apply(&self, image: RgbImage, _rng: &mut StdRng) -> RgbImage {
        imageops::resize(&image, self.size, self.size, FilterType::Triangle)
    }

    fn output_size(&self) -> u32 {
        self.size
    }
}

/// Random augmentation pipeline used for training images
#[derive(Debug, Clone)]
pub struct TrainTransform {
    size: u32,
    config: AugmentationConfig,
}

impl TrainTransform {
    /// Create the augmentation pipeline producing `size`×`size` images
    pub fn new(size: u32, config: AugmentationConfig) -> Self {
        Self { size, config }
    }
}

impl ImageTransform for TrainTransform {
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> RgbImage {
        if !self.config.enabled {
            return EvalTransform::new(self.size).apply(image, rng);
        }

        let mut image = image;
        if rng.random_bool(self.config.horizontal_flip_prob.clamp(0.0, 1.0)) {
            image = imageops::flip_horizontal(&image);
        }

        if self.config.rotation_degrees > 0.0 {
            let degrees = uniform(rng, -self.config.rotation_degrees, self.config.rotation_degrees);
            image = rotate_nearest(&image, degrees);
        }

        image = random_resized_crop(&image, self.size, self.config.crop_scale, rng);
        color_jitter(image, &self.config, rng)
    }

    fn output_size(&self) -> u32 {
        self.size
    }
}

fn uniform(rng: &mut StdRng, low: f64, high: f64) -> f64 {
    low + (high - low) * rng.random::<f64>()
}

/// Rotate counter-clockwise about the image centre, keeping the canvas size.
/// Uncovered pixels are filled with black.
pub fn rotate_nearest(image: &RgbImage, degrees: f64) -> RgbImage {
    let (width, height) = image.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f64 + 0.5 - cx;
        let dy = y as f64 + 0.5 - cy;
        let sx = (dx * cos - dy * sin + cx).floor();
        let sy = (dx * sin + dy * cos + cy).floor();
        if sx >= 0.0 && sy >= 0.0 && sx < width as f64 && sy < height as f64 {
            *image.get_pixel(sx as u32, sy as u32)
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// Crop a random area/aspect region and resize it to `size`×`size`.
pub fn random_resized_crop(image: &RgbImage, size: u32, scale: (f64, f64), rng: &mut StdRng) -> RgbImage {
    let (x, y, w, h) = crop_params(image.width(), image.height(), scale, rng);
    let cropped = imageops::crop_imm(image, x, y, w, h).to_image();
    imageops::resize(&cropped, size, size, FilterType::Triangle)
}

fn crop_params(width: u32, height: u32, scale: (f64, f64), rng: &mut StdRng) -> (u32, u32, u32, u32) {
    let area = (width as f64) * (height as f64);
    let (log_lo, log_hi) = (CROP_RATIO.0.ln(), CROP_RATIO.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * uniform(rng, scale.0, scale.1);
        let aspect = uniform(rng, log_lo, log_hi).exp();

        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;
        if w > 0 && h > 0 && w <= width && h <= height {
            let x = rng.random_range(0..=width - w);
            let y = rng.random_range(0..=height - h);
            return (x, y, w, h);
        }
    }

    // Centre crop clamped to the allowed aspect range
    let in_ratio = width as f64 / height as f64;
    let (w, h) = if in_ratio < CROP_RATIO.0 {
        (width, (width as f64 / CROP_RATIO.0).round() as u32)
    } else if in_ratio > CROP_RATIO.1 {
        ((height as f64 * CROP_RATIO.1).round() as u32, height)
    } else {
        (width, height)
    };
    let (w, h) = (w.clamp(1, width.max(1)), h.clamp(1, height.max(1)));
    ((width - w) / 2, (height - h) / 2, w, h)
}

fn luma(pixel: &Rgb<u8>) -> f32 {
    let [r, g, b] = pixel.0;
    0.2989 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

fn blend(channel: u8, other: f32, factor: f32) -> u8 {
    (factor * channel as f32 + (1.0 - factor) * other)
        .round()
        .clamp(0.0, 255.0) as u8
}

#[derive(Debug, Clone, Copy)]
enum JitterOp {
    Brightness,
    Contrast,
    Saturation,
    Hue,
}

/// Apply brightness, contrast, saturation, and hue jitter in random order.
pub fn color_jitter(mut image: RgbImage, config: &AugmentationConfig, rng: &mut StdRng) -> RgbImage {
    let mut ops = [
        JitterOp::Brightness,
        JitterOp::Contrast,
        JitterOp::Saturation,
        JitterOp::Hue,
    ];
    ops.shuffle(rng);

    let factor = |rng: &mut StdRng, strength: f64| {
        uniform(rng, (1.0 - strength).max(0.0), 1.0 + strength) as f32
    };

    for op in ops {
        match op {
            JitterOp::Brightness if config.brightness > 0.0 => {
                let f = factor(rng, config.brightness);
                for pixel in image.pixels_mut() {
                    pixel.0 = pixel.0.map(|c| blend(c, 0.0, f));
                }
            }
            JitterOp::Contrast if config.contrast > 0.0 => {
                let f = factor(rng, config.contrast);
                let count = (image.width() as f32 * image.height() as f32).max(1.0);
                let mean = image.pixels().map(luma).sum::<f32>() / count;
                for pixel in image.pixels_mut() {
                    pixel.0 = pixel.0.map(|c| blend(c, mean, f));
                }
            }
            JitterOp::Saturation if config.saturation > 0.0 => {
                let f = factor(rng, config.saturation);
                for pixel in image.pixels_mut() {
                    let gray = luma(pixel);
                    pixel.0 = pixel.0.map(|c| blend(c, gray, f));
                }
            }
            JitterOp::Hue if config.hue > 0.0 => {
                let shift = uniform(rng, -config.hue, config.hue);
                image = imageops::colorops::huerotate(&image, (shift * 360.0).round() as i32);
            }
            _ => {}
        }
    }
    image
}

/// Convert an RGB image to a `[3, H, W]` f32 tensor with values in `[0, 1]`.
pub fn to_tensor(image: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
    let (width, height) = image.dimensions();
    let raw = image.as_raw().clone();
    Tensor::from_vec(raw, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 128]))
    }

    #[test]
    fn test_eval_transform_resizes() {
        let mut rng = StdRng::seed_from_u64(0);
        let out = EvalTransform::new(8).apply(gradient(20, 12), &mut rng);
        assert_eq!(out.dimensions(), (8, 8));
    }

    #[test]
    fn test_train_transform_output_size_and_reproducibility() {
        let transform = TrainTransform::new(16, AugmentationConfig::default());
        let a = transform.apply(gradient(24, 20), &mut StdRng::seed_from_u64(3));
        let b = transform.apply(gradient(24, 20), &mut StdRng::seed_from_u64(3));
        assert_eq!(a.dimensions(), (16, 16));
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_rotation_is_identity() {
        let image = gradient(9, 7);
        assert_eq!(rotate_nearest(&image, 0.0), image);
    }

    #[test]
    fn test_half_turn_rotation_mirrors_both_axes() {
        let image = gradient(4, 4);
        let rotated = rotate_nearest(&image, 180.0);
        assert_eq!(rotated.get_pixel(0, 0), image.get_pixel(3, 3));
        assert_eq!(rotated.get_pixel(3, 0), image.get_pixel(0, 3));
    }

    #[test]
    fn test_crop_params_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let (x, y, w, h) = crop_params(40, 30, (0.8, 1.0), &mut rng);
            assert!(w > 0 && h > 0);
            assert!(x + w <= 40 && y + h <= 30);
        }
    }

    #[test]
    fn test_jitter_disabled_is_identity() {
        let config = AugmentationConfig {
            brightness: 0.0,
            contrast: 0.0,
            saturation: 0.0,
            hue: 0.0,
            ..AugmentationConfig::default()
        };
        let image = gradient(6, 6);
        let out = color_jitter(image.clone(), &config, &mut StdRng::seed_from_u64(1));
        assert_eq!(out, image);
    }

    #[test]
    fn test_to_tensor_layout_and_scale() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 51]));
        image.put_pixel(1, 0, Rgb([0, 255, 0]));

        let tensor = to_tensor(&image, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 1, 2]);

        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let expected = [1.0, 0.0, 0.0, 1.0, 0.2, 0.0];
        for (v, e) in values.iter().zip(expected) {
            approx::assert_abs_diff_eq!(*v, e, epsilon = 1e-6);
        }
    }
}
