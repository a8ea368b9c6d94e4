use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection};

/// Luma distance from the frame mean that marks a pixel as foreground.
const DEFAULT_MARGIN: f32 = 48.0;

/// Stub backend for running the relay without a model.
///
/// Reports a single `person` covering every pixel whose luma stands out from
/// the frame mean. Confidence is the mean deviation of those pixels scaled to
/// [0, 1]. Output is a pure function of the pixels, which keeps tests exact.
pub struct StubBackend {
    conf_threshold: f32,
    margin: f32,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            conf_threshold: 0.0,
            margin: DEFAULT_MARGIN,
        }
    }

    /// Drop detections below this confidence.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.conf_threshold = threshold;
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn luma(pixel: &image::Rgb<u8>) -> f32 {
    let [r, g, b] = pixel.0;
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

impl Detector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (width, height) = image.dimensions();
        let total = (width as usize) * (height as usize);
        if total == 0 {
            return Ok(Vec::new());
        }
        let mean = image.pixels().map(luma).sum::<f32>() / total as f32;

        let mut min = (u32::MAX, u32::MAX);
        let mut max = (0u32, 0u32);
        let mut count = 0usize;
        let mut deviation = 0.0f32;
        for (x, y, pixel) in image.enumerate_pixels() {
            let d = (luma(pixel) - mean).abs();
            if d > self.margin {
                min = (min.0.min(x), min.1.min(y));
                max = (max.0.max(x), max.1.max(y));
                count += 1;
                deviation += d;
            }
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let confidence = (deviation / count as f32 / 128.0).clamp(0.0, 1.0);
        if confidence < self.conf_threshold {
            return Ok(Vec::new());
        }
        let bbox = BoundingBox::from_pixels(
            min.0 as f32,
            min.1 as f32,
            (max.0 + 1) as f32,
            (max.1 + 1) as f32,
            width,
            height,
        );
        Ok(vec![Detection::new(0, confidence, bbox)])
    }
}
