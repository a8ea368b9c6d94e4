use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::config::RelayConfig;
use crate::detect::classes::class_name;

/// Axis-aligned box in coordinates normalized to the image (0..1).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build from two corners. Coordinates are clamped to [0, 1] and ordered
    /// so that `x2 >= x1` and `y2 >= y1`; non-finite values collapse to 0.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let (x1, x2) = ordered(unit(x1), unit(x2));
        let (y1, y2) = ordered(unit(y1), unit(y2));
        Self {
            x1,
            y1,
            x2,
            y2,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Build from pixel corners on an image of the given size.
    pub fn from_pixels(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Self::from_corners(x1 / w, y1 / h, x2 / w, y2 / h)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    fn is_normalized(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| (0.0..=1.0).contains(v))
            && self.x2 >= self.x1
            && self.y2 >= self.y1
    }
}

fn unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn ordered(a: f32, b: f32) -> (f32, f32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// One recognized object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    /// Build a detection with the COCO class name for `class_id`.
    pub fn new(class_id: u32, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            class_name: class_name(class_id),
            confidence: unit(confidence),
            bbox,
        }
    }

    /// Re-establish the box and confidence ranges on detector output.
    pub(crate) fn sanitized(mut self) -> Self {
        if !self.bbox.is_normalized() {
            let b = self.bbox;
            self.bbox = BoundingBox::from_corners(b.x1, b.y1, b.x2, b.y2);
        } else {
            self.bbox.width = self.bbox.x2 - self.bbox.x1;
            self.bbox.height = self.bbox.y2 - self.bbox.y1;
        }
        self.confidence = unit(self.confidence);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn of(image: &RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }
}

/// Output of one detection job, plus routing metadata once published.
///
/// `detections` and `detection_count` are only set together through the
/// constructors, so the count always matches.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    detections: Vec<Detection>,
    pub processing_time: f64,
    pub fps: f64,
    pub image_size: ImageSize,
    detection_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Submission timestamp echoed back to the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Completion time, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_image: Option<String>,
}

impl DetectionResult {
    pub fn from_detections(
        detections: Vec<Detection>,
        processing_time: f64,
        image_size: ImageSize,
    ) -> Self {
        let fps = if processing_time > 0.0 {
            1.0 / processing_time
        } else {
            0.0
        };
        Self {
            detection_count: detections.len(),
            detections,
            processing_time,
            fps,
            image_size,
            ..Self::default()
        }
    }

    /// Error-shaped result: no detections, zero timings, `error` set.
    pub fn degraded(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach the submitting session and its submission timestamp.
    pub fn for_session(mut self, session_id: impl Into<String>, timestamp: f64) -> Self {
        self.session_id = Some(session_id.into());
        self.timestamp = Some(timestamp);
        self
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn detection_count(&self) -> usize {
        self.detection_count
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Static detector description advertised to joining clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorInfo {
    pub model: String,
    pub target_size: [u32; 2],
    pub target_fps: u32,
    pub conf_threshold: f32,
}

impl DetectorInfo {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self {
            model: cfg.model.name.clone(),
            target_size: [cfg.detector.target_width, cfg.detector.target_height],
            target_fps: cfg.detector.target_fps,
            conf_threshold: cfg.detector.conf_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corners_are_clamped_and_ordered() {
        let b = BoundingBox::from_corners(0.8, -0.2, 0.3, 1.4);
        assert_eq!((b.x1, b.x2), (0.3, 0.8));
        assert_eq!((b.y1, b.y2), (0.0, 1.0));
        assert!((b.width - 0.5).abs() < 1e-6);
        assert_eq!(b.height, 1.0);

        let nan = BoundingBox::from_corners(f32::NAN, 0.1, 0.2, f32::INFINITY);
        assert_eq!(nan.x1, 0.0);
        assert_eq!(nan.y2, 0.1);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::from_corners(0.0, 0.0, 0.5, 0.5);
        let b = BoundingBox::from_corners(0.6, 0.6, 0.9, 0.9);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn sanitize_repairs_out_of_range_detector_output() {
        let raw = Detection {
            class_id: 2,
            class_name: "car".into(),
            confidence: 1.7,
            bbox: BoundingBox {
                x1: 0.9,
                y1: 0.1,
                x2: 0.2,
                y2: 1.5,
                width: -0.7,
                height: 1.4,
            },
        };
        let fixed = raw.sanitized();
        assert_eq!(fixed.confidence, 1.0);
        assert!(fixed.bbox.x2 >= fixed.bbox.x1);
        assert!(fixed.bbox.y2 <= 1.0);
        assert!((fixed.bbox.width - (fixed.bbox.x2 - fixed.bbox.x1)).abs() < 1e-6);
    }

    #[test]
    fn fps_is_zero_for_non_positive_processing_time() {
        let r = DetectionResult::from_detections(vec![], 0.0, ImageSize::default());
        assert_eq!(r.fps, 0.0);
        let r = DetectionResult::from_detections(vec![], 0.05, ImageSize::default());
        assert!((r.fps - 20.0).abs() < 1e-9);
    }

    #[test]
    fn degraded_result_serializes_error_and_empty_detections() {
        let r = DetectionResult::degraded("queue full").for_session("s1", 12.5);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["error"], "queue full");
        assert_eq!(v["detections"].as_array().unwrap().len(), 0);
        assert_eq!(v["detection_count"], 0);
        assert_eq!(v["processing_time"], 0.0);
        assert_eq!(v["session_id"], "s1");
        assert_eq!(v["timestamp"], 12.5);
        assert!(v.get("processing_timestamp").is_none());
    }
}
