//! YOLO output decoding and non-maximum suppression.
//!
//! Two output layouts are understood:
//!
//! - Row-major `[N, 5 + classes]` (YOLOv5): `cx, cy, w, h, objectness, scores...`
//! - Channel-major `[4 + classes, N]` (YOLOv8 and later): no objectness column
//!
//! Box coordinates are in input pixels and are normalized on the way out.

use crate::detect::result::{BoundingBox, Detection};

/// Hard cap on detections returned per frame.
pub const MAX_DETECTIONS: usize = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum YoloLayout {
    /// `[N, 5 + classes]` with an objectness column.
    RowsWithObjectness,
    /// `[4 + classes, N]` without objectness.
    ChannelsFirst,
}

impl YoloLayout {
    /// Guess the layout from the two trailing output dimensions.
    ///
    /// Anchors always outnumber attributes, so the longer axis holds the anchors.
    pub fn infer(dim_a: usize, dim_b: usize) -> Self {
        if dim_a < dim_b {
            YoloLayout::ChannelsFirst
        } else {
            YoloLayout::RowsWithObjectness
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DecodeParams {
    pub input_width: u32,
    pub input_height: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

/// Decode a flat output tensor shaped `[dim_a, dim_b]` into detections.
pub fn decode_output(
    data: &[f32],
    dim_a: usize,
    dim_b: usize,
    layout: YoloLayout,
    params: DecodeParams,
) -> Vec<Detection> {
    if data.len() < dim_a * dim_b {
        return Vec::new();
    }
    let (anchors, attrs) = match layout {
        YoloLayout::RowsWithObjectness => (dim_a, dim_b),
        YoloLayout::ChannelsFirst => (dim_b, dim_a),
    };
    let class_offset = match layout {
        YoloLayout::RowsWithObjectness => 5,
        YoloLayout::ChannelsFirst => 4,
    };
    if attrs <= class_offset {
        return Vec::new();
    }
    let at = |anchor: usize, attr: usize| -> f32 {
        match layout {
            YoloLayout::RowsWithObjectness => data[anchor * attrs + attr],
            YoloLayout::ChannelsFirst => data[attr * anchors + anchor],
        }
    };

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let objectness = match layout {
            YoloLayout::RowsWithObjectness => at(anchor, 4),
            YoloLayout::ChannelsFirst => 1.0,
        };
        if objectness < params.conf_threshold {
            continue;
        }
        let (class_id, class_score) = (class_offset..attrs)
            .map(|attr| (attr - class_offset, at(anchor, attr)))
            .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                if cur.1 > best.1 {
                    cur
                } else {
                    best
                }
            });
        let confidence = objectness * class_score;
        if !confidence.is_finite() || confidence < params.conf_threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(anchor, 0), at(anchor, 1), at(anchor, 2), at(anchor, 3));
        let bbox = BoundingBox::from_pixels(
            cx - w / 2.0,
            cy - h / 2.0,
            cx + w / 2.0,
            cy + h / 2.0,
            params.input_width,
            params.input_height,
        );
        candidates.push(Detection::new(class_id as u32, confidence, bbox));
    }

    non_max_suppression(candidates, params.iou_threshold)
}

/// Class-wise NMS. Output is sorted by descending confidence and capped at
/// [`MAX_DETECTIONS`].
pub fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for cand in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == cand.class_id && k.bbox.iou(&cand.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(cand);
            if kept.len() == MAX_DETECTIONS {
                break;
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DecodeParams {
        DecodeParams {
            input_width: 100,
            input_height: 100,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
        }
    }

    #[test]
    fn rows_with_objectness_decode_and_suppress() {
        // Three anchors, two classes: [cx, cy, w, h, obj, c0, c1]
        let data = vec![
            50.0, 50.0, 20.0, 20.0, 0.9, 0.9, 0.1, // strong class 0
            51.0, 50.0, 20.0, 20.0, 0.8, 0.9, 0.1, // overlaps first, suppressed
            10.0, 10.0, 10.0, 10.0, 0.1, 0.1, 0.9, // below objectness threshold
        ];
        let dets = decode_output(&data, 3, 7, YoloLayout::RowsWithObjectness, params());
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.class_id, 0);
        assert_eq!(d.class_name, "person");
        assert!((d.confidence - 0.81).abs() < 1e-5);
        assert!((d.bbox.x1 - 0.4).abs() < 1e-5);
        assert!((d.bbox.x2 - 0.6).abs() < 1e-5);
    }

    #[test]
    fn channels_first_layout_is_transposed() {
        // Two anchors, one class: rows are attributes [cx, cy, w, h, c0].
        let data = vec![
            20.0, 80.0, // cx
            20.0, 80.0, // cy
            10.0, 10.0, // w
            10.0, 10.0, // h
            0.3, 0.95, // class 0
        ];
        assert_eq!(YoloLayout::infer(5, 2), YoloLayout::RowsWithObjectness);
        assert_eq!(YoloLayout::infer(5, 8400), YoloLayout::ChannelsFirst);
        let dets = decode_output(&data, 5, 2, YoloLayout::ChannelsFirst, params());
        assert_eq!(dets.len(), 2);
        assert!(dets[0].confidence > dets[1].confidence);
        assert!((dets[0].bbox.x1 - 0.75).abs() < 1e-5);
    }

    #[test]
    fn boxes_outside_the_frame_are_clamped() {
        let data = vec![0.0, 0.0, 40.0, 40.0, 0.9, 0.9];
        let dets = decode_output(&data, 1, 6, YoloLayout::RowsWithObjectness, params());
        assert_eq!(dets.len(), 1);
        let b = dets[0].bbox;
        assert_eq!((b.x1, b.y1), (0.0, 0.0));
        assert!((b.x2 - 0.2).abs() < 1e-5);
    }

    #[test]
    fn nms_keeps_overlapping_boxes_of_different_classes() {
        let bbox = BoundingBox::from_corners(0.1, 0.1, 0.5, 0.5);
        let dets = non_max_suppression(
            vec![Detection::new(0, 0.9, bbox), Detection::new(1, 0.8, bbox)],
            0.45,
        );
        assert_eq!(dets.len(), 2);
    }

    #[test]
    fn short_tensor_yields_nothing() {
        assert!(decode_output(&[1.0, 2.0], 1, 7, YoloLayout::RowsWithObjectness, params()).is_empty());
    }
}
