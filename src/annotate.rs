//! Draws detections onto frames for visual inspection.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::Detection;

/// Outline width in pixels.
const STROKE: u32 = 2;

/// Box colours, indexed by `class_id % PALETTE.len()`.
const PALETTE: [[u8; 3]; 10] = [
    [0, 255, 0],
    [0, 0, 255],
    [255, 0, 0],
    [0, 255, 255],
    [255, 0, 255],
    [255, 255, 0],
    [128, 0, 128],
    [0, 165, 255],
    [0, 128, 0],
    [0, 128, 128],
];

pub fn class_colour(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// Return a copy of `image` with a hollow rectangle around each detection.
pub fn annotate(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut out = image.clone();
    draw_detections(&mut out, detections);
    out
}

pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    for det in detections {
        let b = &det.bbox;
        let x1 = (b.x1 * w as f32).floor() as i32;
        let y1 = (b.y1 * h as f32).floor() as i32;
        let x2 = (b.x2 * w as f32).ceil() as i32;
        let y2 = (b.y2 * h as f32).ceil() as i32;
        let colour = class_colour(det.class_id);
        for inset in 0..STROKE as i32 {
            // Rect::of_size panics on zero, so degenerate boxes still get one pixel.
            let width = (x2 - x1 - 2 * inset).max(1) as u32;
            let height = (y2 - y1 - 2 * inset).max(1) as u32;
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(width, height);
            draw_hollow_rect_mut(image, rect, colour);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn outline_uses_class_colour_and_leaves_interior() {
        let image = RgbImage::new(20, 20);
        let det = Detection::new(1, 0.9, BoundingBox::from_corners(0.25, 0.25, 0.75, 0.75));
        let out = annotate(&image, &[det]);

        assert_eq!(*out.get_pixel(5, 5), class_colour(1));
        assert_eq!(*out.get_pixel(6, 6), class_colour(1));
        assert_eq!(*out.get_pixel(10, 10), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn palette_wraps_by_class_id() {
        assert_eq!(class_colour(3), class_colour(13));
        assert_ne!(class_colour(0), class_colour(1));
    }

    #[test]
    fn degenerate_box_does_not_panic() {
        let mut image = RgbImage::new(8, 8);
        let det = Detection::new(0, 0.5, BoundingBox::from_corners(1.0, 1.0, 1.0, 1.0));
        draw_detections(&mut image, &[det]);
    }
}
