use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Object detector capability.
///
/// # Ownership
///
/// A detector is not assumed to be reentrant or thread-safe. The relay moves
/// its one detector into the detection worker at startup and never hands out
/// another reference, so `detect` is only ever called from that thread. The
/// trait requires `Send` (the detector crosses into the worker thread once) but
/// not `Sync`.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on an RGB image already resized to the target resolution.
    ///
    /// Bounding boxes are normalized to the image dimensions.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the relay starts serving.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        (**self).detect(image)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
