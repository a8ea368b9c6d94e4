mod backend;
mod backends;
mod classes;
pub mod postprocess;
mod result;

use anyhow::{anyhow, Context, Result};

use crate::config::{BackendKind, RelayConfig};

pub use backend::Detector;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use classes::{class_name, COCO_CLASSES};
pub use result::{BoundingBox, Detection, DetectionResult, DetectorInfo, ImageSize};

/// Construct and warm up the configured detector.
///
/// Failure here is fatal for the service: the relay must not start serving
/// without a working detector.
pub fn build_detector(cfg: &RelayConfig) -> Result<Box<dyn Detector>> {
    let mut detector: Box<dyn Detector> = match cfg.model.backend {
        BackendKind::Stub => {
            Box::new(StubBackend::new().with_threshold(cfg.detector.conf_threshold))
        }
        BackendKind::Tract => build_tract(cfg)?,
    };
    detector
        .warm_up()
        .with_context(|| format!("detector '{}' failed to warm up", detector.name()))?;
    Ok(detector)
}

#[cfg(feature = "backend-tract")]
fn build_tract(cfg: &RelayConfig) -> Result<Box<dyn Detector>> {
    let path = std::path::Path::new(&cfg.model.path);
    if !path.exists() {
        return Err(anyhow!("model file not found at {}", path.display()));
    }
    let backend = TractBackend::new(
        path,
        cfg.detector.target_width,
        cfg.detector.target_height,
    )?
    .with_thresholds(cfg.detector.conf_threshold, cfg.detector.iou_threshold);
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_cfg: &RelayConfig) -> Result<Box<dyn Detector>> {
    Err(anyhow!(
        "tract backend requested but this build lacks the 'backend-tract' feature"
    ))
}
