#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::postprocess::{decode_output, DecodeParams, YoloLayout};
use crate::detect::result::Detection;

/// Tract-based backend for YOLO-family ONNX models.
///
/// The model is loaded once from a local file and planned for a fixed
/// `1x3xHxW` input matching the relay's target resolution.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
    conf_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence and IoU thresholds.
    pub fn with_thresholds(mut self, conf_threshold: f32, iou_threshold: f32) -> Self {
        self.conf_threshold = conf_threshold;
        self.iou_threshold = iou_threshold;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Result<Tensor> {
        let (width, height) = image.dimensions();
        if width != self.width || height != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                width,
                height,
                self.width,
                self.height
            ));
        }

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, height as usize, width as usize),
            |(_, channel, y, x)| image.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );

        Ok(input.into_tensor())
    }

    fn extract_detections(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        // Accept [1, A, B] or [A, B].
        let (dim_a, dim_b) = match shape.as_slice() {
            [1, a, b] | [a, b] => (*a, *b),
            other => return Err(anyhow!("unexpected model output shape {:?}", other)),
        };
        let data: Vec<f32> = view.iter().copied().collect();
        Ok(decode_output(
            &data,
            dim_a,
            dim_b,
            YoloLayout::infer(dim_a, dim_b),
            DecodeParams {
                input_width: self.width,
                input_height: self.height,
                conf_threshold: self.conf_threshold,
                iou_threshold: self.iou_threshold,
            },
        ))
    }
}

impl Detector for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.build_input(image)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.extract_detections(outputs)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.width, self.height);
        self.detect(&blank).map(|_| ())
    }
}
