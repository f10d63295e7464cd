#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::frame::Frame;
use crate::pose::backend::PoseEstimator;
use crate::pose::{KeypointIndex, KeypointSet};

/// MoveNet single-pose backend running an ONNX export through tract.
///
/// Input is `[1, size, size, 3]` f32 RGB in `0..=255`; output is
/// `[1, 1, 17, 3]` with `(y, x, score)` per keypoint, normalized.
pub struct MoveNetBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
}

impl MoveNetBackend {
    /// Load the model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, size, size, 3)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "MoveNetBackend: loaded {} ({}x{} input)",
            model_path.display(),
            input_size,
            input_size
        );
        Ok(Self { model, input_size })
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = imageops::resize(
            frame.image(),
            self.input_size,
            self.input_size,
            FilterType::Triangle,
        );
        let size = self.input_size as usize;
        tract_ndarray::Array4::from_shape_fn((1, size, size, 3), |(_, y, x, channel)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32
        })
        .into_tensor()
    }

    fn extract_keypoints(&self, outputs: TVec<TValue>) -> Result<KeypointSet> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        if values.len() != KeypointIndex::COUNT * 3 {
            return Err(anyhow!(
                "expected {} output values, model produced {}",
                KeypointIndex::COUNT * 3,
                values.len()
            ));
        }
        let flat: Vec<f32> = values.iter().copied().collect();
        Ok(KeypointSet::from_triples(&flat)?)
    }
}

impl PoseEstimator for MoveNetBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame) -> Result<KeypointSet> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.extract_keypoints(outputs)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::solid(self.input_size, self.input_size, [0, 0, 0], 0);
        self.infer(&blank).context("warm-up inference failed")?;
        Ok(())
    }
}
