#![cfg(feature = "backend-tract")]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::InferenceBackend;
use crate::detect::letterbox::InputTensor;
use crate::detect::postprocess::RawOutput;

type Plan = TypedRunnableModel<TypedModel>;

/// Tract-based backend for ONNX inference.
///
/// Letterboxed inputs keep the source aspect ratio, so the input height or
/// width depends on the camera. One optimized plan is built per input shape
/// the first time that shape is seen.
pub struct TractBackend {
    model_path: PathBuf,
    model: InferenceModel,
    plans: HashMap<(u32, u32), Plan>,
}

impl TractBackend {
    /// Load an ONNX model from disk.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?;
        Ok(Self {
            model_path: model_path.to_path_buf(),
            model,
            plans: HashMap::new(),
        })
    }

    fn plan_for(&mut self, width: u32, height: u32) -> Result<&Plan> {
        if !self.plans.contains_key(&(width, height)) {
            log::info!(
                "tract: building plan for {} at {}x{}",
                self.model_path.display(),
                width,
                height
            );
            let plan = self
                .model
                .clone()
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
            self.plans.insert((width, height), plan);
        }
        self.plans
            .get(&(width, height))
            .ok_or_else(|| anyhow!("plan cache miss for {}x{}", width, height))
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<(Vec<f32>, Vec<usize>)> {
    let view = tensor
        .to_array_view::<f32>()
        .context("model output tensor was not f32")?;
    Ok((view.iter().copied().collect(), view.shape().to_vec()))
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, input: &InputTensor) -> Result<RawOutput> {
        let tensor = Tensor::from_shape(&input.shape(), &input.data)
            .context("failed to build input tensor")?;
        let plan = self.plan_for(input.width, input.height)?;
        let outputs = plan
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;

        let first = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let (predictions, predictions_shape) = tensor_to_vec(first)?;
        let prototypes = match outputs.get(1) {
            Some(protos) => Some(tensor_to_vec(protos)?),
            None => None,
        };

        Ok(RawOutput {
            predictions,
            predictions_shape,
            prototypes,
        })
    }
}
