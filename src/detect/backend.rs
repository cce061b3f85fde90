use anyhow::Result;

use super::letterbox::InputTensor;
use super::postprocess::RawOutput;

/// Inference runtime backend.
///
/// A backend turns one letterboxed input tensor into the raw output tensors of
/// the model. Box decoding, suppression and rescaling happen in the gateway, so
/// backends only wrap the runtime call itself.
///
/// Each gateway worker owns its own backend instance; implementations do not
/// need interior synchronization.
pub trait InferenceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run the model on one input.
    fn infer(&mut self, input: &InputTensor) -> Result<RawOutput>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
