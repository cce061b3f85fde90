use std::sync::Arc;

use anyhow::Result;

use crate::detect::backend::InferenceBackend;
use crate::detect::letterbox::InputTensor;
use crate::detect::postprocess::RawOutput;

type Responder = dyn Fn(&InputTensor) -> RawOutput + Send + Sync;

/// Stub backend for testing and model-less runs.
///
/// Answers every request through a responder closure. The default responder
/// reports nothing found.
#[derive(Clone)]
pub struct StubBackend {
    responder: Arc<Responder>,
}

impl StubBackend {
    /// Backend that never finds anything.
    pub fn new(num_classes: usize) -> Self {
        Self::with_responder(move |_| RawOutput::empty(num_classes))
    }

    /// Backend that answers with `respond(input)`.
    pub fn with_responder<F>(respond: F) -> Self
    where
        F: Fn(&InputTensor) -> RawOutput + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(respond),
        }
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, input: &InputTensor) -> Result<RawOutput> {
        Ok((self.responder)(input))
    }
}
