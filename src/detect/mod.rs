mod backend;
pub mod backends;
mod gateway;
pub mod letterbox;
pub mod postprocess;
mod result;

pub use backend::InferenceBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use gateway::{Completion, InferenceGateway, ModelDescriptor};
pub use letterbox::{InputTensor, Letterbox};
pub use postprocess::RawOutput;
pub use result::{BoundingBox, Detection, DetectionResult};
