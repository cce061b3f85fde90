//! Gate License Plate Recognition (gate-lpr)
//!
//! Multi-camera license plate reading for gated sites.
//!
//! # Pipeline
//!
//! 1. **Streams** keep only the freshest decoded frame per camera.
//! 2. The **scheduler** shares two inference gateways (plate localization and
//!    character recognition) fairly across cameras, favouring cameras that see
//!    a plate or have seen nothing for a while.
//! 3. Each camera's **detector** keeps a short timeline of frames, rectifies
//!    the plate, orders and corrects the characters, and votes over the
//!    timeline until one reading is confident enough.
//! 4. The **event dispatcher** de-duplicates readings per camera and posts
//!    them to the access-control service.
//!
//! # Module Structure
//!
//! - `ingest`: camera streams (RTSP through GStreamer, synthetic `stub://`)
//! - `detect`: inference backends, letterbox, post-processing, gateway
//! - `plate`: rectification, character ordering, plate taxonomy
//! - `frame`, `detector`: per-camera evidence and consensus
//! - `scheduler`: camera registry and fleet scheduler
//! - `events`, `acs`: access-control service boundary
//! - `config`: daemon configuration

pub mod acs;
pub mod config;
pub mod detect;
pub mod detector;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod plate;
pub mod scheduler;

pub use acs::AcsClient;
pub use config::{CameraConfig, LprConfig};
pub use detect::{
    BoundingBox, Detection, DetectionResult, InferenceBackend, InferenceGateway, ModelDescriptor,
    StubBackend,
};
pub use detector::{ConsensusResult, Detector, DetectorSettings, RecognitionBorders};
pub use events::{
    EventDispatcher, EventSettings, EventSink, HttpEventSink, LprNotification, MemorySink,
    PlateEvent,
};
pub use frame::{Frame, FrameId};
pub use ingest::{RtspConfig, Stream};
pub use plate::{CharacterCandidate, ParsedPlate, PlateCandidate, PlateKind};
pub use scheduler::{CameraRegistry, FleetScheduler};
