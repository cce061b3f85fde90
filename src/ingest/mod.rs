//! Camera ingestion.
//!
//! - `rtsp`: one decoded camera connection (GStreamer, or synthetic `stub://`)
//! - `stream`: long-lived capture thread per camera that keeps only the newest
//!   frame and reconnects after failures

pub mod rtsp;
pub mod stream;

pub use rtsp::{stream_uri, RtspConfig, RtspSource, DEFAULT_RTSP_PORT};
pub use stream::{Stream, StreamStats, DEFAULT_RECONNECT_DELAY};
