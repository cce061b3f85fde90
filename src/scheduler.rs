//! Fleet scheduler: shares the two inference gateways across every camera.
//!
//! Each stage has a balancing queue holding each eligible camera at most once.
//! The queue is drained while the stage's gateway has a free slot and is
//! refilled only once it runs dry, so every eligible camera gets a turn
//! before any camera gets a second one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;

use crate::config::{CameraConfig, LprConfig};
use crate::detect::{Completion, InferenceBackend, InferenceGateway, ModelDescriptor, StubBackend};
use crate::detector::{Detector, DetectorSettings};
use crate::events::PlateEvent;
use crate::frame::FrameId;
use crate::ingest::{RtspConfig, Stream, StreamStats};

/// Bound on how long shutdown waits for in-flight inference.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Correlates a completion with its camera (registry index) and frame.
type Token = (usize, FrameId);

// ----------------------------------------------------------------------------
// Camera registry
// ----------------------------------------------------------------------------

pub struct Camera {
    id: String,
    gate_id: Option<String>,
    stream: Stream,
    detector: Mutex<Detector>,
}

impl Camera {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gate_id(&self) -> Option<&str> {
        self.gate_id.as_deref()
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Lock this camera's detector. A poisoned lock is recovered: detector
    /// state stays consistent between operations.
    pub fn detector(&self) -> MutexGuard<'_, Detector> {
        self.detector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Debug)]
pub struct CameraHealth {
    pub camera_id: String,
    pub stream: StreamStats,
    pub occupied: bool,
    pub starving: bool,
    pub tracked_frames: usize,
}

/// Every camera of the process, built once at startup.
pub struct CameraRegistry {
    cameras: Vec<Camera>,
}

impl CameraRegistry {
    /// Open a stream and create a detector for each camera.
    pub fn open(
        cameras: &[CameraConfig],
        detector: &DetectorSettings,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        crate::config::validate_cameras(cameras)?;
        let mut opened = Vec::with_capacity(cameras.len());
        for camera in cameras {
            let url = camera.stream_uri()?;
            let stream = Stream::open(&camera.camera_id, RtspConfig::from_url(&url)?, reconnect_delay)?;
            opened.push(Camera {
                id: camera.camera_id.clone(),
                gate_id: camera.gate_id.clone(),
                stream,
                detector: Mutex::new(Detector::new(&camera.camera_id, detector.clone())),
            });
        }
        log::info!("registry: {} cameras opened", opened.len());
        Ok(Self { cameras: opened })
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Camera> {
        self.cameras.get(index)
    }

    pub fn find(&self, camera_id: &str) -> Option<&Camera> {
        self.cameras.iter().find(|camera| camera.id == camera_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.iter()
    }

    /// Camera id to gate id, for cameras that have a gate.
    pub fn gates(&self) -> HashMap<String, String> {
        self.cameras
            .iter()
            .filter_map(|camera| Some((camera.id.clone(), camera.gate_id.clone()?)))
            .collect()
    }

    pub fn health(&self) -> Vec<CameraHealth> {
        self.cameras
            .iter()
            .map(|camera| {
                let detector = camera.detector();
                CameraHealth {
                    camera_id: camera.id.clone(),
                    stream: camera.stream.stats(),
                    occupied: detector.is_occupied(),
                    starving: detector.is_starving(),
                    tracked_frames: detector.tracked_frames(),
                }
            })
            .collect()
    }

    /// Close every stream and join the capture threads.
    pub fn close_all(&self) {
        for camera in &self.cameras {
            camera.stream.close();
        }
    }
}

// ----------------------------------------------------------------------------
// Backends
// ----------------------------------------------------------------------------

/// Backend for a model descriptor. `stub://` paths run without a model.
pub fn backend_for(descriptor: &ModelDescriptor) -> Result<Box<dyn InferenceBackend>> {
    let path = descriptor.path.to_string_lossy();
    if path.starts_with("stub://") {
        return Ok(Box::new(StubBackend::new(descriptor.num_classes)));
    }
    #[cfg(feature = "backend-tract")]
    {
        Ok(Box::new(crate::detect::TractBackend::new(&descriptor.path)?))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(anyhow::anyhow!(
            "model {} needs the backend-tract feature (or use a stub:// path)",
            path
        ))
    }
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Counters since the scheduler started, or for one `step`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub plate_submitted: u64,
    pub char_submitted: u64,
    pub plate_completed: u64,
    pub char_completed: u64,
    pub events: u64,
}

impl SchedulerStats {
    fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    fn add(&mut self, other: &SchedulerStats) {
        self.plate_submitted += other.plate_submitted;
        self.char_submitted += other.char_submitted;
        self.plate_completed += other.plate_completed;
        self.char_completed += other.char_completed;
        self.events += other.events;
    }
}

pub struct FleetScheduler {
    registry: Arc<CameraRegistry>,
    plate: InferenceGateway<Token>,
    chars: InferenceGateway<Token>,
    plate_done: Receiver<Completion<Token>>,
    char_done: Receiver<Completion<Token>>,
    plate_queue: VecDeque<usize>,
    char_queue: VecDeque<usize>,
    next_frame_id: FrameId,
    events: Sender<PlateEvent>,
    idle_sleep: Duration,
    stats: SchedulerStats,
}

impl FleetScheduler {
    /// Scheduler with backends chosen from the configured model paths.
    pub fn new(registry: Arc<CameraRegistry>, config: &LprConfig, events: Sender<PlateEvent>) -> Result<Self> {
        let plate_model = config.plate_model.clone();
        let char_model = config.char_model.clone();
        Self::with_backends(
            registry,
            (plate_model.clone(), move || backend_for(&plate_model)),
            (char_model.clone(), move || backend_for(&char_model)),
            events,
            config.idle_sleep,
        )
    }

    /// Scheduler with caller-supplied backend factories for the plate and
    /// character stages.
    pub fn with_backends<P, C>(
        registry: Arc<CameraRegistry>,
        plate: (ModelDescriptor, P),
        chars: (ModelDescriptor, C),
        events: Sender<PlateEvent>,
        idle_sleep: Duration,
    ) -> Result<Self>
    where
        P: FnMut() -> Result<Box<dyn InferenceBackend>>,
        C: FnMut() -> Result<Box<dyn InferenceBackend>>,
    {
        let (plate_tx, plate_done) = mpsc::channel();
        let (char_tx, char_done) = mpsc::channel();
        let plate = InferenceGateway::new("plate", plate.0, plate.1, plate_tx)?;
        let chars = InferenceGateway::new("char", chars.0, chars.1, char_tx)?;
        Ok(Self {
            registry,
            plate,
            chars,
            plate_done,
            char_done,
            plate_queue: VecDeque::new(),
            char_queue: VecDeque::new(),
            next_frame_id: 0,
            events,
            idle_sleep,
            stats: SchedulerStats::default(),
        })
    }

    pub fn registry(&self) -> &Arc<CameraRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.clone()
    }

    /// One pass: apply finished results, then feed both stages.
    pub fn step(&mut self) -> SchedulerStats {
        let mut step = SchedulerStats::default();
        self.drain_completions(&mut step);
        self.feed_char_stage(&mut step);
        self.feed_plate_stage(&mut step);
        self.stats.add(&step);
        step
    }

    /// Step until `shutdown` is set, then drain in-flight work.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        log::info!("scheduler: running with {} cameras", self.registry.len());
        while !shutdown.load(Ordering::SeqCst) {
            if self.step().is_idle() {
                std::thread::sleep(self.idle_sleep);
            }
        }
        self.drain();
    }

    /// Wait for in-flight requests and apply their results.
    pub fn drain(&mut self) {
        if !self.plate.wait_all_timeout(DRAIN_TIMEOUT) {
            log::warn!("scheduler: plate stage still busy after {:?}", DRAIN_TIMEOUT);
        }
        if !self.chars.wait_all_timeout(DRAIN_TIMEOUT) {
            log::warn!("scheduler: char stage still busy after {:?}", DRAIN_TIMEOUT);
        }
        let mut step = SchedulerStats::default();
        self.drain_completions(&mut step);
        self.stats.add(&step);
        log::info!("scheduler: stopped ({:?})", self.stats);
    }

    fn drain_completions(&mut self, step: &mut SchedulerStats) {
        while let Ok(done) = self.plate_done.try_recv() {
            let (index, frame_id) = done.token;
            step.plate_completed += 1;
            if let Some(camera) = self.registry.get(index) {
                camera.detector().on_plate_detection(frame_id, &done.result);
            }
        }
        while let Ok(done) = self.char_done.try_recv() {
            let (index, frame_id) = done.token;
            step.char_completed += 1;
            let Some(camera) = self.registry.get(index) else {
                continue;
            };
            let event = camera.detector().on_character_detection(frame_id, &done.result);
            if let Some(event) = event {
                step.events += 1;
                if self.events.send(event).is_err() {
                    log::debug!("{}: event receiver gone, event dropped", camera.id());
                }
            }
        }
    }

    fn feed_char_stage(&mut self, step: &mut SchedulerStats) {
        while self.chars.is_ready() {
            let Some(index) = self.char_queue.pop_front() else {
                break;
            };
            let Some(camera) = self.registry.get(index) else {
                continue;
            };
            let Some((frame_id, crop)) = camera.detector().next_awaiting() else {
                continue;
            };
            match self.chars.submit(&crop, (index, frame_id)) {
                Ok(()) => step.char_submitted += 1,
                Err(err) => log::warn!("{}: char submit failed: {:#}", camera.id(), err),
            }
        }
        if self.char_queue.is_empty() {
            let registry = &self.registry;
            self.char_queue.extend(
                (0..registry.len())
                    .filter(|&index| registry.get(index).is_some_and(|c| c.detector().has_awaiting())),
            );
        }
    }

    fn feed_plate_stage(&mut self, step: &mut SchedulerStats) {
        while self.plate.is_ready() {
            let Some(index) = self.plate_queue.pop_front() else {
                break;
            };
            let Some(camera) = self.registry.get(index) else {
                continue;
            };
            let Some(image) = camera.stream().pop_frame() else {
                continue;
            };
            let frame_id = self.next_frame_id;
            self.next_frame_id += 1;
            camera.detector().request_frame(frame_id, image.clone());
            match self.plate.submit(&image, (index, frame_id)) {
                Ok(()) => step.plate_submitted += 1,
                Err(err) => log::warn!("{}: plate submit failed: {:#}", camera.id(), err),
            }
        }
        if self.plate_queue.is_empty() {
            let registry = &self.registry;
            self.plate_queue.extend(
                (0..registry.len())
                    .filter(|&index| registry.get(index).is_some_and(|c| c.detector().is_high_priority())),
            );
        }
    }
}

impl Drop for FleetScheduler {
    fn drop(&mut self) {
        self.plate.shutdown();
        self.chars.shutdown();
    }
}
