//! Live camera stream with a single-frame slot.
//!
//! Each `Stream` runs a capture thread that decodes frames as fast as the
//! camera delivers them and keeps only the newest one. Consumers take it with
//! `pop_frame`, which clears the slot; a frame nobody popped is overwritten by
//! the next one.
//!
//! When the connection fails the capture thread exits and marks the stream as
//! dropped. The next `pop_frame` starts a new capture thread that waits the
//! reconnect delay before connecting again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;

use super::rtsp::{redact, RtspConfig, RtspSource};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Granularity at which a waiting capture thread checks for shutdown.
const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, PartialEq)]
pub struct StreamStats {
    pub frames_captured: u64,
    pub reconnects: u64,
    pub is_open: bool,
    /// Time since the last decoded frame.
    pub last_frame_age: Option<Duration>,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Option<Arc<RgbImage>>>,
    last_frame_at: Mutex<Option<Instant>>,
    open: AtomicBool,
    dropped: AtomicBool,
    stop: AtomicBool,
    frames_captured: AtomicU64,
}

pub struct Stream {
    camera_id: String,
    config: RtspConfig,
    reconnect_delay: Duration,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    reconnects: AtomicU64,
}

impl Stream {
    /// Start capturing from `config.url`.
    pub fn open(camera_id: impl Into<String>, config: RtspConfig, reconnect_delay: Duration) -> Result<Self> {
        let stream = Self {
            camera_id: camera_id.into(),
            config,
            reconnect_delay,
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
            reconnects: AtomicU64::new(0),
        };
        stream.spawn_capture(None)?;
        Ok(stream)
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Take the newest frame, if one arrived since the last call.
    ///
    /// On a dropped connection this schedules a reconnect and returns `None`.
    pub fn pop_frame(&self) -> Option<Arc<RgbImage>> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return None;
        }
        if self.shared.dropped.swap(false, Ordering::SeqCst) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if let Err(err) = self.spawn_capture(Some(self.reconnect_delay)) {
                log::error!("{}: failed to restart capture: {:#}", self.camera_id, err);
                self.shared.dropped.store(true, Ordering::SeqCst);
            }
            return None;
        }
        self.shared.slot.lock().ok()?.take()
    }

    pub fn stats(&self) -> StreamStats {
        let last_frame_at = self.shared.last_frame_at.lock().ok().and_then(|at| *at);
        StreamStats {
            frames_captured: self.shared.frames_captured.load(Ordering::SeqCst),
            reconnects: self.reconnects.load(Ordering::SeqCst),
            is_open: self.is_open(),
            last_frame_age: last_frame_at.map(|at| at.elapsed()),
        }
    }

    /// Stop capturing and join the capture thread. Safe to call repeatedly.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("{}: capture thread panicked", self.camera_id);
            }
            log::info!("{}: stream closed", self.camera_id);
        }
    }

    fn spawn_capture(&self, delay: Option<Duration>) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| anyhow!("{}: stream worker lock poisoned", self.camera_id))?;
        // The previous thread has already marked the stream dropped and is
        // on its way out.
        if let Some(previous) = worker.take() {
            let _ = previous.join();
        }
        let camera_id = self.camera_id.clone();
        let config = self.config.clone();
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", camera_id))
            .spawn(move || run_capture(&camera_id, config, &shared, delay))?;
        *worker = Some(handle);
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_capture(camera_id: &str, config: RtspConfig, shared: &Shared, delay: Option<Duration>) {
    if let Some(delay) = delay {
        log::warn!("{}: reconnecting in {:?}", camera_id, delay);
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if shared.stop.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(STOP_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
    if shared.stop.load(Ordering::SeqCst) {
        return;
    }

    match connect(&config) {
        Ok(mut source) => {
            shared.open.store(true, Ordering::SeqCst);
            log::info!("{}: stream connected to {}", camera_id, redact(&config.url));
            while !shared.stop.load(Ordering::SeqCst) {
                match source.next_frame() {
                    Ok(image) => {
                        if let Ok(mut slot) = shared.slot.lock() {
                            *slot = Some(Arc::new(image));
                        }
                        if let Ok(mut at) = shared.last_frame_at.lock() {
                            *at = Some(Instant::now());
                        }
                        shared.frames_captured.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => {
                        log::warn!("{}: error reading stream: {:#}", camera_id, err);
                        break;
                    }
                }
            }
        }
        Err(err) => log::warn!("{}: failed to connect: {:#}", camera_id, err),
    }

    if !shared.stop.load(Ordering::SeqCst) {
        log::warn!("{}: stream disconnected", camera_id);
        if let Ok(mut slot) = shared.slot.lock() {
            slot.take();
        }
        shared.dropped.store(true, Ordering::SeqCst);
    }
    shared.open.store(false, Ordering::SeqCst);
}

fn connect(config: &RtspConfig) -> Result<RtspSource> {
    let mut source = RtspSource::new(config.clone())?;
    source.connect()?;
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn pop_frame_takes_and_clears_the_slot() -> Result<()> {
        // One frame now, the next a second later.
        let config = RtspConfig::from_url("stub://cam?fps=1&width=32&height=24")?;
        let stream = Stream::open("cam", config, Duration::from_secs(60))?;
        assert!(wait_for(Duration::from_secs(5), || stream.stats().frames_captured >= 1));

        let frame = stream.pop_frame().expect("first frame");
        assert_eq!(frame.dimensions(), (32, 24));
        assert!(stream.pop_frame().is_none());
        stream.close();
        Ok(())
    }

    #[test]
    fn dropped_stream_reconnects_on_pop() -> Result<()> {
        let config = RtspConfig::from_url("stub://cam?fps=0&width=8&height=8&frames=2")?;
        let stream = Stream::open("cam", config, Duration::from_millis(10))?;
        assert!(wait_for(Duration::from_secs(5), || {
            stream.stats().frames_captured == 2 && !stream.is_open()
        }));

        // First pop after the drop restarts capture and returns nothing.
        assert!(stream.pop_frame().is_none());
        assert_eq!(stream.stats().reconnects, 1);
        assert!(wait_for(Duration::from_secs(5), || stream.stats().frames_captured == 4));
        stream.close();
        Ok(())
    }

    #[test]
    fn close_is_idempotent_and_stops_capture() -> Result<()> {
        let config = RtspConfig::from_url("stub://cam?fps=100&width=8&height=8")?;
        let stream = Stream::open("cam", config, DEFAULT_RECONNECT_DELAY)?;
        assert!(wait_for(Duration::from_secs(5), || stream.is_open()));
        stream.close();
        stream.close();
        assert!(!stream.is_open());
        let captured = stream.stats().frames_captured;
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(stream.stats().frames_captured, captured);
        assert!(stream.pop_frame().is_none());
        Ok(())
    }
}
