//! Asynchronous inference gateway.
//!
//! A gateway owns a fixed number of execution slots, one worker thread and
//! backend instance per slot. `submit` letterboxes the image on the caller's
//! thread, queues the request, and returns. When a worker finishes, the
//! post-processed detections are sent back together with the caller's
//! correlation token on the completion channel handed to `new`.
//!
//! Submission never blocks on inference: callers must check `is_ready()` first
//! and defer when every slot is busy.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;

use super::backend::InferenceBackend;
use super::letterbox::{prepare_input, InputTensor};
use super::postprocess::postprocess;
use super::result::DetectionResult;

/// Static description of one model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelDescriptor {
    pub path: PathBuf,
    /// Model input size as `(width, height)`.
    pub image_size: (u32, u32),
    pub stride: u32,
    pub num_classes: usize,
    /// Maximum concurrent in-flight requests.
    pub slots: usize,
}

/// A finished request: the submitter's token plus what was found.
#[derive(Debug)]
pub struct Completion<T> {
    pub token: T,
    pub result: DetectionResult,
}

struct Request<T> {
    token: T,
    input: InputTensor,
}

/// Decrements the in-flight counter when a request is finished, even if the
/// worker unwinds.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct InferenceGateway<T: Send + 'static> {
    name: String,
    descriptor: ModelDescriptor,
    requests: Option<Sender<Request<T>>>,
    in_flight: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> InferenceGateway<T> {
    /// Start a gateway with `descriptor.slots` workers, each with a backend
    /// built by `make_backend`.
    pub fn new<F>(
        name: &str,
        descriptor: ModelDescriptor,
        mut make_backend: F,
        completions: Sender<Completion<T>>,
    ) -> Result<Self>
    where
        F: FnMut() -> Result<Box<dyn InferenceBackend>>,
    {
        if descriptor.slots == 0 {
            return Err(anyhow!("{}: gateway needs at least one slot", name));
        }
        let (tx, rx) = mpsc::channel::<Request<T>>();
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(descriptor.slots);
        for slot in 0..descriptor.slots {
            let mut backend = make_backend()?;
            backend.warm_up()?;
            let rx = rx.clone();
            let completions = completions.clone();
            let in_flight = in_flight.clone();
            let num_classes = descriptor.num_classes;
            let worker_name = format!("{}-infer-{}", name, slot);
            let join = std::thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    run_worker(&worker_name, backend, rx, completions, in_flight, num_classes)
                })?;
            workers.push(join);
        }
        log::info!(
            "{}: gateway started ({} slots, model {}, input {}x{})",
            name,
            descriptor.slots,
            descriptor.path.display(),
            descriptor.image_size.0,
            descriptor.image_size.1
        );

        Ok(Self {
            name: name.to_string(),
            descriptor,
            requests: Some(tx),
            in_flight,
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    /// True when a slot is free. Never blocks.
    pub fn is_ready(&self) -> bool {
        self.requests.is_some() && self.in_flight() < self.descriptor.slots
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Letterbox `image` and queue it. Returns as soon as the request is queued.
    pub fn submit(&self, image: &RgbImage, token: T) -> Result<()> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| anyhow!("{}: gateway is shut down", self.name))?;
        let input = prepare_input(image, self.descriptor.image_size, self.descriptor.stride);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if requests.send(Request { token, input }).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("{}: inference workers are gone", self.name));
        }
        Ok(())
    }

    /// Wait until every queued request has completed.
    pub fn wait_all(&self) {
        self.wait_all_timeout(Duration::MAX);
    }

    /// Bounded `wait_all`. Returns false if requests were still in flight.
    pub fn wait_all_timeout(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while self.in_flight() > 0 {
            if started.elapsed() >= timeout || self.workers.iter().all(|w| w.is_finished()) {
                return self.in_flight() == 0;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Drain in-flight work, stop the workers and join them.
    pub fn shutdown(&mut self) {
        if self.requests.is_none() {
            return;
        }
        self.wait_all();
        self.requests = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("{}: inference worker panicked", self.name);
            }
        }
        log::info!("{}: gateway stopped", self.name);
    }
}

impl<T: Send + 'static> Drop for InferenceGateway<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T>(
    worker_name: &str,
    mut backend: Box<dyn InferenceBackend>,
    requests: Arc<Mutex<Receiver<Request<T>>>>,
    completions: Sender<Completion<T>>,
    in_flight: Arc<AtomicUsize>,
    num_classes: usize,
) {
    loop {
        let next = match requests.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => {
                log::error!("{}: request queue lock poisoned", worker_name);
                return;
            }
        };
        let Ok(Request { token, input }) = next else {
            // Sender dropped: gateway shut down.
            return;
        };
        let _guard = InFlightGuard(in_flight.clone());

        let result = match backend.infer(&input) {
            Ok(output) => postprocess(&output, num_classes, &input.letterbox),
            Err(err) => {
                log::warn!("{}: {} inference failed: {}", worker_name, backend.name(), err);
                DetectionResult::empty()
            }
        };
        if completions.send(Completion { token, result }).is_err() {
            log::debug!("{}: completion receiver dropped", worker_name);
        }
    }
}
