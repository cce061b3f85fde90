//! Plate events and their delivery.
//!
//! Detectors emit a `PlateEvent` every time their consensus clears the
//! thresholds, so a vehicle standing in front of the camera produces a stream
//! of identical events. `EventThrottle` keeps only the first of those per
//! camera until the string changes or `duplicate_delay` passes. The
//! `EventDispatcher` applies the throttle, builds the notification (with a JPEG
//! snapshot for new events) and hands it to an `EventSink`.
//!
//! Delivery is best-effort: sink failures are logged and the event is dropped.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DUPLICATE_DELAY: Duration = Duration::from_secs(20);
pub const DEFAULT_JPEG_QUALITY: u8 = 50;
/// UTC+3.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 180;

/// A plate recognized by a camera's consensus.
#[derive(Clone, Debug)]
pub struct PlateEvent {
    pub camera_id: String,
    /// Uppercase plate text.
    pub plate: String,
    pub relative_confidence: f32,
    pub count: usize,
    /// Full frame of the most recent timeline entry.
    pub image: Arc<RgbImage>,
    pub detected_at: DateTime<Utc>,
}

// ----------------------------------------------------------------------------
// Throttle
// ----------------------------------------------------------------------------

/// Per-camera de-duplication of repeated reads.
#[derive(Debug)]
pub struct EventThrottle {
    delay: Duration,
    last: HashMap<String, (String, Instant)>,
}

impl EventThrottle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last: HashMap::new(),
        }
    }

    /// Returns true if `plate` is a new event for `camera_id`, and if so
    /// records it as the camera's last forwarded read.
    pub fn check(&mut self, camera_id: &str, plate: &str, now: Instant) -> bool {
        let is_new = match self.last.get(camera_id) {
            Some((last_plate, at)) => {
                last_plate != plate || now.saturating_duration_since(*at) >= self.delay
            }
            None => true,
        };
        if is_new {
            self.last
                .insert(camera_id.to_string(), (plate.to_string(), now));
        }
        is_new
    }
}

// ----------------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------------

/// Body of `POST {acs}/lpr-event/`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LprNotification {
    pub camera_id: String,
    pub license_plate: String,
    /// RFC 3339 in the configured offset.
    pub timestamp: String,
    pub is_new_event: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<String>,
    /// `data:image/jpeg;base64,...` snapshot, new events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Access decision returned by the ACS for a notification.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct AccessVerdict {
    #[serde(default)]
    pub access_granted: bool,
    #[serde(default)]
    pub reason_for_refuse: Option<String>,
    #[serde(default)]
    pub camera_name: Option<String>,
    #[serde(default)]
    pub license_plate: Option<String>,
}

/// Encode `image` as a JPEG data URL.
pub fn jpeg_data_url(image: &RgbImage, quality: u8) -> Result<String> {
    let mut bytes = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode event snapshot")?;
    Ok(format!(
        "data:image/jpeg;base64,{}",
        BASE64.encode(bytes.into_inner())
    ))
}

/// RFC 3339 timestamp in a fixed UTC offset.
pub fn format_timestamp(at: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    at.with_timezone(&offset).to_rfc3339()
}

// ----------------------------------------------------------------------------
// Sinks
// ----------------------------------------------------------------------------

/// Outbound notification boundary.
pub trait EventSink: Send {
    fn name(&self) -> &'static str;

    /// Deliver one notification. An `Ok(None)` means delivered without a
    /// readable verdict.
    fn send(&mut self, notification: &LprNotification) -> Result<Option<AccessVerdict>>;
}

/// Posts notifications to the ACS over HTTP.
pub struct HttpEventSink {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpEventSink {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            endpoint: format!("{}/lpr-event/", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl EventSink for HttpEventSink {
    fn name(&self) -> &'static str {
        "acs-http"
    }

    fn send(&mut self, notification: &LprNotification) -> Result<Option<AccessVerdict>> {
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(notification)
            .map_err(|err| anyhow!("POST {}: {}", self.endpoint, err))?;
        // The verdict body is informational; a body we cannot read is not a
        // delivery failure.
        Ok(response.into_json::<AccessVerdict>().ok())
    }
}

/// Keeps notifications in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    sent: Arc<Mutex<Vec<LprNotification>>>,
    verdict: Option<AccessVerdict>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every notification with `verdict`.
    pub fn with_verdict(verdict: AccessVerdict) -> Self {
        Self {
            sent: Arc::default(),
            verdict: Some(verdict),
        }
    }

    pub fn sent(&self) -> Vec<LprNotification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn send(&mut self, notification: &LprNotification) -> Result<Option<AccessVerdict>> {
        self.sent
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?
            .push(notification.clone());
        Ok(self.verdict.clone())
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct EventSettings {
    pub duplicate_delay: Duration,
    pub jpeg_quality: u8,
    pub utc_offset_minutes: i32,
    /// Also send repeats (as `is_new_event = false`, without a snapshot).
    pub forward_repeats: bool,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            duplicate_delay: DEFAULT_DUPLICATE_DELAY,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            utc_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
            forward_repeats: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub forwarded: u64,
    pub suppressed: u64,
    pub failed: u64,
}

pub struct EventDispatcher {
    settings: EventSettings,
    throttle: EventThrottle,
    sink: Box<dyn EventSink>,
    /// Camera id -> gate id.
    gates: HashMap<String, String>,
    stats: DispatchStats,
}

impl EventDispatcher {
    pub fn new(settings: EventSettings, sink: Box<dyn EventSink>, gates: HashMap<String, String>) -> Self {
        Self {
            throttle: EventThrottle::new(settings.duplicate_delay),
            settings,
            sink,
            gates,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Build the notification for `event`, or `None` when it is a repeat that
    /// should not be forwarded.
    pub fn prepare(&mut self, event: &PlateEvent, now: Instant) -> Option<LprNotification> {
        let is_new = self.throttle.check(&event.camera_id, &event.plate, now);
        if !is_new && !self.settings.forward_repeats {
            return None;
        }
        let image = if is_new {
            match jpeg_data_url(&event.image, self.settings.jpeg_quality) {
                Ok(url) => Some(url),
                Err(err) => {
                    log::warn!("{}: snapshot dropped: {:#}", event.camera_id, err);
                    None
                }
            }
        } else {
            None
        };
        Some(LprNotification {
            camera_id: event.camera_id.clone(),
            license_plate: event.plate.to_uppercase(),
            timestamp: format_timestamp(event.detected_at, self.settings.utc_offset_minutes),
            is_new_event: is_new,
            gate_id: self.gates.get(&event.camera_id).cloned(),
            image,
        })
    }

    /// Throttle and deliver one event. Returns true if it was sent.
    pub fn dispatch(&mut self, event: &PlateEvent, now: Instant) -> bool {
        self.stats.received += 1;
        let Some(notification) = self.prepare(event, now) else {
            self.stats.suppressed += 1;
            log::debug!("{}: repeat read {} suppressed", event.camera_id, event.plate);
            return false;
        };

        log::info!(
            "{}: plate {} ({:.0}% of {} reads, new={})",
            event.camera_id,
            notification.license_plate,
            event.relative_confidence,
            event.count,
            notification.is_new_event
        );
        match self.sink.send(&notification) {
            Ok(verdict) => {
                self.stats.forwarded += 1;
                if let Some(verdict) = verdict {
                    log_verdict(&notification, &verdict);
                }
                true
            }
            Err(err) => {
                self.stats.failed += 1;
                log::error!(
                    "{}: failed to send event via {}: {:#}",
                    event.camera_id,
                    self.sink.name(),
                    err
                );
                false
            }
        }
    }

    /// Run the dispatcher on its own thread until every sender is dropped.
    pub fn spawn(mut self, events: Receiver<PlateEvent>) -> Result<JoinHandle<DispatchStats>> {
        let handle = std::thread::Builder::new()
            .name("lpr-events".to_string())
            .spawn(move || {
                for event in events {
                    self.dispatch(&event, Instant::now());
                }
                self.stats
            })?;
        Ok(handle)
    }
}

fn log_verdict(notification: &LprNotification, verdict: &AccessVerdict) {
    if verdict.access_granted {
        log::info!(
            "{}: access granted for {}",
            notification.camera_id,
            notification.license_plate
        );
    } else {
        log::info!(
            "{}: access denied for {}: {}",
            notification.camera_id,
            notification.license_plate,
            verdict.reason_for_refuse.as_deref().unwrap_or("unknown reason")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(camera: &str, plate: &str) -> PlateEvent {
        PlateEvent {
            camera_id: camera.to_string(),
            plate: plate.to_string(),
            relative_confidence: 90.0,
            count: 5,
            image: Arc::new(RgbImage::new(16, 8)),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn throttle_suppresses_repeats_within_delay() {
        let mut throttle = EventThrottle::new(Duration::from_secs(20));
        let t0 = Instant::now();
        assert!(throttle.check("cam", "A123BC77", t0));
        assert!(!throttle.check("cam", "A123BC77", t0 + Duration::from_secs(19)));
        assert!(throttle.check("cam", "A123BC77", t0 + Duration::from_secs(20)));
        // Another camera has its own history.
        assert!(throttle.check("other", "A123BC77", t0));
        // A different string is always new.
        assert!(throttle.check("cam", "B456CE12", t0 + Duration::from_secs(21)));
    }

    #[test]
    fn new_events_carry_snapshot_and_gate() {
        let sink = MemorySink::new();
        let gates = HashMap::from([("cam".to_string(), "gate-1".to_string())]);
        let mut dispatcher = EventDispatcher::new(EventSettings::default(), Box::new(sink.clone()), gates);
        let now = Instant::now();

        assert!(dispatcher.dispatch(&event("cam", "A123BC77"), now));
        assert!(!dispatcher.dispatch(&event("cam", "A123BC77"), now + Duration::from_secs(1)));

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_new_event);
        assert_eq!(sent[0].gate_id.as_deref(), Some("gate-1"));
        assert!(sent[0]
            .image
            .as_deref()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
        assert!(sent[0].timestamp.ends_with("+03:00"));
        assert_eq!(dispatcher.stats().suppressed, 1);
    }

    #[test]
    fn repeats_forwarded_without_image_when_enabled() {
        let sink = MemorySink::new();
        let settings = EventSettings {
            forward_repeats: true,
            ..EventSettings::default()
        };
        let mut dispatcher = EventDispatcher::new(settings, Box::new(sink.clone()), HashMap::new());
        let now = Instant::now();
        dispatcher.dispatch(&event("cam", "A123BC77"), now);
        dispatcher.dispatch(&event("cam", "A123BC77"), now + Duration::from_secs(1));

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(!sent[1].is_new_event);
        assert!(sent[1].image.is_none());
        assert!(sent[1].gate_id.is_none());
    }

    #[test]
    fn verdict_parses_partial_bodies() {
        let verdict: AccessVerdict =
            serde_json::from_str(r#"{"access_granted": false, "reason_for_refuse": "expired"}"#).unwrap();
        assert!(!verdict.access_granted);
        assert_eq!(verdict.reason_for_refuse.as_deref(), Some("expired"));

        let empty: AccessVerdict = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, AccessVerdict::default());
    }

    #[test]
    fn notification_omits_absent_fields() {
        let notification = LprNotification {
            camera_id: "cam".into(),
            license_plate: "A123BC77".into(),
            timestamp: "2024-01-01T03:00:00+03:00".into(),
            is_new_event: false,
            gate_id: None,
            image: None,
        };
        let json = serde_json::to_value(&notification).unwrap();
        assert!(json.get("image").is_none());
        assert!(json.get("gate_id").is_none());
        assert_eq!(json["license_plate"], "A123BC77");
    }
}
