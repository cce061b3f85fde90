use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::ModelDescriptor;
use crate::detector::{DetectorSettings, RecognitionBorders};
use crate::events::EventSettings;
use crate::ingest::{stream_uri, DEFAULT_RTSP_PORT};

const DEFAULT_PLATE_MODEL: &str = "models/plate.onnx";
const DEFAULT_CHAR_MODEL: &str = "models/char.onnx";
const DEFAULT_PLATE_IMAGE_SIZE: [u32; 2] = [640, 640];
const DEFAULT_CHAR_IMAGE_SIZE: [u32; 2] = [320, 320];
const DEFAULT_STRIDE: u32 = 32;
const DEFAULT_PLATE_CLASSES: usize = 6;
const DEFAULT_CHAR_CLASSES: usize = 23;
const DEFAULT_SLOTS: usize = 2;
const DEFAULT_ACS_BASE_URL: &str = "http://acs:8000/api";
const DEFAULT_ACS_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_IDLE_SLEEP_MS: u64 = 2;

#[derive(Debug, Deserialize, Default)]
struct LprConfigFile {
    models: Option<ModelsConfigFile>,
    detector: Option<DetectorConfigFile>,
    event: Option<EventConfigFile>,
    acs: Option<AcsConfigFile>,
    stream: Option<StreamConfigFile>,
    scheduler: Option<SchedulerConfigFile>,
    cameras: Option<Vec<CameraConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    plate: Option<ModelConfigFile>,
    char: Option<ModelConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<PathBuf>,
    image_size: Option<[u32; 2]>,
    stride: Option<u32>,
    num_classes: Option<usize>,
    slots: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    starving_delay_ms: Option<u64>,
    conf_threshold: Option<f32>,
    count_threshold: Option<usize>,
    jump_threshold: Option<f32>,
    timeline_len: Option<usize>,
    awaiting_len: Option<usize>,
    recognition_borders: Option<RecognitionBorders>,
}

#[derive(Debug, Deserialize, Default)]
struct EventConfigFile {
    duplicate_delay_secs: Option<u64>,
    jpeg_quality: Option<u8>,
    utc_offset_minutes: Option<i32>,
    forward_repeats: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct AcsConfigFile {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    reconnect_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulerConfigFile {
    idle_sleep_ms: Option<u64>,
}

/// One camera. Either `url` or `host` must be given.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_rtsp_port")]
    pub port: u16,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub gate_id: Option<String>,
}

fn default_rtsp_port() -> u16 {
    DEFAULT_RTSP_PORT
}

impl CameraConfig {
    /// Connection URI: `url` as given, otherwise assembled from the parts.
    pub fn stream_uri(&self) -> Result<String> {
        if let Some(url) = self.url.as_deref().filter(|url| !url.trim().is_empty()) {
            return Ok(url.to_string());
        }
        let host = self
            .host
            .as_deref()
            .filter(|host| !host.trim().is_empty())
            .ok_or_else(|| anyhow!("camera {} needs either url or host", self.camera_id))?;
        Ok(stream_uri(
            host,
            self.port,
            &self.path,
            &self.username,
            &self.password,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct AcsSettings {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LprConfig {
    pub plate_model: ModelDescriptor,
    pub char_model: ModelDescriptor,
    pub detector: DetectorSettings,
    pub event: EventSettings,
    pub acs: AcsSettings,
    pub reconnect_delay: Duration,
    pub idle_sleep: Duration,
    /// Inline camera list. `None` means "ask the ACS".
    pub cameras: Option<Vec<CameraConfig>>,
}

impl LprConfig {
    /// Load from the file named by `LPR_CONFIG` (if set), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LPR_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LprConfigFile) -> Result<Self> {
        let models = file.models.unwrap_or_default();
        let plate_model = model_descriptor(
            models.plate.unwrap_or_default(),
            DEFAULT_PLATE_MODEL,
            DEFAULT_PLATE_IMAGE_SIZE,
            DEFAULT_PLATE_CLASSES,
        );
        let char_model = model_descriptor(
            models.char.unwrap_or_default(),
            DEFAULT_CHAR_MODEL,
            DEFAULT_CHAR_IMAGE_SIZE,
            DEFAULT_CHAR_CLASSES,
        );

        let defaults = DetectorSettings::default();
        let detector = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            starving_delay: detector
                .starving_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.starving_delay),
            conf_threshold: detector.conf_threshold.unwrap_or(defaults.conf_threshold),
            count_threshold: detector.count_threshold.unwrap_or(defaults.count_threshold),
            jump_threshold: detector.jump_threshold.unwrap_or(defaults.jump_threshold),
            timeline_len: detector.timeline_len.unwrap_or(defaults.timeline_len),
            awaiting_len: detector.awaiting_len.unwrap_or(defaults.awaiting_len),
            recognition_borders: detector.recognition_borders,
        };

        let defaults = EventSettings::default();
        let event = file.event.unwrap_or_default();
        let event = EventSettings {
            duplicate_delay: event
                .duplicate_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.duplicate_delay),
            jpeg_quality: event.jpeg_quality.unwrap_or(defaults.jpeg_quality),
            utc_offset_minutes: event
                .utc_offset_minutes
                .unwrap_or(defaults.utc_offset_minutes),
            forward_repeats: event.forward_repeats.unwrap_or(defaults.forward_repeats),
        };

        let acs = file.acs.unwrap_or_default();
        let acs = AcsSettings {
            base_url: acs
                .base_url
                .unwrap_or_else(|| DEFAULT_ACS_BASE_URL.to_string()),
            timeout: Duration::from_secs(acs.timeout_secs.unwrap_or(DEFAULT_ACS_TIMEOUT_SECS)),
        };

        let reconnect_delay = Duration::from_secs(
            file.stream
                .and_then(|stream| stream.reconnect_delay_secs)
                .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
        );
        let idle_sleep = Duration::from_millis(
            file.scheduler
                .and_then(|scheduler| scheduler.idle_sleep_ms)
                .unwrap_or(DEFAULT_IDLE_SLEEP_MS),
        );

        Ok(Self {
            plate_model,
            char_model,
            detector,
            event,
            acs,
            reconnect_delay,
            idle_sleep,
            cameras: file.cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("LPR_ACS_BASE_URL") {
            if !url.trim().is_empty() {
                self.acs.base_url = url;
            }
        }
        if let Ok(path) = std::env::var("LPR_PLATE_MODEL") {
            if !path.trim().is_empty() {
                self.plate_model.path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("LPR_CHAR_MODEL") {
            if !path.trim().is_empty() {
                self.char_model.path = PathBuf::from(path);
            }
        }
        if let Ok(delay) = std::env::var("LPR_DUPLICATE_DELAY_SECS") {
            let seconds: u64 = delay.parse().map_err(|_| {
                anyhow!("LPR_DUPLICATE_DELAY_SECS must be an integer number of seconds")
            })?;
            self.event.duplicate_delay = Duration::from_secs(seconds);
        }
        if let Ok(delay) = std::env::var("LPR_RECONNECT_DELAY_SECS") {
            let seconds: u64 = delay.parse().map_err(|_| {
                anyhow!("LPR_RECONNECT_DELAY_SECS must be an integer number of seconds")
            })?;
            self.reconnect_delay = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        validate_model("plate", &self.plate_model)?;
        validate_model("char", &self.char_model)?;

        let detector = &self.detector;
        if !(0.0..100.0).contains(&detector.conf_threshold) {
            return Err(anyhow!("detector.conf_threshold must be in [0, 100)"));
        }
        if detector.count_threshold == 0 {
            return Err(anyhow!("detector.count_threshold must be at least 1"));
        }
        if !(detector.jump_threshold > 0.0) {
            return Err(anyhow!("detector.jump_threshold must be positive"));
        }
        if detector.timeline_len == 0 || detector.awaiting_len == 0 {
            return Err(anyhow!("detector timeline and awaiting lengths must be non-zero"));
        }
        if let Some(borders) = &detector.recognition_borders {
            let in_unit = |v: f32| (0.0..=1.0).contains(&v);
            if !(in_unit(borders.x_min)
                && in_unit(borders.x_max)
                && in_unit(borders.y_min)
                && in_unit(borders.y_max)
                && borders.x_min < borders.x_max
                && borders.y_min < borders.y_max)
            {
                return Err(anyhow!("detector.recognition_borders must be a non-empty region of [0, 1]"));
            }
        }

        if !(1..=100).contains(&self.event.jpeg_quality) {
            return Err(anyhow!("event.jpeg_quality must be in 1..=100"));
        }
        if self.event.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(anyhow!("event.utc_offset_minutes must be within a day"));
        }

        self.acs.base_url = self.acs.base_url.trim_end_matches('/').to_string();
        url::Url::parse(&self.acs.base_url)
            .map_err(|e| anyhow!("invalid acs.base_url {}: {}", self.acs.base_url, e))?;
        if self.acs.timeout.is_zero() {
            return Err(anyhow!("acs.timeout_secs must be greater than zero"));
        }

        if let Some(cameras) = &self.cameras {
            validate_cameras(cameras)?;
        }
        Ok(())
    }
}

fn model_descriptor(
    file: ModelConfigFile,
    default_path: &str,
    default_size: [u32; 2],
    default_classes: usize,
) -> ModelDescriptor {
    let [width, height] = file.image_size.unwrap_or(default_size);
    ModelDescriptor {
        path: file.path.unwrap_or_else(|| PathBuf::from(default_path)),
        image_size: (width, height),
        stride: file.stride.unwrap_or(DEFAULT_STRIDE),
        num_classes: file.num_classes.unwrap_or(default_classes),
        slots: file.slots.unwrap_or(DEFAULT_SLOTS),
    }
}

fn validate_model(name: &str, model: &ModelDescriptor) -> Result<()> {
    if model.path.as_os_str().is_empty() {
        return Err(anyhow!("models.{}.path must not be empty", name));
    }
    let (width, height) = model.image_size;
    if width == 0 || height == 0 || model.stride == 0 {
        return Err(anyhow!("models.{}: image size and stride must be non-zero", name));
    }
    if width % model.stride != 0 || height % model.stride != 0 {
        return Err(anyhow!(
            "models.{}: image size {}x{} is not a multiple of stride {}",
            name,
            width,
            height,
            model.stride
        ));
    }
    if model.num_classes == 0 {
        return Err(anyhow!("models.{}.num_classes must be non-zero", name));
    }
    if model.slots == 0 {
        return Err(anyhow!("models.{}.slots must be non-zero", name));
    }
    Ok(())
}

/// Camera ids must be unique and every camera must be reachable.
pub fn validate_cameras(cameras: &[CameraConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for camera in cameras {
        if camera.camera_id.trim().is_empty() {
            return Err(anyhow!("camera_id must not be empty"));
        }
        if !seen.insert(camera.camera_id.as_str()) {
            return Err(anyhow!("duplicate camera_id {}", camera.camera_id));
        }
        camera.stream_uri()?;
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<LprConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
