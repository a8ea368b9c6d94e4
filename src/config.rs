use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SOCKET_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:5001";
const DEFAULT_MODEL_PATH: &str = "yolov5n.onnx";
const DEFAULT_MODEL_NAME: &str = "YOLOv5n";
const DEFAULT_CONF_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_TARGET_WIDTH: u32 = 320;
const DEFAULT_TARGET_HEIGHT: u32 = 240;
const DEFAULT_TARGET_FPS: u32 = 15;
const DEFAULT_QUEUE_CAPACITY: usize = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

const ENV_KEYS: &[&str] = &[
    "RELAY_SOCKET_ADDR",
    "RELAY_HTTP_ADDR",
    "RELAY_MODEL_PATH",
    "RELAY_MODEL_NAME",
    "RELAY_BACKEND",
    "RELAY_CONF_THRESHOLD",
    "RELAY_IOU_THRESHOLD",
    "RELAY_TARGET_SIZE",
    "RELAY_TARGET_FPS",
    "RELAY_QUEUE_CAPACITY",
    "RELAY_POLL_INTERVAL_MS",
];

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    socket_addr: Option<String>,
    http_addr: Option<String>,
    model: Option<ModelConfigFile>,
    detector: Option<DetectorConfigFile>,
    queue: Option<QueueConfigFile>,
    health: Option<HealthConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<String>,
    name: Option<String>,
    backend: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    conf_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    target_width: Option<u32>,
    target_height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    capacity: Option<usize>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct HealthConfigFile {
    failure_threshold: Option<u32>,
}

/// Which detector implementation to construct at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Stub,
    Tract,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Stub => "stub",
            BackendKind::Tract => "tract",
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "backend-tract") {
            BackendKind::Tract
        } else {
            BackendKind::Stub
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(BackendKind::Stub),
            "tract" | "onnx" => Ok(BackendKind::Tract),
            other => Err(anyhow!(
                "unknown detector backend '{}'; expected 'stub' or 'tract'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub path: String,
    pub name: String,
    pub backend: BackendKind,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub target_width: u32,
    pub target_height: u32,
    /// Advertised to clients only. The relay does not throttle to this rate.
    pub target_fps: u32,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    /// How long the worker blocks on an empty queue before re-checking shutdown.
    pub poll_interval: Duration,
}

/// Process-wide configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub socket_addr: String,
    pub http_addr: String,
    pub model: ModelSettings,
    pub detector: DetectorSettings,
    pub queue: QueueSettings,
    /// Consecutive detector failures before health reports `degraded`.
    pub failure_threshold: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        // An empty file section resolves every field to its default.
        Self::from_file(RelayConfigFile::default())
    }
}

impl RelayConfig {
    /// Load from `RELAY_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RELAY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RelayConfigFile::default(),
        };
        let file_backend = file_cfg
            .model
            .as_ref()
            .and_then(|model| model.backend.clone());
        let mut cfg = Self::from_file(file_cfg);
        if let Some(backend) = file_backend {
            cfg.model.backend = backend.parse()?;
        }
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Names of every environment variable consulted by `load`.
    pub fn env_keys() -> &'static [&'static str] {
        ENV_KEYS
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let model = file.model.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let queue = file.queue.unwrap_or_default();
        Self {
            socket_addr: file
                .socket_addr
                .unwrap_or_else(|| DEFAULT_SOCKET_ADDR.to_string()),
            http_addr: file
                .http_addr
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            model: ModelSettings {
                path: model.path.unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
                name: model.name.unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
                backend: BackendKind::default(),
            },
            detector: DetectorSettings {
                conf_threshold: detector.conf_threshold.unwrap_or(DEFAULT_CONF_THRESHOLD),
                iou_threshold: detector.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
                target_width: detector.target_width.unwrap_or(DEFAULT_TARGET_WIDTH),
                target_height: detector.target_height.unwrap_or(DEFAULT_TARGET_HEIGHT),
                target_fps: detector.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            },
            queue: QueueSettings {
                capacity: queue.capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                poll_interval: Duration::from_millis(
                    queue.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
            },
            failure_threshold: file
                .health
                .and_then(|health| health.failure_threshold)
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("RELAY_SOCKET_ADDR") {
            self.socket_addr = addr;
        }
        if let Some(addr) = non_empty_env("RELAY_HTTP_ADDR") {
            self.http_addr = addr;
        }
        if let Some(path) = non_empty_env("RELAY_MODEL_PATH") {
            self.model.path = path;
        }
        if let Some(name) = non_empty_env("RELAY_MODEL_NAME") {
            self.model.name = name;
        }
        if let Some(backend) = non_empty_env("RELAY_BACKEND") {
            self.model.backend = backend.parse()?;
        }
        if let Some(value) = non_empty_env("RELAY_CONF_THRESHOLD") {
            self.detector.conf_threshold = value
                .parse()
                .map_err(|_| anyhow!("RELAY_CONF_THRESHOLD must be a number in [0, 1]"))?;
        }
        if let Some(value) = non_empty_env("RELAY_IOU_THRESHOLD") {
            self.detector.iou_threshold = value
                .parse()
                .map_err(|_| anyhow!("RELAY_IOU_THRESHOLD must be a number in [0, 1]"))?;
        }
        if let Some(value) = non_empty_env("RELAY_TARGET_SIZE") {
            let (width, height) = parse_size(&value)?;
            self.detector.target_width = width;
            self.detector.target_height = height;
        }
        if let Some(value) = non_empty_env("RELAY_TARGET_FPS") {
            self.detector.target_fps = value
                .parse()
                .map_err(|_| anyhow!("RELAY_TARGET_FPS must be a positive integer"))?;
        }
        if let Some(value) = non_empty_env("RELAY_QUEUE_CAPACITY") {
            self.queue.capacity = value
                .parse()
                .map_err(|_| anyhow!("RELAY_QUEUE_CAPACITY must be a positive integer"))?;
        }
        if let Some(value) = non_empty_env("RELAY_POLL_INTERVAL_MS") {
            let millis: u64 = value.parse().map_err(|_| {
                anyhow!("RELAY_POLL_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.queue.poll_interval = Duration::from_millis(millis);
        }
        Ok(())
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        parse_addr("socket_addr", &self.socket_addr)?;
        parse_addr("http_addr", &self.http_addr)?;
        if self.queue.capacity == 0 {
            return Err(anyhow!("queue capacity must be at least 1"));
        }
        if self.queue.poll_interval.is_zero() {
            return Err(anyhow!("queue poll interval must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.conf_threshold) {
            return Err(anyhow!(
                "confidence threshold {} is outside [0, 1]",
                self.detector.conf_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.detector.iou_threshold) {
            return Err(anyhow!(
                "IoU threshold {} is outside [0, 1]",
                self.detector.iou_threshold
            ));
        }
        if self.detector.target_width == 0 || self.detector.target_height == 0 {
            return Err(anyhow!("target size must be non-zero"));
        }
        if self.detector.target_fps == 0 {
            return Err(anyhow!("target fps must be >= 1"));
        }
        if self.failure_threshold == 0 {
            return Err(anyhow!("health failure threshold must be >= 1"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|_| anyhow!("{} '{}' is not a socket address", field, value))
}

fn parse_size(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("RELAY_TARGET_SIZE must look like WIDTHxHEIGHT"))?;
    let width = w
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid target width '{}'", w))?;
    let height = h
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid target height '{}'", h))?;
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_advertised_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.detector.conf_threshold, 0.25);
        assert_eq!(cfg.detector.target_width, 320);
        assert_eq!(cfg.detector.target_height, 240);
        assert_eq!(cfg.detector.target_fps, 15);
        assert_eq!(cfg.queue.capacity, 10);
        assert_eq!(cfg.model.name, "YOLOv5n");
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_size_accepts_either_separator_case() {
        assert_eq!(parse_size("640x480").unwrap(), (640, 480));
        assert_eq!(parse_size(" 320 X 240 ").unwrap(), (320, 240));
        assert!(parse_size("640").is_err());
        assert!(parse_size("ax10").is_err());
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut cfg = RelayConfig::default();
        cfg.queue.capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut cfg = RelayConfig::default();
        cfg.detector.conf_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("STUB".parse::<BackendKind>().unwrap(), BackendKind::Stub);
        assert_eq!("onnx".parse::<BackendKind>().unwrap(), BackendKind::Tract);
        assert!("cuda".parse::<BackendKind>().is_err());
    }
}
