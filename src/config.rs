use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::classify::{
    ClassifierConfig, DEFAULT_CONF_THRES_OBJECT, DEFAULT_CONF_THRES_PERSON,
    DEFAULT_FG_RATIO_THRESHOLD, DEFAULT_IOU_THRESHOLD,
};
use crate::detect::{BackendRegistry, ForegroundEstimator, RunningAverageBackground, StubBackend};
use crate::state_machine::{AlertPolicy, DEFAULT_ANOMALY_THRESHOLD_SECS};
use crate::traversal::{DEFAULT_FILE_PREFIX, DEFAULT_JPEG_QUALITY};

const DEFAULT_TARGET_FPS: f64 = 2.0;
const DEFAULT_SAMPLE_PER_100: i32 = 20;
const DEFAULT_SEATS_PATH: &str = "seats.json";
const DEFAULT_STATES_PATH: &str = "runtime/seat_states.jsonl";
const DEFAULT_LATEST_PATH: &str = "runtime/last_frame.json";
const DEFAULT_FRAMES_ROOT: &str = "data/frames";
const DEFAULT_DB_PATH: &str = "seatwatch.db";
const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;
const DEFAULT_CHECKPOINT_EVERY: u64 = 500;
const KNOWN_BACKENDS: [&str; 2] = ["stub", "tract"];

#[derive(Debug, Deserialize, Default)]
struct SeatwatchConfigFile {
    source: Option<SourceConfigFile>,
    seats: Option<SeatsConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    foreground: Option<ForegroundConfigFile>,
    detector: Option<DetectorConfigFile>,
    state: Option<StateConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    input: Option<String>,
    mode: Option<String>,
    target_fps: Option<f64>,
    sample_per_100: Option<i32>,
    start: Option<u64>,
    end: Option<u64>,
    max_frames: Option<u64>,
    image_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SeatsConfigFile {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    iou_threshold: Option<f32>,
    conf_thres_person: Option<f32>,
    conf_thres_object: Option<f32>,
    fg_ratio_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ForegroundConfigFile {
    enabled: Option<bool>,
    alpha: Option<f32>,
    threshold: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    script_path: Option<PathBuf>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    conf_threshold: Option<f32>,
    nms_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct StateConfigFile {
    anomaly_threshold_secs: Option<f64>,
    alert_policy: Option<String>,
    checkpoint_every: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    states_path: Option<PathBuf>,
    latest_path: Option<PathBuf>,
    frames_root: Option<PathBuf>,
    db_path: Option<String>,
    jpeg_quality: Option<u32>,
    file_prefix: Option<String>,
}

/// How the input is traversed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraversalMode {
    /// Directories are read as images, everything else is streamed.
    #[default]
    Auto,
    Stream,
    Extract,
    Images,
}

impl FromStr for TraversalMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(TraversalMode::Auto),
            "stream" => Ok(TraversalMode::Stream),
            "extract" => Ok(TraversalMode::Extract),
            "images" => Ok(TraversalMode::Images),
            other => Err(anyhow!(
                "unknown traversal mode '{}' (expected auto, stream, extract or images)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub input: Option<String>,
    pub mode: TraversalMode,
    pub target_fps: f64,
    pub sample_per_100: i32,
    pub start: u64,
    pub end: Option<u64>,
    pub max_frames: Option<u64>,
    /// Capture rate assumed for image directories, for timestamps.
    pub image_fps: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ForegroundSettings {
    pub enabled: bool,
    pub alpha: f32,
    pub threshold: u8,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub script_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub conf_threshold: Option<f32>,
    pub nms_threshold: Option<f32>,
}

impl ForegroundSettings {
    /// Estimator for these settings, or `None` when disabled.
    pub fn build(&self) -> Option<Box<dyn ForegroundEstimator>> {
        if !self.enabled {
            return None;
        }
        Some(Box::new(RunningAverageBackground::new(
            self.alpha,
            self.threshold,
        )))
    }
}

impl DetectorSettings {
    /// Registry holding the configured backend as its default.
    pub fn build_registry(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        match self.backend.as_str() {
            "stub" => {
                let stub = match &self.script_path {
                    Some(path) => StubBackend::from_script_file(path)?,
                    None => {
                        log::warn!("stub detector without a script: every frame has no detections");
                        StubBackend::new()
                    }
                };
                registry.register(stub);
            }
            "tract" => self.register_tract(&mut registry)?,
            other => return Err(anyhow!("unknown detector backend '{}'", other)),
        }
        registry.warm_up()?;
        Ok(registry)
    }

    #[cfg(feature = "backend-tract")]
    fn register_tract(&self, registry: &mut BackendRegistry) -> Result<()> {
        let model_path = self
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow!("detector backend 'tract' needs detector.model_path"))?;
        let mut backend = crate::detect::TractBackend::new(model_path, self.input_size)?;
        if let Some(conf) = self.conf_threshold {
            backend = backend.with_threshold(conf);
        }
        if let Some(nms) = self.nms_threshold {
            backend = backend.with_nms_threshold(nms);
        }
        registry.register(backend);
        Ok(())
    }

    #[cfg(not(feature = "backend-tract"))]
    fn register_tract(&self, _registry: &mut BackendRegistry) -> Result<()> {
        Err(anyhow!("detector backend 'tract' requires the backend-tract feature"))
    }
}

#[derive(Debug, Clone)]
pub struct StateSettings {
    pub anomaly_threshold_secs: f64,
    pub alert_policy: AlertPolicy,
    /// Save a state-machine checkpoint every this many processed frames. 0 disables.
    pub checkpoint_every: u64,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub states_path: PathBuf,
    pub latest_path: PathBuf,
    pub frames_root: PathBuf,
    pub db_path: String,
    pub jpeg_quality: u8,
    pub file_prefix: String,
}

#[derive(Debug, Clone)]
pub struct SeatwatchConfig {
    pub source: SourceSettings,
    pub seats_path: PathBuf,
    pub classifier: ClassifierConfig,
    pub foreground: ForegroundSettings,
    pub detector: DetectorSettings,
    pub state: StateSettings,
    pub output: OutputSettings,
}

impl SeatwatchConfig {
    /// Load from the TOML file named by `SEATWATCH_CONFIG` (if set), then
    /// apply `SEATWATCH_*` environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SEATWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Built-in defaults with no file and no environment.
    pub fn defaults() -> Result<Self> {
        Self::from_file(SeatwatchConfigFile::default())
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

    fn from_file(file: SeatwatchConfigFile) -> Result<Self> {
        let src = file.source.unwrap_or_default();
        let source = SourceSettings {
            input: src.input,
            mode: src.mode.as_deref().map(str::parse).transpose()?.unwrap_or_default(),
            target_fps: src.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            sample_per_100: src.sample_per_100.unwrap_or(DEFAULT_SAMPLE_PER_100),
            start: src.start.unwrap_or(0),
            end: src.end,
            max_frames: src.max_frames,
            image_fps: src.image_fps,
        };
        let seats_path = file
            .seats
            .and_then(|seats| seats.path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SEATS_PATH));

        let cls = file.classifier.unwrap_or_default();
        let classifier = ClassifierConfig {
            iou_threshold: cls.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            conf_thres_person: cls.conf_thres_person.unwrap_or(DEFAULT_CONF_THRES_PERSON),
            conf_thres_object: cls.conf_thres_object.unwrap_or(DEFAULT_CONF_THRES_OBJECT),
            fg_ratio_threshold: cls.fg_ratio_threshold.unwrap_or(DEFAULT_FG_RATIO_THRESHOLD),
        };

        let fg = file.foreground.unwrap_or_default();
        let foreground = ForegroundSettings {
            enabled: fg.enabled.unwrap_or(true),
            alpha: fg.alpha.unwrap_or(RunningAverageBackground::DEFAULT_ALPHA),
            threshold: fg.threshold.unwrap_or(RunningAverageBackground::DEFAULT_THRESHOLD),
        };

        let det = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: det
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            script_path: det.script_path,
            model_path: det.model_path,
            input_size: det.input_size.unwrap_or(DEFAULT_MODEL_INPUT_SIZE),
            conf_threshold: det.conf_threshold,
            nms_threshold: det.nms_threshold,
        };

        let st = file.state.unwrap_or_default();
        let state = StateSettings {
            anomaly_threshold_secs: st
                .anomaly_threshold_secs
                .unwrap_or(DEFAULT_ANOMALY_THRESHOLD_SECS),
            alert_policy: st
                .alert_policy
                .as_deref()
                .map(str::parse)
                .transpose()?
                .unwrap_or_default(),
            checkpoint_every: st.checkpoint_every.unwrap_or(DEFAULT_CHECKPOINT_EVERY),
        };

        let out = file.output.unwrap_or_default();
        let output = OutputSettings {
            states_path: out
                .states_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATES_PATH)),
            latest_path: out
                .latest_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LATEST_PATH)),
            frames_root: out
                .frames_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FRAMES_ROOT)),
            db_path: out.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            jpeg_quality: out
                .jpeg_quality
                .map_or(DEFAULT_JPEG_QUALITY, |q| q.clamp(1, 100) as u8),
            file_prefix: out
                .file_prefix
                .unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string()),
        };

        Ok(Self {
            source,
            seats_path,
            classifier,
            foreground,
            detector,
            state,
            output,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(input) = std::env::var("SEATWATCH_INPUT") {
            if !input.trim().is_empty() {
                self.source.input = Some(input);
            }
        }
        if let Ok(path) = std::env::var("SEATWATCH_SEATS") {
            if !path.trim().is_empty() {
                self.seats_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("SEATWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.output.db_path = path;
            }
        }
        if let Ok(path) = std::env::var("SEATWATCH_STATES_PATH") {
            if !path.trim().is_empty() {
                self.output.states_path = PathBuf::from(path);
            }
        }
        if let Ok(max) = std::env::var("SEATWATCH_MAX_FRAMES") {
            let max: u64 = max
                .trim()
                .parse()
                .map_err(|_| anyhow!("SEATWATCH_MAX_FRAMES must be a non-negative integer"))?;
            self.source.max_frames = (max > 0).then_some(max);
        }
        if let Ok(secs) = std::env::var("SEATWATCH_ANOMALY_SECS") {
            self.state.anomaly_threshold_secs = secs
                .trim()
                .parse()
                .map_err(|_| anyhow!("SEATWATCH_ANOMALY_SECS must be a number of seconds"))?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        self.classifier.validate()?;
        if !(self.state.anomaly_threshold_secs > 0.0) {
            return Err(anyhow!("anomaly_threshold_secs must be greater than zero"));
        }
        if !(self.foreground.alpha > 0.0 && self.foreground.alpha <= 1.0) {
            return Err(anyhow!("foreground alpha must be in (0, 1]"));
        }
        if self.source.target_fps.is_nan() {
            return Err(anyhow!("target_fps must be a number"));
        }
        if let Some(end) = self.source.end {
            if end < self.source.start {
                return Err(anyhow!(
                    "source end ({}) is before start ({})",
                    end,
                    self.source.start
                ));
            }
        }
        self.detector.backend = self.detector.backend.trim().to_ascii_lowercase();
        if !KNOWN_BACKENDS.contains(&self.detector.backend.as_str()) {
            return Err(anyhow!(
                "unknown detector backend '{}' (expected one of {})",
                self.detector.backend,
                KNOWN_BACKENDS.join(", ")
            ));
        }
        if self.detector.backend == "tract" && self.detector.model_path.is_none() {
            return Err(anyhow!("detector backend 'tract' needs detector.model_path"));
        }
        self.output.jpeg_quality = self.output.jpeg_quality.clamp(1, 100);
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SeatwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
