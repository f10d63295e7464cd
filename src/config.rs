use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::fall::FallSettings;
use crate::frame::Color;
use crate::ingest::{CameraSettings, FrameRotation};
use crate::notify::MqttSettings;
use crate::pipeline::PipelineSettings;
use crate::pose::{PoseBackendKind, PoseSettings};
use crate::redact::RedactionSettings;
use crate::servo::{ServoBackendKind, ServoCalibration, ServoSettings};
use crate::tracking::TrackingSettings;

pub const CONFIG_ENV: &str = "FALLWATCH_CONFIG";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FallwatchConfigFile {
    camera: Option<CameraFile>,
    pose: Option<PoseFile>,
    fall: Option<FallFile>,
    servo: Option<ServoFile>,
    tracking: Option<TrackingFile>,
    redaction: Option<RedactionFile>,
    pipeline: Option<PipelineFile>,
    api: Option<ApiFile>,
    mqtt: Option<MqttFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    rotation: Option<FrameRotation>,
}

#[derive(Debug, Deserialize, Default)]
struct PoseFile {
    backend: Option<PoseBackendKind>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FallFile {
    angle_threshold_deg: Option<f32>,
    min_confidence: Option<f32>,
    confirm_after_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServoFile {
    backend: Option<ServoBackendKind>,
    pwm_chip: Option<u32>,
    pwm_channel: Option<u32>,
    frequency_hz: Option<f64>,
    clockwise_duty: Option<f64>,
    counter_clockwise_duty: Option<f64>,
    neutral_duty: Option<f64>,
    pulse_secs: Option<f64>,
    settle_secs: Option<f64>,
    neutral_hold_secs: Option<f64>,
    stabilize_secs: Option<f64>,
    custom_settle_secs: Option<f64>,
    tracking_hold_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingFile {
    auto_enabled: Option<bool>,
    movement_delay_secs: Option<f64>,
    dead_zone_px: Option<u32>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RedactionFile {
    enabled: Option<bool>,
    min_confidence: Option<f32>,
    pad_side_px: Option<i32>,
    pad_top_px: Option<i32>,
    pad_bottom_px: Option<i32>,
    color: Option<Color>,
    smoothing_factor: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineFile {
    jpeg_quality: Option<u8>,
    max_consecutive_failures: Option<u32>,
    draw_keypoints: Option<bool>,
    keypoint_draw_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
    require_token: Option<bool>,
    max_streams: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttFile {
    broker: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Everything `fallwatchd` needs, resolved from file, env, and defaults.
#[derive(Debug, Clone, Default)]
pub struct FallwatchConfig {
    pub camera: CameraSettings,
    pub pose: PoseSettings,
    pub fall: FallSettings,
    pub servo: ServoSettings,
    pub tracking: TrackingSettings,
    pub redaction: RedactionSettings,
    pub pipeline: PipelineSettings,
    pub api: ApiConfig,
    /// `None` keeps fall events on the log sink only.
    pub mqtt: Option<MqttSettings>,
}

impl FallwatchConfig {
    /// File named by `FALLWATCH_CONFIG` (if set), then env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).ok().filter(|p| !p.trim().is_empty());
        Self::load_from(path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => FallwatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FallwatchConfigFile) -> Result<Self> {
        let mut cfg = Self::default();

        let camera = file.camera.unwrap_or_default();
        cfg.camera.source = camera.source.unwrap_or(cfg.camera.source);
        cfg.camera.width = camera.width.unwrap_or(cfg.camera.width);
        cfg.camera.height = camera.height.unwrap_or(cfg.camera.height);
        cfg.camera.target_fps = camera.target_fps.unwrap_or(cfg.camera.target_fps);
        cfg.camera.rotation = camera.rotation.unwrap_or(cfg.camera.rotation);

        let pose = file.pose.unwrap_or_default();
        cfg.pose.backend = pose.backend.unwrap_or(cfg.pose.backend);
        cfg.pose.model_path = pose.model_path.or(cfg.pose.model_path);
        cfg.pose.input_size = pose.input_size.unwrap_or(cfg.pose.input_size);

        let fall = file.fall.unwrap_or_default();
        cfg.fall.angle_threshold_deg = fall
            .angle_threshold_deg
            .unwrap_or(cfg.fall.angle_threshold_deg);
        cfg.fall.min_confidence = fall.min_confidence.unwrap_or(cfg.fall.min_confidence);
        if let Some(secs) = fall.confirm_after_secs {
            cfg.fall.confirm_after = seconds("fall.confirm_after_secs", secs)?;
        }

        let servo = file.servo.unwrap_or_default();
        cfg.servo.backend = servo.backend.unwrap_or(cfg.servo.backend);
        cfg.servo.pwm_chip = servo.pwm_chip.unwrap_or(cfg.servo.pwm_chip);
        cfg.servo.pwm_channel = servo.pwm_channel.unwrap_or(cfg.servo.pwm_channel);
        cfg.servo.calibration = calibration_from_file(&servo)?;

        let tracking = file.tracking.unwrap_or_default();
        cfg.tracking.auto_enabled = tracking.auto_enabled.unwrap_or(cfg.tracking.auto_enabled);
        if let Some(secs) = tracking.movement_delay_secs {
            cfg.tracking.movement_delay = seconds("tracking.movement_delay_secs", secs)?;
        }
        cfg.tracking.dead_zone_px = tracking.dead_zone_px.unwrap_or(cfg.tracking.dead_zone_px);
        cfg.tracking.min_confidence = tracking
            .min_confidence
            .unwrap_or(cfg.tracking.min_confidence);

        let redaction = file.redaction.unwrap_or_default();
        cfg.redaction.enabled = redaction.enabled.unwrap_or(cfg.redaction.enabled);
        cfg.redaction.min_confidence = redaction
            .min_confidence
            .unwrap_or(cfg.redaction.min_confidence);
        cfg.redaction.pad_side_px = redaction.pad_side_px.unwrap_or(cfg.redaction.pad_side_px);
        cfg.redaction.pad_top_px = redaction.pad_top_px.unwrap_or(cfg.redaction.pad_top_px);
        cfg.redaction.pad_bottom_px = redaction
            .pad_bottom_px
            .unwrap_or(cfg.redaction.pad_bottom_px);
        cfg.redaction.color = redaction.color.unwrap_or(cfg.redaction.color);
        cfg.redaction.smoothing_factor = redaction.smoothing_factor;

        let pipeline = file.pipeline.unwrap_or_default();
        cfg.pipeline.jpeg_quality = pipeline.jpeg_quality.unwrap_or(cfg.pipeline.jpeg_quality);
        cfg.pipeline.max_consecutive_failures = pipeline
            .max_consecutive_failures
            .unwrap_or(cfg.pipeline.max_consecutive_failures);
        cfg.pipeline.draw_keypoints = pipeline
            .draw_keypoints
            .unwrap_or(cfg.pipeline.draw_keypoints);
        cfg.pipeline.keypoint_draw_confidence = pipeline
            .keypoint_draw_confidence
            .unwrap_or(cfg.pipeline.keypoint_draw_confidence);

        let api = file.api.unwrap_or_default();
        cfg.api.addr = api.addr.unwrap_or(cfg.api.addr);
        cfg.api.token_path = api.token_path;
        cfg.api.require_token = api.require_token.unwrap_or(cfg.api.require_token);
        cfg.api.max_streams = api.max_streams.unwrap_or(cfg.api.max_streams);

        cfg.mqtt = match file.mqtt {
            Some(mqtt) => Some(mqtt_from_file(mqtt)?),
            None => None,
        };
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = env_value("FALLWATCH_CAMERA") {
            self.camera.source = source;
        }
        if let Some(addr) = env_value("FALLWATCH_STREAM_ADDR") {
            self.api.addr = addr;
        }
        if let Some(path) = env_value("FALLWATCH_TOKEN_PATH") {
            self.api.token_path = Some(PathBuf::from(path));
        }
        if let Some(backend) = env_value("FALLWATCH_SERVO_BACKEND") {
            self.servo.backend = ServoBackendKind::parse(&backend)?;
        }
        if let Some(auto) = env_value("FALLWATCH_AUTO_TRACK") {
            self.tracking.auto_enabled = parse_bool(&auto)
                .ok_or_else(|| anyhow!("FALLWATCH_AUTO_TRACK must be true or false"))?;
        }
        if let Some(delay) = env_value("FALLWATCH_MOVEMENT_DELAY_SECS") {
            let secs: f64 = delay.parse().map_err(|_| {
                anyhow!("FALLWATCH_MOVEMENT_DELAY_SECS must be a number of seconds")
            })?;
            self.tracking.movement_delay = seconds("FALLWATCH_MOVEMENT_DELAY_SECS", secs)?;
        }
        if let Some(broker) = env_value("FALLWATCH_MQTT_BROKER") {
            let base = self.mqtt.take().unwrap_or_default();
            self.mqtt = Some(base.with_broker(&broker)?);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be non-zero"));
        }
        self.pipeline.target_fps = self.camera.target_fps;

        if self.pose.backend == PoseBackendKind::Tract && self.pose.model_path.is_none() {
            return Err(anyhow!("pose backend 'tract' requires pose.model_path"));
        }
        if self.pose.input_size == 0 {
            return Err(anyhow!("pose input_size must be non-zero"));
        }

        if !(0.0..=90.0).contains(&self.fall.angle_threshold_deg) {
            return Err(anyhow!("fall angle threshold must be within 0..=90 degrees"));
        }
        for (name, value) in [
            ("fall.min_confidence", self.fall.min_confidence),
            ("tracking.min_confidence", self.tracking.min_confidence),
            ("redaction.min_confidence", self.redaction.min_confidence),
            (
                "pipeline.keypoint_draw_confidence",
                self.pipeline.keypoint_draw_confidence,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within 0..=1", name));
            }
        }

        self.servo
            .calibration
            .validate()
            .context("invalid servo calibration")?;

        if self.tracking.movement_delay.is_zero() {
            return Err(anyhow!("tracking movement delay must be greater than zero"));
        }
        if self.redaction.pad_side_px < 0
            || self.redaction.pad_top_px < 0
            || self.redaction.pad_bottom_px < 0
        {
            return Err(anyhow!("redaction padding must not be negative"));
        }
        if let Some(factor) = self.redaction.smoothing_factor {
            if !(0.0..1.0).contains(&factor) {
                return Err(anyhow!("redaction smoothing_factor must be within 0..1"));
            }
        }

        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        if self.pipeline.max_consecutive_failures == 0 {
            return Err(anyhow!("max_consecutive_failures must be greater than zero"));
        }

        self.api
            .addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid stream address '{}': {}", self.api.addr, e))?;
        if self.api.max_streams == 0 {
            return Err(anyhow!("api max_streams must be greater than zero"));
        }
        Ok(())
    }
}

fn calibration_from_file(file: &ServoFile) -> Result<ServoCalibration> {
    let defaults = ServoCalibration::default();
    let duration = |name: &str, value: Option<f64>, default: Duration| -> Result<Duration> {
        match value {
            Some(secs) => seconds(name, secs),
            None => Ok(default),
        }
    };
    Ok(ServoCalibration {
        frequency_hz: file.frequency_hz.unwrap_or(defaults.frequency_hz),
        clockwise_duty: file.clockwise_duty.unwrap_or(defaults.clockwise_duty),
        counter_clockwise_duty: file
            .counter_clockwise_duty
            .unwrap_or(defaults.counter_clockwise_duty),
        neutral_duty: file.neutral_duty.unwrap_or(defaults.neutral_duty),
        pulse: duration("servo.pulse_secs", file.pulse_secs, defaults.pulse)?,
        settle: duration("servo.settle_secs", file.settle_secs, defaults.settle)?,
        neutral_hold: duration(
            "servo.neutral_hold_secs",
            file.neutral_hold_secs,
            defaults.neutral_hold,
        )?,
        stabilize: duration(
            "servo.stabilize_secs",
            file.stabilize_secs,
            defaults.stabilize,
        )?,
        custom_settle: duration(
            "servo.custom_settle_secs",
            file.custom_settle_secs,
            defaults.custom_settle,
        )?,
        tracking_hold: duration(
            "servo.tracking_hold_secs",
            file.tracking_hold_secs,
            defaults.tracking_hold,
        )?,
    })
}

fn mqtt_from_file(file: MqttFile) -> Result<MqttSettings> {
    let mut settings = MqttSettings::default();
    if let Some(broker) = file.broker {
        settings = settings.with_broker(&broker)?;
    }
    settings.client_id = file.client_id.unwrap_or(settings.client_id);
    settings.topic_prefix = file.topic_prefix.unwrap_or(settings.topic_prefix);
    settings.username = file.username;
    settings.password = file.password;
    Ok(settings)
}

fn seconds(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", name))
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<FallwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_spellings() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn negative_seconds_are_rejected() {
        assert!(seconds("x", -1.0).is_err());
        assert!(seconds("x", f64::NAN).is_err());
        assert_eq!(seconds("x", 0.3).unwrap(), Duration::from_millis(300));
    }

    #[test]
    fn empty_file_yields_defaults() -> Result<()> {
        let mut cfg = FallwatchConfig::from_file(FallwatchConfigFile::default())?;
        cfg.validate()?;
        assert_eq!(cfg.camera.source, "stub://camera");
        assert_eq!(cfg.servo.backend, ServoBackendKind::None);
        assert_eq!(cfg.servo.calibration, ServoCalibration::default());
        assert!(!cfg.tracking.auto_enabled);
        assert!(cfg.mqtt.is_none());
        assert!(cfg.api.require_token);
        Ok(())
    }
}
