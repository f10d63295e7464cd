use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use fallwatch::config::FallwatchConfig;
use fallwatch::ingest::FrameRotation;
use fallwatch::servo::ServoBackendKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FALLWATCH_CONFIG",
        "FALLWATCH_CAMERA",
        "FALLWATCH_STREAM_ADDR",
        "FALLWATCH_TOKEN_PATH",
        "FALLWATCH_SERVO_BACKEND",
        "FALLWATCH_AUTO_TRACK",
        "FALLWATCH_MOVEMENT_DELAY_SECS",
        "FALLWATCH_MQTT_BROKER",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = FallwatchConfig::load().expect("load defaults");
    assert_eq!(cfg.camera.source, "stub://camera");
    assert_eq!((cfg.camera.width, cfg.camera.height), (640, 480));
    assert_eq!(cfg.api.addr, "127.0.0.1:5000");
    assert!(cfg.api.token_path.is_none());
    assert_eq!(cfg.servo.backend, ServoBackendKind::None);
    assert!(!cfg.tracking.auto_enabled);
    assert_eq!(cfg.tracking.movement_delay, Duration::from_secs(5));
    assert_eq!(cfg.tracking.dead_zone_px, 100);
    assert!((cfg.fall.angle_threshold_deg - 20.0).abs() < f32::EPSILON);
    assert_eq!(cfg.redaction.pad_bottom_px, 150);
    assert!(cfg.mqtt.is_none());
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let token_path = file.path().with_extension("token");
    let json = format!(
        r#"{{
            "camera": {{ "source": "stub://porch", "width": 320, "height": 240, "rotation": "clockwise90" }},
            "fall": {{ "angle_threshold_deg": 25.0, "confirm_after_secs": 1.5 }},
            "servo": {{ "backend": "stub", "pwm_chip": 2, "clockwise_duty": 7.1, "pulse_secs": 0.2 }},
            "tracking": {{ "auto_enabled": true, "dead_zone_px": 60 }},
            "redaction": {{ "pad_bottom_px": 120, "smoothing_factor": 0.6 }},
            "api": {{ "addr": "0.0.0.0:8080", "token_path": "{}" }}
        }}"#,
        token_path.display()
    );
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("FALLWATCH_CONFIG", file.path());
    std::env::set_var("FALLWATCH_CAMERA", "stub://garden");
    std::env::set_var("FALLWATCH_AUTO_TRACK", "off");
    std::env::set_var("FALLWATCH_MOVEMENT_DELAY_SECS", "2.5");

    let cfg = FallwatchConfig::load().expect("load config");
    clear_env();

    assert_eq!(cfg.camera.source, "stub://garden");
    assert_eq!((cfg.camera.width, cfg.camera.height), (320, 240));
    assert_eq!(cfg.camera.rotation, FrameRotation::Clockwise90);
    assert!((cfg.fall.angle_threshold_deg - 25.0).abs() < f32::EPSILON);
    assert_eq!(cfg.fall.confirm_after, Duration::from_millis(1500));
    assert_eq!(cfg.servo.backend, ServoBackendKind::Stub);
    assert_eq!(cfg.servo.pwm_chip, 2);
    assert!((cfg.servo.calibration.clockwise_duty - 7.1).abs() < 1e-9);
    assert_eq!(cfg.servo.calibration.pulse, Duration::from_millis(200));
    assert_eq!(cfg.servo.calibration.settle, Duration::from_secs(1));
    assert!(!cfg.tracking.auto_enabled);
    assert_eq!(cfg.tracking.movement_delay, Duration::from_millis(2500));
    assert_eq!(cfg.tracking.dead_zone_px, 60);
    assert_eq!(cfg.redaction.pad_bottom_px, 120);
    assert_eq!(cfg.redaction.smoothing_factor, Some(0.6));
    assert_eq!(cfg.api.addr, "0.0.0.0:8080");
    assert_eq!(cfg.api.token_path, Some(token_path));
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[servo]
backend = "sysfs"
pwm_channel = 1

[mqtt]
broker = "broker.local:8883"
topic_prefix = "home/fallwatch"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = FallwatchConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.servo.backend, ServoBackendKind::Sysfs);
    assert_eq!(cfg.servo.pwm_channel, 1);
    let mqtt = cfg.mqtt.expect("mqtt configured");
    assert_eq!(mqtt.host, "broker.local");
    assert_eq!(mqtt.port, 8883);
    assert_eq!(mqtt.event_topic(), "home/fallwatch/fall");
}

#[test]
fn env_only_settings() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("FALLWATCH_STREAM_ADDR", "127.0.0.1:0");
    std::env::set_var("FALLWATCH_TOKEN_PATH", "/tmp/fallwatch.token");
    std::env::set_var("FALLWATCH_SERVO_BACKEND", "stub");
    std::env::set_var("FALLWATCH_MQTT_BROKER", "10.0.0.5");

    let cfg = FallwatchConfig::load().expect("load env config");
    clear_env();

    assert_eq!(cfg.api.addr, "127.0.0.1:0");
    assert_eq!(
        cfg.api.token_path,
        Some(PathBuf::from("/tmp/fallwatch.token"))
    );
    assert_eq!(cfg.servo.backend, ServoBackendKind::Stub);
    let mqtt = cfg.mqtt.expect("mqtt from env");
    assert_eq!(mqtt.host, "10.0.0.5");
    assert_eq!(mqtt.port, 1883);
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("FALLWATCH_AUTO_TRACK", "sometimes");
    assert!(FallwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("FALLWATCH_MOVEMENT_DELAY_SECS", "0");
    assert!(FallwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("FALLWATCH_SERVO_BACKEND", "i2c");
    assert!(FallwatchConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(
        &mut file,
        br#"{ "redaction": { "pad_side_px": -5 } }"#,
    )
    .expect("write config");
    assert!(FallwatchConfig::load_from(Some(file.path())).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "servo": { "neutral_duty": 140.0 } }"#)
        .expect("write config");
    assert!(FallwatchConfig::load_from(Some(file.path())).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "unknown_section": {} }"#)
        .expect("write config");
    assert!(FallwatchConfig::load_from(Some(file.path())).is_err());
}
