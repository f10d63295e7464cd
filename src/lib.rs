//! Fallwatch
//!
//! Pose-driven fall detection for a single camera, with an auto-tracking pan
//! servo and a privacy-redacted MJPEG stream.
//!
//! # Architecture
//!
//! One frame loop owns the camera and the pose estimator. Each iteration:
//!
//! 1. captures a frame and runs pose estimation,
//! 2. classifies the head-to-hip tilt ([`FallClassifier`]),
//! 3. asks the [`AutoTrackController`] whether to pan the servo (the move
//!    itself runs on a worker thread so the loop never sleeps on hardware),
//! 4. burns an opaque box over the subject ([`RedactionOverlay`]),
//! 5. draws the status text and publishes the JPEG to the stream hub.
//!
//! The redaction box is applied before encoding. No unredacted pixels reach
//! the hub, and the box coordinates are never exported.
//!
//! # Module Structure
//!
//! - `frame`: owned RGB frames, drawing primitives, JPEG encoding
//! - `ingest`: camera sources (`stub://` synthetic, V4L2)
//! - `pose`: keypoint types and estimator backends
//! - `fall`: fall classification and rising-edge events
//! - `servo`: PWM channels and the servo driver
//! - `tracking`: auto-track decisions and cooldown
//! - `redact`: subject redaction
//! - `notify`: fall event sinks (log, MQTT)
//! - `pipeline`: the frame loop, status board, and frame hub
//! - `api`: HTTP stream and control routes
//! - `config`: file and environment configuration

pub mod api;
pub mod config;
pub mod error;
pub mod fall;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod pose;
pub mod redact;
pub mod servo;
pub mod tracking;

pub use api::{ApiConfig, ApiHandle, ApiServer, ApiState};
pub use config::FallwatchConfig;
pub use error::{HardwareUnavailable, PipelineError, PoseUnavailable};
pub use fall::{FallClassifier, FallEvent, FallMonitor, FallSettings, FallState};
pub use frame::Frame;
pub use ingest::{CameraSettings, CameraSource, FrameSource};
pub use notify::{FallEventSink, FallNotifier, LogSink, MqttSettings, MqttSink};
pub use pipeline::{
    spawn_pipeline, FrameAnnotationPipeline, FrameHub, PipelineHandle, PipelineOutputs,
    PipelineSettings, StatusBoard, StatusSnapshot,
};
pub use pose::{Keypoint, KeypointIndex, KeypointSet, PoseEstimator};
pub use redact::{RedactionOverlay, RedactionSettings};
pub use servo::{open_servo, PwmChannel, ServoCalibration, ServoDriver, ServoSettings};
pub use tracking::{AutoTrackController, PanDirection, TrackDecision, TrackingSettings};
