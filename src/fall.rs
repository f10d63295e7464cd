//! Fall classification from head/hip geometry, and rising-edge fall events.

use serde::Serialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::PoseUnavailable;
use crate::pose::{KeypointIndex, KeypointSet};

pub const DEFAULT_ANGLE_THRESHOLD_DEG: f32 = 20.0;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;

#[derive(Clone, Debug)]
pub struct FallSettings {
    /// Head-to-hip vectors within this many degrees of horizontal count as a fall.
    pub angle_threshold_deg: f32,
    /// Head and both hips must reach this confidence. `0.0` disables gating.
    pub min_confidence: f32,
    /// How long a fall must persist before an event is emitted.
    pub confirm_after: Duration,
}

impl Default for FallSettings {
    fn default() -> Self {
        Self {
            angle_threshold_deg: DEFAULT_ANGLE_THRESHOLD_DEG,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            confirm_after: Duration::ZERO,
        }
    }
}

/// Per-frame verdict.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FallState {
    pub angle_degrees: f32,
    pub is_fall: bool,
    pub measured_at: Instant,
}

/// Stateless head/hip tilt classifier.
///
/// The angle is measured in normalized keypoint space against the camera
/// frame, so the camera must be mounted upright.
#[derive(Clone, Debug)]
pub struct FallClassifier {
    angle_threshold_deg: f32,
    min_confidence: f32,
}

impl FallClassifier {
    pub fn new(settings: &FallSettings) -> Self {
        Self {
            angle_threshold_deg: settings.angle_threshold_deg,
            min_confidence: settings.min_confidence,
        }
    }

    pub fn classify(
        &self,
        keypoints: &KeypointSet,
        measured_at: Instant,
    ) -> Result<FallState, PoseUnavailable> {
        for index in [
            KeypointIndex::HEAD,
            KeypointIndex::LeftHip,
            KeypointIndex::RightHip,
        ] {
            let kp = keypoints.get(index);
            if !kp.is_confident(self.min_confidence) {
                return Err(PoseUnavailable::LowConfidence {
                    keypoint: index,
                    confidence: kp.confidence,
                });
            }
        }

        let head = keypoints.head();
        let (left, right) = (keypoints.left_hip(), keypoints.right_hip());
        let hip_y = (left.y + right.y) / 2.0;
        let hip_x = (left.x + right.x) / 2.0;

        let angle_degrees = (head.y - hip_y).atan2(head.x - hip_x).to_degrees().abs();
        let is_fall = angle_degrees <= self.angle_threshold_deg
            || angle_degrees >= 180.0 - self.angle_threshold_deg;

        Ok(FallState {
            angle_degrees,
            is_fall,
            measured_at,
        })
    }
}

impl Default for FallClassifier {
    fn default() -> Self {
        Self::new(&FallSettings::default())
    }
}

/// Payload handed to notification sinks.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FallEvent {
    /// Wall-clock time of the confirming frame, milliseconds since the epoch.
    pub detected_at_ms: u64,
    pub angle_degrees: Option<f32>,
    /// True when triggered from the control surface rather than a frame.
    pub simulated: bool,
    pub message: String,
}

impl FallEvent {
    pub fn detected(angle_degrees: f32, held_for: Duration) -> Self {
        let message = if held_for.is_zero() {
            "Fall detected. Please check!".to_string()
        } else {
            format!(
                "Fall detected for {} seconds. Please check!",
                held_for.as_secs()
            )
        };
        Self {
            detected_at_ms: unix_millis(),
            angle_degrees: Some(angle_degrees),
            simulated: false,
            message,
        }
    }

    pub fn simulated() -> Self {
        Self {
            detected_at_ms: unix_millis(),
            angle_degrees: None,
            simulated: true,
            message: "Simulated fall alert".to_string(),
        }
    }
}

/// Turns the per-frame verdict stream into one event per fall episode.
///
/// An episode starts on the first `is_fall` frame and ends on the first
/// non-fall frame. Frames without a pose neither extend nor end an episode.
#[derive(Debug)]
pub struct FallMonitor {
    confirm_after: Duration,
    episode_started: Option<Instant>,
    reported: bool,
}

impl FallMonitor {
    pub fn new(confirm_after: Duration) -> Self {
        Self {
            confirm_after,
            episode_started: None,
            reported: false,
        }
    }

    /// Feed one frame's verdict; returns an event when an episode is confirmed.
    pub fn observe(&mut self, state: Option<&FallState>) -> Option<FallEvent> {
        let state = state?;
        if !state.is_fall {
            self.episode_started = None;
            self.reported = false;
            return None;
        }

        let started = *self.episode_started.get_or_insert(state.measured_at);
        if self.reported {
            return None;
        }
        if state.measured_at.saturating_duration_since(started) >= self.confirm_after {
            self.reported = true;
            return Some(FallEvent::detected(state.angle_degrees, self.confirm_after));
        }
        None
    }

    pub fn in_episode(&self) -> bool {
        self.episode_started.is_some()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
