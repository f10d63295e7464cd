use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

use crate::fall::FallState;
use crate::frame::{Frame, GREEN, RED, WHITE};
use crate::tracking::{TrackDecision, TrackPhase};

/// Point-in-time view served at `GET /status`.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StatusSnapshot {
    /// Human-readable summary: `fall detected`, `no fall`, `no pose detected`,
    /// or `degraded: ...`.
    pub status: String,
    pub fall_detected: bool,
    pub angle_degrees: Option<f32>,
    pub pose_available: bool,
    pub auto_track_enabled: bool,
    pub servo_available: bool,
    /// Whatever the frame source last reported about itself.
    pub camera_healthy: bool,
    pub tracking_phase: TrackPhase,
    pub next_check_secs: u64,
    pub frames_published: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: "starting".to_string(),
            fall_detected: false,
            angle_degrees: None,
            pose_available: false,
            auto_track_enabled: false,
            servo_available: false,
            camera_healthy: true,
            tracking_phase: TrackPhase::Idle,
            next_check_secs: 0,
            frames_published: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Shared status, written by the pipeline thread and read by HTTP handlers.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<StatusSnapshot>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        f(&mut self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, StatusSnapshot> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub(crate) fn pose_status(fall: Option<&FallState>) -> &'static str {
    match fall {
        Some(state) if state.is_fall => "fall detected",
        Some(_) => "no fall",
        None => "no pose detected",
    }
}

/// Burn the per-frame status lines into the top-left corner.
pub(crate) fn draw_overlay(frame: &mut Frame, fall: Option<&FallState>, tracking: &TrackDecision) {
    let scale = (frame.height() / 160).max(1) as i32;
    let line = 10 * scale;
    let x = 4 * scale;
    let mut y = 4 * scale;

    match fall {
        Some(state) if state.is_fall => frame.draw_text(x, y, "Fall Detected!", scale, RED),
        Some(_) => frame.draw_text(x, y, "No Fall", scale, GREEN),
        None => frame.draw_text(x, y, "No pose detected", scale, WHITE),
    }
    y += line;

    if let Some(state) = fall {
        let angle = format!("Angle: {} degrees", state.angle_degrees as i32);
        frame.draw_text(x, y, &angle, scale, WHITE);
        y += line;
    }

    let countdown = format!("Next check in: {}s", tracking.remaining_cooldown.as_secs());
    frame.draw_text(x, y, &countdown, scale, WHITE);
    y += line;

    let tracking_line = if !tracking.hardware_available {
        "Auto-track disabled: hardware unavailable"
    } else if tracking.auto_enabled {
        "Auto Movement Enabled"
    } else {
        "Auto Movement Disabled"
    };
    frame.draw_text(x, y, tracking_line, scale, GREEN);
}

/// Black frame carrying only a message, published while no real frame can
/// be shown safely.
pub(crate) fn placeholder(width: u32, height: u32, message: &str, sequence: u64) -> Frame {
    let mut frame = Frame::solid(width, height, [0, 0, 0], sequence);
    let scale = (height / 160).max(1) as i32;
    frame.draw_text(4 * scale, (height as i32) / 2, message, scale, WHITE);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn snapshot_serializes_status_field() {
        let board = StatusBoard::new();
        board.update(|s| s.status = "no fall".to_string());
        let value = serde_json::to_value(board.snapshot()).unwrap();
        assert_eq!(value["status"], "no fall");
        assert_eq!(value["tracking_phase"], "idle");
    }

    #[test]
    fn overlay_marks_fall_in_red() {
        let mut frame = Frame::solid(320, 240, [0, 0, 0], 0);
        let fall = FallState {
            angle_degrees: 3.0,
            is_fall: true,
            measured_at: Instant::now(),
        };
        let decision = TrackDecision {
            phase: TrackPhase::Cooldown,
            remaining_cooldown: Duration::from_secs(4),
            position: None,
            dispatched: None,
            auto_enabled: false,
            hardware_available: true,
        };
        draw_overlay(&mut frame, Some(&fall), &decision);
        assert!(frame.pixels().chunks(3).any(|p| p == RED));
        assert_eq!(pose_status(Some(&fall)), "fall detected");
        assert_eq!(pose_status(None), "no pose detected");
    }
}
