//! Auto-tracking: keep the subject horizontally centred with the pan servo.
//!
//! The controller is evaluated once per frame. It decides, under a single
//! lock acquisition, whether a move is due and marks it in flight, then hands
//! the blocking servo sequence to a worker thread so the frame loop never
//! waits on the actuator.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::pose::{KeypointIndex, KeypointSet};
use crate::servo::{Rotation, ServoDriver};

pub const DEFAULT_MOVEMENT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_DEAD_ZONE_PX: u32 = 100;

#[derive(Clone, Debug)]
pub struct TrackingSettings {
    /// Initial state of the auto-track toggle.
    pub auto_enabled: bool,
    /// Minimum time between two movement decisions.
    pub movement_delay: Duration,
    /// Half-width of the centred band, in pixels.
    pub dead_zone_px: u32,
    pub tracked_joint: KeypointIndex,
    /// Below this the tracked joint is treated as missing.
    pub min_confidence: f32,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            auto_enabled: false,
            movement_delay: DEFAULT_MOVEMENT_DELAY,
            dead_zone_px: DEFAULT_DEAD_ZONE_PX,
            tracked_joint: KeypointIndex::HEAD,
            min_confidence: 0.3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackPhase {
    Idle,
    Cooldown,
    Moving,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalPosition {
    Left,
    Center,
    Right,
}

impl HorizontalPosition {
    pub fn pan_direction(self) -> Option<PanDirection> {
        match self {
            HorizontalPosition::Left => Some(PanDirection::Left),
            HorizontalPosition::Center => None,
            HorizontalPosition::Right => Some(PanDirection::Right),
        }
    }
}

/// Which way to turn the camera, in image terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PanDirection {
    Left,
    Right,
}

impl PanDirection {
    /// Subject on the left needs a counter-clockwise pan.
    pub fn rotation(self) -> Rotation {
        match self {
            PanDirection::Left => Rotation::CounterClockwise,
            PanDirection::Right => Rotation::Clockwise,
        }
    }
}

/// Classify a pixel column against `width / 2 ± dead_zone`. The band edges
/// count as centred.
pub fn classify_position(x_px: f32, frame_width: u32, dead_zone_px: u32) -> HorizontalPosition {
    let center = (frame_width / 2) as f32;
    let dead_zone = dead_zone_px as f32;
    if x_px < center - dead_zone {
        HorizontalPosition::Left
    } else if x_px > center + dead_zone {
        HorizontalPosition::Right
    } else {
        HorizontalPosition::Center
    }
}

/// Shared tracking flags. Only the controller mutates them.
#[derive(Debug)]
struct TrackingState {
    last_movement_at: Instant,
    auto_enabled: bool,
    movement_in_progress: bool,
}

/// Result of one evaluation, for display.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackDecision {
    pub phase: TrackPhase,
    /// Time until the next movement decision; zero when idle.
    pub remaining_cooldown: Duration,
    pub position: Option<HorizontalPosition>,
    pub dispatched: Option<PanDirection>,
    pub auto_enabled: bool,
    pub hardware_available: bool,
}

pub struct AutoTrackController {
    driver: Arc<ServoDriver>,
    settings: TrackingSettings,
    state: Arc<Mutex<TrackingState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AutoTrackController {
    pub fn new(driver: Arc<ServoDriver>, settings: TrackingSettings) -> Self {
        Self::starting_at(driver, settings, Instant::now())
    }

    /// The first cooldown window runs from `started_at`, so no move happens
    /// within `movement_delay` of startup.
    pub fn starting_at(
        driver: Arc<ServoDriver>,
        settings: TrackingSettings,
        started_at: Instant,
    ) -> Self {
        let state = TrackingState {
            last_movement_at: started_at,
            auto_enabled: settings.auto_enabled,
            movement_in_progress: false,
        };
        Self {
            driver,
            settings,
            state: Arc::new(Mutex::new(state)),
            worker: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> &Arc<ServoDriver> {
        &self.driver
    }

    pub fn settings(&self) -> &TrackingSettings {
        &self.settings
    }

    /// Decide for one frame. `keypoints` is `None` when the pose is
    /// unavailable; that never dispatches.
    pub fn evaluate(
        &self,
        keypoints: Option<&KeypointSet>,
        frame_width: u32,
        now: Instant,
    ) -> TrackDecision {
        let hardware_available = self.driver.is_available();
        let mut state = lock_state(&self.state);
        let elapsed = now.saturating_duration_since(state.last_movement_at);
        let remaining = self.settings.movement_delay.saturating_sub(elapsed);
        let mut decision = TrackDecision {
            phase: if remaining.is_zero() {
                TrackPhase::Idle
            } else {
                TrackPhase::Cooldown
            },
            remaining_cooldown: remaining,
            position: None,
            dispatched: None,
            auto_enabled: state.auto_enabled,
            hardware_available,
        };

        if state.movement_in_progress {
            decision.phase = TrackPhase::Moving;
            return decision;
        }
        if !state.auto_enabled || !remaining.is_zero() || !hardware_available {
            return decision;
        }
        let Some(x_px) = keypoints.and_then(|set| self.tracked_x(set, frame_width)) else {
            return decision;
        };

        let position = classify_position(x_px, frame_width, self.settings.dead_zone_px);
        decision.position = Some(position);
        state.last_movement_at = now;
        decision.remaining_cooldown = self.settings.movement_delay;

        let Some(direction) = position.pan_direction() else {
            decision.phase = TrackPhase::Cooldown;
            return decision;
        };

        state.movement_in_progress = true;
        match self.spawn_worker(direction) {
            Ok(()) => {
                log::debug!("auto-track: {:?} at x={:.0}px, panning {:?}", position, x_px, direction);
                decision.phase = TrackPhase::Moving;
                decision.dispatched = Some(direction);
            }
            Err(err) => {
                state.movement_in_progress = false;
                decision.phase = TrackPhase::Cooldown;
                log::warn!("auto-track dispatch failed: {:#}", err);
            }
        }
        decision
    }

    pub fn auto_enabled(&self) -> bool {
        lock_state(&self.state).auto_enabled
    }

    pub fn set_auto_enabled(&self, enabled: bool) {
        lock_state(&self.state).auto_enabled = enabled;
        log::info!(
            "auto-track {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Flip the toggle and return the new value.
    pub fn toggle_auto_enabled(&self) -> bool {
        let enabled = {
            let mut state = lock_state(&self.state);
            state.auto_enabled = !state.auto_enabled;
            state.auto_enabled
        };
        log::info!(
            "auto-track {}",
            if enabled { "enabled" } else { "disabled" }
        );
        enabled
    }

    /// One-shot manual pan. Ignores the cooldown but waits for any sequence
    /// already holding the servo.
    pub fn manual_move(&self, direction: PanDirection) -> Result<()> {
        log::info!("manual pan {:?}", direction);
        match direction.rotation() {
            Rotation::Clockwise => self.driver.custom_move_clockwise(),
            Rotation::CounterClockwise => self.driver.custom_move_counter_clockwise(),
        }
    }

    pub fn movement_in_progress(&self) -> bool {
        lock_state(&self.state).movement_in_progress
    }

    /// Block until the current worker, if any, has finished.
    pub fn join_in_flight(&self) {
        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("auto-track worker panicked");
            }
        }
    }

    fn tracked_x(&self, set: &KeypointSet, frame_width: u32) -> Option<f32> {
        let joint = set.get(self.settings.tracked_joint);
        if !joint.is_confident(self.settings.min_confidence) {
            return None;
        }
        Some(joint.x * frame_width as f32)
    }

    fn spawn_worker(&self, direction: PanDirection) -> Result<()> {
        let driver = Arc::clone(&self.driver);
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name("servo-track".into())
            .spawn(move || {
                let _in_flight = InFlight(state);
                if let Err(err) = driver.tracking_step(direction.rotation()) {
                    log::warn!("auto-track move failed: {:#}", err);
                }
            })
            .map_err(|e| anyhow!("spawn servo worker: {}", e))?;

        let mut worker = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // the previous worker cleared movement_in_progress, so it has finished
        if let Some(previous) = worker.replace(handle) {
            let _ = previous.join();
        }
        Ok(())
    }
}

/// Clears `movement_in_progress` when the worker exits, panics included.
struct InFlight(Arc<Mutex<TrackingState>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        lock_state(&self.0).movement_in_progress = false;
    }
}

fn lock_state(state: &Mutex<TrackingState>) -> MutexGuard<'_, TrackingState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::standing_pose;
    use crate::servo::{PwmWrite, ServoCalibration, StubPwm};

    const WIDTH: u32 = 640;

    fn calibration(step: Duration) -> ServoCalibration {
        ServoCalibration {
            pulse: step,
            settle: step,
            neutral_hold: step,
            stabilize: step,
            custom_settle: step,
            tracking_hold: step,
            ..ServoCalibration::default()
        }
    }

    fn controller(
        auto: bool,
        step: Duration,
        started_at: Instant,
    ) -> (AutoTrackController, Arc<Mutex<Vec<PwmWrite>>>) {
        let pwm = StubPwm::new();
        let log = pwm.recorder();
        let driver = ServoDriver::initialize("stub", Ok(Box::new(pwm)), calibration(step));
        let settings = TrackingSettings {
            auto_enabled: auto,
            ..TrackingSettings::default()
        };
        (
            AutoTrackController::starting_at(Arc::new(driver), settings, started_at),
            log,
        )
    }

    fn head_at(x_px: f32) -> KeypointSet {
        standing_pose(x_px / WIDTH as f32)
    }

    fn active_duties(log: &Arc<Mutex<Vec<PwmWrite>>>) -> Vec<f64> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|w| match w {
                PwmWrite::Duty { duty_percent, .. }
                    if *duty_percent > 0.0 && (*duty_percent - 7.5).abs() > 1e-9 =>
                {
                    Some(*duty_percent)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn positions_split_around_dead_zone() {
        assert_eq!(classify_position(50.0, WIDTH, 100), HorizontalPosition::Left);
        assert_eq!(classify_position(220.0, WIDTH, 100), HorizontalPosition::Center);
        assert_eq!(classify_position(420.0, WIDTH, 100), HorizontalPosition::Center);
        assert_eq!(classify_position(421.0, WIDTH, 100), HorizontalPosition::Right);
        assert_eq!(classify_position(219.0, WIDTH, 100), HorizontalPosition::Left);
    }

    #[test]
    fn left_subject_pans_counter_clockwise_after_startup_delay() {
        let t0 = Instant::now();
        let (ctrl, log) = controller(true, Duration::from_millis(2), t0);

        // six frames one second apart; only the one at t0+5s is past cooldown
        let mut dispatches = Vec::new();
        for second in 0..6u64 {
            let now = t0 + Duration::from_secs(second);
            let decision = ctrl.evaluate(Some(&head_at(50.0)), WIDTH, now);
            if let Some(direction) = decision.dispatched {
                dispatches.push((second, direction));
            }
        }
        ctrl.join_in_flight();

        assert_eq!(dispatches, vec![(5, PanDirection::Left)]);
        assert_eq!(active_duties(&log), vec![7.7]);
    }

    #[test]
    fn in_flight_move_blocks_redispatch() {
        let t0 = Instant::now();
        let (ctrl, _log) = controller(true, Duration::from_millis(40), t0);
        let due = t0 + DEFAULT_MOVEMENT_DELAY;

        let first = ctrl.evaluate(Some(&head_at(600.0)), WIDTH, due);
        assert_eq!(first.dispatched, Some(PanDirection::Right));
        assert!(ctrl.movement_in_progress());

        // far past the cooldown, but the worker is still running
        let later = due + DEFAULT_MOVEMENT_DELAY * 3;
        let second = ctrl.evaluate(Some(&head_at(600.0)), WIDTH, later);
        assert_eq!(second.phase, TrackPhase::Moving);
        assert_eq!(second.dispatched, None);

        ctrl.join_in_flight();
        assert!(!ctrl.movement_in_progress());
    }

    #[test]
    fn cooldown_suppresses_until_delay_elapses() {
        let t0 = Instant::now();
        let (ctrl, _log) = controller(true, Duration::from_millis(1), t0);
        let due = t0 + DEFAULT_MOVEMENT_DELAY;

        assert!(ctrl.evaluate(Some(&head_at(50.0)), WIDTH, due).dispatched.is_some());
        ctrl.join_in_flight();

        let mut tick = due;
        for _ in 0..49 {
            tick += Duration::from_millis(100);
            let decision = ctrl.evaluate(Some(&head_at(50.0)), WIDTH, tick);
            assert_eq!(decision.dispatched, None);
            assert_eq!(decision.phase, TrackPhase::Cooldown);
            assert!(decision.remaining_cooldown > Duration::ZERO);
        }
        let decision = ctrl.evaluate(Some(&head_at(50.0)), WIDTH, due + DEFAULT_MOVEMENT_DELAY);
        assert_eq!(decision.dispatched, Some(PanDirection::Left));
        ctrl.join_in_flight();
    }

    #[test]
    fn centred_subject_restarts_cooldown_without_moving() {
        let t0 = Instant::now();
        let (ctrl, log) = controller(true, Duration::from_millis(1), t0);
        let due = t0 + DEFAULT_MOVEMENT_DELAY;

        let decision = ctrl.evaluate(Some(&head_at(320.0)), WIDTH, due);
        assert_eq!(decision.position, Some(HorizontalPosition::Center));
        assert_eq!(decision.phase, TrackPhase::Cooldown);
        assert_eq!(decision.remaining_cooldown, DEFAULT_MOVEMENT_DELAY);
        assert!(log.lock().unwrap().is_empty());

        let soon = due + Duration::from_secs(1);
        assert_eq!(
            ctrl.evaluate(Some(&head_at(50.0)), WIDTH, soon).dispatched,
            None
        );
    }

    #[test]
    fn toggling_off_suppresses_dispatch_indefinitely() {
        let t0 = Instant::now();
        let (ctrl, log) = controller(true, Duration::from_millis(1), t0);
        assert!(!ctrl.toggle_auto_enabled());

        for hours in 1..4u64 {
            let now = t0 + Duration::from_secs(3600 * hours);
            let decision = ctrl.evaluate(Some(&head_at(50.0)), WIDTH, now);
            assert_eq!(decision.dispatched, None);
            assert!(!decision.auto_enabled);
        }
        assert!(log.lock().unwrap().is_empty());

        ctrl.set_auto_enabled(true);
        let now = t0 + Duration::from_secs(4 * 3600);
        assert!(ctrl.evaluate(Some(&head_at(50.0)), WIDTH, now).dispatched.is_some());
        ctrl.join_in_flight();
    }

    #[test]
    fn missing_pose_or_hardware_never_dispatches() {
        let t0 = Instant::now();
        let (ctrl, _log) = controller(true, Duration::from_millis(1), t0);
        let due = t0 + DEFAULT_MOVEMENT_DELAY;
        let decision = ctrl.evaluate(None, WIDTH, due);
        assert_eq!(decision.phase, TrackPhase::Idle);
        assert_eq!(decision.dispatched, None);

        let degraded = AutoTrackController::starting_at(
            Arc::new(ServoDriver::disabled()),
            TrackingSettings {
                auto_enabled: true,
                ..TrackingSettings::default()
            },
            t0,
        );
        let decision = degraded.evaluate(Some(&head_at(50.0)), WIDTH, due);
        assert!(!decision.hardware_available);
        assert_eq!(decision.dispatched, None);
    }

    #[test]
    fn manual_move_ignores_cooldown() -> Result<()> {
        let t0 = Instant::now();
        let (ctrl, log) = controller(false, Duration::from_millis(1), t0);
        ctrl.manual_move(PanDirection::Right)?;
        ctrl.manual_move(PanDirection::Left)?;
        let duties: Vec<f64> = log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|w| match w {
                PwmWrite::Duty { duty_percent, .. } => Some(*duty_percent),
                PwmWrite::Released => None,
            })
            .collect();
        assert_eq!(duties, vec![7.3, 0.0, 7.7, 0.0]);
        Ok(())
    }

    #[test]
    fn manual_move_waits_for_in_flight_auto_move() -> Result<()> {
        let t0 = Instant::now();
        let (ctrl, log) = controller(true, Duration::from_millis(40), t0);
        let due = t0 + DEFAULT_MOVEMENT_DELAY;
        let decision = ctrl.evaluate(Some(&head_at(600.0)), WIDTH, due);
        assert_eq!(decision.dispatched, Some(PanDirection::Right));

        // the worker holds the servo from its first write onwards
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "auto move never started");
            thread::sleep(Duration::from_millis(1));
        }
        let started = Instant::now();
        ctrl.manual_move(PanDirection::Left)?;
        // five 40 ms phases, the first already under way
        assert!(started.elapsed() >= Duration::from_millis(120));
        ctrl.join_in_flight();

        let duties: Vec<f64> = log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|w| match w {
                PwmWrite::Duty { duty_percent, .. } => Some(*duty_percent),
                PwmWrite::Released => None,
            })
            .collect();
        assert_eq!(duties, vec![7.3, 7.5, 0.0, 7.7, 0.0]);
        Ok(())
    }
}
