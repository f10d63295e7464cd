//! Pan servo actuation.
//!
//! `ServoDriver` is the only owner of the PWM channel. Every duty-cycle change
//! happens while holding its mutex, so at most one sequence is in flight
//! system-wide, whether it came from the auto-tracker or a manual request.
//! When the channel cannot be opened the driver runs degraded and all
//! commands succeed as no-ops.

mod pwm;

pub use pwm::{PwmChannel, PwmWrite, StubPwm, SysfsPwm};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::error::HardwareUnavailable;

/// Servo timing and duty cycles. These are measured on the bench for a
/// particular continuous-rotation servo, not computed.
#[derive(Clone, Debug, PartialEq)]
pub struct ServoCalibration {
    pub frequency_hz: f64,
    pub clockwise_duty: f64,
    pub counter_clockwise_duty: f64,
    pub neutral_duty: f64,
    /// Active pulse length for every directional move.
    pub pulse: Duration,
    /// Pause after the pulse, before neutral is applied.
    pub settle: Duration,
    pub neutral_hold: Duration,
    /// Pause after neutral before the sequence returns.
    pub stabilize: Duration,
    /// Pause after a manual one-shot pulse, before stop.
    pub custom_settle: Duration,
    /// Extra hold after an auto-track move, before stop.
    pub tracking_hold: Duration,
}

impl Default for ServoCalibration {
    fn default() -> Self {
        Self {
            frequency_hz: 50.0,
            clockwise_duty: 7.3,
            counter_clockwise_duty: 7.7,
            neutral_duty: 7.5,
            pulse: Duration::from_millis(300),
            settle: Duration::from_secs(1),
            neutral_hold: Duration::from_millis(500),
            stabilize: Duration::from_secs(1),
            custom_settle: Duration::from_secs(2),
            tracking_hold: Duration::from_secs(1),
        }
    }
}

impl ServoCalibration {
    pub fn validate(&self) -> Result<()> {
        if !(self.frequency_hz.is_finite() && self.frequency_hz > 0.0) {
            return Err(anyhow!("servo frequency must be positive"));
        }
        for (name, duty) in [
            ("clockwise_duty", self.clockwise_duty),
            ("counter_clockwise_duty", self.counter_clockwise_duty),
            ("neutral_duty", self.neutral_duty),
        ] {
            if !(0.0..=100.0).contains(&duty) {
                return Err(anyhow!("servo {} {} outside 0..=100", name, duty));
            }
        }
        Ok(())
    }

    fn duty_for(&self, rotation: Rotation) -> f64 {
        match rotation {
            Rotation::Clockwise => self.clockwise_duty,
            Rotation::CounterClockwise => self.counter_clockwise_duty,
        }
    }
}

/// Direction of a pan move as seen from behind the camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    Clockwise,
    CounterClockwise,
}

/// One duty-cycle write. `duration` is how long the duty is held before the
/// next command runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ServoCommand {
    RotateClockwise { duty_percent: f64, duration: Duration },
    RotateCounterClockwise { duty_percent: f64, duration: Duration },
    Neutral { duty_percent: f64, duration: Duration },
    Stop,
}

impl ServoCommand {
    fn rotate(rotation: Rotation, duty_percent: f64, duration: Duration) -> Self {
        match rotation {
            Rotation::Clockwise => ServoCommand::RotateClockwise {
                duty_percent,
                duration,
            },
            Rotation::CounterClockwise => ServoCommand::RotateCounterClockwise {
                duty_percent,
                duration,
            },
        }
    }

    fn duty_and_hold(&self) -> (f64, Duration) {
        match *self {
            ServoCommand::RotateClockwise {
                duty_percent,
                duration,
            }
            | ServoCommand::RotateCounterClockwise {
                duty_percent,
                duration,
            }
            | ServoCommand::Neutral {
                duty_percent,
                duration,
            } => (duty_percent, duration),
            ServoCommand::Stop => (0.0, Duration::ZERO),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServoBackendKind {
    /// No servo attached. The driver runs degraded.
    #[default]
    None,
    Stub,
    Sysfs,
}

impl ServoBackendKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "" => Ok(ServoBackendKind::None),
            "stub" => Ok(ServoBackendKind::Stub),
            "sysfs" | "pwm" => Ok(ServoBackendKind::Sysfs),
            other => Err(anyhow!("unknown servo backend '{}'", other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServoBackendKind::None => "none",
            ServoBackendKind::Stub => "stub",
            ServoBackendKind::Sysfs => "sysfs",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ServoSettings {
    pub backend: ServoBackendKind,
    pub pwm_chip: u32,
    pub pwm_channel: u32,
    pub calibration: ServoCalibration,
}

/// Open the configured channel and wrap it in a driver. Never fails: a
/// channel that cannot be opened yields a degraded driver.
pub fn open_servo(settings: &ServoSettings) -> ServoDriver {
    let channel: Result<Box<dyn PwmChannel>> = match settings.backend {
        ServoBackendKind::None => Err(anyhow!("no servo backend configured")),
        ServoBackendKind::Stub => Ok(Box::new(StubPwm::new())),
        ServoBackendKind::Sysfs => SysfsPwm::open(settings.pwm_chip, settings.pwm_channel)
            .map(|pwm| Box::new(pwm) as Box<dyn PwmChannel>),
    };
    ServoDriver::initialize(
        settings.backend.as_str(),
        channel,
        settings.calibration.clone(),
    )
}

pub struct ServoDriver {
    backend: String,
    calibration: ServoCalibration,
    channel: Mutex<Option<Box<dyn PwmChannel>>>,
    available: bool,
    released: AtomicBool,
}

impl ServoDriver {
    /// Take ownership of the channel opened at startup. An `Err` puts the
    /// driver in degraded mode; the failure is logged here and nowhere else.
    pub fn initialize(
        backend: &str,
        channel: Result<Box<dyn PwmChannel>>,
        calibration: ServoCalibration,
    ) -> Self {
        let (channel, available) = match channel {
            Ok(channel) => {
                log::info!("servo channel ready (backend={})", channel.name());
                (Some(channel), true)
            }
            Err(err) => {
                let unavailable = HardwareUnavailable {
                    backend: backend.to_string(),
                    reason: format!("{:#}", err),
                };
                log::warn!("{}; servo commands are disabled", unavailable);
                (None, false)
            }
        };
        Self {
            backend: backend.to_string(),
            calibration,
            channel: Mutex::new(channel),
            available,
            released: AtomicBool::new(false),
        }
    }

    /// A driver with no channel, for callers that never actuate.
    pub fn disabled() -> Self {
        Self {
            backend: "none".to_string(),
            calibration: ServoCalibration::default(),
            channel: Mutex::new(None),
            available: false,
            released: AtomicBool::new(false),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available && !self.released.load(Ordering::SeqCst)
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn calibration(&self) -> &ServoCalibration {
        &self.calibration
    }

    /// Active pulse, settle, neutral, stabilize.
    pub fn move_clockwise(&self) -> Result<()> {
        self.run("move_clockwise", &self.directional(Rotation::Clockwise))
    }

    pub fn move_counter_clockwise(&self) -> Result<()> {
        self.run(
            "move_counter_clockwise",
            &self.directional(Rotation::CounterClockwise),
        )
    }

    /// Cut the pulse. Safe to call at any time, any number of times.
    pub fn stop(&self) -> Result<()> {
        self.run("stop", &[ServoCommand::Stop])
    }

    /// Manual one-shot: single pulse, longer settle, then stop.
    pub fn custom_move_clockwise(&self) -> Result<()> {
        self.run("custom_move_clockwise", &self.one_shot(Rotation::Clockwise))
    }

    pub fn custom_move_counter_clockwise(&self) -> Result<()> {
        self.run(
            "custom_move_counter_clockwise",
            &self.one_shot(Rotation::CounterClockwise),
        )
    }

    /// The auto-track sequence: a directional move, a hold, then stop, all
    /// under one lock acquisition.
    pub fn tracking_step(&self, rotation: Rotation) -> Result<()> {
        let mut commands = self.directional(rotation).to_vec();
        if let Some(ServoCommand::Neutral { duration, .. }) = commands.last_mut() {
            *duration += self.calibration.tracking_hold;
        }
        commands.push(ServoCommand::Stop);
        self.run("tracking_step", &commands)
    }

    /// Stop and release the channel. Only the first call touches hardware.
    pub fn shutdown(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(mut channel) = self.lock_channel().take() else {
            return Ok(());
        };
        let stopped = channel
            .set_duty_cycle(self.calibration.frequency_hz, 0.0)
            .context("stop servo before release");
        let released = channel.release().context("release servo channel");
        log::info!("servo channel released (backend={})", channel.name());
        stopped.and(released)
    }

    fn directional(&self, rotation: Rotation) -> [ServoCommand; 2] {
        let cal = &self.calibration;
        [
            ServoCommand::rotate(rotation, cal.duty_for(rotation), cal.pulse + cal.settle),
            ServoCommand::Neutral {
                duty_percent: cal.neutral_duty,
                duration: cal.neutral_hold + cal.stabilize,
            },
        ]
    }

    fn one_shot(&self, rotation: Rotation) -> [ServoCommand; 2] {
        let cal = &self.calibration;
        [
            ServoCommand::rotate(
                rotation,
                cal.duty_for(rotation),
                cal.pulse + cal.custom_settle,
            ),
            ServoCommand::Stop,
        ]
    }

    fn lock_channel(&self) -> MutexGuard<'_, Option<Box<dyn PwmChannel>>> {
        // a panic mid-sequence leaves the channel usable; the next sequence
        // starts from an explicit duty write
        match self.channel.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn run(&self, label: &str, commands: &[ServoCommand]) -> Result<()> {
        let mut guard = self.lock_channel();
        let Some(channel) = guard.as_mut() else {
            log::debug!("servo {} skipped: no channel", label);
            return Ok(());
        };
        log::debug!("servo {} ({} steps)", label, commands.len());
        let frequency_hz = self.calibration.frequency_hz;
        for command in commands {
            let (duty, hold) = command.duty_and_hold();
            if let Err(err) = channel.set_duty_cycle(frequency_hz, duty) {
                if let Err(stop_err) = channel.set_duty_cycle(frequency_hz, 0.0) {
                    log::warn!("servo stop after failed {} also failed: {:#}", label, stop_err);
                }
                return Err(err.context(format!("servo {} failed at {:?}", label, command)));
            }
            if !hold.is_zero() {
                thread::sleep(hold);
            }
        }
        Ok(())
    }
}

impl Drop for ServoDriver {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("servo shutdown failed: {:#}", err);
        }
    }
}
