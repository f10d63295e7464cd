use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A single hardware PWM output driving one servo.
pub trait PwmChannel: Send {
    fn name(&self) -> &'static str;

    /// Program `frequency_hz` and a duty cycle in percent. `0.0` cuts the pulse.
    fn set_duty_cycle(&mut self, frequency_hz: f64, duty_percent: f64) -> Result<()>;

    /// Return the output to the system. Called once at shutdown.
    fn release(&mut self) -> Result<()>;
}

const SYSFS_PWM_ROOT: &str = "/sys/class/pwm";

/// Linux sysfs PWM (`/sys/class/pwm/pwmchipN/pwmM`).
pub struct SysfsPwm {
    chip_dir: PathBuf,
    channel: u32,
    period_ns: Option<u64>,
    enabled: bool,
}

impl SysfsPwm {
    pub fn open(chip: u32, channel: u32) -> Result<Self> {
        Self::open_at(Path::new(SYSFS_PWM_ROOT), chip, channel)
    }

    /// Open under an arbitrary sysfs root.
    pub fn open_at(root: &Path, chip: u32, channel: u32) -> Result<Self> {
        let chip_dir = root.join(format!("pwmchip{}", chip));
        if !chip_dir.is_dir() {
            return Err(anyhow!("PWM chip not found: {}", chip_dir.display()));
        }
        let pwm = Self {
            chip_dir,
            channel,
            period_ns: None,
            enabled: false,
        };
        if !pwm.channel_dir().exists() {
            fs::write(pwm.chip_dir.join("export"), channel.to_string())
                .with_context(|| format!("export pwm{} on {}", channel, pwm.chip_dir.display()))?;
            // udev needs a moment to fix attribute permissions after export
            for _ in 0..20 {
                if pwm.channel_dir().join("period").exists() {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
        if !pwm.channel_dir().exists() {
            return Err(anyhow!(
                "pwm{} did not appear under {}",
                channel,
                pwm.chip_dir.display()
            ));
        }
        Ok(pwm)
    }

    fn channel_dir(&self) -> PathBuf {
        self.chip_dir.join(format!("pwm{}", self.channel))
    }

    fn write_attr(&self, attr: &str, value: u64) -> Result<()> {
        let path = self.channel_dir().join(attr);
        fs::write(&path, value.to_string())
            .with_context(|| format!("write {} to {}", value, path.display()))
    }
}

impl PwmChannel for SysfsPwm {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn set_duty_cycle(&mut self, frequency_hz: f64, duty_percent: f64) -> Result<()> {
        if !(frequency_hz.is_finite() && frequency_hz > 0.0) {
            return Err(anyhow!("invalid PWM frequency {}", frequency_hz));
        }
        if !(0.0..=100.0).contains(&duty_percent) {
            return Err(anyhow!("duty cycle {} outside 0..=100", duty_percent));
        }
        let period_ns = (1e9 / frequency_hz).round() as u64;
        let duty_ns = (period_ns as f64 * duty_percent / 100.0).round() as u64;

        if self.period_ns != Some(period_ns) {
            // duty must never exceed the period, so shrink it first
            self.write_attr("duty_cycle", 0)?;
            self.write_attr("period", period_ns)?;
            self.period_ns = Some(period_ns);
        }
        self.write_attr("duty_cycle", duty_ns)?;
        if !self.enabled {
            self.write_attr("enable", 1)?;
            self.enabled = true;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.enabled {
            self.write_attr("duty_cycle", 0)?;
            self.write_attr("enable", 0)?;
            self.enabled = false;
        }
        fs::write(self.chip_dir.join("unexport"), self.channel.to_string())
            .with_context(|| format!("unexport pwm{}", self.channel))?;
        Ok(())
    }
}

/// What a [`StubPwm`] was asked to do.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PwmWrite {
    Duty { frequency_hz: f64, duty_percent: f64 },
    Released,
}

/// Records every write instead of touching hardware.
#[derive(Clone, Default)]
pub struct StubPwm {
    log: Arc<Mutex<Vec<PwmWrite>>>,
    fail_writes: bool,
}

impl StubPwm {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel whose duty-cycle writes always fail.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Shared handle to the write log; stays readable after the stub is boxed.
    pub fn recorder(&self) -> Arc<Mutex<Vec<PwmWrite>>> {
        Arc::clone(&self.log)
    }

    fn push(&self, write: PwmWrite) -> Result<()> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| anyhow!("stub pwm log poisoned"))?;
        log.push(write);
        Ok(())
    }
}

impl PwmChannel for StubPwm {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn set_duty_cycle(&mut self, frequency_hz: f64, duty_percent: f64) -> Result<()> {
        if self.fail_writes && duty_percent > 0.0 {
            return Err(anyhow!("stub pwm write failure"));
        }
        self.push(PwmWrite::Duty {
            frequency_hz,
            duty_percent,
        })
    }

    fn release(&mut self) -> Result<()> {
        self.push(PwmWrite::Released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_chip(root: &Path) -> Result<()> {
        let channel = root.join("pwmchip0").join("pwm0");
        fs::create_dir_all(&channel)?;
        for attr in ["period", "duty_cycle", "enable"] {
            fs::write(channel.join(attr), "0")?;
        }
        fs::write(root.join("pwmchip0").join("export"), "")?;
        fs::write(root.join("pwmchip0").join("unexport"), "")?;
        Ok(())
    }

    #[test]
    fn sysfs_writes_period_and_duty_in_nanoseconds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fake_chip(dir.path())?;
        let mut pwm = SysfsPwm::open_at(dir.path(), 0, 0)?;
        pwm.set_duty_cycle(50.0, 7.5)?;

        let channel = dir.path().join("pwmchip0").join("pwm0");
        assert_eq!(fs::read_to_string(channel.join("period"))?, "20000000");
        assert_eq!(fs::read_to_string(channel.join("duty_cycle"))?, "1500000");
        assert_eq!(fs::read_to_string(channel.join("enable"))?, "1");

        pwm.release()?;
        assert_eq!(fs::read_to_string(channel.join("enable"))?, "0");
        assert_eq!(
            fs::read_to_string(dir.path().join("pwmchip0").join("unexport"))?,
            "0"
        );
        Ok(())
    }

    #[test]
    fn sysfs_rejects_missing_chip_and_bad_duty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(SysfsPwm::open_at(dir.path(), 3, 0).is_err());

        fake_chip(dir.path())?;
        let mut pwm = SysfsPwm::open_at(dir.path(), 0, 0)?;
        assert!(pwm.set_duty_cycle(50.0, 120.0).is_err());
        assert!(pwm.set_duty_cycle(0.0, 7.5).is_err());
        Ok(())
    }

    #[test]
    fn stub_records_writes() -> Result<()> {
        let mut pwm = StubPwm::new();
        let log = pwm.recorder();
        pwm.set_duty_cycle(50.0, 7.3)?;
        pwm.release()?;
        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                PwmWrite::Duty {
                    frequency_hz: 50.0,
                    duty_percent: 7.3
                },
                PwmWrite::Released
            ]
        );
        Ok(())
    }
}
