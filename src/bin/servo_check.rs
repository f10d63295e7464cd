//! servo_check - bench tool for the pan servo
//!
//! Runs one driver sequence against the configured PWM channel so duty
//! cycles and timings can be tuned without the camera.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fallwatch::config::FallwatchConfig;
use fallwatch::servo::{open_servo, ServoBackendKind};

#[derive(Parser, Debug)]
#[command(author, version, about = "Exercise the pan servo for calibration")]
struct Args {
    /// JSON or TOML config file (servo section is used).
    #[arg(long, env = "FALLWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the servo backend (none, stub, sysfs).
    #[arg(long)]
    backend: Option<String>,

    /// Override the PWM chip number.
    #[arg(long)]
    chip: Option<u32>,

    /// Override the PWM channel number.
    #[arg(long)]
    channel: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clockwise pulse, then neutral.
    Cw,
    /// Counter-clockwise pulse, then neutral.
    Ccw,
    /// Manual clockwise pulse, then stop.
    CustomCw,
    /// Manual counter-clockwise pulse, then stop.
    CustomCcw,
    /// Duty 0.
    Stop,
    /// Alternate clockwise and counter-clockwise moves.
    Sweep {
        #[arg(long, default_value_t = 2)]
        cycles: u32,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut settings = FallwatchConfig::load_from(args.config.as_deref())?.servo;
    if let Some(backend) = &args.backend {
        settings.backend = ServoBackendKind::parse(backend)?;
    }
    if let Some(chip) = args.chip {
        settings.pwm_chip = chip;
    }
    if let Some(channel) = args.channel {
        settings.pwm_channel = channel;
    }

    let driver = open_servo(&settings);
    if !driver.is_available() {
        return Err(anyhow!(
            "servo backend '{}' is unavailable",
            settings.backend.as_str()
        ));
    }
    log::info!(
        "servo_check: backend {} (pwmchip{}/pwm{}), {:?}",
        driver.backend(),
        settings.pwm_chip,
        settings.pwm_channel,
        driver.calibration()
    );

    let result = match args.command {
        Command::Cw => driver.move_clockwise(),
        Command::Ccw => driver.move_counter_clockwise(),
        Command::CustomCw => driver.custom_move_clockwise(),
        Command::CustomCcw => driver.custom_move_counter_clockwise(),
        Command::Stop => driver.stop(),
        Command::Sweep { cycles } => (0..cycles).try_for_each(|cycle| {
            log::info!("sweep cycle {}/{}", cycle + 1, cycles);
            driver.move_clockwise()?;
            driver.move_counter_clockwise()
        }),
    };
    driver.shutdown()?;
    result?;
    log::info!("servo_check: done");
    Ok(())
}
