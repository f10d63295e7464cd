//! fallwatchd - fall detection and redacted stream daemon
//!
//! This daemon:
//! 1. Opens the camera and the pose estimator (fatal on failure)
//! 2. Opens the pan servo (degrades to no-ops on failure)
//! 3. Runs the frame pipeline on its own thread
//! 4. Serves the redacted stream and control routes over HTTP
//! 5. Shuts down in order on Ctrl-C: pipeline, servo worker, servo, API

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use fallwatch::{
    api::{ApiServer, ApiState},
    config::FallwatchConfig,
    ingest::CameraSource,
    notify::{FallNotifier, LogSink, MqttSink},
    pipeline::{
        spawn_pipeline, FrameAnnotationPipeline, FrameHub, PipelineOutputs, StatusBoard,
    },
    pose::open_estimator,
    redact::RedactionOverlay,
    servo::open_servo,
    tracking::AutoTrackController,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fall detection with a privacy-redacted camera stream")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "FALLWATCH_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = FallwatchConfig::load_from(args.config.as_deref())?;

    let camera = CameraSource::open(&cfg.camera)
        .with_context(|| format!("failed to open camera {}", cfg.camera.source))?;
    let estimator = open_estimator(&cfg.pose).context("failed to build pose estimator")?;

    let driver = Arc::new(open_servo(&cfg.servo));
    let tracker = Arc::new(AutoTrackController::new(
        Arc::clone(&driver),
        cfg.tracking.clone(),
    ));
    log::info!(
        "servo backend '{}' ({}), auto-track {}",
        driver.backend(),
        if driver.is_available() { "available" } else { "unavailable" },
        if tracker.auto_enabled() { "enabled" } else { "disabled" }
    );

    let notifier = FallNotifier::new().with_sink(LogSink);
    if let Some(mqtt) = &cfg.mqtt {
        match MqttSink::connect(mqtt) {
            Ok(sink) => notifier.add_sink(Box::new(sink)),
            // events still reach the log sink
            Err(err) => log::warn!("mqtt sink disabled: {:#}", err),
        }
    }
    let notifier = Arc::new(notifier);
    let hub = Arc::new(FrameHub::new());
    let status = Arc::new(StatusBoard::new());

    let pipeline = FrameAnnotationPipeline::new(
        Box::new(camera),
        estimator,
        &cfg.fall,
        RedactionOverlay::new(cfg.redaction.clone()),
        PipelineOutputs {
            tracker: Arc::clone(&tracker),
            notifier: Arc::clone(&notifier),
            hub: Arc::clone(&hub),
            status: Arc::clone(&status),
        },
        cfg.pipeline.clone(),
    );
    let pipeline_handle = spawn_pipeline(pipeline)?;

    let api_handle = ApiServer::new(
        cfg.api.clone(),
        ApiState {
            tracker: Arc::clone(&tracker),
            notifier,
            hub,
            status,
        },
    )
    .spawn()?;
    log::info!("stream available at http://{}/video_feed", api_handle.addr);
    if cfg.api.require_token {
        if let Some(path) = &api_handle.token_path {
            log::info!("control token written to {}", path.display());
        } else {
            log::warn!("control token (handle securely): {}", api_handle.token);
        }
    } else {
        log::warn!("control routes accept requests without a token");
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("fallwatchd running, waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received");

    if let Err(err) = pipeline_handle.join() {
        log::error!("pipeline did not stop cleanly: {:#}", err);
    }
    tracker.join_in_flight();
    if let Err(err) = driver.shutdown() {
        log::error!("servo shutdown failed: {:#}", err);
    }
    api_handle.stop()?;
    log::info!("fallwatchd stopped");
    Ok(())
}
