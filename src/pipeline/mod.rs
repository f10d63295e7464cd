//! Per-frame orchestration.
//!
//! One iteration: capture, infer, classify, track, draw, redact, burn in
//! status text, encode, publish. An iteration that fails at an external
//! collaborator is skipped; the loop itself never stops on a frame error.
//! Raw frames are only published after redaction. While no safe frame can be
//! produced the hub receives a black placeholder with the degraded status.

mod hub;
mod status;

pub use hub::{FrameHub, HubFrame};
pub use status::{StatusBoard, StatusSnapshot};

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::fall::{FallClassifier, FallMonitor, FallSettings, FallState};
use crate::frame::{Frame, BLUE, GREEN};
use crate::ingest::FrameSource;
use crate::notify::FallNotifier;
use crate::pose::{KeypointIndex, KeypointSet, PoseEstimator};
use crate::redact::RedactionOverlay;
use crate::tracking::{AutoTrackController, TrackDecision};

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub jpeg_quality: u8,
    /// Failed iterations in a row before the status turns degraded.
    pub max_consecutive_failures: u32,
    /// Draw keypoint dots and the head-to-hip line before redaction.
    pub draw_keypoints: bool,
    pub keypoint_draw_confidence: f32,
    /// Loop pacing. `0` runs as fast as the camera delivers.
    pub target_fps: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            max_consecutive_failures: 30,
            draw_keypoints: true,
            keypoint_draw_confidence: 0.3,
            target_fps: 10,
        }
    }
}

/// Summary of one successful iteration.
#[derive(Clone, Copy, Debug)]
pub struct StepOutcome {
    pub sequence: u64,
    pub generation: u64,
    pub fall: Option<FallState>,
    pub tracking: TrackDecision,
    pub redacted: bool,
    pub fall_event_emitted: bool,
}

pub struct FrameAnnotationPipeline {
    source: Box<dyn FrameSource>,
    estimator: Box<dyn PoseEstimator>,
    classifier: FallClassifier,
    monitor: FallMonitor,
    tracker: Arc<AutoTrackController>,
    redaction: RedactionOverlay,
    notifier: Arc<FallNotifier>,
    hub: Arc<FrameHub>,
    status: Arc<StatusBoard>,
    settings: PipelineSettings,
    consecutive_failures: u32,
    degraded: bool,
    last_size: Option<(u32, u32)>,
    frames_published: u64,
}

/// Shared collaborators the pipeline publishes into.
pub struct PipelineOutputs {
    pub tracker: Arc<AutoTrackController>,
    pub notifier: Arc<FallNotifier>,
    pub hub: Arc<FrameHub>,
    pub status: Arc<StatusBoard>,
}

impl FrameAnnotationPipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        estimator: Box<dyn PoseEstimator>,
        fall: &FallSettings,
        redaction: RedactionOverlay,
        outputs: PipelineOutputs,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            estimator,
            classifier: FallClassifier::new(fall),
            monitor: FallMonitor::new(fall.confirm_after),
            tracker: outputs.tracker,
            redaction,
            notifier: outputs.notifier,
            hub: outputs.hub,
            status: outputs.status,
            settings,
            consecutive_failures: 0,
            degraded: false,
            last_size: None,
            frames_published: 0,
        }
    }

    /// Run one iteration at `now`.
    pub fn step(&mut self, now: Instant) -> Result<StepOutcome, PipelineError> {
        match self.try_step(now) {
            Ok(outcome) => {
                if self.degraded {
                    log::info!("pipeline recovered after {} failures", self.consecutive_failures);
                }
                self.consecutive_failures = 0;
                self.degraded = false;
                Ok(outcome)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn try_step(&mut self, now: Instant) -> Result<StepOutcome, PipelineError> {
        let mut frame = self
            .source
            .capture()
            .map_err(PipelineError::FrameAcquisition)?;
        self.last_size = Some((frame.width(), frame.height()));
        let camera_healthy = self.source.is_healthy();

        let keypoints = self
            .estimator
            .infer(&frame)
            .map_err(PipelineError::PoseEstimation)?;

        let fall = match self.classifier.classify(&keypoints, now) {
            Ok(state) => Some(state),
            Err(unavailable) => {
                log::debug!("frame {}: {}", frame.sequence(), unavailable);
                None
            }
        };

        let fall_event_emitted = match self.monitor.observe(fall.as_ref()) {
            Some(event) => {
                self.notifier.emit(&event);
                true
            }
            None => false,
        };

        let tracked = fall.as_ref().map(|_| &keypoints);
        let tracking = self.tracker.evaluate(tracked, frame.width(), now);

        if self.settings.draw_keypoints {
            self.draw_skeleton(&mut frame, &keypoints);
        }
        // redaction filters on its own threshold, so a pose that failed the
        // fall gate can still be covered
        let redacted = self.redaction.apply(&mut frame, Some(&keypoints));
        status::draw_overlay(&mut frame, fall.as_ref(), &tracking);

        let jpeg = frame
            .encode_jpeg(self.settings.jpeg_quality)
            .map_err(PipelineError::Encoding)?;
        let generation = self.hub.publish(jpeg);
        self.frames_published += 1;

        let frames_published = self.frames_published;
        self.status.update(|s| {
            s.status = status::pose_status(fall.as_ref()).to_string();
            s.fall_detected = fall.map(|f| f.is_fall).unwrap_or(false);
            s.angle_degrees = fall.map(|f| f.angle_degrees);
            s.pose_available = fall.is_some();
            s.auto_track_enabled = tracking.auto_enabled;
            s.servo_available = tracking.hardware_available;
            s.camera_healthy = camera_healthy;
            s.tracking_phase = tracking.phase;
            s.next_check_secs = tracking.remaining_cooldown.as_secs();
            s.frames_published = frames_published;
            s.consecutive_failures = 0;
            s.last_error = None;
        });

        Ok(StepOutcome {
            sequence: frame.sequence(),
            generation,
            fall,
            tracking,
            redacted,
            fall_event_emitted,
        })
    }

    fn draw_skeleton(&self, frame: &mut Frame, keypoints: &KeypointSet) {
        let (w, h) = (frame.width(), frame.height());
        let threshold = self.settings.keypoint_draw_confidence;
        let radius = ((w.min(h) / 120).max(2)) as i32;
        for kp in keypoints.confident(threshold) {
            let (x, y) = kp.to_pixel(w, h);
            frame.draw_dot(x, y, radius, GREEN);
        }

        let head = keypoints.head();
        let (left, right) = (
            keypoints.get(KeypointIndex::LeftHip),
            keypoints.get(KeypointIndex::RightHip),
        );
        if head.confidence > threshold && left.confidence > threshold && right.confidence > threshold
        {
            let hip_x = ((left.x + right.x) / 2.0 * w as f32) as i32;
            let hip_y = ((left.y + right.y) / 2.0 * h as f32) as i32;
            frame.draw_line(head.to_pixel(w, h), (hip_x, hip_y), 2, BLUE);
        }
    }

    fn record_failure(&mut self, err: &PipelineError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures == 1 {
            log::warn!("pipeline iteration skipped: {}", err);
        } else {
            log::debug!(
                "pipeline iteration skipped ({} in a row): {}",
                self.consecutive_failures,
                err
            );
        }

        // a source that knows it is gone degrades at once
        let camera_healthy = self.source.is_healthy();
        let stage = if camera_healthy { err.stage() } else { "camera" };
        let degraded =
            !camera_healthy || self.consecutive_failures >= self.settings.max_consecutive_failures;
        let failures = self.consecutive_failures;
        let message = err.to_string();
        self.status.update(|s| {
            s.consecutive_failures = failures;
            s.camera_healthy = camera_healthy;
            s.last_error = Some(message);
            if degraded {
                s.status = format!("degraded: {} unavailable", stage);
            }
        });

        if degraded && !self.degraded {
            log::warn!(
                "pipeline degraded after {} failures: {} unavailable",
                failures,
                stage
            );
        }
        self.degraded = degraded;
        if degraded {
            self.publish_placeholder(stage);
        }
    }

    fn publish_placeholder(&mut self, stage: &str) {
        let (width, height) = self.last_size.unwrap_or((640, 480));
        let text = format!("{} unavailable", stage);
        let frame = status::placeholder(width, height, &text, 0);
        match frame.encode_jpeg(self.settings.jpeg_quality) {
            Ok(jpeg) => {
                self.hub.publish(jpeg);
            }
            Err(err) => log::debug!("placeholder encode failed: {:#}", err),
        }
    }
}

/// Handle to the pipeline thread.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Ask the loop to exit after the current iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    pub fn join(mut self) -> Result<()> {
        self.stop();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| anyhow!("pipeline thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Run the pipeline on a dedicated thread until stopped.
pub fn spawn_pipeline(mut pipeline: FrameAnnotationPipeline) -> Result<PipelineHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let interval = match pipeline.settings.target_fps {
        0 => Duration::ZERO,
        fps => Duration::from_millis(1000 / fps as u64),
    };
    let thread = thread::Builder::new()
        .name("frame-pipeline".into())
        .spawn(move || {
            log::info!("frame pipeline started");
            while !stop_flag.load(Ordering::SeqCst) {
                let started = Instant::now();
                if pipeline.step(started).is_err() {
                    // back off so a dead camera does not spin
                    thread::sleep(interval.max(Duration::from_millis(100)));
                    continue;
                }
                let elapsed = started.elapsed();
                if elapsed < interval {
                    thread::sleep(interval - elapsed);
                }
            }
            pipeline.hub.close();
            log::info!("frame pipeline stopped");
        })
        .map_err(|e| anyhow!("spawn pipeline thread: {}", e))?;
    Ok(PipelineHandle {
        stop,
        thread: Some(thread),
    })
}
