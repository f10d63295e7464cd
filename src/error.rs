//! Error taxonomy for the frame loop.
//!
//! Only construction failures at startup are fatal. Everything here is
//! recovered locally: the frame is rendered without tracking, the servo
//! degrades to no-ops, or the iteration is skipped.

use std::fmt;

use crate::pose::KeypointIndex;

/// The pose for this frame cannot be trusted or was never produced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PoseUnavailable {
    /// The estimator returned a sequence that is not exactly 17 keypoints.
    WrongLength { expected: usize, actual: usize },
    /// A coordinate or confidence was NaN or infinite.
    NonFinite { index: usize },
    /// A required keypoint fell below the confidence gate.
    LowConfidence { keypoint: KeypointIndex, confidence: f32 },
}

impl fmt::Display for PoseUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoseUnavailable::WrongLength { expected, actual } => {
                write!(f, "pose unavailable: expected {expected} keypoints, got {actual}")
            }
            PoseUnavailable::NonFinite { index } => {
                write!(f, "pose unavailable: keypoint {index} is not finite")
            }
            PoseUnavailable::LowConfidence {
                keypoint,
                confidence,
            } => write!(
                f,
                "pose unavailable: {:?} confidence {:.2} below gate",
                keypoint, confidence
            ),
        }
    }
}

impl std::error::Error for PoseUnavailable {}

/// The actuation channel could not be acquired at startup.
#[derive(Debug)]
pub struct HardwareUnavailable {
    pub backend: String,
    pub reason: String,
}

impl fmt::Display for HardwareUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "servo hardware unavailable ({}): {}",
            self.backend, self.reason
        )
    }
}

impl std::error::Error for HardwareUnavailable {}

/// A single pipeline iteration failed and was skipped.
#[derive(Debug)]
pub enum PipelineError {
    FrameAcquisition(anyhow::Error),
    PoseEstimation(anyhow::Error),
    Encoding(anyhow::Error),
}

impl PipelineError {
    /// Short label used in degraded status strings.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::FrameAcquisition(_) => "camera",
            PipelineError::PoseEstimation(_) => "pose estimator",
            PipelineError::Encoding(_) => "encoder",
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::FrameAcquisition(e) => write!(f, "frame acquisition failed: {e:#}"),
            PipelineError::PoseEstimation(e) => write!(f, "pose estimation failed: {e:#}"),
            PipelineError::Encoding(e) => write!(f, "frame encoding failed: {e:#}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::FrameAcquisition(e)
            | PipelineError::PoseEstimation(e)
            | PipelineError::Encoding(e) => Some(e.as_ref()),
        }
    }
}
