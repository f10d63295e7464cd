use anyhow::Result;

use crate::frame::Frame;
use crate::pose::backend::PoseEstimator;
use crate::pose::{Keypoint, KeypointIndex, KeypointSet};

/// Stub backend for development. Always reports the same pose.
pub struct StubEstimator {
    pose: KeypointSet,
}

impl StubEstimator {
    pub fn new(pose: KeypointSet) -> Self {
        Self { pose }
    }

    /// Upright person centred in frame, head above hips.
    pub fn standing() -> Self {
        Self::new(standing_pose(0.5))
    }
}

impl Default for StubEstimator {
    fn default() -> Self {
        Self::standing()
    }
}

impl PoseEstimator for StubEstimator {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, _frame: &Frame) -> Result<KeypointSet> {
        Ok(self.pose.clone())
    }
}

/// Upright skeleton with its head at horizontal position `x` (normalized).
/// A non-finite `x` yields the empty default set.
pub fn standing_pose(x: f32) -> KeypointSet {
    let mut set = KeypointSet::default();
    let layout = [
        (KeypointIndex::Nose, 0.20, 0.0),
        (KeypointIndex::LeftEye, 0.18, -0.01),
        (KeypointIndex::RightEye, 0.18, 0.01),
        (KeypointIndex::LeftEar, 0.19, -0.02),
        (KeypointIndex::RightEar, 0.19, 0.02),
        (KeypointIndex::LeftShoulder, 0.30, -0.05),
        (KeypointIndex::RightShoulder, 0.30, 0.05),
        (KeypointIndex::LeftElbow, 0.40, -0.07),
        (KeypointIndex::RightElbow, 0.40, 0.07),
        (KeypointIndex::LeftWrist, 0.50, -0.07),
        (KeypointIndex::RightWrist, 0.50, 0.07),
        (KeypointIndex::LeftHip, 0.55, -0.04),
        (KeypointIndex::RightHip, 0.55, 0.04),
        (KeypointIndex::LeftKnee, 0.70, -0.04),
        (KeypointIndex::RightKnee, 0.70, 0.04),
        (KeypointIndex::LeftAnkle, 0.85, -0.04),
        (KeypointIndex::RightAnkle, 0.85, 0.04),
    ];
    for (index, y, dx) in layout {
        if set.set(index, Keypoint::new(y, x + dx, 0.9)).is_err() {
            return KeypointSet::default();
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_reports_confident_upright_pose() -> Result<()> {
        let mut backend = StubEstimator::standing();
        let frame = Frame::solid(64, 48, [0, 0, 0], 1);
        let pose = backend.infer(&frame)?;
        assert!(pose.head().y < pose.left_hip().y);
        assert!(pose.iter().all(|kp| kp.confidence > 0.5));
        Ok(())
    }
}
