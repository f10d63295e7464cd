use anyhow::Result;

use crate::frame::Frame;
use crate::pose::KeypointSet;

/// Pose estimator backend.
///
/// Called synchronously once per frame from the pipeline thread, so it may be
/// slow, but it must not retain the frame beyond the call.
pub trait PoseEstimator: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Estimate a single-person pose.
    ///
    /// Returns an error when inference itself fails. A person who is simply
    /// not visible still yields a set, with low confidences.
    fn infer(&mut self, frame: &Frame) -> Result<KeypointSet>;

    /// Run once at startup, before the first frame. A failure here is
    /// treated like a failure to build the backend.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
