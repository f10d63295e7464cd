mod backend;
mod backends;
mod keypoints;

pub use backend::PoseEstimator;
pub use backends::{ScriptedEstimator, StubEstimator};
#[cfg(feature = "backend-tract")]
pub use backends::MoveNetBackend;
pub use backends::stub::standing_pose;
pub use keypoints::{Keypoint, KeypointIndex, KeypointSet};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Default MoveNet single-pose input resolution.
pub const MOVENET_INPUT_SIZE: u32 = 192;

/// Which pose backend to build at startup.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseBackendKind {
    /// Synthetic standing person in the frame centre.
    Stub,
    /// MoveNet single-pose ONNX model (feature: backend-tract).
    Tract,
}

#[derive(Clone, Debug)]
pub struct PoseSettings {
    pub backend: PoseBackendKind,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
}

impl Default for PoseSettings {
    fn default() -> Self {
        Self {
            backend: PoseBackendKind::Stub,
            model_path: None,
            input_size: MOVENET_INPUT_SIZE,
        }
    }
}

/// Build and warm up the configured estimator. Failure here is fatal for the
/// daemon.
pub fn open_estimator(settings: &PoseSettings) -> Result<Box<dyn PoseEstimator>> {
    ready(build_estimator(settings)?)
}

fn ready(mut estimator: Box<dyn PoseEstimator>) -> Result<Box<dyn PoseEstimator>> {
    estimator
        .warm_up()
        .with_context(|| format!("pose backend '{}' failed to warm up", estimator.name()))?;
    log::info!("pose backend '{}' ready", estimator.name());
    Ok(estimator)
}

fn build_estimator(settings: &PoseSettings) -> Result<Box<dyn PoseEstimator>> {
    match settings.backend {
        PoseBackendKind::Stub => Ok(Box::new(StubEstimator::standing())),
        PoseBackendKind::Tract => {
            let path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("pose backend 'tract' requires a model_path"))?;
            #[cfg(feature = "backend-tract")]
            {
                Ok(Box::new(MoveNetBackend::new(path, settings.input_size)?))
            }
            #[cfg(not(feature = "backend-tract"))]
            {
                Err(anyhow!(
                    "pose backend 'tract' ({}) requires the backend-tract feature",
                    path.display()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    struct ColdModel {
        warmed: bool,
        fail_warm_up: bool,
    }

    impl PoseEstimator for ColdModel {
        fn name(&self) -> &'static str {
            "cold"
        }

        fn infer(&mut self, _frame: &Frame) -> Result<KeypointSet> {
            if !self.warmed {
                return Err(anyhow!("inference before warm-up"));
            }
            Ok(standing_pose(0.5))
        }

        fn warm_up(&mut self) -> Result<()> {
            if self.fail_warm_up {
                return Err(anyhow!("weights truncated"));
            }
            self.warmed = true;
            Ok(())
        }
    }

    #[test]
    fn estimator_is_warmed_before_first_frame() -> Result<()> {
        let mut estimator = ready(Box::new(ColdModel {
            warmed: false,
            fail_warm_up: false,
        }))?;
        let frame = Frame::solid(32, 24, [0, 0, 0], 1);
        assert!(estimator.infer(&frame).is_ok());
        Ok(())
    }

    #[test]
    fn failed_warm_up_is_a_startup_error() {
        let err = ready(Box::new(ColdModel {
            warmed: false,
            fail_warm_up: true,
        }))
        .err()
        .expect("warm-up failure should surface");
        assert!(format!("{err:#}").contains("weights truncated"));
    }

    #[test]
    fn stub_backend_opens() -> Result<()> {
        let estimator = open_estimator(&PoseSettings::default())?;
        assert_eq!(estimator.name(), "stub");
        Ok(())
    }

    #[test]
    fn tract_backend_needs_model_path() {
        let settings = PoseSettings {
            backend: PoseBackendKind::Tract,
            ..PoseSettings::default()
        };
        assert!(open_estimator(&settings).is_err());
    }
}
