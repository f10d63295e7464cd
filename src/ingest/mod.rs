//! Camera frame acquisition.
//!
//! Every source yields upright RGB [`Frame`]s of a fixed size:
//! - `stub://...`: synthetic test pattern, no hardware needed
//! - `/dev/videoN`: V4L2 capture device (feature: ingest-v4l2)
//!
//! Sources never write frames anywhere. The pixels are handed to the
//! pipeline and wiped when the frame is dropped.

mod normalize;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

pub use normalize::FrameRotation;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Device;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

/// Anything that can produce the next frame for the pipeline.
pub trait FrameSource: Send {
    /// Source label for logs and status.
    fn name(&self) -> &str;

    /// Block until the next frame is available.
    fn capture(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool {
        true
    }
}

#[derive(Clone, Debug)]
pub struct CameraSettings {
    /// `stub://<label>` or a V4L2 device path.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub rotation: FrameRotation,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            source: "stub://camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 10,
            rotation: FrameRotation::None,
        }
    }
}

/// The configured camera, with rotation applied after capture.
pub struct CameraSource {
    backend: CameraBackend,
    rotation: FrameRotation,
    label: String,
}

enum CameraBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-v4l2")]
    Device(V4l2Device),
}

impl CameraSource {
    /// Build and connect. Failure here is fatal for the daemon.
    pub fn open(settings: &CameraSettings) -> Result<Self> {
        if settings.width == 0 || settings.height == 0 {
            return Err(anyhow!(
                "camera size {}x{} is empty",
                settings.width,
                settings.height
            ));
        }
        let backend = if settings.source.starts_with("stub://") {
            CameraBackend::Synthetic(SyntheticSource::new(settings.width, settings.height))
        } else {
            #[cfg(feature = "ingest-v4l2")]
            {
                let mut device = V4l2Device::new(settings.clone());
                device.connect()?;
                CameraBackend::Device(device)
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                return Err(anyhow!(
                    "camera '{}' requires the ingest-v4l2 feature",
                    settings.source
                ));
            }
        };
        log::info!(
            "CameraSource: opened {} ({}x{}, rotation {:?})",
            settings.source,
            settings.width,
            settings.height,
            settings.rotation
        );
        Ok(Self {
            backend,
            rotation: settings.rotation,
            label: settings.source.clone(),
        })
    }
}

impl FrameSource for CameraSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn capture(&mut self) -> Result<Frame> {
        let mut frame = match &mut self.backend {
            CameraBackend::Synthetic(source) => source.capture()?,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.capture()?,
        };
        if let Some(rotated) = self.rotation.apply(frame.image()) {
            frame.replace_image(rotated);
        }
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.is_healthy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_camera_applies_rotation() -> Result<()> {
        let mut camera = CameraSource::open(&CameraSettings {
            rotation: FrameRotation::Clockwise90,
            ..CameraSettings::default()
        })?;
        let frame = camera.capture()?;
        assert_eq!((frame.width(), frame.height()), (480, 640));
        assert!(camera.is_healthy());
        Ok(())
    }

    #[test]
    fn empty_size_is_rejected() {
        let settings = CameraSettings {
            width: 0,
            ..CameraSettings::default()
        };
        assert!(CameraSource::open(&settings).is_err());
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    #[test]
    fn device_path_needs_feature() {
        let settings = CameraSettings {
            source: "/dev/video0".to_string(),
            ..CameraSettings::default()
        };
        assert!(CameraSource::open(&settings).is_err());
    }
}
