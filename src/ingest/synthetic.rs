use anyhow::Result;

use super::FrameSource;
use crate::frame::Frame;

/// Test pattern source for `stub://` cameras.
///
/// Produces a diagonal gradient that drifts one pixel per frame, so encoded
/// frames differ and stream consumers can see motion.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        log::info!("SyntheticSource: connected ({}x{})", width, height);
        Self {
            width,
            height,
            frame_count: 0,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = self.frame_count as usize;
        let mut pixels = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                let v = ((x + y + shift) % 256) as u8;
                pixels.extend_from_slice(&[v, v / 2, 255 - v]);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn capture(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::from_rgb(pixels, self.width, self.height, self.frame_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_have_requested_size_and_advance() -> Result<()> {
        let mut source = SyntheticSource::new(32, 24);
        let first = source.capture()?;
        let second = source.capture()?;
        assert_eq!((first.width(), first.height()), (32, 24));
        assert_eq!(second.sequence(), 2);
        assert_ne!(first.pixels(), second.pixels());
        assert_eq!(source.frames_captured(), 2);
        Ok(())
    }
}
