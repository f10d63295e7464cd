//! Captured frames and the pixel operations the pipeline performs on them.
//!
//! - `Frame`: owned RGB8 image plus its capture sequence number. Pixels are zeroized on
//!   drop, since an unredacted frame shows the subject.
//! - Drawing primitives: filled rectangles (redaction), dots and lines
//!   (skeleton), burned-in text (status).
//! - `encode_jpeg`: the only way pixels leave the process, and only after the
//!   pipeline has applied redaction.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use zeroize::Zeroize;

mod glyphs;

pub type Color = [u8; 3];

pub const WHITE: Color = [255, 255, 255];
pub const GREEN: Color = [0, 255, 0];
pub const RED: Color = [255, 0, 0];
pub const BLUE: Color = [0, 0, 255];

/// One captured RGB frame.
pub struct Frame {
    image: RgbImage,
    sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self { image, sequence }
    }

    /// Wrap packed RGB24 bytes. Fails when the length does not match the size.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer rejected for {}x{}", width, height))?;
        Ok(Self::new(image, sequence))
    }

    /// Uniformly filled frame, used by synthetic sources and tests.
    pub fn solid(width: u32, height: u32, color: Color, sequence: u64) -> Self {
        Self::new(RgbImage::from_pixel(width, height, Rgb(color)), sequence)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB24 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Color {
        self.image.get_pixel(x, y).0
    }

    /// Replace the image, e.g. after rotation. The previous buffer is wiped.
    pub fn replace_image(&mut self, image: RgbImage) {
        let mut old = std::mem::replace(&mut self.image, image);
        wipe(&mut old);
    }

    /// Fill `[x_min, x_max) x [y_min, y_max)`, clipped to the frame.
    pub fn fill_rect(&mut self, x_min: i32, y_min: i32, x_max: i32, y_max: i32, color: Color) {
        let (w, h) = (self.width() as i32, self.height() as i32);
        let x0 = x_min.clamp(0, w);
        let x1 = x_max.clamp(0, w);
        let y0 = y_min.clamp(0, h);
        let y1 = y_max.clamp(0, h);
        for y in y0..y1 {
            for x in x0..x1 {
                self.image.put_pixel(x as u32, y as u32, Rgb(color));
            }
        }
    }

    /// Filled disc centred on `(cx, cy)`, clipped to the frame.
    pub fn draw_dot(&mut self, cx: i32, cy: i32, radius: i32, color: Color) {
        let (cx, cy) = (i64::from(cx), i64::from(cy));
        let radius = i64::from(radius.max(0));
        let r2 = radius * radius;
        let x_range = (cx - radius).max(0)..=(cx + radius).min(i64::from(self.width()) - 1);
        let y_range = (cy - radius).max(0)..=(cy + radius).min(i64::from(self.height()) - 1);
        for y in y_range {
            for x in x_range.clone() {
                let (dx, dy) = (x - cx, y - cy);
                if (dx * dx).saturating_add(dy * dy) <= r2 {
                    self.image.put_pixel(x as u32, y as u32, Rgb(color));
                }
            }
        }
    }

    /// Bresenham line with a square pen of `thickness` pixels.
    ///
    /// The segment is clipped to the frame first, so endpoints far outside
    /// it cost nothing extra.
    pub fn draw_line(&mut self, from: (i32, i32), to: (i32, i32), thickness: i32, color: Color) {
        let half = i64::from(thickness.max(1) / 2);
        let bounds = (
            -half,
            -half,
            i64::from(self.width()) - 1 + half,
            i64::from(self.height()) - 1 + half,
        );
        let Some(((mut x, mut y), end)) = clip_segment(from, to, bounds) else {
            return;
        };
        let dx = (end.0 - x).abs();
        let dy = -(end.1 - y).abs();
        let sx = if x < end.0 { 1 } else { -1 };
        let sy = if y < end.1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            for oy in -half..=half {
                for ox in -half..=half {
                    self.put_clipped(x + ox, y + oy, color);
                }
            }
            if x == end.0 && y == end.1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// Burn `text` into the frame with its top-left corner at `(x, y)`.
    ///
    /// Uses the built-in 5x7 glyph set; lowercase is rendered as uppercase and
    /// unsupported characters advance the cursor without drawing.
    pub fn draw_text(&mut self, x: i32, y: i32, text: &str, scale: i32, color: Color) {
        let scale = scale.max(1);
        let mut cursor = x;
        for ch in text.chars() {
            if let Some(rows) = glyphs::glyph(ch) {
                for (row, bits) in rows.iter().enumerate() {
                    for col in 0..glyphs::GLYPH_WIDTH {
                        if bits & (1 << (glyphs::GLYPH_WIDTH - 1 - col)) != 0 {
                            let px = cursor + col as i32 * scale;
                            let py = y + row as i32 * scale;
                            for sy in 0..scale {
                                for sx in 0..scale {
                                    self.put_clipped(
                                        i64::from(px + sx),
                                        i64::from(py + sy),
                                        color,
                                    );
                                }
                            }
                        }
                    }
                }
            }
            cursor += glyphs::ADVANCE as i32 * scale;
        }
    }

    /// Encode as baseline JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode_image(&self.image)
            .context("encode jpeg")?;
        Ok(out)
    }

    fn put_clipped(&mut self, x: i64, y: i64, color: Color) {
        if x >= 0 && y >= 0 && x < i64::from(self.width()) && y < i64::from(self.height()) {
            self.image.put_pixel(x as u32, y as u32, Rgb(color));
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        wipe(&mut self.image);
    }
}

fn wipe(image: &mut RgbImage) {
    let pixels: &mut [u8] = image;
    pixels.zeroize();
}

/// Liang-Barsky clip of `from -> to` against the inclusive rectangle
/// `(x_min, y_min, x_max, y_max)`. `None` when the segment misses it.
fn clip_segment(
    from: (i32, i32),
    to: (i32, i32),
    (x_min, y_min, x_max, y_max): (i64, i64, i64, i64),
) -> Option<((i64, i64), (i64, i64))> {
    let (x0, y0) = (f64::from(from.0), f64::from(from.1));
    let (dx, dy) = (f64::from(to.0) - x0, f64::from(to.1) - y0);
    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    for (p, q) in [
        (-dx, x0 - x_min as f64),
        (dx, x_max as f64 - x0),
        (-dy, y0 - y_min as f64),
        (dy, y_max as f64 - y0),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else if p < 0.0 {
            t0 = t0.max(q / p);
        } else {
            t1 = t1.min(q / p);
        }
    }
    if t0 > t1 {
        return None;
    }
    let at = |t: f64| ((x0 + t * dx).round() as i64, (y0 + t * dy).round() as i64);
    Some((at(t0), at(t1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_rejects_length_mismatch() {
        assert!(Frame::from_rgb(vec![0u8; 10], 2, 2, 0).is_err());
        assert!(Frame::from_rgb(vec![0u8; 12], 2, 2, 0).is_ok());
    }

    #[test]
    fn fill_rect_clips_to_frame() {
        let mut frame = Frame::solid(10, 10, [0, 0, 0], 0);
        frame.fill_rect(-5, -5, 3, 20, RED);
        assert_eq!(frame.pixel(0, 0), RED);
        assert_eq!(frame.pixel(2, 9), RED);
        assert_eq!(frame.pixel(3, 0), [0, 0, 0]);
    }

    #[test]
    fn text_changes_pixels_only_inside_glyph_cells() {
        let mut frame = Frame::solid(40, 20, [0, 0, 0], 0);
        frame.draw_text(1, 1, "NO", 1, WHITE);
        let lit = frame.pixels().chunks(3).filter(|p| *p == WHITE).count();
        assert!(lit > 0);
        assert_eq!(frame.pixel(39, 19), [0, 0, 0]);
    }

    #[test]
    fn line_reaches_both_endpoints() {
        let mut frame = Frame::solid(20, 20, [0, 0, 0], 0);
        frame.draw_line((2, 3), (15, 17), 1, GREEN);
        assert_eq!(frame.pixel(2, 3), GREEN);
        assert_eq!(frame.pixel(15, 17), GREEN);
    }

    #[test]
    fn dot_far_outside_frame_draws_nothing() {
        let mut frame = Frame::solid(20, 20, [0, 0, 0], 0);
        frame.draw_dot(i32::MIN, i32::MAX, 4, GREEN);
        frame.draw_dot(i32::MAX, 5, 1000, GREEN);
        assert!(frame.pixels().chunks(3).all(|p| p == [0, 0, 0]));
    }

    #[test]
    fn dot_on_edge_is_partly_drawn() {
        let mut frame = Frame::solid(20, 20, [0, 0, 0], 0);
        frame.draw_dot(0, 0, 2, GREEN);
        assert_eq!(frame.pixel(0, 0), GREEN);
        assert_eq!(frame.pixel(2, 0), GREEN);
        assert_eq!(frame.pixel(2, 2), [0, 0, 0]);
    }

    #[test]
    fn line_from_saturated_endpoint_is_clipped() {
        let mut frame = Frame::solid(64, 48, [0, 0, 0], 0);
        let started = std::time::Instant::now();
        frame.draw_line((i32::MIN, 10), (30, 10), 2, BLUE);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(frame.pixel(0, 10), BLUE);
        assert_eq!(frame.pixel(30, 10), BLUE);
        assert_eq!(frame.pixel(31, 10), BLUE);
        assert_eq!(frame.pixel(33, 10), [0, 0, 0]);
    }

    #[test]
    fn line_that_misses_frame_draws_nothing() {
        let mut frame = Frame::solid(64, 48, [0, 0, 0], 0);
        frame.draw_line((i32::MIN, i32::MIN), (i32::MAX, i32::MIN), 2, BLUE);
        frame.draw_line((-100, -5), (-3, 200), 1, BLUE);
        assert!(frame.pixels().chunks(3).all(|p| p == [0, 0, 0]));
    }

    #[test]
    fn jpeg_output_has_soi_marker() -> Result<()> {
        let frame = Frame::solid(16, 16, [10, 20, 30], 0);
        let bytes = frame.encode_jpeg(80)?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        Ok(())
    }
}
