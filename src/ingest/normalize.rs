// Format conversion is only reached from the V4L2 device path.
#![cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]

use anyhow::{anyhow, Result};
use image::{imageops, RgbImage};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
    Yuyv,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YUYV" => Some(PixelFormat::Yuyv),
            _ => None,
        }
    }
}

/// Orientation fix applied to every captured frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameRotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    CounterClockwise90,
}

impl FrameRotation {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "0" | "none" => Ok(FrameRotation::None),
            "90" | "clockwise90" => Ok(FrameRotation::Clockwise90),
            "180" | "rotate180" => Ok(FrameRotation::Rotate180),
            "270" | "-90" | "counter_clockwise90" => Ok(FrameRotation::CounterClockwise90),
            other => Err(anyhow!("unsupported frame rotation '{}'", other)),
        }
    }

    pub(crate) fn apply(self, image: &RgbImage) -> Option<RgbImage> {
        match self {
            FrameRotation::None => None,
            FrameRotation::Clockwise90 => Some(imageops::rotate90(image)),
            FrameRotation::Rotate180 => Some(imageops::rotate180(image)),
            FrameRotation::CounterClockwise90 => Some(imageops::rotate270(image)),
        }
    }
}

pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = width
                .checked_mul(height)
                .and_then(|v| v.checked_mul(3))
                .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))? as usize;
            if pixels.len() != expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            Ok(pixels.to_vec())
        }
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height),
    }
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane
        .checked_add(y_plane / 2)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&ycbcr_to_rgb(
                pixels[j * w + i],
                pixels[uv_index],
                pixels[uv_index + 1],
            ));
        }
    }

    Ok(rgb)
}

/// Packed 4:2:2, two pixels per `Y0 U Y1 V` quad.
fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    if width % 2 != 0 {
        return Err(anyhow!("YUYV frame width {} is not even", width));
    }
    let pixel_count = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if pixels.len() != pixel_count * 2 {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            pixel_count * 2,
            pixels.len()
        ));
    }

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for quad in pixels.chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        clamp_to_u8(y + 1.402_f32 * v),
        clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v),
        clamp_to_u8(y + 1.772_f32 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let rgb = normalize_to_rgb(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(rgb, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn yuyv_conversion_expands_pairs() -> Result<()> {
        let yuyv = vec![16u8, 128, 235, 128];
        let rgb = normalize_to_rgb(&yuyv, 2, 1, PixelFormat::Yuyv)?;
        assert_eq!(rgb, vec![16, 16, 16, 235, 235, 235]);
        assert!(normalize_to_rgb(&yuyv, 3, 1, PixelFormat::Yuyv).is_err());
        Ok(())
    }

    #[test]
    fn rgb_pass_through_validates_length() -> Result<()> {
        let pixels = vec![1u8; 9];
        assert_eq!(normalize_to_rgb(&pixels, 1, 3, PixelFormat::Rgb24)?, pixels);
        assert!(normalize_to_rgb(&pixels, 2, 3, PixelFormat::Rgb24).is_err());
        Ok(())
    }

    #[test]
    fn clockwise_rotation_swaps_dimensions() {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        let rotated = FrameRotation::Clockwise90.apply(&image).unwrap();
        assert_eq!(rotated.dimensions(), (2, 4));
        // top-left moves to top-right
        assert_eq!(rotated.get_pixel(1, 0).0, [255, 0, 0]);
        assert!(FrameRotation::None.apply(&image).is_none());
    }

    #[test]
    fn rotation_names_parse() -> Result<()> {
        assert_eq!(FrameRotation::parse("90")?, FrameRotation::Clockwise90);
        assert_eq!(FrameRotation::parse("-90")?, FrameRotation::CounterClockwise90);
        assert!(FrameRotation::parse("45").is_err());
        Ok(())
    }
}
