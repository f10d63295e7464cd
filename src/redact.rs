//! Privacy redaction: one opaque box over the subject, burned into pixels.
//!
//! The box never leaves this module as data. Callers only see the frame
//! after the fill.

use std::sync::Mutex;

use crate::frame::{Color, Frame, RED};
use crate::pose::KeypointSet;

#[derive(Clone, Debug)]
pub struct RedactionSettings {
    pub enabled: bool,
    /// Keypoints strictly above this confidence shape the box.
    pub min_confidence: f32,
    pub pad_side_px: i32,
    pub pad_top_px: i32,
    /// Larger than the other pads so the legs stay covered.
    pub pad_bottom_px: i32,
    pub color: Color,
    /// Weight of the previous box when smoothing edges across frames, in
    /// `[0, 1)`. `None` draws each frame's box as measured.
    pub smoothing_factor: Option<f32>,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.5,
            pad_side_px: 50,
            pad_top_px: 50,
            pad_bottom_px: 150,
            color: RED,
            smoothing_factor: None,
        }
    }
}

/// Pixel rectangle, half-open on the max edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BoundingBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl BoundingBox {
    fn clamped(self, width: u32, height: u32) -> Self {
        let (w, h) = (width as i32, height as i32);
        Self {
            x_min: self.x_min.clamp(0, w),
            y_min: self.y_min.clamp(0, h),
            x_max: self.x_max.clamp(0, w),
            y_max: self.y_max.clamp(0, h),
        }
    }
}

/// Exponential moving average over box edges.
#[derive(Debug)]
struct BoxSmoother {
    factor: f32,
    previous: Option<[f32; 4]>,
}

impl BoxSmoother {
    fn new(factor: f32) -> Self {
        Self {
            factor: factor.clamp(0.0, 0.99),
            previous: None,
        }
    }

    fn smooth(&mut self, measured: BoundingBox) -> BoundingBox {
        let current = [
            measured.x_min as f32,
            measured.y_min as f32,
            measured.x_max as f32,
            measured.y_max as f32,
        ];
        let next = match self.previous {
            Some(prev) => std::array::from_fn(|i| {
                self.factor * prev[i] + (1.0 - self.factor) * current[i]
            }),
            None => current,
        };
        self.previous = Some(next);
        BoundingBox {
            x_min: next[0].round() as i32,
            y_min: next[1].round() as i32,
            x_max: next[2].round() as i32,
            y_max: next[3].round() as i32,
        }
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}

pub struct RedactionOverlay {
    settings: RedactionSettings,
    smoother: Option<Mutex<BoxSmoother>>,
}

impl RedactionOverlay {
    pub fn new(settings: RedactionSettings) -> Self {
        let smoother = settings
            .smoothing_factor
            .map(|factor| Mutex::new(BoxSmoother::new(factor)));
        Self { settings, smoother }
    }

    pub fn settings(&self) -> &RedactionSettings {
        &self.settings
    }

    /// Box over the confident keypoints, padded and clamped to the frame.
    /// `None` when no keypoint passes the confidence filter.
    pub(crate) fn bounding_box(
        &self,
        keypoints: &KeypointSet,
        width: u32,
        height: u32,
    ) -> Option<BoundingBox> {
        let mut confident = keypoints
            .confident(self.settings.min_confidence)
            .map(|kp| kp.to_pixel(width, height));
        let (x0, y0) = confident.next()?;
        let (mut x_min, mut y_min, mut x_max, mut y_max) = (x0, y0, x0, y0);
        for (x, y) in confident {
            x_min = x_min.min(x);
            x_max = x_max.max(x);
            y_min = y_min.min(y);
            y_max = y_max.max(y);
        }
        let padded = BoundingBox {
            x_min: x_min.saturating_sub(self.settings.pad_side_px),
            y_min: y_min.saturating_sub(self.settings.pad_top_px),
            x_max: x_max.saturating_add(self.settings.pad_side_px),
            y_max: y_max.saturating_add(self.settings.pad_bottom_px),
        };
        Some(padded.clamped(width, height))
    }

    /// Fill the subject region. Returns whether anything was drawn.
    pub fn apply(&self, frame: &mut Frame, keypoints: Option<&KeypointSet>) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let (width, height) = (frame.width(), frame.height());
        let measured = keypoints.and_then(|set| self.bounding_box(set, width, height));

        let region = match (&self.smoother, measured) {
            (Some(smoother), Some(measured)) => {
                let mut smoother = match smoother.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                Some(smoother.smooth(measured).clamped(width, height))
            }
            (Some(smoother), None) => {
                let mut smoother = match smoother.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                smoother.reset();
                None
            }
            (None, measured) => measured,
        };

        match region {
            Some(b) => {
                frame.fill_rect(b.x_min, b.y_min, b.x_max, b.y_max, self.settings.color);
                true
            }
            None => false,
        }
    }
}

impl Default for RedactionOverlay {
    fn default() -> Self {
        Self::new(RedactionSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{Keypoint, KeypointIndex};

    fn single_point(y: f32, x: f32, conf: f32) -> KeypointSet {
        let mut set = KeypointSet::default();
        set.set(KeypointIndex::Nose, Keypoint::new(y, x, conf)).unwrap();
        set
    }

    #[test]
    fn box_is_padded_and_scaled() {
        let overlay = RedactionOverlay::default();
        let mut set = single_point(0.5, 0.5, 0.9);
        set.set(KeypointIndex::LeftAnkle, Keypoint::new(0.6, 0.4, 0.9)).unwrap();
        let b = overlay.bounding_box(&set, 640, 480).unwrap();
        assert_eq!(
            b,
            BoundingBox {
                x_min: 256 - 50,
                y_min: 240 - 50,
                x_max: 320 + 50,
                y_max: 288 + 150,
            }
        );
    }

    #[test]
    fn box_is_clamped_at_every_edge() {
        let overlay = RedactionOverlay::default();
        for (y, x) in [(0.0, 0.0), (1.0, 1.0), (0.02, 0.98), (0.97, 0.01)] {
            let b = overlay
                .bounding_box(&single_point(y, x, 0.9), 640, 480)
                .unwrap();
            assert!(b.x_min >= 0 && b.x_max <= 640, "{:?}", b);
            assert!(b.y_min >= 0 && b.y_max <= 480, "{:?}", b);
            assert!(b.x_min <= b.x_max && b.y_min <= b.y_max);
        }
    }

    #[test]
    fn out_of_range_coordinates_are_still_clamped() {
        let overlay = RedactionOverlay::default();
        let b = overlay
            .bounding_box(&single_point(-0.5, 1.7, 0.9), 100, 100)
            .unwrap();
        assert_eq!(b.x_min, 100);
        assert_eq!(b.x_max, 100);
        assert_eq!(b.y_min, 0);
    }

    #[test]
    fn no_confident_keypoint_leaves_frame_untouched() {
        let overlay = RedactionOverlay::default();
        let mut frame = Frame::solid(64, 48, [1, 2, 3], 0);
        // 0.5 is not strictly above the threshold
        let set = single_point(0.5, 0.5, 0.5);
        assert!(!overlay.apply(&mut frame, Some(&set)));
        assert!(!overlay.apply(&mut frame, None));
        assert!(frame.pixels().chunks(3).all(|p| p == [1, 2, 3]));
    }

    #[test]
    fn apply_fills_region_opaquely() {
        let overlay = RedactionOverlay::default();
        let mut frame = Frame::solid(640, 480, [0, 0, 0], 0);
        assert!(overlay.apply(&mut frame, Some(&single_point(0.5, 0.5, 0.9))));
        assert_eq!(frame.pixel(320, 240), RED);
        assert_eq!(frame.pixel(270, 190), RED);
        assert_eq!(frame.pixel(269, 240), [0, 0, 0]);
        assert_eq!(frame.pixel(320, 389), RED);
        assert_eq!(frame.pixel(320, 390), [0, 0, 0]);
    }

    #[test]
    fn disabled_overlay_draws_nothing() {
        let overlay = RedactionOverlay::new(RedactionSettings {
            enabled: false,
            ..RedactionSettings::default()
        });
        let mut frame = Frame::solid(64, 48, [0, 0, 0], 0);
        assert!(!overlay.apply(&mut frame, Some(&single_point(0.5, 0.5, 0.9))));
    }

    #[test]
    fn smoothing_moves_edges_part_way() {
        let overlay = RedactionOverlay::new(RedactionSettings {
            smoothing_factor: Some(0.5),
            pad_side_px: 10,
            pad_top_px: 10,
            pad_bottom_px: 10,
            ..RedactionSettings::default()
        });
        let mut frame = Frame::solid(100, 100, [0, 0, 0], 0);
        overlay.apply(&mut frame, Some(&single_point(0.5, 0.2, 0.9)));

        // measured x 50..70, previous x 10..30, drawn halfway at x 30..50
        let mut frame = Frame::solid(100, 100, [0, 0, 0], 0);
        overlay.apply(&mut frame, Some(&single_point(0.5, 0.6, 0.9)));
        assert_eq!(frame.pixel(40, 50), RED);
        assert_eq!(frame.pixel(60, 50), [0, 0, 0]);
    }

    #[test]
    fn lost_subject_resets_smoothing_even_after_poison() {
        let overlay = RedactionOverlay::new(RedactionSettings {
            smoothing_factor: Some(0.5),
            pad_side_px: 10,
            pad_top_px: 10,
            pad_bottom_px: 10,
            ..RedactionSettings::default()
        });
        let mut frame = Frame::solid(100, 100, [0, 0, 0], 0);
        overlay.apply(&mut frame, Some(&single_point(0.5, 0.2, 0.9)));

        let smoother = overlay.smoother.as_ref().unwrap();
        let _ = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = smoother.lock();
                panic!("smoother holder died");
            })
            .join()
        });
        assert!(smoother.is_poisoned());
        assert!(!overlay.apply(&mut frame, None));

        // no easing from the old box: drawn as measured at x 50..70
        let mut frame = Frame::solid(100, 100, [0, 0, 0], 0);
        overlay.apply(&mut frame, Some(&single_point(0.5, 0.6, 0.9)));
        assert_eq!(frame.pixel(60, 50), RED);
        assert_eq!(frame.pixel(40, 50), [0, 0, 0]);
    }
}
