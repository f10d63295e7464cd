use serde::{Deserialize, Serialize};

use crate::error::PoseUnavailable;

/// Anatomical role of each slot in a [`KeypointSet`] (MoveNet/COCO order).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl KeypointIndex {
    pub const COUNT: usize = 17;

    /// Head position used by the fall classifier and the tracker.
    pub const HEAD: KeypointIndex = KeypointIndex::Nose;

    pub fn as_usize(self) -> usize {
        self as usize
    }
}

/// One estimated landmark.
///
/// Coordinates are normalized: `y` is a fraction of frame height and `x` a
/// fraction of frame width, both nominally in `[0, 1]`. Only the overlay and
/// the tracker convert to pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub y: f32,
    pub x: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(y: f32, x: f32, confidence: f32) -> Self {
        Self { y, x, confidence }
    }

    pub fn is_confident(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }

    /// Pixel position as `(x, y)`, truncated toward zero.
    pub fn to_pixel(&self, width: u32, height: u32) -> (i32, i32) {
        (
            (self.x * width as f32) as i32,
            (self.y * height as f32) as i32,
        )
    }

    fn is_finite(&self) -> bool {
        self.y.is_finite() && self.x.is_finite() && self.confidence.is_finite()
    }
}

/// Exactly 17 keypoints for a single person.
///
/// The only way to build one is through the checked constructors, so holders
/// can index any [`KeypointIndex`] without bounds concerns.
#[derive(Clone, Debug, PartialEq)]
pub struct KeypointSet {
    points: [Keypoint; KeypointIndex::COUNT],
}

impl KeypointSet {
    pub fn new(points: [Keypoint; KeypointIndex::COUNT]) -> Result<Self, PoseUnavailable> {
        if let Some(index) = points.iter().position(|kp| !kp.is_finite()) {
            return Err(PoseUnavailable::NonFinite { index });
        }
        Ok(Self { points })
    }

    pub fn from_slice(points: &[Keypoint]) -> Result<Self, PoseUnavailable> {
        let array: [Keypoint; KeypointIndex::COUNT] =
            points
                .try_into()
                .map_err(|_| PoseUnavailable::WrongLength {
                    expected: KeypointIndex::COUNT,
                    actual: points.len(),
                })?;
        Self::new(array)
    }

    /// Build from a flat `[y, x, score]` triple sequence (MoveNet output layout).
    pub fn from_triples(values: &[f32]) -> Result<Self, PoseUnavailable> {
        if values.len() != KeypointIndex::COUNT * 3 {
            return Err(PoseUnavailable::WrongLength {
                expected: KeypointIndex::COUNT,
                actual: values.len() / 3,
            });
        }
        let points: Vec<Keypoint> = values
            .chunks_exact(3)
            .map(|c| Keypoint::new(c[0], c[1], c[2]))
            .collect();
        Self::from_slice(&points)
    }

    pub fn get(&self, index: KeypointIndex) -> &Keypoint {
        &self.points[index.as_usize()]
    }

    /// Replace one slot. Non-finite values are rejected and leave the set
    /// unchanged.
    pub fn set(
        &mut self,
        index: KeypointIndex,
        keypoint: Keypoint,
    ) -> Result<(), PoseUnavailable> {
        if !keypoint.is_finite() {
            return Err(PoseUnavailable::NonFinite {
                index: index.as_usize(),
            });
        }
        self.points[index.as_usize()] = keypoint;
        Ok(())
    }

    pub fn head(&self) -> &Keypoint {
        self.get(KeypointIndex::HEAD)
    }

    pub fn left_hip(&self) -> &Keypoint {
        self.get(KeypointIndex::LeftHip)
    }

    pub fn right_hip(&self) -> &Keypoint {
        self.get(KeypointIndex::RightHip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keypoint> {
        self.points.iter()
    }

    /// Keypoints strictly above `threshold` confidence.
    pub fn confident(&self, threshold: f32) -> impl Iterator<Item = &Keypoint> {
        self.points.iter().filter(move |kp| kp.confidence > threshold)
    }
}

impl Default for KeypointSet {
    fn default() -> Self {
        Self {
            points: [Keypoint::default(); KeypointIndex::COUNT],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_sequence_is_unavailable() {
        let points = vec![Keypoint::new(0.5, 0.5, 0.9); 12];
        assert_eq!(
            KeypointSet::from_slice(&points),
            Err(PoseUnavailable::WrongLength {
                expected: 17,
                actual: 12
            })
        );
    }

    #[test]
    fn nan_coordinate_is_unavailable() {
        let mut points = vec![Keypoint::new(0.5, 0.5, 0.9); 17];
        points[11].x = f32::NAN;
        assert_eq!(
            KeypointSet::from_slice(&points),
            Err(PoseUnavailable::NonFinite { index: 11 })
        );
    }

    #[test]
    fn set_rejects_non_finite_keypoint() {
        let mut set = KeypointSet::default();
        assert_eq!(
            set.set(KeypointIndex::LeftHip, Keypoint::new(0.5, f32::INFINITY, 0.9)),
            Err(PoseUnavailable::NonFinite { index: 11 })
        );
        assert_eq!(*set.left_hip(), Keypoint::default());
        assert!(set.set(KeypointIndex::LeftHip, Keypoint::new(0.5, 0.4, 0.9)).is_ok());
        assert_eq!(set.left_hip().x, 0.4);
    }

    #[test]
    fn triples_follow_y_x_score_order() {
        let mut values = vec![0.0f32; 51];
        values[0] = 0.25;
        values[1] = 0.75;
        values[2] = 0.9;
        let set = KeypointSet::from_triples(&values).unwrap();
        assert_eq!(*set.head(), Keypoint::new(0.25, 0.75, 0.9));
        assert!(KeypointSet::from_triples(&values[..48]).is_err());
    }

    #[test]
    fn pixel_conversion_scales_by_frame_size() {
        let kp = Keypoint::new(0.5, 0.25, 1.0);
        assert_eq!(kp.to_pixel(640, 480), (160, 240));
    }
}
