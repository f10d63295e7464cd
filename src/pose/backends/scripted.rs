use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::frame::Frame;
use crate::pose::backend::PoseEstimator;
use crate::pose::KeypointSet;

/// Replays a fixed script of results, one per frame.
///
/// Once the script is exhausted the last entry repeats. `None` entries
/// simulate an inference failure for that frame.
pub struct ScriptedEstimator {
    script: VecDeque<Option<KeypointSet>>,
    last: Option<KeypointSet>,
    calls: u64,
}

impl ScriptedEstimator {
    pub fn new(script: impl IntoIterator<Item = Option<KeypointSet>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            last: None,
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl PoseEstimator for ScriptedEstimator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(&mut self, frame: &Frame) -> Result<KeypointSet> {
        self.calls += 1;
        let next = match self.script.pop_front() {
            Some(entry) => {
                self.last = entry.clone();
                entry
            }
            None => self.last.clone(),
        };
        next.ok_or_else(|| anyhow!("scripted inference failure at frame {}", frame.sequence()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::backends::stub::standing_pose;

    #[test]
    fn script_replays_then_repeats_last() {
        let frame = Frame::solid(8, 8, [0, 0, 0], 0);
        let mut backend =
            ScriptedEstimator::new([Some(standing_pose(0.2)), None, Some(standing_pose(0.8))]);
        assert!((backend.infer(&frame).unwrap().head().x - 0.2).abs() < 1e-6);
        assert!(backend.infer(&frame).is_err());
        assert!((backend.infer(&frame).unwrap().head().x - 0.8).abs() < 1e-6);
        assert!((backend.infer(&frame).unwrap().head().x - 0.8).abs() < 1e-6);
        assert_eq!(backend.calls(), 4);
    }
}
