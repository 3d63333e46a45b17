use serde::{Deserialize, Serialize};

/// Integer resource levels `r_min..=r_max` seen by the learning-curve model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrid {
    pub r_min: u64,
    pub r_max: u64,
}

impl ResourceGrid {
    pub fn new(r_min: u64, r_max: u64) -> Self {
        Self { r_min, r_max }
    }

    /// Number of levels on the grid.
    pub fn len(&self) -> usize {
        (self.r_max.saturating_sub(self.r_min) + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Map a level into `(0, 1)`.
    pub fn normalize(&self, resource: u64) -> f64 {
        let width = (self.r_max - self.r_min + 1) as f64;
        (resource as f64 - self.r_min as f64 + 0.5) / width
    }

    /// Position of `resource` on the grid, if it lies on it.
    pub fn index(&self, resource: u64) -> Option<usize> {
        if resource < self.r_min || resource > self.r_max {
            return None;
        }
        Some((resource - self.r_min) as usize)
    }

    /// Level at position `index`.
    pub fn level(&self, index: usize) -> u64 {
        self.r_min + index as u64
    }

    /// Normalized inputs of the first `n` levels.
    pub fn normalized_prefix(&self, n: usize) -> Vec<f64> {
        (0..n).map(|j| self.normalize(self.level(j))).collect()
    }
}
