use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rw_types::SchedulerError;
use serde::{Deserialize, Serialize};

/// Geometric rung levels `r_min · ηᵏ < r_max` plus the terminal level
/// `r_max`, and the Hyperband brackets over them. Bracket `s` starts at
/// rung `s`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RungSystem {
    r_min: u64,
    r_max: u64,
    eta: u64,
    levels: Vec<u64>,
    num_brackets: usize,
}

impl RungSystem {
    pub fn new(r_min: u64, r_max: u64, eta: u64, num_brackets: usize) -> Result<Self, SchedulerError> {
        if r_min == 0 {
            return Err(SchedulerError::InvalidRungSystem {
                message: "r_min must be at least 1".to_string(),
            });
        }
        if r_max < r_min {
            return Err(SchedulerError::InvalidRungSystem {
                message: format!("r_max ({}) is below r_min ({})", r_max, r_min),
            });
        }
        if eta < 2 {
            return Err(SchedulerError::InvalidRungSystem {
                message: format!("eta must be at least 2, got {}", eta),
            });
        }
        if num_brackets == 0 {
            return Err(SchedulerError::InvalidRungSystem {
                message: "at least one bracket is required".to_string(),
            });
        }

        let mut levels = Vec::new();
        let mut r = r_min;
        while r < r_max {
            levels.push(r);
            r = r.saturating_mul(eta);
        }
        levels.push(r_max);

        Ok(Self {
            r_min,
            r_max,
            eta,
            num_brackets: num_brackets.min(levels.len()),
            levels,
        })
    }

    pub fn r_min(&self) -> u64 {
        self.r_min
    }

    pub fn r_max(&self) -> u64 {
        self.r_max
    }

    pub fn eta(&self) -> u64 {
        self.eta
    }

    /// Every rung level, the last one being `r_max`.
    pub fn levels(&self) -> &[u64] {
        &self.levels
    }

    pub fn num_brackets(&self) -> usize {
        self.num_brackets
    }

    /// Rung level `index`, or `r_max` past the end.
    pub fn level(&self, index: usize) -> u64 {
        self.levels.get(index).copied().unwrap_or(self.r_max)
    }

    /// Index of `resource` among the rungs of `bracket`.
    pub fn rung_index(&self, bracket: usize, resource: u64) -> Option<usize> {
        self.levels
            .iter()
            .position(|&r| r == resource)
            .filter(|&k| k >= bracket)
    }

    /// Hyperband weights `η^(S−s) / (S−s+1)`, normalized over the enabled
    /// brackets.
    pub fn bracket_weights(&self) -> Vec<f64> {
        let s_max = self.levels.len() - 1;
        let raw: Vec<f64> = (0..self.num_brackets)
            .map(|s| {
                let depth = (s_max - s) as i32;
                (self.eta as f64).powi(depth) / (depth + 1) as f64
            })
            .collect();
        let total: f64 = raw.iter().sum();
        raw.into_iter().map(|w| w / total).collect()
    }

    /// Draw a bracket from the Hyperband distribution.
    pub fn sample_bracket<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        if self.num_brackets == 1 {
            return 0;
        }
        match WeightedIndex::new(self.bracket_weights()) {
            Ok(dist) => dist.sample(rng),
            Err(_) => 0,
        }
    }
}
