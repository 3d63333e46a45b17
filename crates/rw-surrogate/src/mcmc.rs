//! Random-direction slice sampling over an unconstrained parameter vector.

use rand::Rng;
use rand_distr::{Exp1, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use rw_types::SurrogateError;

/// Shrinkage steps after which a slice move gives up and keeps the current
/// point.
const MAX_SHRINK_STEPS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SliceSampler {
    /// Initial bracket width along the sampled direction.
    pub width: f64,
    /// Maximum number of stepping-out expansions.
    pub max_steps_out: usize,
}

impl Default for SliceSampler {
    fn default() -> Self {
        Self {
            width: 1.0,
            max_steps_out: 10,
        }
    }
}

impl SliceSampler {
    /// Run `burn_in + num_samples * thinning` moves from `initial` and return
    /// every `thinning`-th state after burn-in.
    pub fn sample<F, R>(
        &self,
        log_density: F,
        initial: Vec<f64>,
        burn_in: usize,
        num_samples: usize,
        thinning: usize,
        rng: &mut R,
    ) -> Result<Vec<Vec<f64>>, SurrogateError>
    where
        F: Fn(&[f64]) -> f64,
        R: Rng + ?Sized,
    {
        let thinning = thinning.max(1);
        let mut current = initial;
        let mut current_lp = log_density(&current);
        if !current_lp.is_finite() {
            return Err(SurrogateError::RefitFailed {
                message: "initial hyperparameters have zero posterior density".to_string(),
            });
        }

        let total = burn_in + num_samples * thinning;
        let mut samples = Vec::with_capacity(num_samples);
        for step in 0..total {
            let (next, next_lp) = self.step(&log_density, &current, current_lp, rng);
            current = next;
            current_lp = next_lp;
            if step >= burn_in && (step - burn_in + 1) % thinning == 0 {
                samples.push(current.clone());
            }
        }

        debug!(
            num_samples = samples.len(),
            final_log_density = current_lp,
            "slice sampler finished"
        );
        Ok(samples)
    }

    fn step<F, R>(&self, log_density: &F, x0: &[f64], lp0: f64, rng: &mut R) -> (Vec<f64>, f64)
    where
        F: Fn(&[f64]) -> f64,
        R: Rng + ?Sized,
    {
        let direction = random_direction(x0.len(), rng);
        let at = |t: f64| -> Vec<f64> { x0.iter().zip(&direction).map(|(x, d)| x + t * d).collect() };
        let density_at = |t: f64| log_density(&at(t));

        let exp: f64 = rng.sample(Exp1);
        let threshold = lp0 - exp;

        // Step out
        let mut lower = -self.width * rng.gen::<f64>();
        let mut upper = lower + self.width;
        let budget = self.max_steps_out;
        let mut left = (budget as f64 * rng.gen::<f64>()).floor() as usize;
        let mut right = budget.saturating_sub(1).saturating_sub(left);
        while left > 0 && density_at(lower) > threshold {
            lower -= self.width;
            left -= 1;
        }
        while right > 0 && density_at(upper) > threshold {
            upper += self.width;
            right -= 1;
        }

        // Shrink
        for _ in 0..MAX_SHRINK_STEPS {
            if upper - lower <= f64::EPSILON {
                break;
            }
            let t = rng.gen_range(lower..upper);
            let candidate = at(t);
            let lp = log_density(&candidate);
            if lp > threshold {
                return (candidate, lp);
            }
            if t < 0.0 {
                lower = t;
            } else {
                upper = t;
            }
        }
        (x0.to_vec(), lp0)
    }
}

fn random_direction<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Vec<f64> {
    loop {
        let d: Vec<f64> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
        let norm = d.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 1e-12 {
            return d.into_iter().map(|v| v / norm).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn recovers_moments_of_a_gaussian() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let sampler = SliceSampler::default();
        let log_density = |x: &[f64]| {
            let a = (x[0] - 1.0) / 0.5;
            let b = x[1] + 2.0;
            -0.5 * (a * a + b * b)
        };
        let samples = sampler
            .sample(log_density, vec![0.0, 0.0], 200, 3000, 2, &mut rng)
            .unwrap();
        assert_eq!(samples.len(), 3000);

        let n = samples.len() as f64;
        let m0 = samples.iter().map(|s| s[0]).sum::<f64>() / n;
        let m1 = samples.iter().map(|s| s[1]).sum::<f64>() / n;
        let v0 = samples.iter().map(|s| (s[0] - m0).powi(2)).sum::<f64>() / n;
        assert!((m0 - 1.0).abs() < 0.1, "mean {}", m0);
        assert!((m1 + 2.0).abs() < 0.15, "mean {}", m1);
        assert!((v0 - 0.25).abs() < 0.08, "variance {}", v0);
    }

    #[test]
    fn respects_hard_constraints() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let log_density = |x: &[f64]| {
            if x[0] < 0.0 || x[0] > 1.0 {
                f64::NEG_INFINITY
            } else {
                0.0
            }
        };
        let samples = SliceSampler::default()
            .sample(log_density, vec![0.5], 10, 200, 1, &mut rng)
            .unwrap();
        assert!(samples.iter().all(|s| (0.0..=1.0).contains(&s[0])));
    }

    #[test]
    fn infeasible_start_is_an_error() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = SliceSampler::default()
            .sample(|_| f64::NEG_INFINITY, vec![0.0], 1, 1, 1, &mut rng)
            .unwrap_err();
        assert!(matches!(err, SurrogateError::RefitFailed { .. }));
    }

    #[test]
    fn same_seed_same_chain() {
        let log_density = |x: &[f64]| -0.5 * x.iter().map(|v| v * v).sum::<f64>();
        let run = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            SliceSampler::default()
                .sample(log_density, vec![0.3, -0.2, 1.0], 5, 20, 3, &mut rng)
                .unwrap()
        };
        assert_eq!(run(11), run(11));
    }
}
