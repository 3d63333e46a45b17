//! Expected improvement and candidate selection.

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use rw_types::{Configuration, ConfigurationSpace, ObjectiveDirection, SurrogateError};

use crate::surrogate::{PredictiveMixture, SurrogateState};

/// Standard normal cumulative distribution function (Abramowitz & Stegun
/// 7.1.26 on `x / √2`, absolute error below 1.5e-7).
pub fn norm_cdf(x: f64) -> f64 {
    if x >= 8.0 {
        return 1.0;
    }
    if x <= -8.0 {
        return 0.0;
    }

    let a1 = 0.254829592_f64;
    let a2 = -0.284496736_f64;
    let a3 = 1.421413741_f64;
    let a4 = -1.453152027_f64;
    let a5 = 1.061405429_f64;
    let p = 0.3275911_f64;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let z = x.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + p * z);
    let erf = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-z * z).exp();

    0.5 * (1.0 + sign * erf)
}

/// Standard normal probability density function.
pub fn norm_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Expected improvement over `best` of a Gaussian in metric units.
pub fn expected_improvement(
    direction: ObjectiveDirection,
    mean: f64,
    variance: f64,
    best: f64,
) -> f64 {
    let improvement = match direction {
        ObjectiveDirection::Minimize => best - mean,
        ObjectiveDirection::Maximize => mean - best,
    };
    let sd = variance.max(0.0).sqrt();
    if sd < 1e-12 {
        return improvement.max(0.0);
    }
    let z = improvement / sd;
    improvement * norm_cdf(z) + sd * norm_pdf(z)
}

/// Expected improvement averaged over the mixture components.
pub fn mixture_expected_improvement(
    direction: ObjectiveDirection,
    mixture: &PredictiveMixture,
    best: f64,
) -> f64 {
    if mixture.components.is_empty() {
        return 0.0;
    }
    mixture
        .components
        .iter()
        .map(|c| expected_improvement(direction, c.mean, c.variance, best))
        .sum::<f64>()
        / mixture.components.len() as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Random candidates scored per selection.
    pub pool_size: usize,
    /// Resampling attempts (each with a doubled pool) when every candidate
    /// is filtered out.
    pub max_retries: usize,
    /// Trials started by random search before the surrogate is consulted.
    pub num_initial_random: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            pool_size: 500,
            max_retries: 3,
            num_initial_random: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub config: Configuration,
    /// Acquisition value; `None` for random-search picks.
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSelector {
    config: AcquisitionConfig,
}

impl CandidateSelector {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Pick the next configuration to evaluate.
    ///
    /// Without a surrogate state the first valid candidate is returned.
    /// Otherwise the candidate with the highest expected improvement wins;
    /// ties go to the earliest generated one.
    pub fn select<R: Rng + ?Sized>(
        &self,
        state: Option<&SurrogateState>,
        space: &ConfigurationSpace,
        exclude: &[Configuration],
        rng: &mut R,
    ) -> Result<Candidate, SurrogateError> {
        let mut pool_size = self.config.pool_size.max(1);
        let attempts = self.config.max_retries + 1;

        for attempt in 1..=attempts {
            let mut pool: Vec<Configuration> = Vec::with_capacity(pool_size);
            for config in space.sample(pool_size, rng) {
                if space.contains(&config) && !exclude.contains(&config) && !pool.contains(&config)
                {
                    pool.push(config);
                }
            }

            if pool.is_empty() {
                debug!(attempt, pool_size, "candidate pool empty, resampling");
                pool_size = pool_size.saturating_mul(2);
                continue;
            }

            let Some(state) = state else {
                let config = pool.swap_remove(0);
                return Ok(Candidate {
                    config,
                    score: None,
                });
            };

            let direction = state.direction();
            let best = state.best_metric();
            let scores = pool
                .par_iter()
                .map(|c| {
                    state
                        .predict(c, None)
                        .map(|m| mixture_expected_improvement(direction, &m, best))
                })
                .collect::<Result<Vec<f64>, SurrogateError>>()?;

            let mut best_index = 0;
            for (i, score) in scores.iter().enumerate().skip(1) {
                if *score > scores[best_index] {
                    best_index = i;
                }
            }
            debug!(
                candidates = pool.len(),
                score = scores[best_index],
                "candidate selected"
            );
            let score = scores[best_index];
            return Ok(Candidate {
                config: pool.swap_remove(best_index),
                score: Some(score),
            });
        }

        Err(SurrogateError::EmptyCandidatePool { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ResourceGrid;
    use crate::hyper::Hyperparameters;
    use crate::surrogate::{Gaussian, SurrogateConfig, SurrogateModel};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rw_store::ObservationStore;
    use rw_types::{Observation, ParameterValue, TrialId};

    fn config(x: f64) -> Configuration {
        Configuration::new().with("x", ParameterValue::Float(x))
    }

    #[test]
    fn normal_helpers() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((norm_cdf(1.96) - 0.975).abs() < 1e-4);
        assert!((norm_cdf(-1.0) - 0.158_655_25).abs() < 1e-6);
        assert!((norm_pdf(0.0) - 0.398_942_28).abs() < 1e-8);
    }

    #[test]
    fn expected_improvement_properties() {
        let min = ObjectiveDirection::Minimize;
        // lower mean, more improvement
        assert!(
            expected_improvement(min, 0.2, 0.01, 0.5) > expected_improvement(min, 0.4, 0.01, 0.5)
        );
        // uncertainty has value even above the incumbent
        assert!(expected_improvement(min, 0.6, 0.04, 0.5) > 0.0);
        assert_eq!(expected_improvement(min, 0.6, 0.0, 0.5), 0.0);
        assert!((expected_improvement(min, 0.3, 0.0, 0.5) - 0.2).abs() < 1e-12);

        let max = ObjectiveDirection::Maximize;
        let a = expected_improvement(max, 0.7, 0.01, 0.5);
        let b = expected_improvement(min, -0.7, 0.01, -0.5);
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn mixture_ei_averages_components() {
        let mixture = PredictiveMixture {
            components: vec![
                Gaussian {
                    mean: 0.3,
                    variance: 0.0,
                },
                Gaussian {
                    mean: 0.7,
                    variance: 0.0,
                },
            ],
        };
        let ei = mixture_expected_improvement(ObjectiveDirection::Minimize, &mixture, 0.5);
        assert!((ei - 0.1).abs() < 1e-12);
    }

    #[test]
    fn warm_up_returns_first_valid_candidate() {
        let space = ConfigurationSpace::new().add_float("x", 0.0, 1.0);
        let selector = CandidateSelector::new(AcquisitionConfig {
            pool_size: 8,
            ..AcquisitionConfig::default()
        });

        let expected = space.sample(8, &mut ChaCha8Rng::seed_from_u64(4))[0].clone();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let picked = selector.select(None, &space, &[], &mut rng).unwrap();
        assert_eq!(picked.config, expected);
        assert_eq!(picked.score, None);
    }

    #[test]
    fn exhausted_space_fails_after_retries() {
        let space = ConfigurationSpace::new().add_int("n", 3, 3);
        let selector = CandidateSelector::new(AcquisitionConfig {
            pool_size: 2,
            max_retries: 2,
            ..AcquisitionConfig::default()
        });
        let exclude = vec![Configuration::new().with("n", ParameterValue::Int(3))];
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(
            selector.select(None, &space, &exclude, &mut rng).unwrap_err(),
            SurrogateError::EmptyCandidatePool { attempts: 3 }
        );
    }

    #[test]
    fn excluded_configurations_are_never_returned() {
        let space = ConfigurationSpace::new().add_choice(
            "opt",
            vec![serde_json::json!("sgd"), serde_json::json!("adam")],
        );
        let exclude = vec![Configuration::new().with("opt", ParameterValue::Json(serde_json::json!("sgd")))];
        let selector = CandidateSelector::new(AcquisitionConfig {
            pool_size: 4,
            ..AcquisitionConfig::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        for _ in 0..10 {
            let picked = selector.select(None, &space, &exclude, &mut rng).unwrap();
            assert_eq!(
                picked.config.get("opt"),
                Some(&ParameterValue::Json(serde_json::json!("adam")))
            );
        }
    }

    #[test]
    fn surrogate_pick_is_the_first_arg_max() {
        let space = ConfigurationSpace::new().add_float("x", 0.0, 1.0);
        let store = ObservationStore::new();
        for (id, x, len) in [(0u64, 0.1, 5u64), (1, 0.4, 7), (2, 0.8, 3)] {
            for r in 1..=len {
                store
                    .record(Observation {
                        trial_id: TrialId(id),
                        config: config(x),
                        resource: r,
                        value: (x - 0.3f64).powi(2) + 0.5 / r as f64,
                        seed: 0,
                    })
                    .unwrap();
            }
        }
        let mut hp = Hyperparameters::initial(1);
        hp.inv_bandwidths = vec![2.0];
        let model = SurrogateModel::new(
            space.clone(),
            ResourceGrid::new(1, 9),
            ObjectiveDirection::Minimize,
            SurrogateConfig::default(),
        );
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let state = model
            .condition(&store.snapshot(), &[], vec![hp], &mut rng)
            .unwrap();

        let selector = CandidateSelector::new(AcquisitionConfig {
            pool_size: 32,
            ..AcquisitionConfig::default()
        });
        let pool = space.sample(32, &mut ChaCha8Rng::seed_from_u64(6));
        let picked = selector
            .select(Some(&state), &space, &[], &mut ChaCha8Rng::seed_from_u64(6))
            .unwrap();

        let scores: Vec<f64> = pool
            .iter()
            .map(|c| {
                mixture_expected_improvement(
                    ObjectiveDirection::Minimize,
                    &state.predict(c, None).unwrap(),
                    state.best_metric(),
                )
            })
            .collect();
        let top = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let first = scores.iter().position(|s| *s == top).unwrap();
        assert_eq!(picked.config, pool[first]);
        assert_eq!(picked.score, Some(top));
    }
}
