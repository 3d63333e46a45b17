//! Posterior of the additive Freeze-Thaw model for one hyperparameter sample.
//!
//! `f(x, r) = g(x) + h_x(r)`. Every learning curve collapses to a noisy
//! pseudo-observation of `g` at its configuration; the configuration-level GP
//! over those pseudo-observations plus the per-curve residual terms give the
//! exact marginal likelihood and predictive posterior.

use std::f64::consts::PI;
use std::sync::Arc;

use rw_types::{Configuration, SurrogateError, TrialId};

use crate::grid::ResourceGrid;
use crate::hyper::Hyperparameters;
use crate::kernel::Kernel;
use crate::likelihood::{
    precompute, resource_kernel_likelihood_computations, Precomputed, ResourceLikelihood,
};
use crate::linalg::{cholesky, dot, squared_norm, CholeskyFactor, JITTER};

/// Learning curve of one trial in model units (normalized loss), starting at
/// the first grid level.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveData {
    pub trial_id: TrialId,
    pub config: Configuration,
    pub encoded: Vec<f64>,
    pub targets: Vec<f64>,
}

/// Curves sorted by non-increasing length together with the precomputed
/// layout of their targets. Shared by every likelihood evaluation of a refit.
#[derive(Debug, Clone)]
pub struct TrainingData {
    grid: ResourceGrid,
    curves: Vec<CurveData>,
    encoded: Vec<Vec<f64>>,
    precomputed: Precomputed,
}

impl TrainingData {
    pub fn new(grid: ResourceGrid, curves: Vec<CurveData>) -> Result<Self, SurrogateError> {
        if let Some(first) = curves.first() {
            let dim = first.encoded.len();
            if let Some(bad) = curves.iter().find(|c| c.encoded.len() != dim) {
                return Err(SurrogateError::DimensionMismatch {
                    expected: dim,
                    actual: bad.encoded.len(),
                });
            }
        }
        if let Some(long) = curves.iter().find(|c| c.targets.len() > grid.len()) {
            return Err(SurrogateError::DimensionMismatch {
                expected: grid.len(),
                actual: long.targets.len(),
            });
        }

        let targets: Vec<Vec<f64>> = curves.iter().map(|c| c.targets.clone()).collect();
        let precomputed = precompute(&targets)?;

        let mut slots: Vec<Option<CurveData>> = curves.into_iter().map(Some).collect();
        let curves: Vec<CurveData> = precomputed
            .order
            .iter()
            .filter_map(|&i| slots[i].take())
            .collect();
        let encoded = curves.iter().map(|c| c.encoded.clone()).collect();

        Ok(Self {
            grid,
            curves,
            encoded,
            precomputed,
        })
    }

    pub fn grid(&self) -> &ResourceGrid {
        &self.grid
    }

    pub fn curves(&self) -> &[CurveData] {
        &self.curves
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    pub fn num_data(&self) -> usize {
        self.precomputed.ydims.iter().sum()
    }

    pub fn position(&self, trial_id: TrialId) -> Option<usize> {
        self.curves.iter().position(|c| c.trial_id == trial_id)
    }

    pub fn position_of_config(&self, config: &Configuration) -> Option<usize> {
        self.curves.iter().position(|c| &c.config == config)
    }
}

/// Joint Gaussian over a set of grid levels of one configuration, in model
/// units.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentPrediction {
    pub mean: Vec<f64>,
    pub cov: Vec<Vec<f64>>,
}

impl LatentPrediction {
    pub fn variances(&self) -> Vec<f64> {
        self.cov
            .iter()
            .enumerate()
            .map(|(j, row)| row[j].max(0.0))
            .collect()
    }
}

/// Config-level GP over the pseudo-observations.
#[derive(Debug, Clone)]
struct ConfigPosterior {
    factor: CholeskyFactor,
    alpha: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct PosteriorState {
    hyper: Hyperparameters,
    data: Arc<TrainingData>,
    resource: ResourceLikelihood,
    config: ConfigPosterior,
    log_likelihood: f64,
}

impl PosteriorState {
    pub fn new(hyper: Hyperparameters, data: Arc<TrainingData>) -> Result<Self, SurrogateError> {
        let (resource, config, log_likelihood) = condition(&hyper, &data)?;
        Ok(Self {
            hyper,
            data,
            resource,
            config,
            log_likelihood,
        })
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    pub fn data(&self) -> &TrainingData {
        &self.data
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn resource_likelihood(&self) -> &ResourceLikelihood {
        &self.resource
    }

    /// Posterior mean and variance of `g` at an encoded configuration.
    pub fn predict_config(&self, x: &[f64]) -> (f64, f64) {
        let kernel = self.hyper.config_kernel();
        let kstar = kernel.cross(&self.data.encoded, x);
        let mean = self.hyper.mean + dot(&kstar, &self.config.alpha);
        let z = self.config.factor.solve_lower(&kstar);
        let var = (kernel.diagonal(x) - squared_norm(&z)).max(0.0);
        (mean, var)
    }

    /// Noiseless joint posterior of `f(x, ·)` at grid positions `levels`.
    ///
    /// `position` selects the curve of `x` in the training data; `None`
    /// treats `x` as a configuration without observations.
    pub fn predict_latent(
        &self,
        position: Option<usize>,
        x: &[f64],
        levels: &[usize],
    ) -> LatentPrediction {
        let grid = self.data.grid;
        let rk = self.hyper.resource_kernel();
        let sigma2 = self.hyper.noise_variance;
        let (mu_g, var_g) = self.predict_config(x);

        let star: Vec<Vec<f64>> = levels
            .iter()
            .map(|&j| vec![grid.normalize(grid.level(j))])
            .collect();
        let prior_mean: Vec<f64> = star.iter().map(|s| rk.mean(s)).collect();

        let curve = position.and_then(|p| self.data.curves.get(p));
        let (b, us, uw): (Vec<f64>, Vec<Vec<f64>>, Vec<f64>) = match curve {
            Some(curve) => {
                let k = curve.targets.len();
                let lfact = &self.resource.lfact_all;
                let observed: Vec<Vec<f64>> = grid
                    .normalized_prefix(k)
                    .into_iter()
                    .map(|r| vec![r])
                    .collect();
                let v = lfact.solve_lower(&vec![1.0; k]);
                let residual: Vec<f64> = curve
                    .targets
                    .iter()
                    .zip(&observed)
                    .map(|(y, r)| y - rk.mean(r))
                    .collect();
                let w = lfact.solve_lower(&residual);
                let us: Vec<Vec<f64>> = star
                    .iter()
                    .map(|s| lfact.solve_lower(&rk.cross(&observed, s)))
                    .collect();
                let b = us.iter().map(|u| 1.0 - dot(u, &v) / sigma2).collect();
                let uw = us.iter().map(|u| dot(u, &w) / sigma2).collect();
                (b, us, uw)
            }
            None => (vec![1.0; levels.len()], Vec::new(), vec![0.0; levels.len()]),
        };

        let mean = (0..levels.len())
            .map(|j| b[j] * mu_g + prior_mean[j] + uw[j])
            .collect();
        let cov = (0..levels.len())
            .map(|j| {
                (0..levels.len())
                    .map(|l| {
                        let correction = if us.is_empty() {
                            0.0
                        } else {
                            dot(&us[j], &us[l]) / sigma2
                        };
                        b[j] * b[l] * var_g + rk.evaluate(&star[j], &star[l]) - correction
                    })
                    .collect()
            })
            .collect();

        LatentPrediction { mean, cov }
    }
}

/// Log marginal likelihood of `data` under `hyper`, without keeping the
/// posterior around.
pub fn log_marginal_likelihood(
    hyper: &Hyperparameters,
    data: &TrainingData,
) -> Result<f64, SurrogateError> {
    condition(hyper, data).map(|(_, _, ll)| ll)
}

fn condition(
    hyper: &Hyperparameters,
    data: &TrainingData,
) -> Result<(ResourceLikelihood, ConfigPosterior, f64), SurrogateError> {
    let sigma2 = hyper.noise_variance;
    let resource = resource_kernel_likelihood_computations(
        &data.precomputed,
        &data.grid,
        &hyper.resource_kernel(),
        sigma2,
    )?;

    let ln_2pi = (2.0 * PI).ln();
    let n = data.len();
    let mut pseudo_targets = Vec::with_capacity(n);
    let mut pseudo_noise = Vec::with_capacity(n);
    let mut total = -resource.logdet;

    for i in 0..n {
        let (vtv, wtv, wtw) = (resource.vtv[i], resource.wtv[i], resource.wtw[i]);
        let k = resource.ydims[i] as f64;
        let noise = sigma2 / vtv;
        total += 0.5 * (2.0 * PI * noise).ln()
            - 0.5 * k * ln_2pi
            - 0.5 * k * sigma2.ln()
            - (wtw - wtv * wtv / vtv) / (2.0 * sigma2);
        pseudo_targets.push(wtv / vtv);
        pseudo_noise.push(noise);
    }

    let kernel: Kernel = hyper.config_kernel();
    let mut kmat = kernel.matrix(&data.encoded);
    for (i, row) in kmat.iter_mut().enumerate() {
        row[i] += pseudo_noise[i];
    }
    let factor = cholesky(&kmat, JITTER)?;
    let centred: Vec<f64> = pseudo_targets.iter().map(|y| y - hyper.mean).collect();
    let z = factor.solve_lower(&centred);
    let alpha = factor.solve_upper(&z);
    total += -0.5 * squared_norm(&z) - factor.log_det(n) - 0.5 * n as f64 * ln_2pi;

    if !total.is_finite() {
        return Err(SurrogateError::RefitFailed {
            message: format!("log likelihood is not finite ({})", total),
        });
    }

    Ok((resource, ConfigPosterior { factor, alpha }, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rw_types::ParameterValue;

    fn hyper() -> Hyperparameters {
        Hyperparameters {
            mean: 0.2,
            covariance_scale: 1.3,
            inv_bandwidths: vec![2.0],
            alpha: 1.1,
            mean_lam: 1.7,
            gamma: 0.6,
            noise_variance: 0.04,
        }
    }

    fn curve(id: u64, x: f64, targets: &[f64]) -> CurveData {
        CurveData {
            trial_id: TrialId(id),
            config: Configuration::new().with("x", ParameterValue::Float(x)),
            encoded: vec![x],
            targets: targets.to_vec(),
        }
    }

    fn data() -> Arc<TrainingData> {
        Arc::new(
            TrainingData::new(
                ResourceGrid::new(1, 6),
                vec![
                    curve(0, 0.1, &[1.0, 0.6]),
                    curve(1, 0.5, &[0.8, 0.5, 0.3, 0.25]),
                    curve(2, 0.9, &[1.4]),
                    curve(3, 0.7, &[0.9, 0.7, 0.65]),
                ],
            )
            .unwrap(),
        )
    }

    struct Joint {
        cov: Vec<Vec<f64>>,
        mean: Vec<f64>,
        y: Vec<f64>,
        /// (encoded x, normalized r) of every observation.
        points: Vec<(Vec<f64>, f64)>,
        /// curve index of every observation
        owners: Vec<usize>,
    }

    /// Dense joint Gaussian over every observation.
    fn joint(hp: &Hyperparameters, data: &TrainingData) -> Joint {
        let kx = hp.config_kernel();
        let kr = hp.resource_kernel();
        let grid = data.grid();
        let mut points = Vec::new();
        let mut owners = Vec::new();
        let mut y = Vec::new();
        for (i, c) in data.curves().iter().enumerate() {
            for (j, t) in c.targets.iter().enumerate() {
                points.push((c.encoded.clone(), grid.normalize(grid.level(j))));
                owners.push(i);
                y.push(*t);
            }
        }
        let n = y.len();
        let cov = (0..n)
            .map(|a| {
                (0..n)
                    .map(|b| {
                        let mut v = kx.evaluate(&points[a].0, &points[b].0);
                        if owners[a] == owners[b] {
                            v += kr.evaluate(&[points[a].1], &[points[b].1]);
                            if a == b {
                                v += hp.noise_variance;
                            }
                        }
                        v
                    })
                    .collect()
            })
            .collect();
        let mean = points.iter().map(|p| hp.mean + kr.mean(&[p.1])).collect();
        Joint {
            cov,
            mean,
            y,
            points,
            owners,
        }
    }

    #[test]
    fn marginal_likelihood_matches_dense_joint_gaussian() {
        let hp = hyper();
        let data = data();
        let j = joint(&hp, &data);

        let factor = cholesky(&j.cov, 0.0).unwrap();
        let resid: Vec<f64> = j.y.iter().zip(&j.mean).map(|(y, m)| y - m).collect();
        let z = factor.solve_lower(&resid);
        let n = j.y.len();
        let expected = -0.5 * squared_norm(&z)
            - factor.log_det(n)
            - 0.5 * n as f64 * (2.0 * PI).ln();

        let got = log_marginal_likelihood(&hp, &data).unwrap();
        assert!(
            (got - expected).abs() < 1e-6 * expected.abs().max(1.0),
            "closed form {} vs dense {}",
            got,
            expected
        );
        assert_eq!(
            PosteriorState::new(hp, data).unwrap().log_likelihood(),
            got
        );
    }

    #[test]
    fn predictive_posterior_matches_dense_conditioning() {
        let hp = hyper();
        let data = data();
        let state = PosteriorState::new(hp.clone(), Arc::clone(&data)).unwrap();
        let j = joint(&hp, &data);
        let kx = hp.config_kernel();
        let kr = hp.resource_kernel();
        let grid = data.grid();

        let factor = cholesky(&j.cov, 0.0).unwrap();
        let resid: Vec<f64> = j.y.iter().zip(&j.mean).map(|(y, m)| y - m).collect();
        let alpha = factor.solve_upper(&factor.solve_lower(&resid));

        // observed config (longest curve sits at position 0) and a fresh one
        let cases: Vec<(Option<usize>, Vec<f64>)> = vec![(Some(0), vec![0.5]), (None, vec![0.3])];
        let levels = [4usize, 5];
        for (position, x) in cases {
            let pred = state.predict_latent(position, &x, &levels);
            let cross: Vec<Vec<f64>> = levels
                .iter()
                .map(|&l| {
                    let r = grid.normalize(grid.level(l));
                    j.points
                        .iter()
                        .zip(&j.owners)
                        .map(|((px, pr), owner)| {
                            let mut v = kx.evaluate(px, &x);
                            if Some(*owner) == position {
                                v += kr.evaluate(&[*pr], &[r]);
                            }
                            v
                        })
                        .collect()
                })
                .collect();

            for (a, &la) in levels.iter().enumerate() {
                let ra = grid.normalize(grid.level(la));
                let mean = hp.mean + kr.mean(&[ra]) + dot(&cross[a], &alpha);
                assert!((pred.mean[a] - mean).abs() < 1e-6, "mean {:?}", position);
                for (b, &lb) in levels.iter().enumerate() {
                    let rb = grid.normalize(grid.level(lb));
                    let prior = kx.evaluate(&x, &x) + kr.evaluate(&[ra], &[rb]);
                    let za = factor.solve_lower(&cross[a]);
                    let zb = factor.solve_lower(&cross[b]);
                    let cov = prior - dot(&za, &zb);
                    assert!((pred.cov[a][b] - cov).abs() < 1e-6, "cov {:?}", position);
                }
            }
        }
    }

    #[test]
    fn training_data_is_sorted_longest_first() {
        let data = data();
        let lengths: Vec<usize> = data.curves().iter().map(|c| c.targets.len()).collect();
        assert_eq!(lengths, vec![4, 3, 2, 1]);
        assert_eq!(data.position(TrialId(2)), Some(3));
        assert_eq!(data.num_data(), 10);
    }

    #[test]
    fn curve_longer_than_grid_is_rejected() {
        let err = TrainingData::new(ResourceGrid::new(1, 2), vec![curve(0, 0.1, &[1.0, 0.9, 0.8])])
            .unwrap_err();
        assert_eq!(
            err,
            SurrogateError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
    }
}
