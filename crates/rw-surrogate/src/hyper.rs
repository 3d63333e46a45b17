//! Kernel, mean and noise hyperparameters of the Freeze-Thaw model and their
//! priors.
//!
//! The sampler works on an unconstrained vector
//! `[mean, ln scale, ln inv_bw_1..d, ln alpha, ln mean_lam, ln gamma, ln noise]`;
//! every coordinate has a normal prior and a box constraint.

use serde::{Deserialize, Serialize};

use crate::kernel::Kernel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Constant mean of the configuration-level GP.
    pub mean: f64,
    pub covariance_scale: f64,
    pub inv_bandwidths: Vec<f64>,
    pub alpha: f64,
    pub mean_lam: f64,
    pub gamma: f64,
    pub noise_variance: f64,
}

/// Normal prior on one unconstrained coordinate, truncated to `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Prior {
    location: f64,
    spread: f64,
    lower: f64,
    upper: f64,
}

impl Prior {
    const fn new(location: f64, spread: f64, lower: f64, upper: f64) -> Self {
        Self {
            location,
            spread,
            lower,
            upper,
        }
    }

    fn log_density(&self, x: f64) -> f64 {
        if !(x >= self.lower && x <= self.upper) {
            return f64::NEG_INFINITY;
        }
        let z = (x - self.location) / self.spread;
        -0.5 * z * z
    }

    fn clamp(&self, x: f64) -> f64 {
        x.clamp(self.lower, self.upper)
    }
}

// Bounds are in unconstrained units; log-domain ones are `ln` of the
// parameter range.
const MEAN: Prior = Prior::new(0.0, 1.0, -10.0, 10.0);
const LN_SCALE: Prior = Prior::new(0.0, 1.0, -6.9, 4.6);
const LN_INV_BANDWIDTH: Prior = Prior::new(0.0, 1.5, -9.2, 4.6);
const LN_ALPHA: Prior = Prior::new(0.0, 1.0, -6.9, 4.6);
const LN_MEAN_LAM: Prior = Prior::new(0.0, 1.0, -6.9, 6.9);
const LN_GAMMA: Prior = Prior::new(-0.7, 1.0, -9.2, 4.6);
const LN_NOISE: Prior = Prior::new(-4.6, 1.5, -13.8, 2.3);

impl Hyperparameters {
    /// Starting point for the sampler over `dim` encoded inputs.
    pub fn initial(dim: usize) -> Self {
        Self {
            mean: 0.0,
            covariance_scale: 1.0,
            inv_bandwidths: vec![1.0; dim],
            alpha: 1.0,
            mean_lam: 1.0,
            gamma: 0.5,
            noise_variance: 1e-2,
        }
    }

    pub fn dim(&self) -> usize {
        self.inv_bandwidths.len()
    }

    pub fn config_kernel(&self) -> Kernel {
        Kernel::matern52(self.covariance_scale, self.inv_bandwidths.clone())
    }

    pub fn resource_kernel(&self) -> Kernel {
        Kernel::exponential_decay(self.alpha, self.mean_lam, self.gamma)
    }

    /// Length of the unconstrained vector for `dim` encoded inputs.
    pub fn unconstrained_len(dim: usize) -> usize {
        dim + 6
    }

    pub fn to_unconstrained(&self) -> Vec<f64> {
        let mut x = Vec::with_capacity(Self::unconstrained_len(self.dim()));
        x.push(self.mean);
        x.push(self.covariance_scale.ln());
        x.extend(self.inv_bandwidths.iter().map(|b| b.ln()));
        x.push(self.alpha.ln());
        x.push(self.mean_lam.ln());
        x.push(self.gamma.ln());
        x.push(self.noise_variance.ln());
        x
    }

    /// Inverse of [`Hyperparameters::to_unconstrained`]. Returns `None` when
    /// `x` has the wrong length.
    pub fn from_unconstrained(x: &[f64], dim: usize) -> Option<Self> {
        if x.len() != Self::unconstrained_len(dim) {
            return None;
        }
        let tail = &x[2 + dim..];
        Some(Self {
            mean: x[0],
            covariance_scale: x[1].exp(),
            inv_bandwidths: x[2..2 + dim].iter().map(|v| v.exp()).collect(),
            alpha: tail[0].exp(),
            mean_lam: tail[1].exp(),
            gamma: tail[2].exp(),
            noise_variance: tail[3].exp(),
        })
    }

    fn priors(dim: usize) -> impl Iterator<Item = Prior> {
        [MEAN, LN_SCALE]
            .into_iter()
            .chain(std::iter::repeat(LN_INV_BANDWIDTH).take(dim))
            .chain([LN_ALPHA, LN_MEAN_LAM, LN_GAMMA, LN_NOISE])
    }

    /// Unnormalized log prior of an unconstrained vector; `-inf` outside the
    /// box or for non-finite coordinates.
    pub fn log_prior(x: &[f64], dim: usize) -> f64 {
        if x.len() != Self::unconstrained_len(dim) {
            return f64::NEG_INFINITY;
        }
        Self::priors(dim)
            .zip(x)
            .map(|(prior, &v)| prior.log_density(v))
            .sum()
    }

    /// Project an unconstrained vector into the prior box.
    pub fn clamp_unconstrained(x: &[f64], dim: usize) -> Vec<f64> {
        Self::priors(dim).zip(x).map(|(p, &v)| p.clamp(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconstrained_mapping_round_trips() {
        let hp = Hyperparameters {
            mean: -0.3,
            covariance_scale: 2.0,
            inv_bandwidths: vec![0.5, 4.0],
            alpha: 1.5,
            mean_lam: 0.2,
            gamma: 0.7,
            noise_variance: 1e-3,
        };
        let x = hp.to_unconstrained();
        assert_eq!(x.len(), Hyperparameters::unconstrained_len(2));
        let back = Hyperparameters::from_unconstrained(&x, 2).unwrap();
        assert!((back.covariance_scale - 2.0).abs() < 1e-12);
        assert!((back.inv_bandwidths[1] - 4.0).abs() < 1e-12);
        assert!((back.noise_variance - 1e-3).abs() < 1e-15);
        assert!(Hyperparameters::from_unconstrained(&x, 3).is_none());
    }

    #[test]
    fn initial_point_has_finite_prior() {
        let x = Hyperparameters::initial(3).to_unconstrained();
        assert!(Hyperparameters::log_prior(&x, 3).is_finite());
    }

    #[test]
    fn prior_rejects_points_outside_the_box() {
        let mut x = Hyperparameters::initial(1).to_unconstrained();
        x[0] = 50.0;
        assert_eq!(Hyperparameters::log_prior(&x, 1), f64::NEG_INFINITY);
        x[0] = f64::NAN;
        assert_eq!(Hyperparameters::log_prior(&x, 1), f64::NEG_INFINITY);

        let clamped = Hyperparameters::clamp_unconstrained(&[50.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1);
        assert_eq!(clamped[0], 10.0);
    }
}
