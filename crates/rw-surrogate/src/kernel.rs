//! Covariance functions over encoded configurations and normalized resources.

use serde::{Deserialize, Serialize};

const SQRT5: f64 = 2.236_067_977_499_79;

/// Covariance function. Composition goes through the `Scaled` and `Sum`
/// wrapper variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Kernel {
    Zero,
    /// Matérn-5/2 with automatic relevance determination.
    Matern52 {
        covariance_scale: f64,
        inv_bandwidths: Vec<f64>,
    },
    /// Freeze-Thaw resource kernel `γ κ(r + r')` with
    /// `κ(s) = (β / (s + β))^α`, `β = α / mean_lam`. Inputs are scalars.
    ExponentialDecay { alpha: f64, mean_lam: f64, gamma: f64 },
    Scaled { factor: f64, inner: Box<Kernel> },
    Sum { parts: Vec<Kernel> },
}

impl Kernel {
    pub fn matern52(covariance_scale: f64, inv_bandwidths: Vec<f64>) -> Self {
        Kernel::Matern52 {
            covariance_scale,
            inv_bandwidths,
        }
    }

    pub fn exponential_decay(alpha: f64, mean_lam: f64, gamma: f64) -> Self {
        Kernel::ExponentialDecay {
            alpha,
            mean_lam,
            gamma,
        }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Kernel::Scaled {
            factor,
            inner: Box::new(self),
        }
    }

    pub fn evaluate(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Kernel::Zero => 0.0,
            Kernel::Matern52 {
                covariance_scale,
                inv_bandwidths,
            } => {
                let dist2: f64 = a
                    .iter()
                    .zip(b)
                    .zip(inv_bandwidths)
                    .map(|((x, y), ib)| {
                        let d = (x - y) * ib;
                        d * d
                    })
                    .sum();
                let r = SQRT5 * dist2.sqrt();
                covariance_scale * (1.0 + r + r * r / 3.0) * (-r).exp()
            }
            Kernel::ExponentialDecay {
                alpha,
                mean_lam,
                gamma,
            } => gamma * kappa(a[0] + b[0], *alpha, *mean_lam),
            Kernel::Scaled { factor, inner } => factor * inner.evaluate(a, b),
            Kernel::Sum { parts } => parts.iter().map(|k| k.evaluate(a, b)).sum(),
        }
    }

    pub fn diagonal(&self, a: &[f64]) -> f64 {
        match self {
            Kernel::Zero => 0.0,
            Kernel::Matern52 {
                covariance_scale, ..
            } => *covariance_scale,
            Kernel::ExponentialDecay { .. } => self.evaluate(a, a),
            Kernel::Scaled { factor, inner } => factor * inner.diagonal(a),
            Kernel::Sum { parts } => parts.iter().map(|k| k.diagonal(a)).sum(),
        }
    }

    /// Mean function paired with the kernel. Only the resource kernel carries
    /// a non-zero one, `γ κ(r)`.
    pub fn mean(&self, a: &[f64]) -> f64 {
        match self {
            Kernel::Zero | Kernel::Matern52 { .. } => 0.0,
            Kernel::ExponentialDecay {
                alpha,
                mean_lam,
                gamma,
            } => gamma * kappa(a[0], *alpha, *mean_lam),
            Kernel::Scaled { factor, inner } => factor * inner.mean(a),
            Kernel::Sum { parts } => parts.iter().map(|k| k.mean(a)).sum(),
        }
    }

    /// Flat parameter list in declaration order.
    pub fn parameters(&self) -> Vec<f64> {
        match self {
            Kernel::Zero => Vec::new(),
            Kernel::Matern52 {
                covariance_scale,
                inv_bandwidths,
            } => std::iter::once(*covariance_scale)
                .chain(inv_bandwidths.iter().copied())
                .collect(),
            Kernel::ExponentialDecay {
                alpha,
                mean_lam,
                gamma,
            } => vec![*alpha, *mean_lam, *gamma],
            Kernel::Scaled { factor, inner } => std::iter::once(*factor)
                .chain(inner.parameters())
                .collect(),
            Kernel::Sum { parts } => parts.iter().flat_map(|k| k.parameters()).collect(),
        }
    }

    /// Gram matrix over `points`.
    pub fn matrix(&self, points: &[Vec<f64>]) -> Vec<Vec<f64>> {
        points
            .iter()
            .map(|a| points.iter().map(|b| self.evaluate(a, b)).collect())
            .collect()
    }

    /// Covariances between every point in `points` and `x`.
    pub fn cross(&self, points: &[Vec<f64>], x: &[f64]) -> Vec<f64> {
        points.iter().map(|p| self.evaluate(p, x)).collect()
    }
}

fn kappa(s: f64, alpha: f64, mean_lam: f64) -> f64 {
    let beta = alpha / mean_lam;
    (beta / (s + beta)).powf(alpha)
}
