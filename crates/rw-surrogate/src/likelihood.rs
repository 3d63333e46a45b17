//! Sufficient statistics of the per-configuration learning-curve likelihood.
//!
//! For a curve `y_i` of length `k_i` and `A = K_r / σ² + I` over the first
//! `k_i` grid levels with Cholesky factor `L`, the marginal likelihood only
//! needs `v = L⁻¹ 1` and `w = L⁻¹ (y_i − m)` through `vᵗv`, `wᵗv` and `wᵗw`.
//! Because every curve starts at the first grid level, `L` for a shorter curve
//! is the upper-left block of the factor for the longest one, so a single
//! factorization serves the whole data set.

use rw_types::SurrogateError;

use crate::grid::ResourceGrid;
use crate::kernel::Kernel;
use crate::linalg::{cholesky, dot, squared_norm, CholeskyFactor, JITTER};

/// Data layout shared by every likelihood evaluation of one refit.
#[derive(Debug, Clone, PartialEq)]
pub struct Precomputed {
    /// Curve lengths, non-increasing.
    pub ydims: Vec<usize>,
    /// `num_configs[j]` = number of curves longer than `j`.
    pub num_configs: Vec<usize>,
    /// Level-major targets: part `j` holds `y_i[j]` for the first
    /// `num_configs[j]` curves.
    pub yflat: Vec<f64>,
    /// `order[p]` = input index of the curve stored at position `p`.
    pub order: Vec<usize>,
}

impl Precomputed {
    pub fn num_curves(&self) -> usize {
        self.ydims.len()
    }

    pub fn ydim_max(&self) -> usize {
        self.ydims.first().copied().unwrap_or(0)
    }
}

/// Lay out `targets` for the fast likelihood sweep. Curves are stably sorted
/// by non-increasing length; empty curves are not allowed.
pub fn precompute(targets: &[Vec<f64>]) -> Result<Precomputed, SurrogateError> {
    if targets.is_empty() {
        return Err(SurrogateError::InsufficientData {
            message: "no learning curves to precompute".to_string(),
        });
    }
    if let Some(i) = targets.iter().position(|t| t.is_empty()) {
        return Err(SurrogateError::InsufficientData {
            message: format!("learning curve {} is empty", i),
        });
    }

    let mut order: Vec<usize> = (0..targets.len()).collect();
    order.sort_by(|&a, &b| targets[b].len().cmp(&targets[a].len()));

    let ydims: Vec<usize> = order.iter().map(|&i| targets[i].len()).collect();
    let ydim_max = ydims[0];
    let num_configs: Vec<usize> = (0..ydim_max)
        .map(|j| ydims.iter().filter(|&&d| d > j).count())
        .collect();

    let mut yflat = Vec::with_capacity(ydims.iter().sum());
    for (j, &num) in num_configs.iter().enumerate() {
        yflat.extend(order[..num].iter().map(|&i| targets[i][j]));
    }

    Ok(Precomputed {
        ydims,
        num_configs,
        yflat,
        order,
    })
}

/// Per-curve statistics, in the sorted order of [`Precomputed`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLikelihood {
    pub vtv: Vec<f64>,
    pub wtv: Vec<f64>,
    pub wtw: Vec<f64>,
    /// Factor of `A` over the longest curve.
    pub lfact_all: CholeskyFactor,
    pub ydims: Vec<usize>,
    pub num_data: usize,
    /// `Σ_i log det L_i`.
    pub logdet: f64,
}

/// `A = K_r / σ² + I` over the first `dim` grid levels and its resource mean.
fn resource_system(
    grid: &ResourceGrid,
    kernel: &Kernel,
    noise_variance: f64,
    dim: usize,
) -> Result<(CholeskyFactor, Vec<f64>), SurrogateError> {
    let inputs: Vec<Vec<f64>> = grid
        .normalized_prefix(dim)
        .into_iter()
        .map(|r| vec![r])
        .collect();
    let mut amat = kernel.matrix(&inputs);
    for (j, row) in amat.iter_mut().enumerate() {
        for value in row.iter_mut() {
            *value /= noise_variance;
        }
        row[j] += 1.0;
    }
    let lfact = cholesky(&amat, JITTER)?;
    let means = inputs.iter().map(|r| kernel.mean(r)).collect();
    Ok((lfact, means))
}

/// `Σ_i log det L_i` where `L_i` is the leading `ydims[i]` block of
/// `lfact_all`.
pub fn logdet_cholfact(lfact_all: &CholeskyFactor, ydims: &[usize]) -> f64 {
    let dim = ydims.iter().copied().max().unwrap_or(0);
    (0..dim)
        .map(|j| {
            let weight = ydims.iter().filter(|&&d| d > j).count() as f64;
            lfact_all.diagonal(j).ln() * weight
        })
        .sum()
}

/// Single-factor sweep over the grid levels.
///
/// `W` is built one level (row) at a time over the curves still active at
/// that level. When curves drop out their columns are summarized into the
/// parts lists and `W` is narrowed; the parts are concatenated in reverse at
/// the end to restore curve order.
pub fn resource_kernel_likelihood_computations(
    precomputed: &Precomputed,
    grid: &ResourceGrid,
    kernel: &Kernel,
    noise_variance: f64,
) -> Result<ResourceLikelihood, SurrogateError> {
    let ydim_max = precomputed.ydim_max();
    if ydim_max == 0 {
        return Err(SurrogateError::InsufficientData {
            message: "no learning curves".to_string(),
        });
    }
    if ydim_max > grid.len() {
        return Err(SurrogateError::DimensionMismatch {
            expected: grid.len(),
            actual: ydim_max,
        });
    }

    let (lfact_all, means) = resource_system(grid, kernel, noise_variance, ydim_max)?;
    let num_configs = &precomputed.num_configs;
    let yflat = &precomputed.yflat;

    let mut offset = num_configs[0];
    let scale = 1.0 / lfact_all.diagonal(0);
    let mut v: Vec<f64> = vec![scale];
    let mut wmat: Vec<Vec<f64>> = vec![yflat[..offset]
        .iter()
        .map(|y| (y - means[0]) * scale)
        .collect()];

    let mut wtv_parts: Vec<Vec<f64>> = Vec::new();
    let mut wtw_parts: Vec<Vec<f64>> = Vec::new();
    let mut num_prev = offset;

    for (ydim, &num) in num_configs.iter().enumerate().skip(1) {
        if num < num_prev {
            let (wtv, wtw) = column_summaries(&v, &wmat, num, num_prev);
            wtv_parts.push(wtv);
            wtw_parts.push(wtw);
            wmat = wmat.iter().map(|row| row[..num].to_vec()).collect();
            num_prev = num;
        }

        let rhs = &yflat[offset..offset + num];
        offset += num;
        let lvec = lfact_all.off_diagonal(ydim);
        let scale = 1.0 / lfact_all.diagonal(ydim);

        let w_new: Vec<f64> = (0..num)
            .map(|c| {
                let acc: f64 = lvec.iter().zip(&wmat).map(|(l, row)| l * row[c]).sum();
                (rhs[c] - means[ydim] - acc) * scale
            })
            .collect();
        wmat.push(w_new);

        let v_new = (1.0 - dot(lvec, &v)) * scale;
        v.push(v_new);
    }

    let (wtv, wtw) = column_summaries(&v, &wmat, 0, num_prev);
    wtv_parts.push(wtv);
    wtw_parts.push(wtw);

    let wtv: Vec<f64> = wtv_parts.into_iter().rev().flatten().collect();
    let wtw: Vec<f64> = wtw_parts.into_iter().rev().flatten().collect();

    let vtv_for_ydim: Vec<f64> = v
        .iter()
        .scan(0.0, |acc, x| {
            *acc += x * x;
            Some(*acc)
        })
        .collect();
    let vtv = precomputed
        .ydims
        .iter()
        .map(|&d| vtv_for_ydim[d - 1])
        .collect();

    let logdet = logdet_cholfact(&lfact_all, &precomputed.ydims);

    Ok(ResourceLikelihood {
        vtv,
        wtv,
        wtw,
        lfact_all,
        ydims: precomputed.ydims.clone(),
        num_data: precomputed.ydims.iter().sum(),
        logdet,
    })
}

/// `(vᵗw, wᵗw)` for columns `from..to` of `W`.
fn column_summaries(v: &[f64], wmat: &[Vec<f64>], from: usize, to: usize) -> (Vec<f64>, Vec<f64>) {
    (from..to)
        .map(|c| {
            wmat.iter()
                .zip(v)
                .fold((0.0, 0.0), |(wtv, wtw), (row, vj)| {
                    (wtv + vj * row[c], wtw + row[c] * row[c])
                })
        })
        .unzip()
}

/// One curve at a time, each with its own factorization. Much slower; kept
/// as the reference for the sweep.
pub fn resource_kernel_likelihood_slow_computations(
    targets: &[Vec<f64>],
    grid: &ResourceGrid,
    kernel: &Kernel,
    noise_variance: f64,
) -> Result<ResourceLikelihood, SurrogateError> {
    let ydims: Vec<usize> = targets.iter().map(|t| t.len()).collect();
    let ydim_max = ydims.iter().copied().max().unwrap_or(0);
    if ydim_max == 0 || ydims.contains(&0) {
        return Err(SurrogateError::InsufficientData {
            message: "learning curves must be non-empty".to_string(),
        });
    }
    if ydim_max > grid.len() {
        return Err(SurrogateError::DimensionMismatch {
            expected: grid.len(),
            actual: ydim_max,
        });
    }

    let (lfact_all, _) = resource_system(grid, kernel, noise_variance, ydim_max)?;

    let mut vtv = Vec::with_capacity(targets.len());
    let mut wtv = Vec::with_capacity(targets.len());
    let mut wtw = Vec::with_capacity(targets.len());
    let mut logdet = 0.0;

    for y in targets {
        let (lfact, means) = resource_system(grid, kernel, noise_variance, y.len())?;
        let v = lfact.solve_lower(&vec![1.0; y.len()]);
        let residual: Vec<f64> = y.iter().zip(&means).map(|(y, m)| y - m).collect();
        let w = lfact.solve_lower(&residual);
        vtv.push(squared_norm(&v));
        wtv.push(dot(&w, &v));
        wtw.push(squared_norm(&w));
        logdet += lfact.log_det(y.len());
    }

    Ok(ResourceLikelihood {
        vtv,
        wtv,
        wtw,
        lfact_all,
        num_data: ydims.iter().sum(),
        ydims,
        logdet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curves() -> Vec<Vec<f64>> {
        vec![
            vec![0.9, 0.7],
            vec![1.2, 0.8, 0.6, 0.55, 0.5],
            vec![0.4],
            vec![1.0, 0.9, 0.85],
            vec![0.3, 0.25, 0.2, 0.2, 0.19],
            vec![0.7, 0.65, 0.6],
        ]
    }

    fn sorted(targets: &[Vec<f64>], order: &[usize]) -> Vec<Vec<f64>> {
        order.iter().map(|&i| targets[i].clone()).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-6 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn precompute_orders_by_length() {
        let pre = precompute(&curves()).unwrap();
        assert_eq!(pre.ydims, vec![5, 5, 3, 3, 2, 1]);
        assert_eq!(pre.order, vec![1, 4, 3, 5, 0, 2]);
        assert_eq!(pre.num_configs, vec![6, 5, 4, 2, 2]);
        assert_eq!(pre.yflat.len(), 19);
        // level 1 of the five longest curves, in sorted order
        assert_eq!(&pre.yflat[6..11], &[0.8, 0.25, 0.9, 0.65, 0.7]);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(precompute(&[]).is_err());
        assert!(precompute(&[vec![1.0], vec![]]).is_err());
    }

    #[test]
    fn fast_sweep_matches_per_curve_reference() {
        let grid = ResourceGrid::new(1, 9);
        let kernel = Kernel::exponential_decay(1.3, 2.1, 0.8);
        let noise = 0.05;

        let targets = curves();
        let pre = precompute(&targets).unwrap();
        let fast = resource_kernel_likelihood_computations(&pre, &grid, &kernel, noise).unwrap();
        let slow = resource_kernel_likelihood_slow_computations(
            &sorted(&targets, &pre.order),
            &grid,
            &kernel,
            noise,
        )
        .unwrap();

        assert_eq!(fast.ydims, slow.ydims);
        assert_eq!(fast.num_data, 19);
        for i in 0..targets.len() {
            assert!(close(fast.vtv[i], slow.vtv[i]), "vtv[{}]", i);
            assert!(close(fast.wtv[i], slow.wtv[i]), "wtv[{}]", i);
            assert!(close(fast.wtw[i], slow.wtw[i]), "wtw[{}]", i);
        }
        assert!(close(fast.logdet, slow.logdet));
        assert!(close(
            logdet_cholfact(&slow.lfact_all, &slow.ydims),
            slow.logdet
        ));
    }

    fn assert_sweeps_agree(targets: &[Vec<f64>], grid: &ResourceGrid, kernel: &Kernel, noise: f64) {
        let pre = precompute(targets).unwrap();
        let fast = resource_kernel_likelihood_computations(&pre, grid, kernel, noise).unwrap();
        let slow = resource_kernel_likelihood_slow_computations(
            &sorted(targets, &pre.order),
            grid,
            kernel,
            noise,
        )
        .unwrap();

        assert_eq!(fast.ydims, slow.ydims);
        assert_eq!(fast.num_data, targets.iter().map(Vec::len).sum::<usize>());
        for i in 0..targets.len() {
            assert!(close(fast.vtv[i], slow.vtv[i]), "vtv[{}] of {:?}", i, targets);
            assert!(close(fast.wtv[i], slow.wtv[i]), "wtv[{}] of {:?}", i, targets);
            assert!(close(fast.wtw[i], slow.wtw[i]), "wtw[{}] of {:?}", i, targets);
        }
        assert!(close(fast.logdet, slow.logdet), "logdet of {:?}", targets);
    }

    #[test]
    fn fast_sweep_matches_reference_on_random_curves() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let grid = ResourceGrid::new(1, 9);
        let max_len = grid.len();
        let mut datasets: Vec<Vec<Vec<f64>>> = vec![
            vec![vec![0.42]],
            vec![vec![0.9, 0.6, 0.5]],
            vec![vec![0.3], vec![0.8], vec![-0.1]],
        ];
        for _ in 0..20 {
            let n = rng.gen_range(1..=8);
            let dataset = (0..n)
                .map(|_| {
                    let len = rng.gen_range(1..=max_len);
                    (0..len).map(|_| rng.gen_range(-2.0..2.0)).collect()
                })
                .collect();
            datasets.push(dataset);
        }

        for targets in &datasets {
            let kernel = Kernel::exponential_decay(
                rng.gen_range(0.2..3.0),
                rng.gen_range(0.2..3.0),
                rng.gen_range(0.1..2.0),
            );
            let noise = rng.gen_range(0.01..0.5);
            assert_sweeps_agree(targets, &grid, &kernel, noise);
        }
    }

    #[test]
    fn curve_longer_than_grid_is_rejected() {
        let grid = ResourceGrid::new(1, 2);
        let kernel = Kernel::exponential_decay(1.0, 1.0, 1.0);
        let pre = precompute(&[vec![1.0, 2.0, 3.0]]).unwrap();
        assert_eq!(
            resource_kernel_likelihood_computations(&pre, &grid, &kernel, 0.1).unwrap_err(),
            SurrogateError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
    }
}
