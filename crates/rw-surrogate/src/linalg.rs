//! Dense helpers for the small symmetric systems the surrogate solves.

use rand::Rng;
use rand_distr::StandardNormal;
use rw_types::SurrogateError;

/// Diagonal jitter added to every factorization.
pub const JITTER: f64 = 1e-9;

/// Lower-triangular Cholesky factor stored row by row (row `i` holds `i + 1`
/// entries). The leading `k` rows are the factor of the leading `k × k` block
/// of the factorized matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CholeskyFactor {
    rows: Vec<Vec<f64>>,
}

impl CholeskyFactor {
    pub fn dim(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        if j <= i {
            self.rows[i][j]
        } else {
            0.0
        }
    }

    /// Row `i` restricted to columns `0..i`.
    pub fn off_diagonal(&self, i: usize) -> &[f64] {
        &self.rows[i][..i]
    }

    pub fn diagonal(&self, i: usize) -> f64 {
        self.rows[i][i]
    }

    /// Solve `L_k x = b` with the leading `k = b.len()` block.
    pub fn solve_lower(&self, b: &[f64]) -> Vec<f64> {
        let k = b.len();
        debug_assert!(k <= self.dim());
        let mut x: Vec<f64> = Vec::with_capacity(k);
        for i in 0..k {
            let row = &self.rows[i];
            let sum: f64 = (0..i).map(|j| row[j] * x[j]).sum();
            x.push((b[i] - sum) / row[i]);
        }
        x
    }

    /// Solve `L_kᵀ x = b` with the leading `k = b.len()` block.
    pub fn solve_upper(&self, b: &[f64]) -> Vec<f64> {
        let k = b.len();
        debug_assert!(k <= self.dim());
        let mut x = vec![0.0; k];
        for i in (0..k).rev() {
            let sum: f64 = (i + 1..k).map(|j| self.rows[j][i] * x[j]).sum();
            x[i] = (b[i] - sum) / self.rows[i][i];
        }
        x
    }

    /// `log det L_k` of the leading `k × k` block.
    pub fn log_det(&self, k: usize) -> f64 {
        (0..k).map(|i| self.rows[i][i].ln()).sum()
    }

    /// `L z` for the full factor.
    pub fn multiply(&self, z: &[f64]) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.iter().zip(z).map(|(l, z)| l * z).sum())
            .collect()
    }
}

/// Cholesky factorization of a symmetric matrix with `jitter` added to the
/// diagonal. Only the lower triangle of `matrix` is read.
pub fn cholesky(matrix: &[Vec<f64>], jitter: f64) -> Result<CholeskyFactor, SurrogateError> {
    let n = matrix.len();
    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(n);

    for i in 0..n {
        let mut row = Vec::with_capacity(i + 1);
        for j in 0..=i {
            let mut sum = matrix[i][j];
            if i == j {
                for k in 0..j {
                    sum -= row[k] * row[k];
                }
                let pivot = sum + jitter;
                if !(pivot > 0.0) || !pivot.is_finite() {
                    return Err(SurrogateError::NotPositiveDefinite { dim: n });
                }
                row.push(pivot.sqrt());
            } else {
                let prev = &rows[j];
                for k in 0..j {
                    sum -= row[k] * prev[k];
                }
                row.push(sum / prev[j]);
            }
        }
        rows.push(row);
    }

    Ok(CholeskyFactor { rows })
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn squared_norm(a: &[f64]) -> f64 {
    dot(a, a)
}

/// Draw from `N(mean, cov)`; `cov` is factorized with `jitter` on the
/// diagonal.
pub fn sample_gaussian<R: Rng + ?Sized>(
    mean: &[f64],
    cov: &[Vec<f64>],
    jitter: f64,
    rng: &mut R,
) -> Result<Vec<f64>, SurrogateError> {
    let factor = cholesky(cov, jitter)?;
    let z: Vec<f64> = (0..mean.len()).map(|_| rng.sample(StandardNormal)).collect();
    Ok(factor
        .multiply(&z)
        .into_iter()
        .zip(mean)
        .map(|(dz, m)| m + dz)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn spd() -> Vec<Vec<f64>> {
        vec![
            vec![4.0, 2.0, 0.6],
            vec![2.0, 5.0, 1.0],
            vec![0.6, 1.0, 3.0],
        ]
    }

    #[test]
    fn factor_reproduces_matrix() {
        let m = spd();
        let l = cholesky(&m, 0.0).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let v: f64 = (0..3).map(|k| l.get(i, k) * l.get(j, k)).sum();
                assert!((v - m[i][j]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn factor_matches_known_lower_triangle() {
        // L = [[2, 0, 0], [1, 3, 0], [0.5, -1, 2]]
        let m = vec![
            vec![4.0, 2.0, 1.0],
            vec![2.0, 10.0, -2.5],
            vec![1.0, -2.5, 5.25],
        ];
        let l = cholesky(&m, 0.0).unwrap();
        let expected = [[2.0, 0.0, 0.0], [1.0, 3.0, 0.0], [0.5, -1.0, 2.0]];
        assert_eq!(l.dim(), 3);
        for i in 0..3 {
            for j in 0..3 {
                assert!((l.get(i, j) - expected[i][j]).abs() < 1e-12, "L[{i}][{j}]");
            }
        }
        assert!((l.log_det(3) - 12.0f64.ln()).abs() < 1e-12);
        assert_eq!(l.off_diagonal(2), &[0.5, -1.0]);
    }

    #[test]
    fn leading_block_is_factor_of_leading_submatrix() {
        let m = spd();
        let full = cholesky(&m, 0.0).unwrap();
        let sub: Vec<Vec<f64>> = m[..2].iter().map(|r| r[..2].to_vec()).collect();
        let small = cholesky(&sub, 0.0).unwrap();
        for i in 0..2 {
            for j in 0..=i {
                assert!((full.get(i, j) - small.get(i, j)).abs() < 1e-12);
            }
        }
        assert!((full.log_det(2) - small.log_det(2)).abs() < 1e-12);
    }

    #[test]
    fn triangular_solves_invert_the_factor() {
        let l = cholesky(&spd(), 0.0).unwrap();
        let b = vec![1.0, -2.0, 0.5];
        let x = l.solve_lower(&b);
        let back = l.multiply(&x);
        for (u, v) in back.iter().zip(&b) {
            assert!((u - v).abs() < 1e-12);
        }

        let y = l.solve_upper(&b);
        // Lᵀ y == b
        for i in 0..3 {
            let v: f64 = (0..3).map(|k| l.get(k, i) * y[k]).sum();
            assert!((v - b[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn indefinite_matrix_is_rejected() {
        let m = vec![vec![1.0, 2.0], vec![2.0, 1.0]];
        assert_eq!(
            cholesky(&m, JITTER).unwrap_err(),
            SurrogateError::NotPositiveDefinite { dim: 2 }
        );
    }

    #[test]
    fn gaussian_samples_have_requested_moments() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let cov = vec![vec![1.0, 0.8], vec![0.8, 1.0]];
        let n = 20_000;
        let draws: Vec<Vec<f64>> = (0..n)
            .map(|_| sample_gaussian(&[1.0, -1.0], &cov, 0.0, &mut rng).unwrap())
            .collect();
        let mean0 = draws.iter().map(|d| d[0]).sum::<f64>() / n as f64;
        let mean1 = draws.iter().map(|d| d[1]).sum::<f64>() / n as f64;
        let cross = draws
            .iter()
            .map(|d| (d[0] - mean0) * (d[1] - mean1))
            .sum::<f64>()
            / n as f64;
        assert!((mean0 - 1.0).abs() < 0.05);
        assert!((mean1 + 1.0).abs() < 0.05);
        assert!((cross - 0.8).abs() < 0.05);
    }
}
