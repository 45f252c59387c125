//! Sparse LU factorization of the discrete Laplacian.
//!
//! A single left-looking LU of `L` serves solves in both orientations:
//! `L = LU` gives `Lx = b` by forward/backward substitution and
//! `Lᵀx = b` through `Uᵀ`/`Lᵀ`. No pivoting is performed: away from
//! boundary indices the damped Laplacian `I - P` is a row-diagonally
//! dominant M-matrix, for which the factorization exists and is stable.
//!
//! Boundary rows and columns are identically zero by construction (the
//! boundary block decouples), so their structurally empty pivots are
//! replaced by `1.0`; a solve then passes `rhs` through unchanged at
//! boundary indices and the transient block is solved independently.

use crate::adjacency::CsrAdjacency;
use crate::{Error, Result};

/// A pivot smaller than this makes the transient block numerically singular,
/// which happens exactly when the damped chain has no dissipation path out of
/// some node (rank-deficient Laplacian).
const PIVOT_TOLERANCE: f64 = 1e-12;

/// LU factors of a Laplacian, stored column-wise.
#[derive(Debug)]
pub(crate) struct LuFactors {
    n: usize,
    /// Strictly-below-diagonal entries of the unit lower factor, per column.
    lower: Vec<Vec<(usize, f64)>>,
    /// Strictly-above-diagonal entries of the upper factor, per column.
    upper: Vec<Vec<(usize, f64)>>,
    pivots: Vec<f64>,
}

impl LuFactors {
    /// Factorize the Laplacian stored in `l`. `boundary[i]` marks indices
    /// whose row and column were zeroed out; only those may present an empty
    /// pivot, which is replaced by a unit pivot.
    pub(crate) fn factorize(l: &CsrAdjacency, boundary: &[bool]) -> Result<Self> {
        let n = l.node_count();
        let (col_ptr, csc_rows, csc_vals) = csr_to_csc(l);

        let mut lower: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
        let mut upper: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
        let mut pivots = vec![0.0; n];

        let mut work = vec![0.0; n];
        let mut mark = vec![false; n];
        let mut touched: Vec<usize> = Vec::new();

        for j in 0..n {
            // scatter column j of L
            for p in col_ptr[j]..col_ptr[j + 1] {
                let i = csc_rows[p];
                let v = csc_vals[p];
                if v != 0.0 {
                    work[i] = v;
                    if !mark[i] {
                        mark[i] = true;
                        touched.push(i);
                    }
                }
            }

            // left-looking elimination against the finished columns
            for k in 0..j {
                let xk = work[k];
                if xk == 0.0 {
                    continue;
                }
                for &(i, lv) in &lower[k] {
                    if !mark[i] {
                        mark[i] = true;
                        touched.push(i);
                    }
                    work[i] -= xk * lv;
                }
            }

            let mut pivot = work[j];
            if boundary[j] && pivot.abs() < PIVOT_TOLERANCE {
                pivot = 1.0;
            }
            if !pivot.is_finite() || pivot.abs() < PIVOT_TOLERANCE {
                return Err(Error::SingularMatrix { index: j });
            }

            let mut ucol = Vec::new();
            let mut lcol = Vec::new();
            for &i in &touched {
                let v = work[i];
                if v != 0.0 {
                    if i < j {
                        ucol.push((i, v));
                    } else if i > j {
                        lcol.push((i, v / pivot));
                    }
                }
            }
            pivots[j] = pivot;
            upper.push(ucol);
            lower.push(lcol);

            for &i in &touched {
                work[i] = 0.0;
                mark[i] = false;
            }
            touched.clear();
        }

        Ok(Self {
            n,
            lower,
            upper,
            pivots,
        })
    }

    /// Solve `Lx = rhs`.
    pub(crate) fn solve_right(&self, rhs: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x = rhs.to_vec();
        // forward: unit lower factor
        for k in 0..n {
            let xk = x[k];
            if xk != 0.0 {
                for &(i, lv) in &self.lower[k] {
                    x[i] -= xk * lv;
                }
            }
        }
        // backward: upper factor
        for j in (0..n).rev() {
            x[j] /= self.pivots[j];
            let xj = x[j];
            if xj != 0.0 {
                for &(k, uv) in &self.upper[j] {
                    x[k] -= xj * uv;
                }
            }
        }
        x
    }

    /// Solve `Lᵀx = rhs`.
    pub(crate) fn solve_left(&self, rhs: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x = vec![0.0; n];
        // forward: Uᵀ is lower triangular with the pivots on its diagonal
        for j in 0..n {
            let mut t = rhs[j];
            for &(k, uv) in &self.upper[j] {
                t -= uv * x[k];
            }
            x[j] = t / self.pivots[j];
        }
        // backward: Lᵀ is unit upper triangular
        for k in (0..n).rev() {
            let mut t = x[k];
            for &(i, lv) in &self.lower[k] {
                t -= lv * x[i];
            }
            x[k] = t;
        }
        x
    }
}

/// Column-compressed mirror of the CSR storage.
fn csr_to_csc(l: &CsrAdjacency) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let n = l.node_count();
    let values = l.values();
    let cols = l.col_indices();
    let nnz = values.len();

    let mut col_ptr = vec![0usize; n + 1];
    for &j in cols {
        col_ptr[j + 1] += 1;
    }
    for j in 0..n {
        col_ptr[j + 1] += col_ptr[j];
    }
    let mut next = col_ptr.clone();
    let mut csc_rows = vec![0usize; nnz];
    let mut csc_vals = vec![0.0; nnz];
    for i in 0..n {
        for k in l.row_range(i) {
            let j = cols[k];
            let p = next[j];
            next[j] += 1;
            csc_rows[p] = i;
            csc_vals[p] = values[k];
        }
    }
    (col_ptr, csc_rows, csc_vals)
}
