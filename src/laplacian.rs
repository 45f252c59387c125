//! Discrete Laplacian with an explicit boundary.
//!
//! `BoundaryLaplacian` turns a weighted adjacency matrix into
//! `L = I - P_masked` where `P` is the row-normalized transition matrix and
//! the mask applies per-edge damping. Rows and columns belonging to the
//! boundary (sources and/or sinks) are snapshotted and then zeroed, so the
//! stored `L` has an exactly-zero row, column, *and diagonal* at every
//! boundary index: the boundary block decouples and the factorization solves
//! the transient block alone.
//!
//! Orientation naming deserves care: [`Orientation::Left`] solves
//! `Lᵀx = rhs` (the solution multiplies `L` from the left) and
//! [`Orientation::Right`] solves `Lx = rhs`. Emitting-mode visit columns are
//! `Left` solves against boundary rows; absorbing-mode columns are `Right`
//! solves against boundary columns.

use std::collections::HashMap;

use nalgebra::DMatrix;

use crate::adjacency::CsrAdjacency;
use crate::factor::LuFactors;
use crate::{Error, Result};

/// Which side of the Laplacian a solve addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Solve `Lᵀx = rhs`.
    Left,
    /// Solve `Lx = rhs`.
    Right,
}

/// Common seam for the two Laplacian flavors, so the mode evaluators can run
/// against either a per-boundary factorization ([`BoundaryLaplacian`]) or a
/// shared full-graph factorization with block corrections
/// ([`crate::FullGraphLaplacian`]).
pub trait LaplacianSolver {
    fn node_count(&self) -> usize;

    /// Solve against the boundary-restricted Laplacian. At boundary indices
    /// the returned entries are not meaningful (the decoupled block passes
    /// values through); the evaluators overwrite them by convention.
    fn solve(&mut self, rhs: &[f64], orientation: Orientation) -> Result<Vec<f64>>;

    /// Row `i` of the pre-zeroing masked transition matrix, dense.
    fn boundary_row(&self, i: usize) -> Result<Vec<f64>>;

    /// Column `j` of the pre-zeroing masked transition matrix, dense.
    fn boundary_col(&self, j: usize) -> Result<Vec<f64>>;
}

/// Sparse Laplacian with boundary rows/columns extracted, plus a lazily
/// created LU factorization reused by every subsequent solve.
#[derive(Debug)]
pub struct BoundaryLaplacian {
    l: CsrAdjacency,
    boundary_rows: Vec<usize>,
    boundary_cols: Vec<usize>,
    row_data: Vec<Vec<f64>>,
    col_data: Vec<Vec<f64>>,
    row_map: HashMap<usize, usize>,
    col_map: HashMap<usize, usize>,
    is_boundary: Vec<bool>,
    factors: Option<LuFactors>,
    factorizations: usize,
}

impl BoundaryLaplacian {
    /// Build the Laplacian, consuming the adjacency matrix.
    ///
    /// The construction rewrites the stored values in place (normalize, mask,
    /// zero boundary, negate, add identity), which is why ownership moves
    /// here; clone the adjacency first if it is needed afterwards.
    /// `df_mask` must parallel the adjacency value array.
    pub fn new(
        mut w: CsrAdjacency,
        df_mask: &[f64],
        boundary_rows: &[usize],
        boundary_cols: &[usize],
    ) -> Result<Self> {
        let n = w.node_count();
        if df_mask.len() != w.nnz() {
            return Err(Error::InvalidParameter(format!(
                "df_mask length must equal nnz (len={} nnz={})",
                df_mask.len(),
                w.nnz()
            )));
        }
        for &i in boundary_rows.iter().chain(boundary_cols.iter()) {
            if i >= n {
                return Err(Error::InvalidParameter(format!(
                    "boundary index {i} out of range for {n} nodes"
                )));
            }
        }

        w.normalize_rows();
        for (v, &m) in w.values_mut().iter_mut().zip(df_mask.iter()) {
            *v *= m;
        }

        // Snapshot boundary rows of the masked transition matrix, then zero
        // them. Column snapshots come after, so a boundary column records
        // zeros at boundary-row intersections; the source-to-sink coupling is
        // reintroduced explicitly by the channel evaluator.
        let mut row_data = Vec::with_capacity(boundary_rows.len());
        for &i in boundary_rows {
            row_data.push(w.dense_row(i));
        }
        for &i in boundary_rows {
            let range = w.row_range(i);
            for v in &mut w.values_mut()[range] {
                *v = 0.0;
            }
        }

        // Snapshot boundary columns in one pass over the storage. This is the
        // structurally expensive step (no column index is maintained), but
        // boundary sets are small and the pass is O(nnz) total.
        let mut col_slots: HashMap<usize, Vec<usize>> = HashMap::new();
        for (slot, &j) in boundary_cols.iter().enumerate() {
            col_slots.entry(j).or_default().push(slot);
        }
        let mut col_data = vec![vec![0.0; n]; boundary_cols.len()];
        for i in 0..n {
            for k in w.row_range(i) {
                if let Some(slots) = col_slots.get(&w.col_indices()[k]) {
                    for &slot in slots {
                        col_data[slot][i] = w.values()[k];
                    }
                }
            }
        }

        // Zero every row and column of the boundary union.
        let mut is_boundary = vec![false; n];
        for &i in boundary_rows.iter().chain(boundary_cols.iter()) {
            is_boundary[i] = true;
        }
        for i in 0..n {
            if is_boundary[i] {
                let range = w.row_range(i);
                for v in &mut w.values_mut()[range] {
                    *v = 0.0;
                }
            }
        }
        for i in 0..n {
            for k in w.row_range(i) {
                if is_boundary[w.col_indices()[k]] {
                    w.values_mut()[k] = 0.0;
                }
            }
        }

        // L = I - P on the transient block; boundary diagonals stay 0.0 so
        // the boundary block decouples entirely.
        for v in w.values_mut() {
            *v = -*v;
        }
        for i in 0..n {
            if !is_boundary[i] {
                let k = w.diag_indices()[i];
                w.values_mut()[k] += 1.0;
            }
        }

        let row_map = boundary_rows
            .iter()
            .enumerate()
            .map(|(slot, &i)| (i, slot))
            .collect();
        let col_map = boundary_cols
            .iter()
            .enumerate()
            .map(|(slot, &j)| (j, slot))
            .collect();

        Ok(Self {
            l: w,
            boundary_rows: boundary_rows.to_vec(),
            boundary_cols: boundary_cols.to_vec(),
            row_data,
            col_data,
            row_map,
            col_map,
            is_boundary,
            factors: None,
            factorizations: 0,
        })
    }

    /// The stored Laplacian matrix (boundary rows/columns identically zero).
    pub fn matrix(&self) -> &CsrAdjacency {
        &self.l
    }

    pub fn boundary_rows(&self) -> &[usize] {
        &self.boundary_rows
    }

    pub fn boundary_cols(&self) -> &[usize] {
        &self.boundary_cols
    }

    /// How many times a factorization has been computed. Stays at 1 across
    /// arbitrarily many solves in either orientation.
    pub fn factorization_count(&self) -> usize {
        self.factorizations
    }

    /// Sum of the extracted boundary columns, used as a right-hand side when
    /// probing which transient nodes can reach any sink at all.
    pub fn boundary_col_sum(&self) -> Vec<f64> {
        let n = self.l.node_count();
        let mut sum = vec![0.0; n];
        for col in &self.col_data {
            for (s, &v) in sum.iter_mut().zip(col.iter()) {
                *s += v;
            }
        }
        sum
    }

    /// The full Green's function `L⁻¹` of the transient block, dense.
    /// One right solve per column; intended for small graphs and diagnostics.
    pub fn greens_function(&mut self) -> Result<DMatrix<f64>> {
        let n = self.l.node_count();
        let mut g = DMatrix::<f64>::identity(n, n);
        for j in 0..n {
            let rhs: Vec<f64> = (0..n).map(|i| g[(i, j)]).collect();
            let x = self.solve(&rhs, Orientation::Right)?;
            for i in 0..n {
                g[(i, j)] = x[i];
            }
        }
        Ok(g)
    }

    fn ensure_factorized(&mut self) -> Result<()> {
        if self.factors.is_none() {
            let factors = LuFactors::factorize(&self.l, &self.is_boundary)?;
            self.factorizations += 1;
            self.factors = Some(factors);
        }
        Ok(())
    }
}

impl LaplacianSolver for BoundaryLaplacian {
    fn node_count(&self) -> usize {
        self.l.node_count()
    }

    fn solve(&mut self, rhs: &[f64], orientation: Orientation) -> Result<Vec<f64>> {
        if rhs.len() != self.l.node_count() {
            return Err(Error::InvalidParameter(format!(
                "rhs length must equal node_count (len={} node_count={})",
                rhs.len(),
                self.l.node_count()
            )));
        }
        self.ensure_factorized()?;
        let factors = self
            .factors
            .as_ref()
            .expect("factorization created by ensure_factorized");
        Ok(match orientation {
            Orientation::Left => factors.solve_left(rhs),
            Orientation::Right => factors.solve_right(rhs),
        })
    }

    fn boundary_row(&self, i: usize) -> Result<Vec<f64>> {
        match self.row_map.get(&i) {
            Some(&slot) => Ok(self.row_data[slot].clone()),
            None => Err(Error::UnknownBoundaryIndex(i)),
        }
    }

    fn boundary_col(&self, j: usize) -> Result<Vec<f64>> {
        match self.col_map.get(&j) {
            Some(&slot) => Ok(self.col_data[slot].clone()),
            None => Err(Error::UnknownBoundaryIndex(j)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn cycle4() -> CsrAdjacency {
        CsrAdjacency::from_edges(4, &[(0, 1, 1.0), (1, 2, 1.0), (2, 3, 1.0), (3, 0, 1.0)])
            .unwrap()
    }

    fn uniform_mask(adj: &CsrAdjacency, df: f64) -> Vec<f64> {
        adj.damping_mask(df, &BTreeMap::new(), 1.0, &BTreeMap::new())
    }

    #[test]
    fn boundary_rows_cols_and_diagonal_are_zeroed() {
        let adj = cycle4();
        let mask = uniform_mask(&adj, 0.5);
        let spl = BoundaryLaplacian::new(adj, &mask, &[1], &[2]).unwrap();
        let l = spl.matrix();
        for i in 0..4 {
            for k in l.row_range(i) {
                let j = l.col_indices()[k];
                if i == 1 || i == 2 || j == 1 || j == 2 {
                    assert_eq!(l.values()[k], 0.0, "L[{i},{j}] not zeroed");
                }
            }
        }
        // diagonal of a boundary index stays exactly 0.0
        assert_eq!(l.values()[l.diag_indices()[1]], 0.0);
        assert_eq!(l.values()[l.diag_indices()[2]], 0.0);
        // transient diagonals carry the identity
        assert_eq!(l.values()[l.diag_indices()[0]], 1.0);
        assert_eq!(l.values()[l.diag_indices()[3]], 1.0);
    }

    #[test]
    fn boundary_snapshots_hold_premask_transition_rows() {
        let adj = cycle4();
        let mask = uniform_mask(&adj, 0.5);
        let spl = BoundaryLaplacian::new(adj, &mask, &[0], &[2]).unwrap();
        assert_eq!(spl.boundary_rows(), &[0]);
        assert_eq!(spl.boundary_cols(), &[2]);
        // row 0 of the damped transition matrix: 0 -> 1 with weight 0.5
        let row = spl.boundary_row(0).unwrap();
        assert_eq!(row, vec![0.0, 0.5, 0.0, 0.0]);
        // column 2: only 1 -> 2, weight 0.5
        let col = spl.boundary_col(2).unwrap();
        assert_eq!(col, vec![0.0, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn unknown_boundary_index_is_an_error() {
        let adj = cycle4();
        let mask = uniform_mask(&adj, 0.5);
        let spl = BoundaryLaplacian::new(adj, &mask, &[0], &[]).unwrap();
        assert!(matches!(
            spl.boundary_row(3),
            Err(Error::UnknownBoundaryIndex(3))
        ));
        assert!(matches!(
            spl.boundary_col(0),
            Err(Error::UnknownBoundaryIndex(0))
        ));
    }

    #[test]
    fn factorization_is_cached_across_orientations() {
        let adj = cycle4();
        let mask = uniform_mask(&adj, 0.5);
        let mut spl = BoundaryLaplacian::new(adj, &mask, &[0], &[]).unwrap();
        assert_eq!(spl.factorization_count(), 0);
        let rhs = vec![1.0; 4];
        spl.solve(&rhs, Orientation::Left).unwrap();
        assert_eq!(spl.factorization_count(), 1);
        spl.solve(&rhs, Orientation::Left).unwrap();
        spl.solve(&rhs, Orientation::Right).unwrap();
        assert_eq!(spl.factorization_count(), 1);
    }

    #[test]
    fn solve_inverts_the_transient_block() {
        // cycle with sink column 2 at df = 0.5: transient edges 0->1, 3->0
        let adj = cycle4();
        let mask = uniform_mask(&adj, 0.5);
        let mut spl = BoundaryLaplacian::new(adj, &mask, &[], &[2]).unwrap();
        let rhs = spl.boundary_col(2).unwrap();
        let x = spl.solve(&rhs, Orientation::Right).unwrap();
        assert_relative_eq!(x[1], 0.5, epsilon = 1e-12);
        assert_relative_eq!(x[0], 0.25, epsilon = 1e-12);
        assert_relative_eq!(x[3], 0.125, epsilon = 1e-12);
    }

    #[test]
    fn greens_function_inverts_the_transient_block() {
        // sink column {2} at df = 0.5 leaves transient edges 0->1 and 3->0
        let adj = cycle4();
        let mask = uniform_mask(&adj, 0.5);
        let mut spl = BoundaryLaplacian::new(adj, &mask, &[], &[2]).unwrap();
        let g = spl.greens_function().unwrap();
        assert_relative_eq!(g[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(g[(0, 1)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(g[(3, 1)], 0.25, epsilon = 1e-12);
        // the decoupled boundary index passes the identity column through
        assert_relative_eq!(g[(2, 2)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn undamped_laplacian_without_boundary_is_singular() {
        // df = 1.0 and no boundary: I - P has the all-ones null vector
        let adj = cycle4();
        let mask = uniform_mask(&adj, 1.0);
        let mut spl = BoundaryLaplacian::new(adj, &mask, &[], &[]).unwrap();
        let err = spl.solve(&[1.0; 4], Orientation::Right).unwrap_err();
        assert!(matches!(err, Error::SingularMatrix { .. }));
    }
}
