//! Sparse adjacency matrices in compressed-sparse-row form.
//!
//! The adjacency matrix is the single input to every analysis mode. Its
//! storage contract is stricter than a generic CSR matrix:
//! - square, one row/column per node;
//! - column indices sorted and unique within each row;
//! - a diagonal entry materialized in every row, possibly zero, with its
//!   position recorded in `diag_idx` (the Laplacian construction adds `1.0`
//!   there in place);
//! - `row_weights[i]` is the divisor that turns row `i` into a transition
//!   probability row. It defaults to the row sum, so it is zero iff the row
//!   is all zero and normalization never divides by zero.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Weighted adjacency matrix in CSR form plus the bookkeeping the Laplacian
/// construction needs (diagonal positions, row normalization weights).
///
/// `Clone` produces an independent deep copy; `BoundaryLaplacian::new`
/// consumes the matrix by value because it rewrites the stored values in
/// place, so callers that need the adjacency afterwards clone first.
#[derive(Debug, Clone)]
pub struct CsrAdjacency {
    n: usize,
    values: Vec<f64>,
    col_indices: Vec<usize>,
    row_ptr: Vec<usize>,
    diag_idx: Vec<usize>,
    row_weights: Vec<f64>,
}

impl CsrAdjacency {
    /// Build from an edge list `(from, to, weight)`. Duplicate edges are
    /// summed and a zero diagonal entry is materialized for every node.
    pub fn from_edges(n: usize, edges: &[(usize, usize, f64)]) -> Result<Self> {
        let mut rows: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
        for &(u, v, w) in edges {
            if u >= n || v >= n {
                return Err(Error::InvalidParameter(format!(
                    "edge ({u}, {v}) out of range for {n} nodes"
                )));
            }
            if !w.is_finite() {
                return Err(Error::InvalidParameter(format!(
                    "edge ({u}, {v}) weight must be finite"
                )));
            }
            if w < 0.0 {
                return Err(Error::InvalidParameter(format!(
                    "edge ({u}, {v}) weight must be non-negative"
                )));
            }
            *rows[u].entry(v).or_insert(0.0) += w;
        }
        for (i, row) in rows.iter_mut().enumerate() {
            row.entry(i).or_insert(0.0);
        }

        let nnz: usize = rows.iter().map(|r| r.len()).sum();
        let mut values = Vec::with_capacity(nnz);
        let mut col_indices = Vec::with_capacity(nnz);
        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut diag_idx = Vec::with_capacity(n);
        row_ptr.push(0);
        for (i, row) in rows.iter().enumerate() {
            for (&j, &w) in row {
                if j == i {
                    diag_idx.push(values.len());
                }
                col_indices.push(j);
                values.push(w);
            }
            row_ptr.push(values.len());
        }
        let row_weights = row_sums(n, &values, &row_ptr);
        Ok(Self {
            n,
            values,
            col_indices,
            row_ptr,
            diag_idx,
            row_weights,
        })
    }

    /// Build from raw CSR arrays (e.g. a deserialized graph).
    ///
    /// Rejects unsorted or duplicated column indices, missing diagonal
    /// entries, and negative or non-finite values.
    pub fn from_csr(values: Vec<f64>, col_indices: Vec<usize>, row_ptr: Vec<usize>) -> Result<Self> {
        if row_ptr.is_empty() {
            return Err(Error::InvalidParameter(
                "row_ptr must have length node_count + 1".to_string(),
            ));
        }
        let n = row_ptr.len() - 1;
        if values.len() != col_indices.len() {
            return Err(Error::InvalidParameter(format!(
                "values/col_indices length mismatch ({} vs {})",
                values.len(),
                col_indices.len()
            )));
        }
        if row_ptr[0] != 0 || row_ptr[n] != values.len() {
            return Err(Error::InvalidParameter(
                "row_ptr must start at 0 and end at nnz".to_string(),
            ));
        }
        let mut diag_idx = Vec::with_capacity(n);
        for i in 0..n {
            let (start, end) = (row_ptr[i], row_ptr[i + 1]);
            if end < start || end > values.len() {
                return Err(Error::InvalidParameter(format!(
                    "row_ptr is not monotone at row {i}"
                )));
            }
            let mut diag = None;
            let mut prev: Option<usize> = None;
            for k in start..end {
                let j = col_indices[k];
                if j >= n {
                    return Err(Error::InvalidParameter(format!(
                        "column index {j} out of range in row {i}"
                    )));
                }
                if let Some(p) = prev {
                    if j <= p {
                        return Err(Error::InvalidParameter(format!(
                            "column indices must be sorted and unique in row {i}"
                        )));
                    }
                }
                prev = Some(j);
                if !values[k].is_finite() || values[k] < 0.0 {
                    return Err(Error::InvalidParameter(format!(
                        "entry ({i}, {j}) must be finite and non-negative"
                    )));
                }
                if j == i {
                    diag = Some(k);
                }
            }
            match diag {
                Some(k) => diag_idx.push(k),
                None => {
                    return Err(Error::InvalidParameter(format!(
                        "row {i} is missing a stored diagonal entry"
                    )))
                }
            }
        }
        let row_weights = row_sums(n, &values, &row_ptr);
        Ok(Self {
            n,
            values,
            col_indices,
            row_ptr,
            diag_idx,
            row_weights,
        })
    }

    /// Replace the default row-sum normalization weights.
    ///
    /// A zero weight must only be used for an all-zero row; `normalize_rows`
    /// leaves such rows untouched rather than dividing by zero.
    pub fn with_row_weights(mut self, row_weights: Vec<f64>) -> Result<Self> {
        if row_weights.len() != self.n {
            return Err(Error::InvalidParameter(format!(
                "row_weights length must equal node_count (len={} node_count={})",
                row_weights.len(),
                self.n
            )));
        }
        for (i, &w) in row_weights.iter().enumerate() {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::InvalidParameter(format!(
                    "row_weights[{i}] must be finite and non-negative"
                )));
            }
        }
        self.row_weights = row_weights;
        Ok(self)
    }

    pub fn node_count(&self) -> usize {
        self.n
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    pub fn row_weights(&self) -> &[f64] {
        &self.row_weights
    }

    pub fn row_range(&self, i: usize) -> std::ops::Range<usize> {
        self.row_ptr[i]..self.row_ptr[i + 1]
    }

    pub(crate) fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub(crate) fn diag_indices(&self) -> &[usize] {
        &self.diag_idx
    }

    /// Row `i` expanded to a dense vector.
    pub fn dense_row(&self, i: usize) -> Vec<f64> {
        let mut row = vec![0.0; self.n];
        for k in self.row_range(i) {
            row[self.col_indices[k]] = self.values[k];
        }
        row
    }

    /// Per-entry damping factors: for a stored entry `(i, j)` the factor is
    /// `out(i) * in(j)`, where the maps override the uniform factors for
    /// individual nodes. Forcing an override to `0.0` excludes the node from
    /// flow entirely (an *antisink*); `1.0` exempts it from damping.
    pub fn damping_mask(
        &self,
        out_factor: f64,
        out_overrides: &BTreeMap<usize, f64>,
        in_factor: f64,
        in_overrides: &BTreeMap<usize, f64>,
    ) -> Vec<f64> {
        let mut mask = vec![0.0; self.values.len()];
        for i in 0..self.n {
            let out = out_overrides.get(&i).copied().unwrap_or(out_factor);
            for k in self.row_range(i) {
                let j = self.col_indices[k];
                let inward = in_overrides.get(&j).copied().unwrap_or(in_factor);
                mask[k] = out * inward;
            }
        }
        mask
    }

    /// Divide each row by its normalization weight, in place, turning the
    /// adjacency into a (sub)stochastic transition matrix. Rows with zero
    /// weight stay all-zero.
    pub fn normalize_rows(&mut self) {
        for i in 0..self.n {
            let w = self.row_weights[i];
            if w > 0.0 {
                for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                    self.values[k] /= w;
                }
            }
        }
    }

    /// Build from a petgraph directed graph with `f64` edge weights, using
    /// `NodeIndex::index()` as the node id.
    #[cfg(feature = "petgraph")]
    pub fn from_petgraph<N>(graph: &petgraph::graph::DiGraph<N, f64>) -> Result<Self> {
        use petgraph::visit::EdgeRef;
        let edges: Vec<(usize, usize, f64)> = graph
            .edge_references()
            .map(|e| (e.source().index(), e.target().index(), *e.weight()))
            .collect();
        Self::from_edges(graph.node_count(), &edges)
    }
}

fn row_sums(n: usize, values: &[f64], row_ptr: &[usize]) -> Vec<f64> {
    (0..n)
        .map(|i| values[row_ptr[i]..row_ptr[i + 1]].iter().sum())
        .collect()
}
