//! Emitting-mode analysis: expected visits downstream of source nodes.
//!
//! `H[i, j]` is the expected number of visits to node `i` by flow emitted
//! from source `j` before dissipation, with `H[s, s] = 1` by convention and
//! other source rows zeroed (flow re-entering a source is reabsorbed).

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::adjacency::CsrAdjacency;
use crate::fullgraph::FullGraphLaplacian;
use crate::laplacian::{BoundaryLaplacian, LaplacianSolver, Orientation};
use crate::newton::{
    rootfind_newton, CalibrationRun, DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE,
};
use crate::{dot, Error, Result};

/// A fixed factor very close to 1 leaves almost no dissipation and the
/// transient solve becomes numerically meaningless; calibrated runs landing
/// here are rejected the same way.
const DF_UPPER_GUARD: f64 = 1.0 - 1e-3;

/// Trial damping for the calibration mask template; the template is rescaled
/// by `x / max(template)` per trial, so the starting value only fixes the
/// relative strength of per-node overrides.
const TEMPLATE_DF: f64 = 0.85;

/// Damping policy for emitting mode: exactly one of a fixed factor or a
/// target average path length.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EmittingDamping {
    /// Uniform damping factor in `(0, 1 - 1e-3]`.
    Fixed(f64),
    /// Calibrate the factor so the average path length from the sources
    /// reaches this value (at least 1; clamped to the node count above).
    TargetPathLength(f64),
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EmittingConfig {
    /// Source node indices (the emitting boundary).
    pub sources: Vec<usize>,
    pub damping: EmittingDamping,
    /// Per-node out-damping overrides; `0.0` makes a node an antisink
    /// (excluded from flow entirely).
    pub antisinks: BTreeMap<usize, f64>,
}

impl EmittingConfig {
    pub fn new(sources: Vec<usize>, damping: EmittingDamping) -> Self {
        Self {
            sources,
            damping,
            antisinks: BTreeMap::new(),
        }
    }

    pub fn validate(&self, node_count: usize) -> Result<()> {
        validate_boundary("source", &self.sources, node_count)?;
        validate_antisinks(&self.antisinks, node_count)?;
        match self.damping {
            EmittingDamping::Fixed(df) => {
                if !df.is_finite() || df <= 0.0 || df > 1.0 {
                    return Err(Error::InvalidDamping(format!(
                        "fixed factor {df} must lie in (0, 1]"
                    )));
                }
                if df > DF_UPPER_GUARD {
                    return Err(Error::NumericalInstability(df));
                }
            }
            EmittingDamping::TargetPathLength(da) => {
                if !da.is_finite() || da < 1.0 {
                    return Err(Error::TargetOutOfBounds {
                        target: da,
                        lower: 1.0,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EmittingResult {
    /// `node_count × |sources|` visit matrix.
    pub h: DMatrix<f64>,
    /// The damping factor used (given or calibrated).
    pub damping: f64,
    /// Present when the factor was calibrated.
    pub calibration: Option<CalibrationRun>,
    /// Antisink nodes with a zero override, excluded from flow.
    pub excluded_nodes: Vec<usize>,
}

/// Run an emitting analysis, consuming the adjacency matrix.
pub fn emitting_analysis(adj: CsrAdjacency, config: &EmittingConfig) -> Result<EmittingResult> {
    config.validate(adj.node_count())?;
    let excluded_nodes = excluded_from(&config.antisinks);

    match config.damping {
        EmittingDamping::Fixed(df) => {
            let mask = adj.damping_mask(df, &config.antisinks, 1.0, &BTreeMap::new());
            let mut spl = BoundaryLaplacian::new(adj, &mask, &config.sources, &[])?;
            let h = evaluate_emitting(&mut spl, &config.sources)?;
            Ok(EmittingResult {
                h,
                damping: df,
                calibration: None,
                excluded_nodes,
            })
        }
        EmittingDamping::TargetPathLength(da) => {
            // a path cannot revisit more distinct steps than there are nodes
            let target = da.min(adj.node_count() as f64);
            let (run, mut spl) = calibrate(&adj, &config.sources, &config.antisinks, target)?;
            if run.damping > DF_UPPER_GUARD {
                return Err(Error::NumericalInstability(run.damping));
            }
            let h = evaluate_emitting(&mut spl, &config.sources)?;
            Ok(EmittingResult {
                h,
                damping: run.damping,
                calibration: Some(run),
                excluded_nodes,
            })
        }
    }
}

/// Emitting evaluation against a shared full-graph factorization: installs
/// the sources as the boundary and computes `H` without refactorizing.
pub fn emitting_with_laplacian(
    spl: &mut FullGraphLaplacian,
    sources: &[usize],
) -> Result<DMatrix<f64>> {
    validate_boundary("source", sources, spl.node_count())?;
    spl.set_boundary(sources)?;
    evaluate_emitting(spl, sources)
}

/// Solve one visit column per source: `Lᵀ h = pᵀ_s` with `p_s` the source's
/// pre-extraction transition row, then apply the boundary conventions.
pub(crate) fn evaluate_emitting<S: LaplacianSolver>(
    spl: &mut S,
    sources: &[usize],
) -> Result<DMatrix<f64>> {
    let n = spl.node_count();
    let mut h = DMatrix::<f64>::zeros(n, sources.len());
    for (j, &s) in sources.iter().enumerate() {
        let rhs = spl.boundary_row(s)?;
        let x = spl.solve(&rhs, Orientation::Left)?;
        for i in 0..n {
            h[(i, j)] = x[i];
        }
        for &t in sources {
            h[(t, j)] = 0.0;
        }
        h[(s, j)] = 1.0;
    }
    Ok(h)
}

/// Calibrate the damping factor to hit `target` average path length.
///
/// Each trial rebuilds the Laplacian at the rescaled mask and measures the
/// average path length `Σ P_S·G·1 / |S|` via one extra solve; its damping
/// derivative comes from a second solve against the same factorization.
fn calibrate(
    adj: &CsrAdjacency,
    sources: &[usize],
    antisinks: &BTreeMap<usize, f64>,
    target: f64,
) -> Result<(CalibrationRun, BoundaryLaplacian)> {
    let template = adj.damping_mask(TEMPLATE_DF, antisinks, 1.0, &BTreeMap::new());
    let template_max = mask_max(&template)?;
    let n = adj.node_count();
    let m = sources.len() as f64;

    let outcome = rootfind_newton(
        |x0| {
            let scale = x0 / template_max;
            let mask: Vec<f64> = template.iter().map(|t| t * scale).collect();
            let mut spl = BoundaryLaplacian::new(adj.clone(), &mask, sources, &[])?;

            let mut v = vec![1.0; n];
            for &s in sources {
                v[s] = 0.0;
            }
            let g_row_sum = spl.solve(&v, Orientation::Right)?;
            let gsq_row_sum = spl.solve(&g_row_sum, Orientation::Right)?;

            let mut h_sum = 0.0;
            let mut hg_sum = 0.0;
            for &s in sources {
                let row = spl.boundary_row(s)?;
                h_sum += dot(&row, &g_row_sum);
                hg_sum += dot(&row, &gsq_row_sum);
            }
            Ok((h_sum / m - target, hg_sum / m / x0, spl))
        },
        0.8,
        0.0,
        1.0,
        DEFAULT_MAX_ITERATIONS,
        DEFAULT_TOLERANCE,
    )?;

    Ok((outcome.run, outcome.state))
}

pub(crate) fn validate_boundary(kind: &str, indices: &[usize], node_count: usize) -> Result<()> {
    if indices.is_empty() {
        return Err(Error::InvalidParameter(format!(
            "at least one {kind} node is required"
        )));
    }
    let mut seen = vec![false; node_count];
    for &i in indices {
        if i >= node_count {
            return Err(Error::InvalidParameter(format!(
                "{kind} index {i} out of range for {node_count} nodes"
            )));
        }
        if seen[i] {
            return Err(Error::InvalidParameter(format!(
                "duplicate {kind} index {i}"
            )));
        }
        seen[i] = true;
    }
    Ok(())
}

pub(crate) fn validate_antisinks(
    antisinks: &BTreeMap<usize, f64>,
    node_count: usize,
) -> Result<()> {
    for (&i, &a) in antisinks {
        if i >= node_count {
            return Err(Error::InvalidParameter(format!(
                "antisink index {i} out of range for {node_count} nodes"
            )));
        }
        if !a.is_finite() || !(0.0..=1.0).contains(&a) {
            return Err(Error::InvalidParameter(format!(
                "antisink factor for node {i} must lie in [0, 1]"
            )));
        }
    }
    Ok(())
}

pub(crate) fn excluded_from(antisinks: &BTreeMap<usize, f64>) -> Vec<usize> {
    antisinks
        .iter()
        .filter(|&(_, &a)| a == 0.0)
        .map(|(&i, _)| i)
        .collect()
}

pub(crate) fn mask_max(mask: &[f64]) -> Result<f64> {
    let max = mask.iter().fold(0.0_f64, |m, &v| m.max(v));
    if max <= 0.0 {
        return Err(Error::InvalidDamping(
            "damping overrides leave no edge alive".to_string(),
        ));
    }
    Ok(max)
}
