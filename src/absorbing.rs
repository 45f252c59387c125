//! Absorbing-mode analysis: where does flow from each node end up?
//!
//! `F[i, k]` is the probability that flow starting at transient node `i` is
//! eventually absorbed at sink `k`, with `F[k, k] = 1` for each sink and
//! zero elsewhere on sink rows. Undamped runs (`df = 1`) are the classical
//! absorbing-chain setup; nodes with no path to any sink would make the
//! transient block singular there, so they are located with a near-undamped
//! probe solve and removed from the chain first.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::adjacency::CsrAdjacency;
use crate::connectivity::mask_out_nodes;
use crate::emitting::{excluded_from, mask_max, validate_antisinks, validate_boundary};
use crate::fullgraph::FullGraphLaplacian;
use crate::laplacian::{BoundaryLaplacian, LaplacianSolver, Orientation};
use crate::newton::{
    rootfind_newton, CalibrationRun, DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE,
};
use crate::{dot, Error, Result};

/// Damping factor of the disconnection probe: close enough to 1 that any
/// connected node retains measurable absorbed mass, far enough that the
/// factorization never degenerates.
const PROBE_DF: f64 = 0.9999;

/// Absorbed mass below this marks a node as unable to reach any sink.
const PROBE_EPSILON: f64 = 1e-16;

/// A fixed factor this close to 1 is treated as undamped and triggers the
/// disconnection probe.
const UNDAMPED_MARGIN: f64 = 1e-14;

/// Trial damping for the calibration mask template.
const TEMPLATE_DF: f64 = 0.99;

/// Damping policy for absorbing mode.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AbsorbingDamping {
    /// Uniform damping factor in `(0, 1]`; `1.0` runs the chain undamped.
    Fixed(f64),
    /// Calibrate the factor so the absorption probability, averaged over the
    /// connected transient nodes, reaches this value in `[0, 1]`.
    TargetAbsorption(f64),
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AbsorbingConfig {
    /// Sink node indices (the absorbing boundary).
    pub sinks: Vec<usize>,
    pub damping: AbsorbingDamping,
    /// Per-node out-damping overrides; `0.0` makes a node an antisink.
    pub antisinks: BTreeMap<usize, f64>,
}

impl AbsorbingConfig {
    pub fn new(sinks: Vec<usize>, damping: AbsorbingDamping) -> Self {
        Self {
            sinks,
            damping,
            antisinks: BTreeMap::new(),
        }
    }

    pub fn validate(&self, node_count: usize) -> Result<()> {
        validate_boundary("sink", &self.sinks, node_count)?;
        validate_antisinks(&self.antisinks, node_count)?;
        match self.damping {
            AbsorbingDamping::Fixed(df) => {
                if !df.is_finite() || df <= 0.0 || df > 1.0 {
                    return Err(Error::InvalidDamping(format!(
                        "fixed factor {df} must lie in (0, 1]"
                    )));
                }
            }
            AbsorbingDamping::TargetAbsorption(ap) => {
                if !ap.is_finite() || !(0.0..=1.0).contains(&ap) {
                    return Err(Error::OutOfRange(ap));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AbsorbingResult {
    /// `node_count × |sinks|` absorption-probability matrix.
    pub f: DMatrix<f64>,
    pub damping: f64,
    pub calibration: Option<CalibrationRun>,
    /// Antisink nodes with a zero override.
    pub excluded_nodes: Vec<usize>,
    /// Transient nodes the probe found unable to reach any sink; empty when
    /// the probe did not run (damped fixed factor).
    pub disconnected: Vec<usize>,
    /// Number of connected transient nodes, when the probe ran.
    pub connected_count: Option<usize>,
}

/// Run an absorbing analysis, consuming the adjacency matrix.
pub fn absorbing_analysis(adj: CsrAdjacency, config: &AbsorbingConfig) -> Result<AbsorbingResult> {
    config.validate(adj.node_count())?;
    let excluded_nodes = excluded_from(&config.antisinks);

    match config.damping {
        AbsorbingDamping::Fixed(df) => {
            let mut mask = adj.damping_mask(df, &config.antisinks, 1.0, &BTreeMap::new());
            let mut disconnected = Vec::new();
            let mut connected_count = None;
            if df > 1.0 - UNDAMPED_MARGIN {
                disconnected = disconnected_indices(&adj, &config.antisinks, &config.sinks)?;
                mask_out_nodes(&adj, &mut mask, &disconnected);
                connected_count = Some(transient_count(
                    adj.node_count(),
                    &config.sinks,
                    &disconnected,
                )?);
            }
            let mut spl = BoundaryLaplacian::new(adj, &mask, &[], &config.sinks)?;
            let f = evaluate_absorbing(&mut spl, &config.sinks)?;
            Ok(AbsorbingResult {
                f,
                damping: df,
                calibration: None,
                excluded_nodes,
                disconnected,
                connected_count,
            })
        }
        AbsorbingDamping::TargetAbsorption(ap) => {
            let disconnected = disconnected_indices(&adj, &config.antisinks, &config.sinks)?;
            let n_transient =
                transient_count(adj.node_count(), &config.sinks, &disconnected)?;
            let (run, mut spl) = calibrate(
                &adj,
                &config.sinks,
                &config.antisinks,
                &disconnected,
                n_transient,
                ap,
            )?;
            let f = evaluate_absorbing(&mut spl, &config.sinks)?;
            Ok(AbsorbingResult {
                f,
                damping: run.damping,
                calibration: Some(run),
                excluded_nodes,
                disconnected,
                connected_count: Some(n_transient),
            })
        }
    }
}

/// Absorbing evaluation against a shared full-graph factorization: installs
/// the sinks as the boundary and computes `F` without refactorizing. The
/// full-graph Laplacian is always damped, so no disconnection probe runs.
pub fn absorbing_with_laplacian(
    spl: &mut FullGraphLaplacian,
    sinks: &[usize],
) -> Result<DMatrix<f64>> {
    validate_boundary("sink", sinks, spl.node_count())?;
    spl.set_boundary(sinks)?;
    evaluate_absorbing(spl, sinks)
}

/// Solve one absorption column per sink: `L f = p_k` with `p_k` the sink's
/// pre-extraction transition column, then apply the boundary conventions.
/// Sink rows are cleared before the `F[k, k] = 1` diagonal is set, in that
/// order, so overlapping conventions cannot erase the self-certainty entry.
pub(crate) fn evaluate_absorbing<S: LaplacianSolver>(
    spl: &mut S,
    sinks: &[usize],
) -> Result<DMatrix<f64>> {
    let n = spl.node_count();
    let mut f = DMatrix::<f64>::zeros(n, sinks.len());
    for (c, &k) in sinks.iter().enumerate() {
        let rhs = spl.boundary_col(k)?;
        let x = spl.solve(&rhs, Orientation::Right)?;
        for i in 0..n {
            f[(i, c)] = x[i];
        }
        for &t in sinks {
            f[(t, c)] = 0.0;
        }
        f[(k, c)] = 1.0;
    }
    Ok(f)
}

/// Locate transient nodes whose absorbed mass is numerically zero under a
/// near-undamped solve. Sinks are never reported (their rows are zeroed by
/// the boundary extraction, not disconnected).
fn disconnected_indices(
    adj: &CsrAdjacency,
    antisinks: &BTreeMap<usize, f64>,
    sinks: &[usize],
) -> Result<Vec<usize>> {
    let mask = adj.damping_mask(PROBE_DF, antisinks, 1.0, &BTreeMap::new());
    let mut spl = BoundaryLaplacian::new(adj.clone(), &mask, &[], sinks)?;
    let n = adj.node_count();
    // total absorbed mass per node needs only the summed sink columns, so
    // one solve covers every sink at once
    let rhs = spl.boundary_col_sum();
    let absorbed = spl.solve(&rhs, Orientation::Right)?;
    let mut is_sink = vec![false; n];
    for &k in sinks {
        is_sink[k] = true;
    }
    Ok((0..n)
        .filter(|&i| !is_sink[i] && absorbed[i] < PROBE_EPSILON)
        .collect())
}

fn transient_count(node_count: usize, sinks: &[usize], disconnected: &[usize]) -> Result<usize> {
    let connected = node_count - sinks.len() - disconnected.len();
    if connected == 0 {
        return Err(Error::UnreachableBoundary);
    }
    Ok(connected)
}

/// Calibrate the damping factor so the average absorption probability over
/// the connected transient nodes hits `target`.
///
/// The column sums of `F = G·P_K` come from two adjoint solves:
/// `g = Gᵀ·1` gives `Σ_i F[i, k] = g·p_k`, and `gg = Gᵀ·g` gives the damping
/// derivative `d(ΣF)/dx = (gg·p_k) / x`.
fn calibrate(
    adj: &CsrAdjacency,
    sinks: &[usize],
    antisinks: &BTreeMap<usize, f64>,
    disconnected: &[usize],
    n_transient: usize,
    target: f64,
) -> Result<(CalibrationRun, BoundaryLaplacian)> {
    let mut template = adj.damping_mask(TEMPLATE_DF, antisinks, 1.0, &BTreeMap::new());
    mask_out_nodes(adj, &mut template, disconnected);
    let template_max = mask_max(&template)?;
    let n = adj.node_count();
    let nt = n_transient as f64;

    let mut live = vec![1.0; n];
    for &k in sinks {
        live[k] = 0.0;
    }
    for &i in disconnected {
        live[i] = 0.0;
    }

    let outcome = rootfind_newton(
        |x0| {
            let scale = x0 / template_max;
            let mask: Vec<f64> = template.iter().map(|t| t * scale).collect();
            let mut spl = BoundaryLaplacian::new(adj.clone(), &mask, &[], sinks)?;

            let g = spl.solve(&live, Orientation::Left)?;
            let gg = spl.solve(&g, Orientation::Left)?;

            let mut f_sum = 0.0;
            let mut gf_sum = 0.0;
            for &k in sinks {
                let col = spl.boundary_col(k)?;
                f_sum += dot(&g, &col);
                gf_sum += dot(&gg, &col);
            }
            Ok((f_sum / nt - target, gf_sum / nt / x0, spl))
        },
        0.85,
        0.0,
        1.0,
        DEFAULT_MAX_ITERATIONS,
        DEFAULT_TOLERANCE,
    )?;

    Ok((outcome.run, outcome.state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cycle4() -> CsrAdjacency {
        CsrAdjacency::from_edges(4, &[(0, 1, 1.0), (1, 2, 1.0), (2, 3, 1.0), (3, 0, 1.0)])
            .unwrap()
    }

    #[test]
    fn damped_cycle_absorbs_by_distance_to_the_sink() {
        let adj = cycle4();
        let config = AbsorbingConfig::new(vec![2], AbsorbingDamping::Fixed(0.5));
        let res = absorbing_analysis(adj, &config).unwrap();
        assert_eq!(res.f[(2, 0)], 1.0);
        assert_relative_eq!(res.f[(1, 0)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(res.f[(0, 0)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(res.f[(3, 0)], 0.125, epsilon = 1e-12);
        // damped flow dissipates, so transient rows stay strictly inside (0, 1)
        for i in [0usize, 1, 3] {
            assert!(res.f[(i, 0)] > 0.0 && res.f[(i, 0)] < 1.0);
        }
        assert!(res.disconnected.is_empty());
        assert!(res.connected_count.is_none());
    }

    #[test]
    fn undamped_chain_absorbs_everything() {
        let adj =
            CsrAdjacency::from_edges(3, &[(0, 1, 1.0), (1, 2, 1.0)]).unwrap();
        let config = AbsorbingConfig::new(vec![2], AbsorbingDamping::Fixed(1.0));
        let res = absorbing_analysis(adj, &config).unwrap();
        assert_relative_eq!(res.f[(0, 0)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(res.f[(1, 0)], 1.0, epsilon = 1e-10);
        assert_eq!(res.connected_count, Some(2));
    }

    #[test]
    fn undamped_run_masks_out_nodes_that_cannot_reach_a_sink() {
        // 0 -> 1 -> 2 (sink), plus an isolated 2-cycle 3 <-> 4 that would
        // leave the undamped transient block singular
        let adj = CsrAdjacency::from_edges(
            5,
            &[(0, 1, 1.0), (1, 2, 1.0), (3, 4, 1.0), (4, 3, 1.0)],
        )
        .unwrap();
        let config = AbsorbingConfig::new(vec![2], AbsorbingDamping::Fixed(1.0));
        let res = absorbing_analysis(adj, &config).unwrap();
        assert_eq!(res.disconnected, vec![3, 4]);
        assert_eq!(res.connected_count, Some(2));
        assert_relative_eq!(res.f[(0, 0)], 1.0, epsilon = 1e-10);
        assert_eq!(res.f[(3, 0)], 0.0);
        assert_eq!(res.f[(4, 0)], 0.0);
    }

    #[test]
    fn calibration_hits_the_average_absorption_target() {
        let adj = cycle4();
        let config = AbsorbingConfig::new(vec![2], AbsorbingDamping::TargetAbsorption(0.5));
        let res = absorbing_analysis(adj, &config).unwrap();
        let run = res.calibration.unwrap();
        assert!(run.converged);
        assert!(res.damping > 0.0 && res.damping < 1.0);
        // (df + df^2 + df^3) / 3 == 0.5 at the calibrated factor
        let df = res.damping;
        assert_relative_eq!((df + df * df + df * df * df) / 3.0, 0.5, epsilon = 1e-8);
        let mean = (res.f[(0, 0)] + res.f[(1, 0)] + res.f[(3, 0)]) / 3.0;
        assert_relative_eq!(mean, 0.5, epsilon = 1e-8);
        assert_eq!(res.connected_count, Some(3));
    }

    #[test]
    fn absorption_target_outside_the_unit_interval_is_rejected() {
        let adj = cycle4();
        let config = AbsorbingConfig::new(vec![2], AbsorbingDamping::TargetAbsorption(1.5));
        let err = absorbing_analysis(adj, &config).unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
    }

    #[test]
    fn shared_laplacian_agrees_with_a_dedicated_one() {
        let adj = CsrAdjacency::from_edges(
            4,
            &[
                (0, 1, 1.0),
                (0, 2, 2.0),
                (1, 2, 1.0),
                (1, 3, 1.0),
                (2, 3, 1.0),
                (3, 0, 1.0),
            ],
        )
        .unwrap();
        let mask = adj.damping_mask(0.7, &BTreeMap::new(), 1.0, &BTreeMap::new());

        let mut fgl = FullGraphLaplacian::new(adj.clone(), &mask).unwrap();
        let shared = absorbing_with_laplacian(&mut fgl, &[3]).unwrap();

        let config = AbsorbingConfig::new(vec![3], AbsorbingDamping::Fixed(0.7));
        let direct = absorbing_analysis(adj, &config).unwrap();

        for i in 0..4 {
            assert_relative_eq!(shared[(i, 0)], direct.f[(i, 0)], epsilon = 1e-10);
        }
    }
}
