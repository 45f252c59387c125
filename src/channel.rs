//! Normalized-channel analysis: flow constrained to travel from sources to
//! sinks.
//!
//! Both boundary sets are extracted from the Laplacian at once. `F[i, k]` is
//! the probability that flow through transient node `i` is absorbed at sink
//! `k`; `H[i, s]` the expected visits to `i` by flow emitted at source `s`.
//! Source rows of `F` and sink rows of `H` carry the source-to-sink coupling
//! `G_SK[s, k] = p_s·F[:, k] + p_s[k]`, which accounts for flow crossing the
//! boundary directly. Self-certainty entries (`F[k, k]`, `H[s, s]`) are
//! written after the coupling values, so a node acting as both source and
//! sink still reports 1 for itself.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::adjacency::CsrAdjacency;
use crate::connectivity::{channel_precheck, mask_out_nodes};
use crate::emitting::{excluded_from, mask_max, validate_antisinks, validate_boundary};
use crate::fullgraph::FullGraphLaplacian;
use crate::laplacian::{BoundaryLaplacian, LaplacianSolver, Orientation};
use crate::newton::{
    rootfind_newton, CalibrationRun, DEFAULT_MAX_ITERATIONS, DEFAULT_TOLERANCE,
};
use crate::{dot, Error, Result};

/// Below this the transition matrix is numerically zero and the channel
/// degenerates.
const DF_LOWER_GUARD: f64 = 1e-14;

/// A fixed factor this close to 1 is treated as undamped: the off-transit
/// region must then be masked out or the transient block is singular.
const UNDAMPED_MARGIN: f64 = 1e-14;

/// Trial damping for the calibration mask template.
const TEMPLATE_DF: f64 = 0.85;

/// Damping policy for channel mode. Calibrated variants target the average
/// source-to-sink path length, expressed as a deviation above the
/// shortest-path lower bound measured on the masked graph.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelDamping {
    /// Uniform damping factor in `[1e-14, 1]`.
    Fixed(f64),
    /// Target path length = shortest-path bound + this many hops.
    AbsoluteDeviation(f64),
    /// Target path length = shortest-path bound × (1 + this fraction).
    RelativeDeviation(f64),
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelConfig {
    pub sources: Vec<usize>,
    pub sinks: Vec<usize>,
    pub damping: ChannelDamping,
    /// Per-node out-damping overrides; `0.0` makes a node an antisink.
    pub antisinks: BTreeMap<usize, f64>,
}

impl ChannelConfig {
    pub fn new(sources: Vec<usize>, sinks: Vec<usize>, damping: ChannelDamping) -> Self {
        Self {
            sources,
            sinks,
            damping,
            antisinks: BTreeMap::new(),
        }
    }

    pub fn validate(&self, node_count: usize) -> Result<()> {
        validate_boundary("source", &self.sources, node_count)?;
        validate_boundary("sink", &self.sinks, node_count)?;
        validate_antisinks(&self.antisinks, node_count)?;
        match self.damping {
            ChannelDamping::Fixed(df) => {
                if !df.is_finite() || df > 1.0 {
                    return Err(Error::InvalidDamping(format!(
                        "fixed factor {df} must lie in [{DF_LOWER_GUARD}, 1]"
                    )));
                }
                if df < DF_LOWER_GUARD {
                    return Err(Error::InvalidDamping(format!(
                        "fixed factor {df} is too close to 0"
                    )));
                }
            }
            ChannelDamping::AbsoluteDeviation(d) | ChannelDamping::RelativeDeviation(d) => {
                if !d.is_finite() {
                    return Err(Error::InvalidDamping(format!(
                        "path-length deviation {d} must be finite"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ChannelResult {
    /// `node_count × |sinks|` absorption matrix.
    pub f: DMatrix<f64>,
    /// `node_count × |sources|` visit matrix.
    pub h: DMatrix<f64>,
    pub damping: f64,
    pub calibration: Option<CalibrationRun>,
    /// Antisink nodes with a zero override.
    pub excluded_nodes: Vec<usize>,
    /// Nodes outside the source-to-sink transit region.
    pub disconnected: Vec<usize>,
    /// Average over sources of the shortest masked-graph hop count to the
    /// nearest sink; the lower bound for calibrated path-length targets.
    pub avg_shortest_path: f64,
}

/// Run a normalized-channel analysis, consuming the adjacency matrix.
///
/// The connectivity pre-check always runs before any Laplacian is built:
/// a source that cannot reach any sink fails with
/// [`Error::UnreachableBoundary`] up front.
pub fn channel_analysis(adj: CsrAdjacency, config: &ChannelConfig) -> Result<ChannelResult> {
    config.validate(adj.node_count())?;
    let excluded_nodes = excluded_from(&config.antisinks);

    match config.damping {
        ChannelDamping::Fixed(df) => {
            let mut mask = adj.damping_mask(df, &config.antisinks, 1.0, &BTreeMap::new());
            let pre = channel_precheck(&adj, &mask, &config.sources, &config.sinks)?;
            if df > 1.0 - UNDAMPED_MARGIN {
                mask_out_nodes(&adj, &mut mask, &pre.disconnected);
            }
            let mut spl =
                BoundaryLaplacian::new(adj, &mask, &config.sources, &config.sinks)?;
            let (f, h) = evaluate_channel(&mut spl, &config.sources, &config.sinks)?;
            Ok(ChannelResult {
                f,
                h,
                damping: df,
                calibration: None,
                excluded_nodes,
                disconnected: pre.disconnected,
                avg_shortest_path: pre.avg_shortest_path,
            })
        }
        ChannelDamping::AbsoluteDeviation(d) | ChannelDamping::RelativeDeviation(d) => {
            let mut template =
                adj.damping_mask(TEMPLATE_DF, &config.antisinks, 1.0, &BTreeMap::new());
            let pre = channel_precheck(&adj, &template, &config.sources, &config.sinks)?;
            mask_out_nodes(&adj, &mut template, &pre.disconnected);

            let lower = pre.avg_shortest_path;
            let deviation = match config.damping {
                ChannelDamping::RelativeDeviation(_) => d * lower,
                _ => d,
            };
            let target = lower + deviation;
            if target < lower {
                return Err(Error::TargetOutOfBounds { target, lower });
            }

            let (run, mut spl) =
                calibrate(&adj, &config.sources, &config.sinks, &template, target)?;
            let (f, h) = evaluate_channel(&mut spl, &config.sources, &config.sinks)?;
            Ok(ChannelResult {
                f,
                h,
                damping: run.damping,
                calibration: Some(run),
                excluded_nodes,
                disconnected: pre.disconnected,
                avg_shortest_path: lower,
            })
        }
    }
}

/// Channel evaluation against a shared full-graph factorization: installs
/// sources and sinks together as the boundary and computes `(F, H)` without
/// refactorizing.
pub fn channel_with_laplacian(
    spl: &mut FullGraphLaplacian,
    sources: &[usize],
    sinks: &[usize],
) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
    validate_boundary("source", sources, spl.node_count())?;
    validate_boundary("sink", sinks, spl.node_count())?;
    let union: Vec<usize> = sinks.iter().chain(sources.iter()).copied().collect();
    spl.set_boundary(&union)?;
    evaluate_channel(spl, sources, sinks)
}

/// Core channel evaluation. Returns `(F, H)`.
pub(crate) fn evaluate_channel<S: LaplacianSolver>(
    spl: &mut S,
    sources: &[usize],
    sinks: &[usize],
) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
    let n = spl.node_count();
    let boundary: Vec<usize> = sources.iter().chain(sinks.iter()).copied().collect();

    let p_s: Vec<Vec<f64>> = sources
        .iter()
        .map(|&s| spl.boundary_row(s))
        .collect::<Result<_>>()?;

    // raw absorption columns with all boundary rows cleared, kept as plain
    // vectors until the coupling terms are known
    let mut f_cols: Vec<Vec<f64>> = Vec::with_capacity(sinks.len());
    for &k in sinks {
        let rhs = spl.boundary_col(k)?;
        let mut x = spl.solve(&rhs, Orientation::Right)?;
        for &b in &boundary {
            x[b] = 0.0;
        }
        f_cols.push(x);
    }

    let mut g_sk = DMatrix::<f64>::zeros(sources.len(), sinks.len());
    for (j, p) in p_s.iter().enumerate() {
        for (c, &k) in sinks.iter().enumerate() {
            g_sk[(j, c)] = dot(p, &f_cols[c]) + p[k];
        }
    }

    let mut f = DMatrix::<f64>::zeros(n, sinks.len());
    for (c, &k) in sinks.iter().enumerate() {
        for i in 0..n {
            f[(i, c)] = f_cols[c][i];
        }
        for (j, &s) in sources.iter().enumerate() {
            f[(s, c)] = g_sk[(j, c)];
        }
        // after the coupling insertion, so a source-and-sink node keeps
        // certainty of itself
        f[(k, c)] = 1.0;
    }

    let mut h = DMatrix::<f64>::zeros(n, sources.len());
    for (j, &s) in sources.iter().enumerate() {
        let x = spl.solve(&p_s[j], Orientation::Left)?;
        for i in 0..n {
            h[(i, j)] = x[i];
        }
        for &b in &boundary {
            h[(b, j)] = 0.0;
        }
        for (c, &k) in sinks.iter().enumerate() {
            h[(k, j)] = g_sk[(j, c)];
        }
        h[(s, j)] = 1.0;
    }

    Ok((f, h))
}

/// Calibrate the damping factor so the absorption-weighted average path
/// length over the channels hits `target`.
///
/// For source `s` and sink `k`, with `G` the transient Green's function and
/// `p` the boundary snapshots, the channel weight is `F_sk = p_s·G·p_k` and
/// the mean path length of that channel is `T_sk = 1 + p_s·G²·p_k / F_sk`.
/// Its damping derivative reuses a third adjoint power,
/// `dT_sk/dx = (T_sk - T_sk² + 2·p_s·G³·p_k / F_sk) / x`. Channels with
/// zero weight contribute nothing; a source whose channels all have zero
/// weight has no interior path to any sink and aborts the calibration.
fn calibrate(
    adj: &CsrAdjacency,
    sources: &[usize],
    sinks: &[usize],
    template: &[f64],
    target: f64,
) -> Result<(CalibrationRun, BoundaryLaplacian)> {
    let template_max = mask_max(template)?;
    let m = sources.len() as f64;

    let outcome = rootfind_newton(
        |x0| {
            let scale = x0 / template_max;
            let mask: Vec<f64> = template.iter().map(|t| t * scale).collect();
            let mut spl = BoundaryLaplacian::new(adj.clone(), &mask, sources, sinks)?;

            let mut f_cols = Vec::with_capacity(sinks.len());
            let mut gf_cols = Vec::with_capacity(sinks.len());
            let mut ggf_cols = Vec::with_capacity(sinks.len());
            for &k in sinks {
                let rhs = spl.boundary_col(k)?;
                let f_col = spl.solve(&rhs, Orientation::Right)?;
                let gf_col = spl.solve(&f_col, Orientation::Right)?;
                let ggf_col = spl.solve(&gf_col, Orientation::Right)?;
                f_cols.push(f_col);
                gf_cols.push(gf_col);
                ggf_cols.push(ggf_col);
            }

            let mut fval = 0.0;
            let mut fpval = 0.0;
            for &s in sources {
                let p = spl.boundary_row(s)?;
                let mut fs_total = 0.0;
                let mut ft_sum = 0.0;
                let mut fdt_sum = 0.0;
                for c in 0..sinks.len() {
                    let fs = dot(&p, &f_cols[c]);
                    if fs == 0.0 {
                        continue;
                    }
                    let hf = dot(&p, &gf_cols[c]);
                    let hgf = dot(&p, &ggf_cols[c]);
                    let ts = 1.0 + hf / fs;
                    let dts = (ts - ts * ts + 2.0 * hgf / fs) / x0;
                    fs_total += fs;
                    ft_sum += fs * ts;
                    fdt_sum += fs * dts;
                }
                if fs_total == 0.0 {
                    return Err(Error::UnreachableBoundary);
                }
                fval += ft_sum / fs_total;
                fpval += fdt_sum / fs_total;
            }
            Ok((fval / m - target, fpval / m, spl))
        },
        0.8,
        0.0,
        1.0,
        DEFAULT_MAX_ITERATIONS,
        DEFAULT_TOLERANCE,
    )?;

    Ok((outcome.run, outcome.state))
}
