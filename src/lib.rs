//! `flowprobe`: boundary Green's-function analysis on weighted directed graphs.
//!
//! Models information flow as a damped Markov chain: probability mass injected
//! at *source* nodes diffuses along edges, dissipates according to a damping
//! factor, and is absorbed at *sink* nodes. The crate computes the
//! Green's-function quantities describing that process — the expected visit
//! matrix `H` (emitting mode), the absorption matrix `F` (absorbing mode), or
//! both coupled through the source/sink boundary (normalized-channel mode).
//!
//! Public invariants (must not drift):
//! - **Node order**: all outputs are indexed by node id `0..n-1` consistent
//!   with the input adjacency matrix; row `i`, column `j` of a result matrix
//!   means "quantity for node `i` relative to boundary entity `j`".
//! - **Self-certainty**: every boundary node reports `1.0` against itself
//!   (`F[k,k] = 1`, `H[s,s] = 1`), even when a node is simultaneously a
//!   source and a sink.
//! - **Determinism**: identical inputs and configurations produce identical
//!   outputs; nothing in the solver is randomized.
//!
//! Swappable (allowed to change without breaking the contract):
//! - the sparse factorization strategy (so long as "factorize once, reuse
//!   for every solve" holds)
//! - Newton iteration internals (so long as the returned damping factor stays
//!   inside `[0, 1]` and non-convergence is surfaced via the run record)

pub mod absorbing;
pub mod adjacency;
pub mod channel;
mod connectivity;
pub mod emitting;
mod factor;
pub mod fullgraph;
pub mod laplacian;
pub mod newton;

pub use absorbing::{
    absorbing_analysis, absorbing_with_laplacian, AbsorbingConfig, AbsorbingDamping,
    AbsorbingResult,
};
pub use adjacency::CsrAdjacency;
pub use channel::{
    channel_analysis, channel_with_laplacian, ChannelConfig, ChannelDamping, ChannelResult,
};
pub use emitting::{
    emitting_analysis, emitting_with_laplacian, EmittingConfig, EmittingDamping, EmittingResult,
};
pub use fullgraph::FullGraphLaplacian;
pub use laplacian::{BoundaryLaplacian, LaplacianSolver, Orientation};
pub use newton::CalibrationRun;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid damping specification: {0}")]
    InvalidDamping(String),
    #[error("Laplacian is singular (zero pivot at node {index})")]
    SingularMatrix { index: usize },
    #[error("boundary block is singular; boundary nodes are mutually unreachable")]
    SingularBlock,
    #[error("node {0} is not a registered boundary row/column")]
    UnknownBoundaryIndex(usize),
    #[error("no boundary has been set on this full-graph Laplacian")]
    BoundaryNotSet,
    #[error("no source is connected to any sink")]
    UnreachableBoundary,
    #[error("damping factor {0} is too close to 1; solution is numerically unstable")]
    NumericalInstability(f64),
    #[error("target statistic {target} is below the reachable lower bound {lower}")]
    TargetOutOfBounds { target: f64, lower: f64 },
    #[error("absorption probability {0} must lie in [0, 1]")]
    OutOfRange(f64),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
