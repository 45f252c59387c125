//! Bracketed Newton root finding for damping calibration.
//!
//! Each analysis mode can be asked to hit a target statistic (absorption
//! probability, average path length) instead of being given a damping factor
//! directly. The calibrator evaluates a mode-supplied function at trial
//! damping values; the function returns the signed deviation from the
//! target, its derivative with respect to the damping scale, and the solver
//! state built for the trial (so the final state is reused for the closing
//! evaluation instead of being rebuilt).
//!
//! The bracket `[a, b]` shrinks around the root on every evaluation and any
//! Newton step that escapes it is replaced by the bisection midpoint, so the
//! iteration converges even where the derivative estimate misbehaves.
//! Exhausting `max_iterations` is not an error: the last iterate is returned
//! with `converged` unset and the final residual recorded, and the caller
//! decides whether best-effort is acceptable.

use crate::{Error, Result};

pub const DEFAULT_MAX_ITERATIONS: usize = 50;
pub const DEFAULT_TOLERANCE: f64 = 1.0e-11;

/// Outcome record of one calibration. `damping` always lies inside the
/// initial bracket.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationRun {
    /// The calibrated damping factor.
    pub damping: f64,
    /// Signed deviation from the target at the last evaluated iterate.
    pub residual: f64,
    pub iterations: usize,
    /// False when `max_iterations` was exhausted; the run still carries the
    /// best available value.
    pub converged: bool,
}

#[derive(Debug)]
pub(crate) struct NewtonOutcome<S> {
    pub run: CalibrationRun,
    /// Solver state from the last evaluation.
    pub state: S,
}

/// Find a root of `func` inside `(a, b)` starting from `x0`.
///
/// `func(x)` returns `(value, derivative, state)`; errors abort the search.
pub(crate) fn rootfind_newton<S, F>(
    mut func: F,
    mut x0: f64,
    mut a: f64,
    mut b: f64,
    max_iterations: usize,
    tolerance: f64,
) -> Result<NewtonOutcome<S>>
where
    F: FnMut(f64) -> Result<(f64, f64, S)>,
{
    let mut last: Option<(f64, S)> = None;
    let mut x = x0;
    let mut iterations = 0;
    let mut converged = false;

    for _ in 0..max_iterations {
        iterations += 1;
        let (fval, fpval, state) = func(x0)?;

        if fval < 0.0 {
            a = x0;
        } else {
            b = x0;
        }

        x = x0 - fval / fpval;
        if !(a < x && x < b) {
            // once bracketed, never leave the bracket (also catches a
            // non-finite Newton step from a degenerate derivative)
            x = 0.5 * (a + b);
        }

        last = Some((fval, state));
        if (x - x0).abs() < tolerance || fval.abs() < tolerance {
            converged = true;
            break;
        }
        x0 = x;
    }

    match last {
        Some((residual, state)) => Ok(NewtonOutcome {
            run: CalibrationRun {
                damping: x,
                residual,
                iterations,
                converged,
            },
            state,
        }),
        None => Err(Error::InvalidParameter(
            "max_iterations must be > 0".to_string(),
        )),
    }
}
