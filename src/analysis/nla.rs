//! Nonlinear subsystem packaging.
//!
//! A strongly-connected set of algebraic statements cannot be ordered, so
//! it is collapsed into one subsystem solved simultaneously at evaluation
//! time. The packaging fixes the problem shape once, at analysis time:
//!
//! - the unknown of each member statement is its left-hand-side variable,
//!   and the unknown vector is ordered by member declaration order;
//! - the residual is `r[i] = eval(lhs_i) - eval(rhs_i)` after the current
//!   iterate has been scattered into the owning buffers;
//! - the initial guess is gathered from current buffer contents, i.e. a
//!   previously converged value, or the declared initial value on first
//!   use.
//!
//! The iterative solve itself is injected by the caller; this module only
//! defines the problem the injected root finder receives.

use serde::Serialize;

use crate::interp::compile::{CompiledValue, Slot};

/// One member of a nonlinear subsystem.
#[derive(Clone, Debug, Serialize)]
pub struct NlaMember {
    /// The unknown: the analysed-variable id of the member's left-hand
    /// side.
    pub variable: usize,
    pub(crate) lhs: Slot,
    pub(crate) rhs: CompiledValue,
}

/// A packaged nonlinear subsystem.
#[derive(Clone, Debug, Serialize)]
pub struct NlaSystem {
    pub(crate) members: Vec<NlaMember>,
    pub(crate) uses_external: bool,
}

impl NlaSystem {
    /// Number of unknowns (and of member statements).
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// The unknowns, in unknown-vector order.
    pub fn variables(&self) -> impl Iterator<Item = usize> + '_ {
        self.members.iter().map(|m| m.variable)
    }

    pub fn members(&self) -> &[NlaMember] {
        &self.members
    }
}
