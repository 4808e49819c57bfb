//! rucell — analysis and execution of CellML-style models of coupled
//! differential-algebraic equations.
//!
//! The crate takes an in-memory [`model::Model`] (markup parsing happens
//! upstream), classifies every variable into a role, orders the equations
//! deterministically into four evaluation phases, packages unresolvable
//! algebraic cycles into simultaneously-solved nonlinear subsystems, and
//! compiles each statement into two interchangeable forms — a tree walked
//! by recursion and a post-order program run on an explicit stack. An
//! [`interp::Interpreter`] then evaluates the compiled model against
//! per-role numeric buffers, with caller-injected closures for external
//! variables and root finding.

use std::sync::Once;

pub mod analysis;
pub mod interp;
pub mod model;


pub use analysis::analysed::{
    AnalysedModel, AnalysedStatement, AnalysedVariable, Phase, StatementBody, VariableKind,
};
pub use analysis::issue::{Issue, IssueKind, Issues, Severity};
pub use analysis::nla::NlaSystem;
pub use analysis::Analyser;
pub use interp::{Buffers, Hooks, Interpreter, InterpreterError, Representation};
pub use model::{Component, Equation, InitialValue, Interface, Model};

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        env_logger::init();
    });
}
