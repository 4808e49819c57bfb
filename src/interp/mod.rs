//! The interpreter.
//!
//! An [`Interpreter`] binds to one analysed model, owns the per-role
//! numeric buffers, and replays the compiled statement list phase by
//! phase. Phases must be called in the documented order:
//! `initialise_variables`, `compute_computed_constants`, then
//! `compute_rates` and `compute_variables` in any order and as often as
//! wanted. Re-running `initialise_variables` resets the instance.
//!
//! External variables and nonlinear subsystems are handled through
//! caller-injected closures: an external resolver invoked at most once per
//! external per call (the result is cached for the remainder of that call
//! only), and a root finder that receives a residual function and an
//! initial guess and must leave the unknown vector at its solution. Both
//! are synchronous and must not re-enter the interpreter.
//!
//! The analysed model is shared read-only; every interpreter owns private
//! buffers, so instances may run on different threads. A single instance
//! is not synchronised and must not be driven concurrently.

pub mod compile;

pub(crate) mod rpn;
pub(crate) mod tree;

use serde::Serialize;
use thiserror::Error;

use crate::analysis::analysed::{AnalysedModel, Phase, StatementBody};
use crate::analysis::nla::NlaSystem;

use compile::{Segment, Slot};

/// Which compiled form an interpreter replays. Both produce bit-identical
/// results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Representation {
    /// Recursive evaluation of the lowered trees.
    Tree,
    /// Explicit-stack evaluation of the post-order programs.
    Stack,
}

/// The per-role numeric buffers of one interpreter instance.
#[derive(Clone, Debug, Default)]
pub struct Buffers {
    pub states: Vec<f64>,
    pub rates: Vec<f64>,
    pub constants: Vec<f64>,
    pub computed_constants: Vec<f64>,
    pub algebraic: Vec<f64>,
    pub externals: Vec<f64>,
}

impl Buffers {
    pub(crate) fn read(&self, slot: Slot) -> f64 {
        match slot.segment {
            Segment::State => self.states[slot.index],
            Segment::Rate => self.rates[slot.index],
            Segment::Constant => self.constants[slot.index],
            Segment::ComputedConstant => self.computed_constants[slot.index],
            Segment::Algebraic => self.algebraic[slot.index],
            Segment::External => self.externals[slot.index],
        }
    }

    pub(crate) fn write(&mut self, slot: Slot, value: f64) {
        match slot.segment {
            Segment::State => self.states[slot.index] = value,
            Segment::Rate => self.rates[slot.index] = value,
            Segment::Constant => self.constants[slot.index] = value,
            Segment::ComputedConstant => self.computed_constants[slot.index] = value,
            Segment::Algebraic => self.algebraic[slot.index] = value,
            Segment::External => self.externals[slot.index] = value,
        }
    }

    fn fill_nan(&mut self) {
        for buffer in [
            &mut self.states,
            &mut self.rates,
            &mut self.constants,
            &mut self.computed_constants,
            &mut self.algebraic,
            &mut self.externals,
        ] {
            buffer.fill(f64::NAN);
        }
    }
}

/// The caller-injected hooks.
///
/// The external resolver receives the current value of the variable of
/// integration, a read-only view of all buffers, and the external buffer
/// index to resolve. The root finder receives the residual function and
/// the unknown vector seeded with the initial guess; it must leave the
/// vector at the converged solution, and reports non-convergence through
/// its own contract, never through the interpreter.
#[derive(Default)]
pub struct Hooks<'a> {
    pub external: Option<&'a mut (dyn FnMut(f64, &Buffers, usize) -> f64 + 'a)>,
    pub root_finder:
        Option<&'a mut (dyn FnMut(&mut dyn FnMut(&[f64], &mut [f64]), &mut [f64]) + 'a)>,
}

impl<'a> Hooks<'a> {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Fatal interpreter conditions. Numeric trouble is never an error: NaN
/// and infinity propagate through buffers as ordinary values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum InterpreterError {
    #[error("the analysed model has blocking issues and cannot be evaluated")]
    InvalidModel,
    #[error("`{called}` requires `{required}` to have been run first")]
    PhaseOrder {
        called: &'static str,
        required: &'static str,
    },
    #[error("the model references external variables but no resolver was supplied")]
    MissingExternalResolver,
    #[error("the model contains nonlinear subsystems but no root finder was supplied")]
    MissingRootFinder,
}

/// Evaluation context: the buffers, the current variable-of-integration
/// value, the per-call external cache, and the reusable machine stack.
pub(crate) struct EvalState {
    pub voi: f64,
    pub bufs: Buffers,
    pub(crate) resolved: Vec<bool>,
    pub(crate) stack: Vec<rpn::StackValue>,
}

impl EvalState {
    /// Read a slot; an unresolved external slot invokes the resolver first
    /// and caches the result for the remainder of the current call.
    pub(crate) fn read_slot(
        &mut self,
        slot: Slot,
        ext: &mut dyn FnMut(f64, &Buffers, usize) -> f64,
    ) -> f64 {
        if slot.segment == Segment::External && !self.resolved[slot.index] {
            let value = ext(self.voi, &self.bufs, slot.index);
            self.bufs.externals[slot.index] = value;
            self.resolved[slot.index] = true;
        }
        self.bufs.read(slot)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Uninitialised,
    ConstantsPending,
    Ready,
}

/// One evaluation instance bound to an analysed model.
pub struct Interpreter<'m> {
    model: &'m AnalysedModel,
    representation: Representation,
    stage: Stage,
    st: EvalState,
}

impl<'m> Interpreter<'m> {
    /// Bind to a model, allocating buffers sized from its classification.
    /// Fails while blocking analysis issues remain.
    pub fn new(
        model: &'m AnalysedModel,
        representation: Representation,
    ) -> Result<Self, InterpreterError> {
        if model.has_errors() {
            return Err(InterpreterError::InvalidModel);
        }
        Ok(Self {
            model,
            representation,
            stage: Stage::Uninitialised,
            st: EvalState {
                voi: 0.0,
                bufs: Buffers {
                    states: vec![0.0; model.state_count()],
                    rates: vec![0.0; model.state_count()],
                    constants: vec![0.0; model.constant_count()],
                    computed_constants: vec![0.0; model.computed_constant_count()],
                    algebraic: vec![0.0; model.algebraic_count()],
                    externals: vec![0.0; model.external_count()],
                },
                resolved: vec![false; model.external_count()],
                stack: Vec::with_capacity(32),
            },
        })
    }

    pub fn model(&self) -> &'m AnalysedModel {
        self.model
    }

    pub fn representation(&self) -> Representation {
        self.representation
    }

    pub fn voi(&self) -> f64 {
        self.st.voi
    }

    pub fn states(&self) -> &[f64] {
        &self.st.bufs.states
    }

    pub fn states_mut(&mut self) -> &mut [f64] {
        &mut self.st.bufs.states
    }

    pub fn rates(&self) -> &[f64] {
        &self.st.bufs.rates
    }

    pub fn constants(&self) -> &[f64] {
        &self.st.bufs.constants
    }

    pub fn constants_mut(&mut self) -> &mut [f64] {
        &mut self.st.bufs.constants
    }

    pub fn computed_constants(&self) -> &[f64] {
        &self.st.bufs.computed_constants
    }

    pub fn algebraic(&self) -> &[f64] {
        &self.st.bufs.algebraic
    }

    pub fn externals(&self) -> &[f64] {
        &self.st.bufs.externals
    }

    /// Write every declared initial value into its buffer. Buffers are
    /// reset to NaN first, so anything never written reads as NaN. Resets
    /// the instance: computed constants must be recomputed afterwards.
    pub fn initialise_variables(&mut self) {
        self.st.bufs.fill_nan();
        self.stage = Stage::Uninitialised;
        // Initialisation statements read literals and constants only, so
        // no hooks can be required here.
        let _ = self.run_phase(Phase::InitialiseVariables, &mut Hooks::none());
        self.stage = Stage::ConstantsPending;
    }

    /// Run the computed-constant statements, in order.
    pub fn compute_computed_constants(&mut self) -> Result<(), InterpreterError> {
        if self.stage == Stage::Uninitialised {
            return Err(InterpreterError::PhaseOrder {
                called: "compute_computed_constants",
                required: "initialise_variables",
            });
        }
        self.run_phase(Phase::ComputeComputedConstants, &mut Hooks::none())?;
        self.stage = Stage::Ready;
        Ok(())
    }

    /// Set the variable of integration and run the rate statements plus
    /// the algebraic statements they need.
    pub fn compute_rates(
        &mut self,
        voi: f64,
        hooks: &mut Hooks,
    ) -> Result<(), InterpreterError> {
        self.ensure_ready("compute_rates")?;
        self.begin_call(voi);
        self.run_phase(Phase::ComputeRates, hooks)
    }

    /// Set the variable of integration and run the remaining statements:
    /// external refreshes, leftover algebraic equations and subsystems.
    pub fn compute_variables(
        &mut self,
        voi: f64,
        hooks: &mut Hooks,
    ) -> Result<(), InterpreterError> {
        self.ensure_ready("compute_variables")?;
        self.begin_call(voi);
        self.run_phase(Phase::ComputeVariables, hooks)
    }

    fn ensure_ready(&self, called: &'static str) -> Result<(), InterpreterError> {
        match self.stage {
            Stage::Ready => Ok(()),
            Stage::Uninitialised => Err(InterpreterError::PhaseOrder {
                called,
                required: "initialise_variables",
            }),
            Stage::ConstantsPending => Err(InterpreterError::PhaseOrder {
                called,
                required: "compute_computed_constants",
            }),
        }
    }

    /// Start a `compute_rates`/`compute_variables` call: set the variable
    /// of integration and drop the external cache of the previous call.
    fn begin_call(&mut self, voi: f64) {
        self.st.voi = voi;
        self.st.resolved.fill(false);
    }

    fn run_phase(&mut self, phase: Phase, hooks: &mut Hooks) -> Result<(), InterpreterError> {
        let needs = self.model.phase_needs(phase);
        if needs.external && hooks.external.is_none() {
            return Err(InterpreterError::MissingExternalResolver);
        }
        if needs.root_finder && hooks.root_finder.is_none() {
            return Err(InterpreterError::MissingRootFinder);
        }

        let model = self.model;
        let mut fallback = |_: f64, _: &Buffers, _: usize| f64::NAN;
        let Hooks {
            external,
            root_finder,
        } = hooks;
        let ext: &mut dyn FnMut(f64, &Buffers, usize) -> f64 = match external {
            Some(resolver) => &mut **resolver,
            None => &mut fallback,
        };

        for statement in model.phase_statements(phase) {
            match &statement.body {
                StatementBody::Assign { compiled, .. } => match self.representation {
                    Representation::Tree => {
                        let value = tree::eval(model.arena(), compiled.tree, &mut self.st, ext);
                        self.st.bufs.write(compiled.lhs, value);
                    }
                    Representation::Stack => {
                        rpn::run(&compiled.rpn, &mut self.st, ext);
                    }
                },
                StatementBody::ExternalRefresh { index, .. } => {
                    let _ = self
                        .st
                        .read_slot(Slot::new(Segment::External, *index), ext);
                }
                StatementBody::NlaSolve { system } => {
                    let finder = match root_finder {
                        Some(finder) => &mut **finder,
                        None => return Err(InterpreterError::MissingRootFinder),
                    };
                    solve_system(
                        model,
                        model.nla_system(*system),
                        self.representation,
                        &mut self.st,
                        ext,
                        finder,
                    );
                }
            }
        }
        Ok(())
    }
}

/// Drive one nonlinear subsystem through the injected root finder: gather
/// the initial guess from current buffer contents, hand the residual
/// function over, and scatter whatever the finder left in the unknown
/// vector back into the buffers. A non-converging finder simply leaves its
/// last iterate behind; the interpreter never retries.
fn solve_system(
    model: &AnalysedModel,
    system: &NlaSystem,
    representation: Representation,
    st: &mut EvalState,
    ext: &mut dyn FnMut(f64, &Buffers, usize) -> f64,
    finder: &mut dyn FnMut(&mut dyn FnMut(&[f64], &mut [f64]), &mut [f64]),
) {
    let members = system.members();
    let mut unknowns: Vec<f64> = members.iter().map(|m| st.bufs.read(m.lhs)).collect();

    let mut objective = |u: &[f64], r: &mut [f64]| {
        for (member, &value) in members.iter().zip(u) {
            st.bufs.write(member.lhs, value);
        }
        for (k, member) in members.iter().enumerate() {
            let rhs = match representation {
                Representation::Tree => tree::eval(model.arena(), member.rhs.tree, st, ext),
                Representation::Stack => {
                    rpn::run(&member.rhs.rpn, st, ext).unwrap_or(f64::NAN)
                }
            };
            r[k] = st.bufs.read(member.lhs) - rhs;
        }
    };
    finder(&mut objective, &mut unknowns);

    for (member, &value) in members.iter().zip(&unknowns) {
        st.bufs.write(member.lhs, value);
    }
}
