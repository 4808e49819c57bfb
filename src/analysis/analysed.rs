//! The analysed model.
//!
//! The immutable output of analysis: a classified variable table, the
//! ordered and compiled statement list partitioned into the four
//! evaluation phases, and the packaged nonlinear subsystems. This is the
//! structure a code-generation back-end walks and the structure that
//! drives an interpreter; it is serializable so callers can dump it.
//!
//! An analysed model is read-only and `Sync`: any number of interpreter
//! instances may share one, each owning private buffers.

use serde::Serialize;

use crate::interp::compile::{CompiledStatement, EvalArena};

use super::issue::Issues;
use super::nla::NlaSystem;

/// The role of an analysed variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum VariableKind {
    VariableOfIntegration,
    State,
    /// The derivative of a state; paired with its state at the same index.
    Rate,
    Constant,
    ComputedConstant,
    Algebraic,
    External,
}

/// The four evaluation phases, in required call order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    InitialiseVariables,
    ComputeComputedConstants,
    ComputeRates,
    ComputeVariables,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::InitialiseVariables,
        Phase::ComputeComputedConstants,
        Phase::ComputeRates,
        Phase::ComputeVariables,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Phase::InitialiseVariables => 0,
            Phase::ComputeComputedConstants => 1,
            Phase::ComputeRates => 2,
            Phase::ComputeVariables => 3,
        }
    }
}

/// One analysed variable: identity, units, role and buffer index.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysedVariable {
    pub component: String,
    pub name: String,
    pub units: String,
    pub kind: VariableKind,
    /// Index into the buffer of the variable's role. A state and its rate
    /// share one index.
    pub index: usize,
}

/// What a statement does when executed.
#[derive(Clone, Debug, Serialize)]
pub enum StatementBody {
    /// Evaluate the compiled right-hand side and store it in the left-hand
    /// side's slot.
    Assign {
        variable: usize,
        compiled: CompiledStatement,
    },
    /// Resolve an external variable through the caller-supplied hook.
    ExternalRefresh { variable: usize, index: usize },
    /// Solve a nonlinear subsystem through the caller-supplied root
    /// finder.
    NlaSolve { system: usize },
}

/// One ordered statement.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysedStatement {
    pub phase: Phase,
    pub body: StatementBody,
    /// Analysed-variable ids this statement reads (the variable of
    /// integration excluded). For a subsystem, the union over its members.
    pub dependencies: Vec<usize>,
}

impl AnalysedStatement {
    /// The variable this statement computes, if it computes exactly one.
    pub fn variable(&self) -> Option<usize> {
        match &self.body {
            StatementBody::Assign { variable, .. }
            | StatementBody::ExternalRefresh { variable, .. } => Some(*variable),
            StatementBody::NlaSolve { .. } => None,
        }
    }

    pub fn nla_system(&self) -> Option<usize> {
        match &self.body {
            StatementBody::NlaSolve { system } => Some(*system),
            _ => None,
        }
    }
}

/// The hooks a phase cannot run without.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PhaseNeeds {
    pub external: bool,
    pub root_finder: bool,
}

/// Number of variables per role.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RoleCounts {
    pub states: usize,
    pub constants: usize,
    pub computed_constants: usize,
    pub algebraic: usize,
    pub externals: usize,
}

/// The immutable result of analysing a model.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysedModel {
    pub(crate) name: String,
    pub(crate) issues: Issues,
    pub(crate) variables: Vec<AnalysedVariable>,
    pub(crate) voi: Option<usize>,
    pub(crate) counts: RoleCounts,
    pub(crate) arena: EvalArena,
    pub(crate) statements: Vec<AnalysedStatement>,
    /// Statement offsets of the four phases, plus the total.
    pub(crate) phase_offsets: [usize; 5],
    pub(crate) nla_systems: Vec<NlaSystem>,
    pub(crate) needs: [PhaseNeeds; 4],
}

impl AnalysedModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn issues(&self) -> &Issues {
        &self.issues
    }

    /// Whether any blocking issue was collected; a model with errors
    /// cannot drive an interpreter.
    pub fn has_errors(&self) -> bool {
        self.issues.has_errors()
    }

    pub fn variables(&self) -> &[AnalysedVariable] {
        &self.variables
    }

    pub fn variable(&self, id: usize) -> &AnalysedVariable {
        &self.variables[id]
    }

    /// The variable of integration, if the model has one.
    pub fn voi(&self) -> Option<usize> {
        self.voi
    }

    /// Look a variable up by component and name. States, constants and the
    /// like are found directly; the rate of a state is reachable through
    /// [`AnalysedModel::rate_of`].
    pub fn find_variable(&self, component: &str, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| {
            v.kind != VariableKind::Rate && v.component == component && v.name == name
        })
    }

    /// The rate paired with a state.
    pub fn rate_of(&self, state: usize) -> Option<usize> {
        let index = self.variables[state].index;
        if self.variables[state].kind != VariableKind::State {
            return None;
        }
        self.variables
            .iter()
            .position(|v| v.kind == VariableKind::Rate && v.index == index)
    }

    pub fn statements(&self) -> &[AnalysedStatement] {
        &self.statements
    }

    /// The statements of one phase, in execution order.
    pub fn phase_statements(&self, phase: Phase) -> &[AnalysedStatement] {
        let i = phase.index();
        &self.statements[self.phase_offsets[i]..self.phase_offsets[i + 1]]
    }

    /// The variables a statement-computed variable reads, or empty for
    /// variables no statement computes.
    pub fn variable_dependencies(&self, variable: usize) -> &[usize] {
        for statement in &self.statements {
            let computes = match &statement.body {
                StatementBody::Assign { variable: v, .. } => *v == variable,
                StatementBody::ExternalRefresh { variable: v, .. } => *v == variable,
                StatementBody::NlaSolve { system } => {
                    self.nla_systems[*system].variables().any(|v| v == variable)
                }
            };
            if computes {
                return &statement.dependencies;
            }
        }
        &[]
    }

    pub fn nla_systems(&self) -> &[NlaSystem] {
        &self.nla_systems
    }

    pub fn nla_system(&self, id: usize) -> &NlaSystem {
        &self.nla_systems[id]
    }

    pub fn state_count(&self) -> usize {
        self.counts.states
    }

    pub fn constant_count(&self) -> usize {
        self.counts.constants
    }

    pub fn computed_constant_count(&self) -> usize {
        self.counts.computed_constants
    }

    pub fn algebraic_count(&self) -> usize {
        self.counts.algebraic
    }

    pub fn external_count(&self) -> usize {
        self.counts.externals
    }

    pub(crate) fn arena(&self) -> &EvalArena {
        &self.arena
    }

    pub(crate) fn phase_needs(&self, phase: Phase) -> PhaseNeeds {
        self.needs[phase.index()]
    }
}
