//! Model analysis.
//!
//! The analyser turns a source [`Model`](crate::model::Model) into an
//! [`AnalysedModel`]: every variable classified into a role, every
//! initialisation and equation resolved, ordered deterministically,
//! partitioned into the four evaluation phases, compiled into both
//! executable forms, and every unresolvable algebraic cycle packaged as a
//! nonlinear subsystem. Problems are collected as issues, never thrown;
//! analysis is a pure function of its input and always runs to completion.

pub mod analysed;
pub mod issue;
pub mod nla;

mod classify;
mod graph;

use indexmap::IndexSet;
use log::debug;

use crate::interp::compile::{self, EvalArena, ResolvedRef, Segment, Slot};
use crate::model::ast::VarRef;
use crate::model::{InitialValue, Model};

use analysed::{
    AnalysedModel, AnalysedStatement, AnalysedVariable, Phase, PhaseNeeds, RoleCounts,
    StatementBody, VariableKind,
};
use classify::{Classification, Reference};
use graph::{StmtSource, Unit};
use issue::Issues;
use nla::{NlaMember, NlaSystem};

/// The analyser: external-variable flags plus the analysis entry point.
#[derive(Clone, Debug, Default)]
pub struct Analyser {
    externals: Vec<VarRef>,
}

impl Analyser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a declared variable as externally supplied: the calling
    /// environment provides its value at each evaluation and any computing
    /// equation it has is discarded. Flag order determines the external
    /// buffer index.
    pub fn add_external_variable(&mut self, component: &str, name: &str) -> &mut Self {
        self.externals.push(VarRef::new(component, name));
        self
    }

    /// Analyse a model. Always returns a model; blocking problems are
    /// reported through [`AnalysedModel::issues`] and leave it unevaluable.
    pub fn analyse(&self, model: &Model) -> AnalysedModel {
        let mut issues = Issues::new();
        let cls = classify::classify(model, &self.externals, &mut issues);
        let ordered = graph::order(&cls, &mut issues);
        let analysed = assemble(model, &cls, &ordered, issues);
        debug!(
            "analysed model '{}': {} states, {} constants, {} computed constants, {} algebraic, {} externals, {} subsystems",
            analysed.name(),
            analysed.state_count(),
            analysed.constant_count(),
            analysed.computed_constant_count(),
            analysed.algebraic_count(),
            analysed.external_count(),
            analysed.nla_systems().len()
        );
        analysed
    }
}

/// Buffer-index assignment and the variable table, in role order: the
/// variable of integration, states, their rates, constants, computed
/// constants, algebraic variables, externals.
struct VariableLayout {
    counts: RoleCounts,
    /// Buffer index per classification id.
    index_of: Vec<usize>,
    /// Analysed id per classification id.
    analysed_id: Vec<usize>,
    /// Analysed id of the paired rate, per state classification id.
    rate_id: Vec<Option<usize>>,
    variables: Vec<AnalysedVariable>,
    voi: Option<usize>,
}

fn layout_variables(cls: &Classification) -> VariableLayout {
    let n = cls.vars.len();
    let mut layout = VariableLayout {
        counts: RoleCounts::default(),
        index_of: vec![0; n],
        analysed_id: vec![usize::MAX; n],
        rate_id: vec![None; n],
        variables: Vec::new(),
        voi: None,
    };

    for (id, var) in cls.vars.iter().enumerate() {
        layout.index_of[id] = match var.kind {
            VariableKind::VariableOfIntegration => 0,
            VariableKind::State => {
                let index = layout.counts.states;
                layout.counts.states += 1;
                index
            }
            VariableKind::Constant => {
                let index = layout.counts.constants;
                layout.counts.constants += 1;
                index
            }
            VariableKind::ComputedConstant => {
                let index = layout.counts.computed_constants;
                layout.counts.computed_constants += 1;
                index
            }
            VariableKind::Algebraic => {
                let index = layout.counts.algebraic;
                layout.counts.algebraic += 1;
                index
            }
            VariableKind::External => {
                layout.counts.externals += 1;
                var.external_index.unwrap_or_default()
            }
            VariableKind::Rate => 0,
        };
    }

    let push = |layout: &mut VariableLayout, id: usize, kind: VariableKind| {
        let var = &cls.vars[id];
        layout.analysed_id[id] = layout.variables.len();
        layout.variables.push(AnalysedVariable {
            component: var.component.clone(),
            name: var.name.clone(),
            units: var.units.clone(),
            kind,
            index: layout.index_of[id],
        });
    };

    if let Some(voi) = cls.voi {
        push(&mut layout, voi, VariableKind::VariableOfIntegration);
        layout.voi = Some(layout.analysed_id[voi]);
    }

    let states: Vec<usize> = (0..n)
        .filter(|&id| cls.vars[id].kind == VariableKind::State)
        .collect();
    for &id in &states {
        push(&mut layout, id, VariableKind::State);
    }
    for &id in &states {
        let var = &cls.vars[id];
        layout.rate_id[id] = Some(layout.variables.len());
        layout.variables.push(AnalysedVariable {
            component: var.component.clone(),
            name: var.name.clone(),
            units: var.units.clone(),
            kind: VariableKind::Rate,
            index: layout.index_of[id],
        });
    }

    for kind in [
        VariableKind::Constant,
        VariableKind::ComputedConstant,
        VariableKind::Algebraic,
    ] {
        for id in 0..n {
            if cls.vars[id].kind == kind {
                push(&mut layout, id, kind);
            }
        }
    }

    // Externals in flag order, which is also their buffer-index order.
    let mut externals: Vec<usize> = (0..n)
        .filter(|&id| cls.vars[id].kind == VariableKind::External)
        .collect();
    externals.sort_by_key(|&id| layout.index_of[id]);
    for id in externals {
        push(&mut layout, id, VariableKind::External);
    }

    layout
}

fn value_slot(cls: &Classification, layout: &VariableLayout, id: usize) -> Option<Slot> {
    let segment = match cls.vars[id].kind {
        VariableKind::State => Segment::State,
        VariableKind::Constant => Segment::Constant,
        VariableKind::ComputedConstant => Segment::ComputedConstant,
        VariableKind::Algebraic => Segment::Algebraic,
        VariableKind::External => Segment::External,
        VariableKind::VariableOfIntegration | VariableKind::Rate => return None,
    };
    Some(Slot::new(segment, layout.index_of[id]))
}

fn assemble(
    model: &Model,
    cls: &Classification,
    ordered: &graph::Ordered,
    issues: Issues,
) -> AnalysedModel {
    let layout = layout_variables(cls);

    let resolve = |var: &VarRef| -> Option<ResolvedRef> {
        let id = cls.resolve(var)?;
        match cls.vars[id].kind {
            VariableKind::VariableOfIntegration => Some(ResolvedRef::Voi),
            _ => value_slot(cls, &layout, id).map(ResolvedRef::Slot),
        }
    };
    let resolve_rate = |var: &VarRef| -> Option<Slot> {
        let id = cls.resolve(var)?;
        if cls.vars[id].kind != VariableKind::State {
            return None;
        }
        Some(Slot::new(Segment::Rate, layout.index_of[id]))
    };
    let map_deps = |refs: &[Reference]| -> Vec<usize> {
        refs.iter()
            .filter_map(|r| match r {
                Reference::Variable(v) => {
                    let id = layout.analysed_id[*v];
                    (id != usize::MAX).then_some(id)
                }
                Reference::Rate(s) => layout.rate_id[*s],
            })
            .collect()
    };

    let mut arena = EvalArena::new();
    let mut statements: Vec<AnalysedStatement> = Vec::new();
    let mut nla_systems: Vec<NlaSystem> = Vec::new();
    let mut needs = [PhaseNeeds::default(); 4];
    let mut phase_offsets = [0usize; 5];

    for phase in Phase::ALL {
        let pi = phase.index();
        phase_offsets[pi] = statements.len();

        // Every external variable is refreshed at the head of
        // ComputeVariables, in flag order; references inside other phases
        // resolve lazily through the same per-call cache.
        if phase == Phase::ComputeVariables {
            let mut externals: Vec<usize> = (0..cls.vars.len())
                .filter(|&id| cls.vars[id].kind == VariableKind::External)
                .collect();
            externals.sort_by_key(|&id| layout.index_of[id]);
            for id in externals {
                needs[pi].external = true;
                let dependencies = match cls.vars[id].equation {
                    Some(eq) => map_deps(&cls.equations[eq].refs),
                    None => Vec::new(),
                };
                statements.push(AnalysedStatement {
                    phase,
                    body: StatementBody::ExternalRefresh {
                        variable: layout.analysed_id[id],
                        index: layout.index_of[id],
                    },
                    dependencies,
                });
            }
        }

        for unit in &ordered.phases[pi] {
            match unit {
                Unit::Single(idx) => {
                    let stmt = &ordered.stmts[*idx];
                    let (variable, compiled) = match stmt.source {
                        StmtSource::Init { var } => {
                            let lhs = match value_slot(cls, &layout, var) {
                                Some(slot) => slot,
                                None => continue,
                            };
                            let tree = match &cls.vars[var].init {
                                Some(InitialValue::Literal(value)) => {
                                    arena.push(compile::EvalNode::Number(*value))
                                }
                                Some(InitialValue::Reference(r)) => {
                                    match cls.resolve(r).and_then(|id| {
                                        value_slot(cls, &layout, id)
                                    }) {
                                        Some(slot) => {
                                            arena.push(compile::EvalNode::Load(slot))
                                        }
                                        None => {
                                            arena.push(compile::EvalNode::Number(f64::NAN))
                                        }
                                    }
                                }
                                None => continue,
                            };
                            (
                                layout.analysed_id[var],
                                compile::statement_from_tree(&arena, lhs, tree),
                            )
                        }
                        StmtSource::Equation(eq) => {
                            let equation = &cls.equations[eq];
                            let target = equation.target;
                            let (lhs, variable) = if equation.is_ode {
                                (
                                    Slot::new(Segment::Rate, layout.index_of[target]),
                                    layout.rate_id[target].unwrap_or_default(),
                                )
                            } else {
                                match value_slot(cls, &layout, target) {
                                    Some(slot) => (slot, layout.analysed_id[target]),
                                    None => continue,
                                }
                            };
                            let compiled = compile::compile_statement(
                                model.arena(),
                                equation.rhs,
                                lhs,
                                &resolve,
                                &resolve_rate,
                                &mut arena,
                            );
                            (variable, compiled)
                        }
                    };
                    if compile::reads_external(&arena, compiled.tree) {
                        needs[pi].external = true;
                    }
                    statements.push(AnalysedStatement {
                        phase,
                        body: StatementBody::Assign { variable, compiled },
                        dependencies: map_deps(&stmt.deps_vars),
                    });
                }
                Unit::Nla(member_stmts) => {
                    let mut members = Vec::new();
                    let mut uses_external = false;
                    let mut dependencies = IndexSet::new();
                    for &idx in member_stmts {
                        let stmt = &ordered.stmts[idx];
                        let eq = match stmt.source {
                            StmtSource::Equation(eq) => eq,
                            StmtSource::Init { .. } => continue,
                        };
                        let equation = &cls.equations[eq];
                        let lhs = match value_slot(cls, &layout, equation.target) {
                            Some(slot) => slot,
                            None => continue,
                        };
                        let rhs = compile::compile_value(
                            model.arena(),
                            equation.rhs,
                            &resolve,
                            &resolve_rate,
                            &mut arena,
                        );
                        uses_external |= compile::reads_external(&arena, rhs.tree);
                        dependencies.extend(map_deps(&stmt.deps_vars));
                        members.push(NlaMember {
                            variable: layout.analysed_id[equation.target],
                            lhs,
                            rhs,
                        });
                    }
                    if members.is_empty() {
                        continue;
                    }
                    let system = nla_systems.len();
                    nla_systems.push(NlaSystem {
                        members,
                        uses_external,
                    });
                    needs[pi].root_finder = true;
                    if uses_external {
                        needs[pi].external = true;
                    }
                    statements.push(AnalysedStatement {
                        phase,
                        body: StatementBody::NlaSolve { system },
                        dependencies: dependencies.into_iter().collect(),
                    });
                }
            }
        }
    }
    phase_offsets[4] = statements.len();

    AnalysedModel {
        name: model.name.clone(),
        issues,
        variables: layout.variables,
        voi: layout.voi,
        counts: layout.counts,
        arena,
        statements,
        phase_offsets,
        nla_systems,
        needs,
    }
}
