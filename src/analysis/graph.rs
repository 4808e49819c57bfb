//! Dependency graph construction and deterministic ordering.
//!
//! Every initialisation and every kept equation becomes a statement node.
//! An edge runs from the statement producing a value to each statement
//! reading it, except that external variables (already available) and a
//! state's own value (only its rate matters for ordering) never create
//! edges. Strongly-connected components are found with Tarjan's algorithm,
//! all-algebraic cycles collapse into nonlinear-subsystem units, and the
//! condensation is scheduled with Kahn's algorithm using a `BTreeSet`
//! ready-queue keyed by declaration index, so ties always break in
//! original declaration order.

use std::collections::BTreeSet;

use indexmap::IndexSet;
use log::debug;

use super::analysed::VariableKind;
use super::classify::{Classification, Reference};
use super::issue::{Issue, IssueKind, Issues};

/// Where a statement comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StmtSource {
    /// The explicit initialisation of a variable.
    Init { var: usize },
    /// A model equation, by classification index.
    Equation(usize),
}

/// A statement node of the dependency graph.
#[derive(Clone, Debug)]
pub(crate) struct Stmt {
    pub source: StmtSource,
    /// References backing the public dependency set (voi excluded).
    pub deps_vars: Vec<Reference>,
    /// Statements this statement depends on, deduplicated.
    pub dep_stmts: Vec<usize>,
}

/// One scheduled unit: a single statement or a nonlinear subsystem.
#[derive(Clone, Debug)]
pub(crate) enum Unit {
    Single(usize),
    Nla(Vec<usize>),
}

/// The fully ordered, phase-partitioned statement list.
#[derive(Clone, Debug, Default)]
pub(crate) struct Ordered {
    pub stmts: Vec<Stmt>,
    /// InitialiseVariables, ComputeComputedConstants, ComputeRates,
    /// ComputeVariables.
    pub phases: [Vec<Unit>; 4],
}

pub(crate) fn order(cls: &Classification, issues: &mut Issues) -> Ordered {
    let mut stmts = build_statements(cls);
    link_dependencies(cls, &mut stmts);

    let sccs = tarjan(&stmts);
    let units = schedule(cls, &stmts, &sccs, issues);
    let phases = partition(cls, &stmts, units);

    debug!(
        "ordered {} statements into phases of {}, {}, {} and {} units",
        stmts.len(),
        phases[0].len(),
        phases[1].len(),
        phases[2].len(),
        phases[3].len()
    );

    Ordered { stmts, phases }
}

fn build_statements(cls: &Classification) -> Vec<Stmt> {
    let mut stmts = Vec::new();

    // Initialisations first, in declaration order of their targets.
    for (var, internal) in cls.vars.iter().enumerate() {
        if internal.init.is_none() {
            continue;
        }
        if !matches!(
            internal.kind,
            VariableKind::State
                | VariableKind::Constant
                | VariableKind::Algebraic
                | VariableKind::External
        ) {
            continue;
        }
        let deps_vars = match &internal.init {
            Some(crate::model::InitialValue::Reference(r)) => match cls.resolve(r) {
                Some(id) => vec![Reference::Variable(id)],
                None => Vec::new(),
            },
            _ => Vec::new(),
        };
        stmts.push(Stmt {
            source: StmtSource::Init { var },
            deps_vars,
            dep_stmts: Vec::new(),
        });
    }

    // Then equations, in model order.
    for (eq, equation) in cls.equations.iter().enumerate() {
        if equation.discarded {
            continue;
        }
        let deps_vars = equation
            .refs
            .iter()
            .filter(|r| match r {
                Reference::Variable(v) => {
                    cls.vars[*v].kind != VariableKind::VariableOfIntegration
                }
                Reference::Rate(_) => true,
            })
            .copied()
            .collect();
        stmts.push(Stmt {
            source: StmtSource::Equation(eq),
            deps_vars,
            dep_stmts: Vec::new(),
        });
    }

    stmts
}

fn link_dependencies(cls: &Classification, stmts: &mut Vec<Stmt>) {
    // Producer of each variable's value: a constant comes from its
    // initialisation, everything else from its computing equation. An
    // initialised algebraic variable has both; the equation wins, its
    // initialisation only seeds the solver guess.
    let mut value_producer: Vec<Option<usize>> = vec![None; cls.vars.len()];
    let mut rate_producer: Vec<Option<usize>> = vec![None; cls.vars.len()];

    for (idx, stmt) in stmts.iter().enumerate() {
        match stmt.source {
            StmtSource::Init { var } => {
                if cls.vars[var].kind == VariableKind::Constant {
                    value_producer[var] = Some(idx);
                }
            }
            StmtSource::Equation(eq) => {
                let equation = &cls.equations[eq];
                if equation.is_ode {
                    rate_producer[equation.target] = Some(idx);
                } else {
                    value_producer[equation.target] = Some(idx);
                }
            }
        }
    }

    for stmt in stmts.iter_mut() {
        let mut deps = IndexSet::new();
        for reference in &stmt.deps_vars {
            let producer = match reference {
                Reference::Variable(v) => match cls.vars[*v].kind {
                    // Externals are supplied by the environment and a
                    // state's value comes from integration; neither orders
                    // statements.
                    VariableKind::External | VariableKind::State => None,
                    VariableKind::VariableOfIntegration | VariableKind::Rate => None,
                    _ => value_producer[*v],
                },
                Reference::Rate(s) => rate_producer[*s],
            };
            if let Some(producer) = producer {
                deps.insert(producer);
            }
        }
        stmt.dep_stmts = deps.into_iter().collect();
    }
}

/// Tarjan's strongly-connected components, visiting statements in
/// declaration order so component discovery is deterministic. Members of
/// each component are returned in declaration order.
fn tarjan(stmts: &[Stmt]) -> Vec<Vec<usize>> {
    struct State {
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next_index: usize,
        sccs: Vec<Vec<usize>>,
    }

    fn visit(stmts: &[Stmt], state: &mut State, v: usize) {
        state.index[v] = Some(state.next_index);
        state.low[v] = state.next_index;
        state.next_index += 1;
        state.stack.push(v);
        state.on_stack[v] = true;

        for &w in &stmts[v].dep_stmts {
            if state.index[w].is_none() {
                visit(stmts, state, w);
                state.low[v] = state.low[v].min(state.low[w]);
            } else if state.on_stack[w] {
                state.low[v] = state.low[v].min(state.index[w].unwrap());
            }
        }

        if state.low[v] == state.index[v].unwrap() {
            let mut scc = Vec::new();
            loop {
                let w = state.stack.pop().unwrap();
                state.on_stack[w] = false;
                scc.push(w);
                if w == v {
                    break;
                }
            }
            scc.sort_unstable();
            state.sccs.push(scc);
        }
    }

    let n = stmts.len();
    let mut state = State {
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next_index: 0,
        sccs: Vec::new(),
    };

    for v in 0..n {
        if state.index[v].is_none() {
            visit(stmts, &mut state, v);
        }
    }

    state.sccs
}

/// Schedule the condensation with Kahn's algorithm. Simultaneously-ready
/// units are taken in declaration order of their first member.
fn schedule(
    cls: &Classification,
    stmts: &[Stmt],
    sccs: &[Vec<usize>],
    issues: &mut Issues,
) -> Vec<Unit> {
    let mut scc_of = vec![0usize; stmts.len()];
    for (id, scc) in sccs.iter().enumerate() {
        for &stmt in scc {
            scc_of[stmt] = id;
        }
    }

    // Dependency edges between components, deduplicated.
    let mut dependents: Vec<IndexSet<usize>> = vec![IndexSet::new(); sccs.len()];
    let mut in_degree = vec![0usize; sccs.len()];
    for (idx, stmt) in stmts.iter().enumerate() {
        for &dep in &stmt.dep_stmts {
            let from = scc_of[dep];
            let to = scc_of[idx];
            if from != to && dependents[from].insert(to) {
                in_degree[to] += 1;
            }
        }
    }

    let mut ready: BTreeSet<(usize, usize)> = sccs
        .iter()
        .enumerate()
        .filter(|(id, _)| in_degree[*id] == 0)
        .map(|(id, scc)| (scc[0], id))
        .collect();

    let mut units = Vec::new();
    while let Some(&(first, id)) = ready.iter().next() {
        ready.remove(&(first, id));
        make_units(cls, stmts, &sccs[id], issues, &mut units);
        for &dependent in &dependents[id] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert((sccs[dependent][0], dependent));
            }
        }
    }

    units
}

fn make_units(
    cls: &Classification,
    stmts: &[Stmt],
    scc: &[usize],
    issues: &mut Issues,
    units: &mut Vec<Unit>,
) {
    let cyclic = scc.len() > 1 || stmts[scc[0]].dep_stmts.contains(&scc[0]);
    if !cyclic {
        units.push(Unit::Single(scc[0]));
        return;
    }

    // Only a cycle made entirely of plain algebraic assignments can be
    // solved simultaneously; anything touching a rate or an initialisation
    // is a hard cyclic dependency.
    let packageable = scc.iter().all(|&idx| match stmts[idx].source {
        StmtSource::Init { .. } => false,
        StmtSource::Equation(eq) => {
            let equation = &cls.equations[eq];
            !equation.is_ode && cls.vars[equation.target].kind == VariableKind::Algebraic
        }
    });

    if packageable {
        units.push(Unit::Nla(scc.to_vec()));
        return;
    }

    let names: Vec<String> = scc
        .iter()
        .map(|&idx| {
            let var = match stmts[idx].source {
                StmtSource::Init { var } => var,
                StmtSource::Equation(eq) => cls.equations[eq].target,
            };
            format!("'{}'", cls.vars[var].var_ref())
        })
        .collect();
    issues.push(Issue::error(
        IssueKind::EquationCyclicDependency,
        format!("cyclic dependency between {}", names.join(", ")),
    ));

    // Emit the members as plain statements so ordering and reporting stay
    // complete; the error already blocks evaluation.
    for &idx in scc {
        units.push(Unit::Single(idx));
    }
}

/// Assign every scheduled unit to its phase, preserving the global order
/// within each phase.
fn partition(cls: &Classification, stmts: &[Stmt], units: Vec<Unit>) -> [Vec<Unit>; 4] {
    #[derive(Clone, Copy, PartialEq)]
    enum UnitKind {
        Init,
        ComputedConstant,
        Ode,
        Algebraic,
    }

    let kind_of = |unit: &Unit| -> UnitKind {
        let first = match unit {
            Unit::Single(idx) => *idx,
            Unit::Nla(members) => members[0],
        };
        match stmts[first].source {
            StmtSource::Init { .. } => UnitKind::Init,
            StmtSource::Equation(eq) => {
                let equation = &cls.equations[eq];
                if equation.is_ode {
                    UnitKind::Ode
                } else if cls.vars[equation.target].kind == VariableKind::ComputedConstant {
                    UnitKind::ComputedConstant
                } else {
                    UnitKind::Algebraic
                }
            }
        }
    };

    // Map each statement to its unit for the transitive-prerequisite walk.
    let mut unit_of = vec![usize::MAX; stmts.len()];
    for (id, unit) in units.iter().enumerate() {
        match unit {
            Unit::Single(idx) => unit_of[*idx] = id,
            Unit::Nla(members) => {
                for &idx in members {
                    unit_of[idx] = id;
                }
            }
        }
    }

    // ComputeRates takes every rate statement plus the algebraic units they
    // transitively need; everything runs in earlier phases or stays for
    // ComputeVariables.
    let kinds: Vec<UnitKind> = units.iter().map(&kind_of).collect();
    let mut needed = vec![false; units.len()];
    let mut work: Vec<usize> = kinds
        .iter()
        .enumerate()
        .filter(|(_, k)| **k == UnitKind::Ode)
        .map(|(id, _)| id)
        .collect();
    for &id in &work {
        needed[id] = true;
    }
    while let Some(id) = work.pop() {
        let members: Vec<usize> = match &units[id] {
            Unit::Single(idx) => vec![*idx],
            Unit::Nla(members) => members.clone(),
        };
        for idx in members {
            for &dep in &stmts[idx].dep_stmts {
                let dep_unit = unit_of[dep];
                if dep_unit == id || needed[dep_unit] {
                    continue;
                }
                if kinds[dep_unit] == UnitKind::Algebraic {
                    needed[dep_unit] = true;
                    work.push(dep_unit);
                }
            }
        }
    }

    let mut phases: [Vec<Unit>; 4] = Default::default();
    for (id, unit) in units.into_iter().enumerate() {
        let phase = match kinds[id] {
            UnitKind::Init => 0,
            UnitKind::ComputedConstant => 1,
            UnitKind::Ode => 2,
            UnitKind::Algebraic => {
                if needed[id] {
                    2
                } else {
                    3
                }
            }
        };
        phases[phase].push(unit);
    }
    phases
}
