//! Role assignment.
//!
//! One pass over the model resolves every reference, finds the variable of
//! integration and the states, applies caller-supplied external flags, and
//! settles every remaining variable into Constant, ComputedConstant or
//! Algebraic. Misuse is collected into the issue list; classification never
//! aborts.

use indexmap::{IndexMap, IndexSet};
use log::debug;

use crate::model::ast::{AstNode, NodeId, VarRef};
use crate::model::{EquationTarget, InitialValue, Model};

use super::analysed::VariableKind;
use super::issue::{Issue, IssueKind, Issues};

/// A resolved right-hand-side reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Reference {
    /// The value of a variable.
    Variable(usize),
    /// The rate of a state, from a derivative node on a right-hand side.
    Rate(usize),
}

/// A variable during classification, before buffer indices are assigned.
#[derive(Clone, Debug)]
pub(crate) struct InternalVariable {
    pub component: String,
    pub name: String,
    pub units: String,
    pub kind: VariableKind,
    pub external_index: Option<usize>,
    pub init: Option<InitialValue>,
    pub equation: Option<usize>,
}

impl InternalVariable {
    pub fn var_ref(&self) -> VarRef {
        VarRef::new(&self.component, &self.name)
    }
}

/// An equation after reference resolution.
#[derive(Clone, Debug)]
pub(crate) struct InternalEquation {
    pub target: usize,
    pub is_ode: bool,
    pub rhs: NodeId,
    /// Resolved references in first-appearance order, deduplicated.
    pub refs: Vec<Reference>,
    /// The target was flagged external; the equation produces no statement
    /// but its references stay visible as the external's dependency set.
    pub discarded: bool,
}

/// The classified model: variables with settled roles, resolved equations,
/// and the variable of integration if there is exactly one candidate.
#[derive(Clone, Debug, Default)]
pub(crate) struct Classification {
    pub vars: Vec<InternalVariable>,
    pub by_ref: IndexMap<(String, String), usize>,
    pub voi: Option<usize>,
    pub equations: Vec<InternalEquation>,
}

impl Classification {
    pub fn resolve(&self, var: &VarRef) -> Option<usize> {
        self.by_ref
            .get(&(var.component.clone(), var.name.clone()))
            .copied()
    }
}

pub(crate) fn classify(
    model: &Model,
    external_flags: &[VarRef],
    issues: &mut Issues,
) -> Classification {
    let mut cls = Classification::default();

    // Variable table, in declaration order.
    for component in model.components() {
        for decl in component.variables() {
            let id = cls.vars.len();
            cls.by_ref
                .insert((component.name.clone(), decl.name.clone()), id);
            cls.vars.push(InternalVariable {
                component: component.name.clone(),
                name: decl.name.clone(),
                units: decl.units.clone(),
                kind: VariableKind::Algebraic,
                external_index: None,
                init: None,
                equation: None,
            });
        }
    }

    apply_external_flags(&mut cls, external_flags, issues);
    collect_initialisations(model, &mut cls, issues);

    let scan = scan_equations(model, &mut cls, issues);

    settle_voi(&mut cls, &scan, issues);
    settle_states(&mut cls, &scan, issues);
    settle_constants(&mut cls, issues);
    check_initialisations(&mut cls, issues);
    report_unused(&mut cls, issues);

    debug!(
        "classified {} variables, {} equations, voi: {:?}",
        cls.vars.len(),
        cls.equations.len(),
        cls.voi.map(|v| cls.vars[v].var_ref().to_string())
    );

    cls
}

fn apply_external_flags(cls: &mut Classification, flags: &[VarRef], issues: &mut Issues) {
    let mut next_index = 0;
    for flag in flags {
        match cls.resolve(flag) {
            Some(id) => {
                if cls.vars[id].external_index.is_none() {
                    cls.vars[id].external_index = Some(next_index);
                    next_index += 1;
                }
            }
            None => issues.push(Issue::error(
                IssueKind::ExternalVariableUnknown,
                format!("external variable '{}' is not declared in the model", flag),
            )),
        }
    }
}

fn collect_initialisations(model: &Model, cls: &mut Classification, issues: &mut Issues) {
    for component in model.components() {
        for init in component.initialisations() {
            let target = VarRef::new(&component.name, &init.target);
            let id = match cls.resolve(&target) {
                Some(id) => id,
                None => {
                    issues.push(Issue::error(
                        IssueKind::UndefinedVariable,
                        format!("initialisation targets undeclared variable '{}'", target),
                    ));
                    continue;
                }
            };
            if let InitialValue::Reference(var) = &init.value {
                if cls.resolve(var).is_none() {
                    issues.push(Issue::error(
                        IssueKind::UndefinedVariable,
                        format!(
                            "the initial value of '{}' references undeclared variable '{}'",
                            target, var
                        ),
                    ));
                    continue;
                }
            }
            if cls.vars[id].init.is_some() {
                issues.push(Issue::error(
                    IssueKind::VariableInitialisedMoreThanOnce,
                    format!("variable '{}' is initialised more than once", target),
                ));
            } else {
                cls.vars[id].init = Some(init.value.clone());
            }
        }
    }
}

/// Facts gathered while resolving equations, settled afterwards.
#[derive(Default)]
struct EquationScan {
    /// Variables bound by a derivative anywhere in the model.
    voi_candidates: IndexSet<usize>,
    /// Variables appearing as a derivative subject anywhere.
    states: IndexSet<usize>,
    /// Derivative subjects seen only on right-hand sides.
    rhs_rate_subjects: IndexSet<usize>,
    /// Variables with a differential equation targeting them.
    ode_targets: IndexSet<usize>,
}

fn scan_equations(model: &Model, cls: &mut Classification, issues: &mut Issues) -> EquationScan {
    let mut scan = EquationScan::default();

    for component in model.components() {
        for equation in component.equations() {
            let (target, is_ode) = match &equation.target {
                EquationTarget::Variable(var) => match cls.resolve(var) {
                    Some(id) => (id, false),
                    None => {
                        issues.push(Issue::error(
                            IssueKind::UndefinedVariable,
                            format!("equation targets undeclared variable '{}'", var),
                        ));
                        continue;
                    }
                },
                EquationTarget::Derivative {
                    bound,
                    state,
                    order,
                } => {
                    let bound_id = cls.resolve(bound);
                    let state_id = cls.resolve(state);
                    if *order != 1 {
                        issues.push(Issue::error(
                            IssueKind::OdeNotFirstOrder,
                            format!(
                                "the differential equation for '{}' is of order {}, only first-order equations are supported",
                                state, order
                            ),
                        ));
                    }
                    match (bound_id, state_id) {
                        (Some(b), Some(s)) => {
                            scan.voi_candidates.insert(b);
                            scan.states.insert(s);
                            scan.ode_targets.insert(s);
                            (s, true)
                        }
                        _ => {
                            issues.push(Issue::error(
                                IssueKind::UndefinedVariable,
                                format!(
                                    "differential equation 'd {} / d {}' references an undeclared variable",
                                    state, bound
                                ),
                            ));
                            continue;
                        }
                    }
                }
            };

            let mut refs = IndexSet::new();
            walk_rhs(model, equation.rhs, cls, &mut scan, &mut refs, issues);

            if cls.vars[target].equation.is_some() {
                issues.push(Issue::error(
                    IssueKind::VariableComputedMoreThanOnce,
                    format!(
                        "variable '{}' is computed more than once",
                        cls.vars[target].var_ref()
                    ),
                ));
                continue;
            }

            let id = cls.equations.len();
            cls.vars[target].equation = Some(id);
            cls.equations.push(InternalEquation {
                target,
                is_ode,
                rhs: equation.rhs,
                refs: refs.into_iter().collect(),
                discarded: false,
            });
        }
    }

    scan
}

fn walk_rhs(
    model: &Model,
    node: NodeId,
    cls: &mut Classification,
    scan: &mut EquationScan,
    refs: &mut IndexSet<Reference>,
    issues: &mut Issues,
) {
    match model.arena().node(node) {
        AstNode::Number(_) | AstNode::Constant(_) => {}
        AstNode::Variable(var) => match cls.resolve(var) {
            Some(id) => {
                refs.insert(Reference::Variable(id));
            }
            None => issues.push(Issue::error(
                IssueKind::UndefinedVariable,
                format!("reference to undeclared variable '{}'", var),
            )),
        },
        AstNode::Derivative {
            bound,
            state,
            order,
        } => {
            if *order != 1 {
                issues.push(Issue::error(
                    IssueKind::OdeNotFirstOrder,
                    format!(
                        "the derivative of '{}' is of order {}, only first-order derivatives are supported",
                        state, order
                    ),
                ));
            }
            match (cls.resolve(bound), cls.resolve(state)) {
                (Some(b), Some(s)) => {
                    scan.voi_candidates.insert(b);
                    scan.states.insert(s);
                    scan.rhs_rate_subjects.insert(s);
                    refs.insert(Reference::Rate(s));
                }
                _ => issues.push(Issue::error(
                    IssueKind::UndefinedVariable,
                    format!(
                        "derivative 'd {} / d {}' references an undeclared variable",
                        state, bound
                    ),
                )),
            }
        }
        AstNode::Apply { op, args } => {
            if !op.accepts(args.len()) {
                issues.push(Issue::error(
                    IssueKind::InvalidArgument,
                    format!(
                        "operator {:?} applied to {} argument(s)",
                        op,
                        args.len()
                    ),
                ));
            }
            for arg in args {
                walk_rhs(model, *arg, cls, scan, refs, issues);
            }
        }
        AstNode::Piecewise { cases, otherwise } => {
            for case in cases {
                walk_rhs(model, case.cond, cls, scan, refs, issues);
                walk_rhs(model, case.value, cls, scan, refs, issues);
            }
            if let Some(otherwise) = otherwise {
                walk_rhs(model, *otherwise, cls, scan, refs, issues);
            }
        }
    }
}

fn settle_voi(cls: &mut Classification, scan: &EquationScan, issues: &mut Issues) {
    if scan.voi_candidates.len() > 1 {
        let names: Vec<String> = scan
            .voi_candidates
            .iter()
            .map(|&id| format!("'{}'", cls.vars[id].var_ref()))
            .collect();
        issues.push(Issue::error(
            IssueKind::VoiSeveral,
            format!(
                "several variables of integration: {}",
                names.join(", ")
            ),
        ));
        return;
    }

    let voi = match scan.voi_candidates.first() {
        Some(&voi) => voi,
        None => return,
    };
    cls.voi = Some(voi);
    cls.vars[voi].kind = VariableKind::VariableOfIntegration;

    let var_ref = cls.vars[voi].var_ref();
    if cls.vars[voi].init.is_some() {
        issues.push(Issue::error(
            IssueKind::VoiInitialised,
            format!("the variable of integration '{}' must not be initialised", var_ref),
        ));
    }
    if cls.vars[voi].equation.is_some() {
        issues.push(Issue::error(
            IssueKind::VoiComputed,
            format!(
                "the variable of integration '{}' must not be computed by an equation",
                var_ref
            ),
        ));
    }
    if cls.vars[voi].external_index.is_some() {
        issues.push(Issue::error(
            IssueKind::ExternalVariableVoi,
            format!(
                "the variable of integration '{}' must not be flagged as external",
                var_ref
            ),
        ));
        cls.vars[voi].external_index = None;
    }
}

fn settle_states(cls: &mut Classification, scan: &EquationScan, issues: &mut Issues) {
    for &state in &scan.states {
        if cls.voi == Some(state) {
            continue;
        }
        cls.vars[state].kind = VariableKind::State;
        let var_ref = cls.vars[state].var_ref();

        if cls.vars[state].external_index.is_some() {
            issues.push(Issue::error(
                IssueKind::ExternalVariableState,
                format!("the state '{}' must not be flagged as external", var_ref),
            ));
            cls.vars[state].external_index = None;
        }
        if cls.vars[state].init.is_none() {
            issues.push(Issue::error(
                IssueKind::StateNotInitialised,
                format!("the state '{}' has no initial value", var_ref),
            ));
        }
        if scan.rhs_rate_subjects.contains(&state) && !scan.ode_targets.contains(&state) {
            issues.push(Issue::error(
                IssueKind::InvalidArgument,
                format!(
                    "the derivative of '{}' is referenced but no differential equation defines it",
                    var_ref
                ),
            ));
        }
    }
}

/// Settle External, Constant and the ComputedConstant fixpoint; everything
/// else stays Algebraic.
fn settle_constants(cls: &mut Classification, _issues: &mut Issues) {
    for id in 0..cls.vars.len() {
        let var = &cls.vars[id];
        if var.kind != VariableKind::Algebraic {
            continue;
        }
        if var.external_index.is_some() {
            cls.vars[id].kind = VariableKind::External;
            if let Some(eq) = cls.vars[id].equation {
                debug!(
                    "discarding the equation of external variable '{}'",
                    cls.vars[id].var_ref()
                );
                cls.equations[eq].discarded = true;
            }
            continue;
        }
        if var.init.is_some() && var.equation.is_none() {
            cls.vars[id].kind = VariableKind::Constant;
        }
    }

    // A variable computed from constants alone is a computed constant, and
    // computed-constant-ness propagates through chains. Initialised
    // variables are excluded: their initial value is a solver guess, so
    // their equation stays in the variable phases.
    let mut changed = true;
    while changed {
        changed = false;
        for id in 0..cls.vars.len() {
            let var = &cls.vars[id];
            if var.kind != VariableKind::Algebraic || var.init.is_some() {
                continue;
            }
            let eq = match var.equation {
                Some(eq) => eq,
                None => continue,
            };
            let constant_rhs = cls.equations[eq].refs.iter().all(|r| match r {
                Reference::Variable(v) => matches!(
                    cls.vars[*v].kind,
                    VariableKind::Constant | VariableKind::ComputedConstant
                ),
                Reference::Rate(_) => false,
            });
            if constant_rhs {
                cls.vars[id].kind = VariableKind::ComputedConstant;
                changed = true;
            }
        }
    }
}

fn check_initialisations(cls: &mut Classification, issues: &mut Issues) {
    for id in 0..cls.vars.len() {
        let value = match &cls.vars[id].init {
            Some(InitialValue::Reference(var)) => var.clone(),
            _ => continue,
        };
        let referenced = match cls.resolve(&value) {
            Some(referenced) => referenced,
            None => continue, // already reported
        };
        if cls.vars[referenced].kind != VariableKind::Constant {
            issues.push(Issue::error(
                IssueKind::NonConstantInitialisation,
                format!(
                    "the initial value of '{}' references '{}', which is not a constant",
                    cls.vars[id].var_ref(),
                    value
                ),
            ));
        }
    }
}

fn report_unused(cls: &mut Classification, issues: &mut Issues) {
    for id in 0..cls.vars.len() {
        let var = &cls.vars[id];
        let settled = var.kind != VariableKind::Algebraic;
        if settled || var.equation.is_some() || var.init.is_some() {
            continue;
        }
        issues.push(Issue::warning(
            IssueKind::VariableUnused,
            format!("variable '{}' is unused", cls.vars[id].var_ref()),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ast::AstOp;
    use crate::model::Equation;

    fn classify_model(model: &Model) -> (Classification, Issues) {
        classify_with_externals(model, &[])
    }

    fn classify_with_externals(model: &Model, externals: &[VarRef]) -> (Classification, Issues) {
        let mut issues = Issues::new();
        let cls = classify(model, externals, &mut issues);
        (cls, issues)
    }

    fn decay_model() -> Model {
        let mut model = Model::new("decay");
        let rhs = {
            let arena = model.arena_mut();
            let k = arena.variable("main", "k");
            let x = arena.variable("main", "x");
            let neg = arena.unary(AstOp::Minus, k);
            arena.binary(AstOp::Times, neg, x)
        };
        model
            .component("main")
            .variable("t", "second")
            .variable("x", "mole")
            .variable("k", "per_second")
            .initialise("x", InitialValue::Literal(10.0))
            .initialise("k", InitialValue::Literal(0.5))
            .add_equation(Equation::ode(
                VarRef::new("main", "t"),
                VarRef::new("main", "x"),
                rhs,
            ));
        model
    }

    #[test]
    fn test_decay_roles() {
        let (cls, issues) = classify_model(&decay_model());
        assert!(!issues.has_errors(), "{:?}", issues);

        let t = cls.resolve(&VarRef::new("main", "t")).unwrap();
        let x = cls.resolve(&VarRef::new("main", "x")).unwrap();
        let k = cls.resolve(&VarRef::new("main", "k")).unwrap();

        assert_eq!(cls.voi, Some(t));
        assert_eq!(cls.vars[t].kind, VariableKind::VariableOfIntegration);
        assert_eq!(cls.vars[x].kind, VariableKind::State);
        assert_eq!(cls.vars[k].kind, VariableKind::Constant);
    }

    #[test]
    fn test_voi_several() {
        let mut model = Model::new("m");
        let (one, two) = {
            let arena = model.arena_mut();
            (arena.number(1.0), arena.number(2.0))
        };
        model
            .component("main")
            .variable("t", "second")
            .variable("u", "second")
            .variable("x", "mole")
            .variable("y", "mole")
            .initialise("x", InitialValue::Literal(0.0))
            .initialise("y", InitialValue::Literal(0.0))
            .add_equation(Equation::ode(
                VarRef::new("main", "t"),
                VarRef::new("main", "x"),
                one,
            ))
            .add_equation(Equation::ode(
                VarRef::new("main", "u"),
                VarRef::new("main", "y"),
                two,
            ));

        let (cls, issues) = classify_model(&model);
        assert!(issues.has_errors());
        assert!(issues.iter().any(|i| i.kind == IssueKind::VoiSeveral));
        assert_eq!(cls.voi, None);
    }

    #[test]
    fn test_state_not_initialised() {
        let mut model = Model::new("m");
        let one = model.arena_mut().number(1.0);
        model
            .component("main")
            .variable("t", "second")
            .variable("x", "mole")
            .add_equation(Equation::ode(
                VarRef::new("main", "t"),
                VarRef::new("main", "x"),
                one,
            ));

        let (_, issues) = classify_model(&model);
        assert!(issues
            .iter()
            .any(|i| i.kind == IssueKind::StateNotInitialised));
    }

    #[test]
    fn test_computed_constant_chain() {
        // a = 2 (constant), b = a * 2, c = b + a: b and c are computed
        // constants through the fixpoint.
        let mut model = Model::new("m");
        let (b_rhs, c_rhs) = {
            let arena = model.arena_mut();
            let a1 = arena.variable("main", "a");
            let two = arena.number(2.0);
            let b_rhs = arena.binary(AstOp::Times, a1, two);
            let b = arena.variable("main", "b");
            let a2 = arena.variable("main", "a");
            let c_rhs = arena.binary(AstOp::Plus, b, a2);
            (b_rhs, c_rhs)
        };
        model
            .component("main")
            .variable("a", "dimensionless")
            .variable("b", "dimensionless")
            .variable("c", "dimensionless")
            .initialise("a", InitialValue::Literal(2.0))
            .add_equation(Equation::assign("main", "b", b_rhs))
            .add_equation(Equation::assign("main", "c", c_rhs));

        let (cls, issues) = classify_model(&model);
        assert!(!issues.has_errors(), "{:?}", issues);

        let b = cls.resolve(&VarRef::new("main", "b")).unwrap();
        let c = cls.resolve(&VarRef::new("main", "c")).unwrap();
        assert_eq!(cls.vars[b].kind, VariableKind::ComputedConstant);
        assert_eq!(cls.vars[c].kind, VariableKind::ComputedConstant);
    }

    #[test]
    fn test_unused_variable_is_warning_only() {
        let mut model = Model::new("m");
        model
            .component("main")
            .variable("orphan", "dimensionless");

        let (cls, issues) = classify_model(&model);
        assert!(!issues.has_errors());
        assert!(issues.iter().any(|i| i.kind == IssueKind::VariableUnused));

        let orphan = cls.resolve(&VarRef::new("main", "orphan")).unwrap();
        assert_eq!(cls.vars[orphan].kind, VariableKind::Algebraic);
        assert!(cls.vars[orphan].equation.is_none());
    }

    #[test]
    fn test_external_flag_discards_equation() {
        let mut model = Model::new("m");
        let one = model.arena_mut().number(1.0);
        model
            .component("main")
            .variable("v", "volt")
            .add_equation(Equation::assign("main", "v", one));

        let (cls, issues) =
            classify_with_externals(&model, &[VarRef::new("main", "v")]);
        assert!(!issues.has_errors(), "{:?}", issues);

        let v = cls.resolve(&VarRef::new("main", "v")).unwrap();
        assert_eq!(cls.vars[v].kind, VariableKind::External);
        assert!(cls.equations[0].discarded);
    }

    #[test]
    fn test_external_flag_misuse() {
        let mut model = Model::new("m");
        let one = model.arena_mut().number(1.0);
        model
            .component("main")
            .variable("t", "second")
            .variable("x", "mole")
            .initialise("x", InitialValue::Literal(0.0))
            .add_equation(Equation::ode(
                VarRef::new("main", "t"),
                VarRef::new("main", "x"),
                one,
            ));

        let (_, issues) = classify_with_externals(
            &model,
            &[
                VarRef::new("main", "t"),
                VarRef::new("main", "x"),
                VarRef::new("main", "nowhere"),
            ],
        );
        assert!(issues.iter().any(|i| i.kind == IssueKind::ExternalVariableVoi));
        assert!(issues
            .iter()
            .any(|i| i.kind == IssueKind::ExternalVariableState));
        assert!(issues
            .iter()
            .any(|i| i.kind == IssueKind::ExternalVariableUnknown));
    }

    #[test]
    fn test_duplicate_equation_and_initialisation() {
        let mut model = Model::new("m");
        let (one, two) = {
            let arena = model.arena_mut();
            (arena.number(1.0), arena.number(2.0))
        };
        model
            .component("main")
            .variable("a", "dimensionless")
            .variable("b", "dimensionless")
            .initialise("b", InitialValue::Literal(1.0))
            .initialise("b", InitialValue::Literal(2.0))
            .add_equation(Equation::assign("main", "a", one))
            .add_equation(Equation::assign("main", "a", two));

        let (_, issues) = classify_model(&model);
        assert!(issues
            .iter()
            .any(|i| i.kind == IssueKind::VariableComputedMoreThanOnce));
        assert!(issues
            .iter()
            .any(|i| i.kind == IssueKind::VariableInitialisedMoreThanOnce));
    }

    #[test]
    fn test_second_order_derivative_is_an_error() {
        let mut model = Model::new("m");
        let rhs = model.arena_mut().number(1.0);
        model
            .component("main")
            .variable("t", "second")
            .variable("x", "mole")
            .initialise("x", InitialValue::Literal(0.0))
            .add_equation(crate::model::Equation {
                target: crate::model::EquationTarget::Derivative {
                    bound: VarRef::new("main", "t"),
                    state: VarRef::new("main", "x"),
                    order: 2,
                },
                rhs,
            });

        let (_, issues) = classify_model(&model);
        assert!(issues.iter().any(|i| i.kind == IssueKind::OdeNotFirstOrder));
    }

    #[test]
    fn test_operator_arity_misuse() {
        // not(a, b) is malformed.
        let mut model = Model::new("m");
        let rhs = {
            let arena = model.arena_mut();
            let a = arena.variable("main", "a");
            let b = arena.variable("main", "b");
            arena.apply(AstOp::Not, vec![a, b])
        };
        model
            .component("main")
            .variable("a", "dimensionless")
            .variable("b", "dimensionless")
            .variable("c", "dimensionless")
            .initialise("a", InitialValue::Literal(1.0))
            .initialise("b", InitialValue::Literal(2.0))
            .add_equation(Equation::assign("main", "c", rhs));

        let (_, issues) = classify_model(&model);
        assert!(issues.iter().any(|i| i.kind == IssueKind::InvalidArgument));
    }

    #[test]
    fn test_non_constant_initialisation() {
        let mut model = Model::new("m");
        let (t, one) = {
            let arena = model.arena_mut();
            (arena.variable("main", "t"), arena.number(1.0))
        };
        model
            .component("main")
            .variable("t", "second")
            .variable("x", "mole")
            .variable("y", "mole")
            .initialise("x", InitialValue::Reference(VarRef::new("main", "y")))
            .add_equation(Equation::ode(
                VarRef::new("main", "t"),
                VarRef::new("main", "x"),
                t,
            ))
            .add_equation(Equation::assign("main", "y", one));

        let (_, issues) = classify_model(&model);
        assert!(issues
            .iter()
            .any(|i| i.kind == IssueKind::NonConstantInitialisation));
    }
}
