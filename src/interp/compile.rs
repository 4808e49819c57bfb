//! Statement lowering.
//!
//! Every analysed statement is lowered into two interchangeable forms: a
//! slot-resolved tree (evaluated by recursion) and a post-order instruction
//! vector (evaluated with an explicit value stack). Both forms are produced
//! from the same lowered tree and evaluate through the same operator
//! kernels, so their semantic equivalence is structural.
//!
//! Variadic source operators fold left-to-right into binary applications;
//! unary and binary minus are distinct operations; named constants and a
//! missing piecewise `otherwise` lower to number literals (NaN for the
//! latter) identically in both forms.

use serde::Serialize;

use crate::model::ast::{AstArena, AstNode, AstOp, NodeId, VarRef};

/// The buffer a slot lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Segment {
    State,
    Rate,
    Constant,
    ComputedConstant,
    Algebraic,
    External,
}

/// One addressable cell of the evaluation context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub segment: Segment,
    pub index: usize,
}

impl Slot {
    pub fn new(segment: Segment, index: usize) -> Self {
        Self { segment, index }
    }
}

/// Unary operations of the compiled forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UnaryOp {
    Not,
    Neg,
    Sqrt,
    Abs,
    Exp,
    Ln,
    Log,
    Ceiling,
    Floor,
    Sin,
    Cos,
    Tan,
    Sec,
    Csc,
    Cot,
    Sinh,
    Cosh,
    Tanh,
    Sech,
    Csch,
    Coth,
    Asin,
    Acos,
    Atan,
    Asec,
    Acsc,
    Acot,
    Asinh,
    Acosh,
    Atanh,
    Asech,
    Acsch,
    Acoth,
}

/// Binary operations of the compiled forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BinaryOp {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    And,
    Or,
    Xor,
    Plus,
    Minus,
    Times,
    Divide,
    Power,
    Min,
    Max,
    Rem,
}

pub(crate) fn truthy(x: f64) -> bool {
    x != 0.0
}

fn from_bool(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl UnaryOp {
    /// The IEEE-754 kernel shared by both compiled forms.
    pub(crate) fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Not => from_bool(!truthy(x)),
            UnaryOp::Neg => -x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Ln => x.ln(),
            UnaryOp::Log => x.log10(),
            UnaryOp::Ceiling => x.ceil(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tan => x.tan(),
            UnaryOp::Sec => 1.0 / x.cos(),
            UnaryOp::Csc => 1.0 / x.sin(),
            UnaryOp::Cot => 1.0 / x.tan(),
            UnaryOp::Sinh => x.sinh(),
            UnaryOp::Cosh => x.cosh(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sech => 1.0 / x.cosh(),
            UnaryOp::Csch => 1.0 / x.sinh(),
            UnaryOp::Coth => 1.0 / x.tanh(),
            UnaryOp::Asin => x.asin(),
            UnaryOp::Acos => x.acos(),
            UnaryOp::Atan => x.atan(),
            UnaryOp::Asec => (1.0 / x).acos(),
            UnaryOp::Acsc => (1.0 / x).asin(),
            UnaryOp::Acot => (1.0 / x).atan(),
            UnaryOp::Asinh => x.asinh(),
            UnaryOp::Acosh => x.acosh(),
            UnaryOp::Atanh => x.atanh(),
            UnaryOp::Asech => (1.0 / x).acosh(),
            UnaryOp::Acsch => (1.0 / x).asinh(),
            UnaryOp::Acoth => (1.0 / x).atanh(),
        }
    }
}

impl BinaryOp {
    /// The IEEE-754 kernel shared by both compiled forms. Relational and
    /// logical operators yield 1.0/0.0.
    pub(crate) fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Eq => from_bool(a == b),
            BinaryOp::Neq => from_bool(a != b),
            BinaryOp::Lt => from_bool(a < b),
            BinaryOp::Leq => from_bool(a <= b),
            BinaryOp::Gt => from_bool(a > b),
            BinaryOp::Geq => from_bool(a >= b),
            BinaryOp::And => from_bool(truthy(a) && truthy(b)),
            BinaryOp::Or => from_bool(truthy(a) || truthy(b)),
            BinaryOp::Xor => from_bool(truthy(a) ^ truthy(b)),
            BinaryOp::Plus => a + b,
            BinaryOp::Minus => a - b,
            BinaryOp::Times => a * b,
            BinaryOp::Divide => a / b,
            BinaryOp::Power => a.powf(b),
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
            BinaryOp::Rem => a % b,
        }
    }
}

/// Index of a node in an [`EvalArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EvalId(u32);

/// A node of a lowered tree.
#[derive(Clone, Debug, Serialize)]
pub enum EvalNode {
    Number(f64),
    /// The current value of the variable of integration.
    Voi,
    /// A buffer read, resolved at evaluation time.
    Load(Slot),
    Unary {
        op: UnaryOp,
        arg: EvalId,
    },
    Binary {
        op: BinaryOp,
        lhs: EvalId,
        rhs: EvalId,
    },
    /// `cond`, `then` and `otherwise` all evaluate; the condition selects
    /// the result, so both compiled forms behave identically.
    Select {
        cond: EvalId,
        then: EvalId,
        otherwise: EvalId,
    },
}

/// Arena of lowered trees for one analysed model.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EvalArena {
    nodes: Vec<EvalNode>,
}

impl EvalArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: EvalNode) -> EvalId {
        let id = EvalId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: EvalId) -> &EvalNode {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One stack-machine instruction. `Load` pushes a slot reference that is
/// dereferenced against live buffers when consumed, not when pushed.
#[derive(Clone, Copy, Debug, Serialize)]
pub enum Instr {
    Number(f64),
    Voi,
    Load(Slot),
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// Pops otherwise, then, cond; pushes the selected value.
    Select,
    /// Pops a value and a target slot reference and writes the value.
    Assign,
}

/// A compiled assignment statement: both forms plus the target slot.
#[derive(Clone, Debug, Serialize)]
pub struct CompiledStatement {
    pub lhs: Slot,
    pub tree: EvalId,
    /// Full statement: target load, value program, `Assign`.
    pub rpn: Vec<Instr>,
}

/// A compiled right-hand side on its own, as used by nonlinear-subsystem
/// members whose residuals are evaluated rather than assigned.
#[derive(Clone, Debug, Serialize)]
pub struct CompiledValue {
    pub tree: EvalId,
    pub rpn: Vec<Instr>,
}

/// How a variable reference lowers.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ResolvedRef {
    Voi,
    Slot(Slot),
}

/// Lower a source expression into `out`, resolving variable references
/// through `resolve` and right-hand-side derivatives through
/// `resolve_rate`. Lowering is total: references and applications already
/// reported during analysis lower to NaN literals.
pub(crate) fn lower_expr(
    src: &AstArena,
    node: NodeId,
    resolve: &impl Fn(&VarRef) -> Option<ResolvedRef>,
    resolve_rate: &impl Fn(&VarRef) -> Option<Slot>,
    out: &mut EvalArena,
) -> EvalId {
    match src.node(node) {
        AstNode::Number(value) => out.push(EvalNode::Number(*value)),
        AstNode::Constant(constant) => out.push(EvalNode::Number(constant.value())),
        AstNode::Variable(var) => match resolve(var) {
            Some(ResolvedRef::Voi) => out.push(EvalNode::Voi),
            Some(ResolvedRef::Slot(slot)) => out.push(EvalNode::Load(slot)),
            None => out.push(EvalNode::Number(f64::NAN)),
        },
        AstNode::Derivative { state, .. } => match resolve_rate(state) {
            Some(slot) => out.push(EvalNode::Load(slot)),
            None => out.push(EvalNode::Number(f64::NAN)),
        },
        AstNode::Apply { op, args } => lower_apply(src, *op, args, resolve, resolve_rate, out),
        AstNode::Piecewise { cases, otherwise } => {
            let otherwise = match otherwise {
                Some(node) => lower_expr(src, *node, resolve, resolve_rate, out),
                None => out.push(EvalNode::Number(f64::NAN)),
            };
            // Fold the cases from the last to the first so the first
            // matching condition wins.
            let mut chain = otherwise;
            for case in cases.iter().rev() {
                let cond = lower_expr(src, case.cond, resolve, resolve_rate, out);
                let value = lower_expr(src, case.value, resolve, resolve_rate, out);
                chain = out.push(EvalNode::Select {
                    cond,
                    then: value,
                    otherwise: chain,
                });
            }
            chain
        }
    }
}

fn lower_apply(
    src: &AstArena,
    op: AstOp,
    args: &[NodeId],
    resolve: &impl Fn(&VarRef) -> Option<ResolvedRef>,
    resolve_rate: &impl Fn(&VarRef) -> Option<Slot>,
    out: &mut EvalArena,
) -> EvalId {
    if !op.accepts(args.len()) {
        // Reported as InvalidArgument during analysis.
        return out.push(EvalNode::Number(f64::NAN));
    }

    if op == AstOp::Minus && args.len() == 1 {
        let arg = lower_expr(src, args[0], resolve, resolve_rate, out);
        return out.push(EvalNode::Unary {
            op: UnaryOp::Neg,
            arg,
        });
    }

    if let Some(op) = unary_of(op) {
        let arg = lower_expr(src, args[0], resolve, resolve_rate, out);
        return out.push(EvalNode::Unary { op, arg });
    }

    let op = binary_of(op);
    let mut acc = lower_expr(src, args[0], resolve, resolve_rate, out);
    for arg in &args[1..] {
        let rhs = lower_expr(src, *arg, resolve, resolve_rate, out);
        acc = out.push(EvalNode::Binary { op, lhs: acc, rhs });
    }
    acc
}

fn unary_of(op: AstOp) -> Option<UnaryOp> {
    let unary = match op {
        AstOp::Not => UnaryOp::Not,
        AstOp::Sqrt => UnaryOp::Sqrt,
        AstOp::Abs => UnaryOp::Abs,
        AstOp::Exp => UnaryOp::Exp,
        AstOp::Ln => UnaryOp::Ln,
        AstOp::Log => UnaryOp::Log,
        AstOp::Ceiling => UnaryOp::Ceiling,
        AstOp::Floor => UnaryOp::Floor,
        AstOp::Sin => UnaryOp::Sin,
        AstOp::Cos => UnaryOp::Cos,
        AstOp::Tan => UnaryOp::Tan,
        AstOp::Sec => UnaryOp::Sec,
        AstOp::Csc => UnaryOp::Csc,
        AstOp::Cot => UnaryOp::Cot,
        AstOp::Sinh => UnaryOp::Sinh,
        AstOp::Cosh => UnaryOp::Cosh,
        AstOp::Tanh => UnaryOp::Tanh,
        AstOp::Sech => UnaryOp::Sech,
        AstOp::Csch => UnaryOp::Csch,
        AstOp::Coth => UnaryOp::Coth,
        AstOp::Asin => UnaryOp::Asin,
        AstOp::Acos => UnaryOp::Acos,
        AstOp::Atan => UnaryOp::Atan,
        AstOp::Asec => UnaryOp::Asec,
        AstOp::Acsc => UnaryOp::Acsc,
        AstOp::Acot => UnaryOp::Acot,
        AstOp::Asinh => UnaryOp::Asinh,
        AstOp::Acosh => UnaryOp::Acosh,
        AstOp::Atanh => UnaryOp::Atanh,
        AstOp::Asech => UnaryOp::Asech,
        AstOp::Acsch => UnaryOp::Acsch,
        AstOp::Acoth => UnaryOp::Acoth,
        _ => return None,
    };
    Some(unary)
}

fn binary_of(op: AstOp) -> BinaryOp {
    match op {
        AstOp::Eq => BinaryOp::Eq,
        AstOp::Neq => BinaryOp::Neq,
        AstOp::Lt => BinaryOp::Lt,
        AstOp::Leq => BinaryOp::Leq,
        AstOp::Gt => BinaryOp::Gt,
        AstOp::Geq => BinaryOp::Geq,
        AstOp::And => BinaryOp::And,
        AstOp::Or => BinaryOp::Or,
        AstOp::Xor => BinaryOp::Xor,
        AstOp::Plus => BinaryOp::Plus,
        AstOp::Minus => BinaryOp::Minus,
        AstOp::Times => BinaryOp::Times,
        AstOp::Divide => BinaryOp::Divide,
        AstOp::Power => BinaryOp::Power,
        AstOp::Min => BinaryOp::Min,
        AstOp::Max => BinaryOp::Max,
        AstOp::Rem => BinaryOp::Rem,
        // Unary kinds and minus are handled before this mapping.
        _ => BinaryOp::Plus,
    }
}

/// Emit the post-order instruction program of a lowered tree.
pub(crate) fn emit_rpn(arena: &EvalArena, id: EvalId, out: &mut Vec<Instr>) {
    match arena.node(id) {
        EvalNode::Number(value) => out.push(Instr::Number(*value)),
        EvalNode::Voi => out.push(Instr::Voi),
        EvalNode::Load(slot) => out.push(Instr::Load(*slot)),
        EvalNode::Unary { op, arg } => {
            emit_rpn(arena, *arg, out);
            out.push(Instr::Unary(*op));
        }
        EvalNode::Binary { op, lhs, rhs } => {
            emit_rpn(arena, *lhs, out);
            emit_rpn(arena, *rhs, out);
            out.push(Instr::Binary(*op));
        }
        EvalNode::Select {
            cond,
            then,
            otherwise,
        } => {
            emit_rpn(arena, *cond, out);
            emit_rpn(arena, *then, out);
            emit_rpn(arena, *otherwise, out);
            out.push(Instr::Select);
        }
    }
}

/// Derive the full stack program (target load, value, assign) of an
/// already-lowered right-hand side.
pub(crate) fn statement_from_tree(
    arena: &EvalArena,
    lhs: Slot,
    tree: EvalId,
) -> CompiledStatement {
    let mut rpn = vec![Instr::Load(lhs)];
    emit_rpn(arena, tree, &mut rpn);
    rpn.push(Instr::Assign);
    CompiledStatement { lhs, tree, rpn }
}

/// Compile an assignment statement: lower the right-hand side and derive
/// the full stack program.
pub(crate) fn compile_statement(
    src: &AstArena,
    rhs: NodeId,
    lhs: Slot,
    resolve: &impl Fn(&VarRef) -> Option<ResolvedRef>,
    resolve_rate: &impl Fn(&VarRef) -> Option<Slot>,
    out: &mut EvalArena,
) -> CompiledStatement {
    let tree = lower_expr(src, rhs, resolve, resolve_rate, out);
    statement_from_tree(out, lhs, tree)
}

/// Compile a bare right-hand side (nonlinear-subsystem member).
pub(crate) fn compile_value(
    src: &AstArena,
    rhs: NodeId,
    resolve: &impl Fn(&VarRef) -> Option<ResolvedRef>,
    resolve_rate: &impl Fn(&VarRef) -> Option<Slot>,
    out: &mut EvalArena,
) -> CompiledValue {
    let tree = lower_expr(src, rhs, resolve, resolve_rate, out);
    let mut rpn = Vec::new();
    emit_rpn(out, tree, &mut rpn);
    CompiledValue { tree, rpn }
}

/// Whether a compiled tree reads any external slot.
pub(crate) fn reads_external(arena: &EvalArena, id: EvalId) -> bool {
    match arena.node(id) {
        EvalNode::Number(_) | EvalNode::Voi => false,
        EvalNode::Load(slot) => slot.segment == Segment::External,
        EvalNode::Unary { arg, .. } => reads_external(arena, *arg),
        EvalNode::Binary { lhs, rhs, .. } => {
            reads_external(arena, *lhs) || reads_external(arena, *rhs)
        }
        EvalNode::Select {
            cond,
            then,
            otherwise,
        } => {
            reads_external(arena, *cond)
                || reads_external(arena, *then)
                || reads_external(arena, *otherwise)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ast::AstConstant;

    fn no_vars(_: &VarRef) -> Option<ResolvedRef> {
        None
    }

    fn no_rates(_: &VarRef) -> Option<Slot> {
        None
    }

    #[test]
    fn test_unary_and_binary_minus_are_distinct() {
        let mut src = AstArena::new();
        let one = src.number(1.0);
        let two = src.number(2.0);
        let neg = src.unary(AstOp::Minus, one);
        let sub = src.binary(AstOp::Minus, two, one);

        let mut out = EvalArena::new();
        let neg_id = lower_expr(&src, neg, &no_vars, &no_rates, &mut out);
        let sub_id = lower_expr(&src, sub, &no_vars, &no_rates, &mut out);

        assert!(matches!(
            out.node(neg_id),
            EvalNode::Unary {
                op: UnaryOp::Neg,
                ..
            }
        ));
        assert!(matches!(
            out.node(sub_id),
            EvalNode::Binary {
                op: BinaryOp::Minus,
                ..
            }
        ));
    }

    #[test]
    fn test_variadic_left_fold() {
        // plus(1, 2, 3) lowers to (1 + 2) + 3.
        let mut src = AstArena::new();
        let one = src.number(1.0);
        let two = src.number(2.0);
        let three = src.number(3.0);
        let sum = src.apply(AstOp::Plus, vec![one, two, three]);

        let mut out = EvalArena::new();
        let id = lower_expr(&src, sum, &no_vars, &no_rates, &mut out);

        match out.node(id) {
            EvalNode::Binary {
                op: BinaryOp::Plus,
                lhs,
                rhs,
            } => {
                assert!(matches!(
                    out.node(*lhs),
                    EvalNode::Binary {
                        op: BinaryOp::Plus,
                        ..
                    }
                ));
                assert!(matches!(out.node(*rhs), EvalNode::Number(v) if *v == 3.0));
            }
            other => panic!("expected binary plus, got {:?}", other),
        }
    }

    #[test]
    fn test_constants_lower_to_literals_in_both_forms() {
        let mut src = AstArena::new();
        let pi = src.constant(AstConstant::Pi);

        let mut out = EvalArena::new();
        let id = lower_expr(&src, pi, &no_vars, &no_rates, &mut out);
        assert!(
            matches!(out.node(id), EvalNode::Number(v) if *v == std::f64::consts::PI)
        );

        let mut rpn = Vec::new();
        emit_rpn(&out, id, &mut rpn);
        assert!(matches!(rpn[0], Instr::Number(v) if v == std::f64::consts::PI));
    }

    #[test]
    fn test_missing_otherwise_lowers_to_nan() {
        let mut src = AstArena::new();
        let cond = src.constant(AstConstant::False);
        let value = src.number(1.0);
        let pw = src.piecewise(
            vec![crate::model::ast::PiecewiseCase { cond, value }],
            None,
        );

        let mut out = EvalArena::new();
        let id = lower_expr(&src, pw, &no_vars, &no_rates, &mut out);
        match out.node(id) {
            EvalNode::Select { otherwise, .. } => {
                assert!(matches!(out.node(*otherwise), EvalNode::Number(v) if v.is_nan()));
            }
            other => panic!("expected select, got {:?}", other),
        }
    }

    #[test]
    fn test_statement_program_shape() {
        let mut src = AstArena::new();
        let one = src.number(1.0);
        let lhs = Slot::new(Segment::Algebraic, 0);

        let mut out = EvalArena::new();
        let compiled = compile_statement(&src, one, lhs, &no_vars, &no_rates, &mut out);

        assert!(matches!(compiled.rpn[0], Instr::Load(s) if s == lhs));
        assert!(matches!(compiled.rpn[1], Instr::Number(v) if v == 1.0));
        assert!(matches!(compiled.rpn[2], Instr::Assign));
    }

    #[test]
    fn test_kernel_boolean_results() {
        assert_eq!(BinaryOp::Lt.apply(1.0, 2.0), 1.0);
        assert_eq!(BinaryOp::Lt.apply(2.0, 1.0), 0.0);
        assert_eq!(BinaryOp::Eq.apply(f64::NAN, f64::NAN), 0.0);
        assert_eq!(BinaryOp::Neq.apply(f64::NAN, f64::NAN), 1.0);
        assert_eq!(BinaryOp::Xor.apply(3.0, 0.0), 1.0);
        assert_eq!(UnaryOp::Not.apply(0.0), 1.0);
        assert_eq!(UnaryOp::Not.apply(2.5), 0.0);
    }

    #[test]
    fn test_kernel_reciprocal_trig() {
        let x = 0.7;
        assert_eq!(UnaryOp::Sec.apply(x), 1.0 / x.cos());
        assert_eq!(UnaryOp::Asec.apply(x), (1.0 / x).acos());
        assert_eq!(UnaryOp::Acoth.apply(2.0), (1.0 / 2.0f64).atanh());
    }
}
