//! Expression trees for model mathematics.
//!
//! Expressions live in a per-model arena and are addressed by [`NodeId`].
//! Nodes never point back at their parents, so equation trees are acyclic by
//! construction and the arena can be walked without reference counting.

use serde::Serialize;

/// Index of a node in an [`AstArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(pub(crate) u32);

/// A reference to a declared variable, by component and variable name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct VarRef {
    pub component: String,
    pub name: String,
}

impl VarRef {
    pub fn new(component: &str, name: &str) -> Self {
        Self {
            component: component.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for VarRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.component, self.name)
    }
}

/// Named mathematical constants that may appear as leaf nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum AstConstant {
    Pi,
    E,
    True,
    False,
    Inf,
    NaN,
}

impl AstConstant {
    /// The IEEE-754 value the constant lowers to. Booleans are 1.0/0.0.
    pub fn value(self) -> f64 {
        match self {
            AstConstant::Pi => std::f64::consts::PI,
            AstConstant::E => std::f64::consts::E,
            AstConstant::True => 1.0,
            AstConstant::False => 0.0,
            AstConstant::Inf => f64::INFINITY,
            AstConstant::NaN => f64::NAN,
        }
    }
}

/// Operator kinds.
///
/// Relational and logical operators yield 1.0/0.0. `Minus` is unary or
/// binary; `And`, `Or`, `Xor`, `Plus`, `Times`, `Min` and `Max` accept two
/// or more arguments and are folded left-to-right when lowered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum AstOp {
    // Relational and logical operators.
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    And,
    Or,
    Xor,
    Not,

    // Arithmetic operators.
    Plus,
    Minus,
    Times,
    Divide,
    Power,
    Sqrt,
    Abs,
    Exp,
    Ln,
    Log,
    Ceiling,
    Floor,
    Min,
    Max,
    Rem,

    // Trigonometric operators.
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

/// Argument-count contract of an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Unary,
    Binary,
    /// Unary or binary, with distinct semantics (minus).
    UnaryOrBinary,
    /// Two or more arguments, folded left-to-right.
    Variadic,
}

impl AstOp {
    pub fn arity(self) -> Arity {
        use AstOp::*;
        match self {
            Eq | Neq | Lt | Leq | Gt | Geq | Divide | Power | Rem => Arity::Binary,
            And | Or | Xor | Plus | Times | Min | Max => Arity::Variadic,
            Minus => Arity::UnaryOrBinary,
            _ => Arity::Unary,
        }
    }

    /// Whether an application with `n` arguments is well-formed.
    pub fn accepts(self, n: usize) -> bool {
        match self.arity() {
            Arity::Unary => n == 1,
            Arity::Binary => n == 2,
            Arity::UnaryOrBinary => n == 1 || n == 2,
            Arity::Variadic => n >= 2,
        }
    }
}

/// One branch of a piecewise expression.
#[derive(Clone, Debug, Serialize)]
pub struct PiecewiseCase {
    pub cond: NodeId,
    pub value: NodeId,
}

/// A node of an expression tree.
#[derive(Clone, Debug, Serialize)]
pub enum AstNode {
    /// A number literal.
    Number(f64),
    /// A named constant.
    Constant(AstConstant),
    /// A reference to a declared variable.
    Variable(VarRef),
    /// A first-order derivative of `state` with respect to `bound`, used on
    /// the right-hand side of an equation. On a left-hand side the
    /// derivative is an equation target, never an expression node.
    Derivative {
        bound: VarRef,
        state: VarRef,
        order: u32,
    },
    /// An operator applied to one or more arguments.
    Apply { op: AstOp, args: Vec<NodeId> },
    /// A piecewise expression. Yields NaN when no case matches and there is
    /// no `otherwise`.
    Piecewise {
        cases: Vec<PiecewiseCase>,
        otherwise: Option<NodeId>,
    },
}

/// Arena holding every expression node of a model.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AstArena {
    nodes: Vec<AstNode>,
}

impl AstArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: AstNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &AstNode {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn number(&mut self, value: f64) -> NodeId {
        self.push(AstNode::Number(value))
    }

    pub fn constant(&mut self, constant: AstConstant) -> NodeId {
        self.push(AstNode::Constant(constant))
    }

    pub fn variable(&mut self, component: &str, name: &str) -> NodeId {
        self.push(AstNode::Variable(VarRef::new(component, name)))
    }

    pub fn derivative(&mut self, bound: VarRef, state: VarRef) -> NodeId {
        self.push(AstNode::Derivative {
            bound,
            state,
            order: 1,
        })
    }

    pub fn apply(&mut self, op: AstOp, args: Vec<NodeId>) -> NodeId {
        self.push(AstNode::Apply { op, args })
    }

    pub fn binary(&mut self, op: AstOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.apply(op, vec![lhs, rhs])
    }

    pub fn unary(&mut self, op: AstOp, arg: NodeId) -> NodeId {
        self.apply(op, vec![arg])
    }

    pub fn piecewise(&mut self, cases: Vec<PiecewiseCase>, otherwise: Option<NodeId>) -> NodeId {
        self.push(AstNode::Piecewise { cases, otherwise })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_roundtrip() {
        let mut arena = AstArena::new();
        let one = arena.number(1.0);
        let x = arena.variable("main", "x");
        let sum = arena.binary(AstOp::Plus, x, one);

        assert_eq!(arena.len(), 3);
        match arena.node(sum) {
            AstNode::Apply { op, args } => {
                assert_eq!(*op, AstOp::Plus);
                assert_eq!(args, &vec![x, one]);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_arity_contracts() {
        assert!(AstOp::Minus.accepts(1));
        assert!(AstOp::Minus.accepts(2));
        assert!(!AstOp::Minus.accepts(3));

        assert!(AstOp::Plus.accepts(4));
        assert!(!AstOp::Plus.accepts(1));

        assert!(AstOp::Not.accepts(1));
        assert!(!AstOp::Not.accepts(2));

        assert!(AstOp::Power.accepts(2));
        assert!(!AstOp::Power.accepts(1));
    }

    #[test]
    fn test_constant_values() {
        assert_eq!(AstConstant::True.value(), 1.0);
        assert_eq!(AstConstant::False.value(), 0.0);
        assert!(AstConstant::NaN.value().is_nan());
        assert!(AstConstant::Inf.value().is_infinite());
        assert_eq!(AstConstant::Pi.value(), std::f64::consts::PI);
    }
}
