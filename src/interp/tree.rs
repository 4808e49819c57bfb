//! Tree-walk evaluation.
//!
//! Recursive evaluation of a lowered tree against live buffers. Operator
//! semantics come from the same kernels the stack machine uses, so the two
//! forms cannot drift apart.

use super::compile::{truthy, EvalArena, EvalId, EvalNode};
use super::{Buffers, EvalState};

pub(crate) fn eval(
    arena: &EvalArena,
    id: EvalId,
    st: &mut EvalState,
    ext: &mut dyn FnMut(f64, &Buffers, usize) -> f64,
) -> f64 {
    match arena.node(id) {
        EvalNode::Number(value) => *value,
        EvalNode::Voi => st.voi,
        EvalNode::Load(slot) => st.read_slot(*slot, ext),
        EvalNode::Unary { op, arg } => {
            let x = eval(arena, *arg, st, ext);
            op.apply(x)
        }
        EvalNode::Binary { op, lhs, rhs } => {
            let a = eval(arena, *lhs, st, ext);
            let b = eval(arena, *rhs, st, ext);
            op.apply(a, b)
        }
        EvalNode::Select {
            cond,
            then,
            otherwise,
        } => {
            let cond = eval(arena, *cond, st, ext);
            let then = eval(arena, *then, st, ext);
            let otherwise = eval(arena, *otherwise, st, ext);
            if truthy(cond) {
                then
            } else {
                otherwise
            }
        }
    }
}
