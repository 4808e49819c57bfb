//! The source model: the in-memory form this engine analyses.
//!
//! A [`Model`] is what an upstream markup parser (out of scope here) hands
//! over once imports and connections have been resolved: named components in
//! declaration order, each holding variable declarations, explicit
//! initialisations, and assignment-form equations whose right-hand sides
//! live in a model-wide expression arena.

pub mod ast;

use indexmap::IndexMap;
use serde::Serialize;

use ast::{AstArena, NodeId, VarRef};

/// Interface direction of a declared variable, as recorded by the markup.
///
/// Connection resolution happens upstream; the direction is carried through
/// for back-ends that want to report it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Interface {
    #[default]
    None,
    Public,
    Private,
    PublicAndPrivate,
}

/// A variable declaration: a name, a units reference and an interface
/// direction. Values come from initialisations, equations, or the calling
/// environment, never from the declaration itself.
#[derive(Clone, Debug, Serialize)]
pub struct VariableDecl {
    pub name: String,
    pub units: String,
    pub interface: Interface,
}

/// The value of an explicit initialisation: a literal, or a reference to
/// another variable (which must analyse as a constant).
#[derive(Clone, Debug, Serialize)]
pub enum InitialValue {
    Literal(f64),
    Reference(VarRef),
}

/// An explicit initial-value assignment for one variable.
///
/// Initialisations are kept as a list rather than folded into the
/// declaration so that a doubly-initialised variable is expressible and can
/// be reported during analysis.
#[derive(Clone, Debug, Serialize)]
pub struct Initialisation {
    pub target: String,
    pub value: InitialValue,
}

/// The target of an equation: a plain variable, or the derivative of a
/// state with respect to a bound variable.
#[derive(Clone, Debug, Serialize)]
pub enum EquationTarget {
    Variable(VarRef),
    Derivative {
        bound: VarRef,
        state: VarRef,
        order: u32,
    },
}

/// One assignment-form equation: a target and a right-hand side tree.
#[derive(Clone, Debug, Serialize)]
pub struct Equation {
    pub target: EquationTarget,
    pub rhs: NodeId,
}

impl Equation {
    /// An algebraic assignment `component.name = rhs`.
    pub fn assign(component: &str, name: &str, rhs: NodeId) -> Self {
        Self {
            target: EquationTarget::Variable(VarRef::new(component, name)),
            rhs,
        }
    }

    /// A first-order ODE `d state / d bound = rhs`.
    pub fn ode(bound: VarRef, state: VarRef, rhs: NodeId) -> Self {
        Self {
            target: EquationTarget::Derivative {
                bound,
                state,
                order: 1,
            },
            rhs,
        }
    }
}

/// A named component: variable declarations, initialisations and equations,
/// all in declaration order.
#[derive(Clone, Debug, Serialize)]
pub struct Component {
    pub name: String,
    pub(crate) variables: IndexMap<String, VariableDecl>,
    pub(crate) initialisations: Vec<Initialisation>,
    pub(crate) equations: Vec<Equation>,
}

impl Component {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            variables: IndexMap::new(),
            initialisations: Vec::new(),
            equations: Vec::new(),
        }
    }

    /// Declare a variable with default (no) interface direction.
    pub fn variable(&mut self, name: &str, units: &str) -> &mut Self {
        self.variable_with_interface(name, units, Interface::None)
    }

    pub fn variable_with_interface(
        &mut self,
        name: &str,
        units: &str,
        interface: Interface,
    ) -> &mut Self {
        self.variables.insert(
            name.to_string(),
            VariableDecl {
                name: name.to_string(),
                units: units.to_string(),
                interface,
            },
        );
        self
    }

    /// Record an explicit initial value for `name`.
    pub fn initialise(&mut self, name: &str, value: InitialValue) -> &mut Self {
        self.initialisations.push(Initialisation {
            target: name.to_string(),
            value,
        });
        self
    }

    pub fn add_equation(&mut self, equation: Equation) -> &mut Self {
        self.equations.push(equation);
        self
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariableDecl> {
        self.variables.values()
    }

    pub fn initialisations(&self) -> &[Initialisation] {
        &self.initialisations
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }
}

/// An in-memory model: components in declaration order plus the expression
/// arena all equation trees live in.
#[derive(Clone, Debug, Serialize)]
pub struct Model {
    pub name: String,
    pub(crate) arena: AstArena,
    pub(crate) components: IndexMap<String, Component>,
}

impl Model {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            arena: AstArena::new(),
            components: IndexMap::new(),
        }
    }

    /// Add (or fetch) a component and return it for population.
    pub fn component(&mut self, name: &str) -> &mut Component {
        self.components
            .entry(name.to_string())
            .or_insert_with(|| Component::new(name))
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn arena(&self) -> &AstArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut AstArena {
        &mut self.arena
    }
}
