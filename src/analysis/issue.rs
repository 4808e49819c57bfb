//! Analysis issues.
//!
//! Issues are data, not control flow: analysis always runs to completion and
//! collects everything it finds into a severity-tagged list. Only
//! error-severity issues block evaluation; a model with warnings alone can
//! still drive an interpreter.

use serde::Serialize;

/// How serious an issue is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// The model cannot be evaluated while this issue stands.
    Error,
    /// Worth reporting, but evaluation may proceed.
    Warning,
}

/// The kind of an analysis issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    /// More than one candidate variable of integration.
    VoiSeveral,
    /// The variable of integration has an initial value.
    VoiInitialised,
    /// The variable of integration is the target of an equation.
    VoiComputed,
    /// A derivative of order other than one.
    OdeNotFirstOrder,
    /// A state with no initial value.
    StateNotInitialised,
    /// A variable targeted by more than one equation.
    VariableComputedMoreThanOnce,
    /// A variable with more than one explicit initialisation.
    VariableInitialisedMoreThanOnce,
    /// An initial value referencing a non-constant variable.
    NonConstantInitialisation,
    /// A variable with no equation, no initial value and no external
    /// binding.
    VariableUnused,
    /// The variable of integration was flagged as external.
    ExternalVariableVoi,
    /// A state was flagged as external.
    ExternalVariableState,
    /// An external flag names an undeclared variable.
    ExternalVariableUnknown,
    /// A dependency cycle that cannot be packaged as a nonlinear subsystem.
    EquationCyclicDependency,
    /// A reference to an undeclared variable.
    UndefinedVariable,
    /// A malformed expression, e.g. an operator applied to the wrong number
    /// of arguments.
    InvalidArgument,
}

/// One analysis issue: kind, severity and a human-readable description
/// naming the offending component or variable.
#[derive(Clone, Debug, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
}

impl Issue {
    pub fn error(kind: IssueKind, description: String) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            description,
        }
    }

    pub fn warning(kind: IssueKind, description: String) -> Self {
        Self {
            kind,
            severity: Severity::Warning,
            description,
        }
    }
}

/// The issues collected by one analysis run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Issues {
    issues: Vec<Issue>,
}

impl Issues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Whether any issue blocks evaluation.
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_filtering() {
        let mut issues = Issues::new();
        issues.push(Issue::warning(
            IssueKind::VariableUnused,
            "variable 'main.x' is unused".to_string(),
        ));
        assert!(!issues.has_errors());
        assert_eq!(issues.warnings().count(), 1);

        issues.push(Issue::error(
            IssueKind::VoiSeveral,
            "several variables of integration".to_string(),
        ));
        assert!(issues.has_errors());
        assert_eq!(issues.errors().count(), 1);
        assert_eq!(issues.len(), 2);
    }
}
