//! Advice - structural edits to a route definition
//!
//! An `AdviceWith` is an ordered batch of edits (replace, remove, insert,
//! prepend, append) addressed by step id or textual form. Edits search
//! depth-first in declaration order, descending into filter, choice, fan-out
//! and do-try bodies. The whole batch is validated against a copy of the
//! definition, so an unmatched selector rejects the batch without touching
//! the live route.

use crate::error::EngineError;
use crate::route::{RouteDefinition, StepDefinition, StepKind};
use std::fmt;

/// Addresses one step in a route definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSelector {
    /// Match the author-assigned step id.
    ById(String),
    /// Match the step's textual form, e.g. `to(mock:out)`.
    ByRepr(String),
}

impl StepSelector {
    pub fn id(id: impl Into<String>) -> Self {
        StepSelector::ById(id.into())
    }

    pub fn repr(repr: impl Into<String>) -> Self {
        StepSelector::ByRepr(repr.into())
    }

    fn matches(&self, step: &StepDefinition) -> bool {
        match self {
            StepSelector::ById(id) => step.id() == Some(id.as_str()),
            StepSelector::ByRepr(repr) => step.repr() == *repr,
        }
    }
}

impl fmt::Display for StepSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepSelector::ById(id) => write!(f, "id '{}'", id),
            StepSelector::ByRepr(repr) => write!(f, "step '{}'", repr),
        }
    }
}

enum AdviceOp {
    Replace(StepSelector, StepDefinition),
    Remove(StepSelector),
    InsertBefore(StepSelector, StepDefinition),
    InsertAfter(StepSelector, StepDefinition),
    Prepend(StepDefinition),
    Append(StepDefinition),
}

/// An ordered batch of route edits.
#[derive(Default)]
pub struct AdviceWith {
    ops: Vec<AdviceOp>,
}

impl AdviceWith {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(mut self, selector: StepSelector, step: StepDefinition) -> Self {
        self.ops.push(AdviceOp::Replace(selector, step));
        self
    }

    pub fn remove(mut self, selector: StepSelector) -> Self {
        self.ops.push(AdviceOp::Remove(selector));
        self
    }

    pub fn insert_before(mut self, selector: StepSelector, step: StepDefinition) -> Self {
        self.ops.push(AdviceOp::InsertBefore(selector, step));
        self
    }

    pub fn insert_after(mut self, selector: StepSelector, step: StepDefinition) -> Self {
        self.ops.push(AdviceOp::InsertAfter(selector, step));
        self
    }

    pub fn prepend(mut self, step: StepDefinition) -> Self {
        self.ops.push(AdviceOp::Prepend(step));
        self
    }

    pub fn append(mut self, step: StepDefinition) -> Self {
        self.ops.push(AdviceOp::Append(step));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every edit to a copy of the definition. Fails on the first
    /// unmatched selector, leaving the input untouched.
    pub fn apply(&self, definition: &RouteDefinition) -> Result<RouteDefinition, EngineError> {
        let mut edited = definition.clone();
        for op in &self.ops {
            match op {
                AdviceOp::Replace(selector, step) => {
                    self.apply_selector(&mut edited, selector, &Edit::Replace(step))?
                }
                AdviceOp::Remove(selector) => {
                    self.apply_selector(&mut edited, selector, &Edit::Remove)?
                }
                AdviceOp::InsertBefore(selector, step) => {
                    self.apply_selector(&mut edited, selector, &Edit::InsertBefore(step))?
                }
                AdviceOp::InsertAfter(selector, step) => {
                    self.apply_selector(&mut edited, selector, &Edit::InsertAfter(step))?
                }
                AdviceOp::Prepend(step) => edited.steps.insert(0, step.clone()),
                AdviceOp::Append(step) => edited.steps.push(step.clone()),
            }
        }
        Ok(edited)
    }

    fn apply_selector(
        &self,
        definition: &mut RouteDefinition,
        selector: &StepSelector,
        edit: &Edit<'_>,
    ) -> Result<(), EngineError> {
        if apply_in(&mut definition.steps, selector, edit) {
            Ok(())
        } else {
            Err(EngineError::StepNotFound {
                route_id: definition.id.clone(),
                selector: selector.to_string(),
            })
        }
    }
}

enum Edit<'a> {
    Replace(&'a StepDefinition),
    Remove,
    InsertBefore(&'a StepDefinition),
    InsertAfter(&'a StepDefinition),
}

fn apply_in(steps: &mut Vec<StepDefinition>, selector: &StepSelector, edit: &Edit<'_>) -> bool {
    if let Some(position) = steps.iter().position(|step| selector.matches(step)) {
        match edit {
            Edit::Replace(step) => steps[position] = (*step).clone(),
            Edit::Remove => {
                steps.remove(position);
            }
            Edit::InsertBefore(step) => steps.insert(position, (*step).clone()),
            Edit::InsertAfter(step) => steps.insert(position + 1, (*step).clone()),
        }
        return true;
    }

    for step in steps.iter_mut() {
        for nested in nested_step_lists(step) {
            if apply_in(nested, selector, edit) {
                return true;
            }
        }
    }
    false
}

fn nested_step_lists(step: &mut StepDefinition) -> Vec<&mut Vec<StepDefinition>> {
    match &mut step.kind {
        StepKind::Filter { steps, .. } | StepKind::Split { steps, .. } => vec![steps],
        StepKind::Choice {
            branches,
            otherwise,
        } => {
            let mut lists: Vec<&mut Vec<StepDefinition>> =
                branches.iter_mut().map(|branch| &mut branch.steps).collect();
            if let Some(otherwise) = otherwise {
                lists.push(otherwise);
            }
            lists
        }
        StepKind::Multicast { branches, .. } => branches.iter_mut().collect(),
        StepKind::DoTry {
            steps,
            catches,
            finally,
        } => {
            let mut lists: Vec<&mut Vec<StepDefinition>> = vec![steps];
            lists.extend(catches.iter_mut().map(|clause| &mut clause.steps));
            if let Some(finally) = finally {
                lists.push(finally);
            }
            lists
        }
        StepKind::Process { .. }
        | StepKind::SetBody { .. }
        | StepKind::SetHeader { .. }
        | StepKind::RecipientList { .. }
        | StepKind::To(_) => Vec::new(),
    }
}
