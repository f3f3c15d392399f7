//! Stateful nodes and the mutation actions that target them.
//!
//! State lives in the per-instance table, so two handles to the same
//! (definition, scope, context) share one value and a mutation through
//! either is observed by both.

use super::data;
use crate::address::GraphNode;
use crate::dependency::{NodeDependency, Until};
use crate::engine::{DepsContext, RunContext};
use crate::error::NodeError;
use crate::node::{NodeDefinition, Prop};
use crate::operation::{OpKind, Operation};
use crate::registry::{NodeType, Outcome, PropKind, Registry, StateSpec};
use crate::transduce;
use std::any::Any;
use std::rc::Rc;

pub const VARIABLE: &str = "variable";
pub const MUTABLE_LIST: &str = "mutable_list";

pub const SET: &str = "set";
pub const RESET: &str = "reset";
pub const PUSH: &str = "push";
pub const POP: &str = "pop";
pub const SHIFT: &str = "shift";
pub const UNSHIFT: &str = "unshift";
pub const CLEAR: &str = "clear";

pub fn variable(initial: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(VARIABLE, [("initial", Prop::Node(initial))])
}

pub fn mutable_list(items: impl IntoIterator<Item = NodeDefinition>) -> NodeDefinition {
    NodeDefinition::new(MUTABLE_LIST, [("items", Prop::nodes(items))])
}

pub fn set(target: NodeDefinition, value: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        SET,
        [("target", Prop::Node(target)), ("value", Prop::Node(value))],
    )
}

pub fn reset(target: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(RESET, [("target", Prop::Node(target))])
}

pub fn push(
    target: NodeDefinition,
    items: impl IntoIterator<Item = NodeDefinition>,
) -> NodeDefinition {
    NodeDefinition::new(
        PUSH,
        [("target", Prop::Node(target)), ("items", Prop::nodes(items))],
    )
}

pub fn pop(target: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(POP, [("target", Prop::Node(target))])
}

pub fn shift(target: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(SHIFT, [("target", Prop::Node(target))])
}

pub fn unshift(
    target: NodeDefinition,
    items: impl IntoIterator<Item = NodeDefinition>,
) -> NodeDefinition {
    NodeDefinition::new(
        UNSHIFT,
        [("target", Prop::Node(target)), ("items", Prop::nodes(items))],
    )
}

pub fn clear(target: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(CLEAR, [("target", Prop::Node(target))])
}

/// `None` until the first `set`; `reset` goes back to the initial node.
#[derive(Default)]
struct VariableState {
    current: Option<NodeDefinition>,
}

struct ListState {
    items: Vec<NodeDefinition>,
}

fn variable_state(_definition: &NodeDefinition) -> Result<Box<dyn Any>, NodeError> {
    Ok(Box::new(VariableState::default()))
}

fn list_state(definition: &NodeDefinition) -> Result<Box<dyn Any>, NodeError> {
    Ok(Box::new(ListState {
        items: definition.nodes_prop("items")?.to_vec(),
    }))
}

fn variable_evaluate(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let current = cx.with_state(|state: &VariableState| state.current.clone())?;
    match current {
        Some(value) => Ok(Outcome::Done(value)),
        None => Ok(Outcome::Done(cx.definition().node_prop("initial")?.clone())),
    }
}

fn variable_set(
    cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Operation::Set(value) = op else {
        return Err(unexpected(op));
    };
    let stored = value.clone();
    cx.update_state(|state: &mut VariableState| state.current = Some(stored))?;
    log::debug!("set {:?} to {:?}", cx.node(), value);
    Ok(Outcome::Done(value.clone()))
}

fn variable_reset(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    cx.update_state(|state: &mut VariableState| state.current = None)?;
    Ok(Outcome::Done(cx.definition().node_prop("initial")?.clone()))
}

fn current_items(cx: &mut RunContext<'_>) -> Result<Vec<NodeDefinition>, NodeError> {
    cx.with_state(|state: &ListState| state.items.clone())
}

fn list_evaluate(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(data::list(current_items(cx)?)))
}

fn list_length(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let len = cx.with_state(|state: &ListState| state.items.len())?;
    Ok(Outcome::Done(data::value(len as f64)))
}

fn list_iterate(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let items = data::list(current_items(cx)?);
    Ok(Outcome::Done(transduce::list_cursor(items, 0)))
}

fn list_mutate(
    cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let initial = cx.definition().nodes_prop("items")?.to_vec();
    let outcome = cx.update_state(|state: &mut ListState| match op {
        Operation::Push(items) => {
            state.items.extend(items.iter().cloned());
            Ok(data::list(state.items.clone()))
        }
        Operation::Unshift(items) => {
            state.items.splice(0..0, items.iter().cloned());
            Ok(data::list(state.items.clone()))
        }
        Operation::Pop => Ok(state.items.pop().unwrap_or_else(data::nil)),
        Operation::Shift => Ok(if state.items.is_empty() {
            data::nil()
        } else {
            state.items.remove(0)
        }),
        Operation::Clear => {
            state.items.clear();
            Ok(data::list(Vec::new()))
        }
        Operation::Reset => {
            state.items = initial;
            Ok(data::list(state.items.clone()))
        }
        Operation::Set(value) => match data::items_of(value) {
            Some(items) => {
                state.items = items.to_vec();
                Ok(value.clone())
            }
            None => Err(NodeError::mismatch(
                op.name(),
                "a list",
                format!("`{}`", value.tag()),
            )),
        },
        other => Err(unexpected(other)),
    })??;
    log::debug!("{} on {:?}", op.name(), cx.node());
    Ok(Outcome::Done(outcome))
}

fn unexpected(op: &Operation) -> NodeError {
    NodeError::custom(format!("unexpected operation `{}`", op.name()))
}

fn mutation_kind(tag: &str) -> Option<OpKind> {
    Some(match tag {
        SET => OpKind::Set,
        RESET => OpKind::Reset,
        PUSH => OpKind::Push,
        POP => OpKind::Pop,
        SHIFT => OpKind::Shift,
        UNSHIFT => OpKind::Unshift,
        CLEAR => OpKind::Clear,
        _ => return None,
    })
}

/// Target first, then every argument resolved to static data.
fn action_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let kind = mutation_kind(definition.tag())
        .ok_or_else(|| NodeError::UnknownType(definition.tag().into()))?;
    let target = definition.node_prop("target")?.clone();
    let mut deps = vec![NodeDependency::new(target).until(Until::Supports(kind))];
    let arguments: Vec<NodeDefinition> = match definition.prop("value") {
        Some(_) => vec![definition.node_prop("value")?.clone()],
        None if definition.prop("items").is_some() => definition.nodes_prop("items")?.to_vec(),
        None => Vec::new(),
    };
    deps.extend(
        arguments
            .into_iter()
            .map(|argument| NodeDependency::new(argument).operation(Operation::Resolve)),
    );
    Ok(deps)
}

fn action_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (target, arguments) = deps
        .split_first()
        .ok_or_else(|| NodeError::custom("mutation without a target"))?;
    let arguments: Rc<Vec<NodeDefinition>> =
        Rc::new(arguments.iter().map(|arg| arg.definition.clone()).collect());
    let operation = match cx.definition().tag() {
        SET => Operation::Set(
            arguments
                .first()
                .cloned()
                .ok_or_else(|| NodeError::custom("`set` without a value"))?,
        ),
        RESET => Operation::Reset,
        PUSH => Operation::Push(arguments),
        POP => Operation::Pop,
        SHIFT => Operation::Shift,
        UNSHIFT => Operation::Unshift(arguments),
        CLEAR => Operation::Clear,
        other => return Err(NodeError::UnknownType(other.into())),
    };
    Ok(Outcome::Delegate(target.clone(), operation))
}

pub(crate) fn register(registry: &mut Registry) {
    registry
        .register(
            NodeType::new(VARIABLE)
                .prop("initial", PropKind::Node)
                .state(StateSpec::new(variable_state))
                .run(OpKind::Evaluate, variable_evaluate)
                .run(OpKind::Set, variable_set)
                .run(OpKind::Reset, variable_reset),
        )
        .register(
            NodeType::new(MUTABLE_LIST)
                .prop("items", PropKind::Nodes)
                .state(StateSpec::new(list_state))
                .run(OpKind::Evaluate, list_evaluate)
                .run(OpKind::GetItems, list_evaluate)
                .run(OpKind::Length, list_length)
                .run(OpKind::Iterate, list_iterate)
                .run(OpKind::Set, list_mutate)
                .run(OpKind::Reset, list_mutate)
                .run(OpKind::Push, list_mutate)
                .run(OpKind::Pop, list_mutate)
                .run(OpKind::Shift, list_mutate)
                .run(OpKind::Unshift, list_mutate)
                .run(OpKind::Clear, list_mutate),
        );
    for tag in [SET, RESET, PUSH, POP, SHIFT, UNSHIFT, CLEAR] {
        let mut ty = NodeType::new(tag).prop("target", PropKind::Node);
        ty = match tag {
            SET => ty.prop("value", PropKind::Node),
            PUSH | UNSHIFT => ty.prop("items", PropKind::Nodes),
            _ => ty,
        };
        registry.register(ty.one_shot().handler(OpKind::Evaluate, action_deps, action_run));
    }
}
