//! Transformer stages.
//!
//! Every stage answers `Init`, `Step` and `Result` with plain data and
//! `stage_step` directives, plus `TransformItems` for eager use over an
//! already materialized list. Counts and predicates are nodes, so a stage
//! recomputes when they change.

use super::drivers::transform_start;
use super::reducers::stage_step;
use crate::address::GraphNode;
use crate::dependency::{NodeDependency, Until};
use crate::engine::{DepsContext, RunContext};
use crate::error::NodeError;
use crate::node::{NodeDefinition, Prop, Props};
use crate::nodes::{control, data};
use crate::operation::{OpKind, Operation};
use crate::registry::{DepsFn, NodeType, Outcome, PropKind, Registry, RunFn};

pub const MAP: &str = "map";
pub const FILTER: &str = "filter";
pub const TAKE: &str = "take";
pub const SKIP: &str = "skip";
pub const TAKE_WHILE: &str = "take_while";
pub const FIRST: &str = "first";
pub const LAST: &str = "last";
pub const COUNT: &str = "count";

/// Apply the callable `f` to every item.
pub fn map(f: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(MAP, [("f", Prop::Node(f))])
}

/// Keep items for which the callable `predicate` is truthy.
pub fn filter(predicate: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(FILTER, [("f", Prop::Node(predicate))])
}

/// First `n` items; `n` is any node resolving to a number.
pub fn take(n: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(TAKE, [("n", Prop::Node(n))])
}

pub fn skip(n: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(SKIP, [("n", Prop::Node(n))])
}

pub fn take_while(predicate: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(TAKE_WHILE, [("f", Prop::Node(predicate))])
}

pub fn first() -> NodeDefinition {
    NodeDefinition::from_props(FIRST, Props::new())
}

pub fn last() -> NodeDefinition {
    NodeDefinition::from_props(LAST, Props::new())
}

/// Emits a single item: the number of items seen.
pub fn count() -> NodeDefinition {
    NodeDefinition::from_props(COUNT, Props::new())
}

fn counter(definition: &NodeDefinition) -> Result<f64, NodeError> {
    definition
        .to_value()
        .and_then(|value| value.as_number())
        .ok_or_else(|| NodeError::mismatch("step", "a number", format!("{definition:?}")))
}

fn truthy(result: &GraphNode) -> bool {
    result
        .definition
        .to_value()
        .is_some_and(|value| value.is_truthy())
}

fn step_parts(op: &Operation) -> Result<(&NodeDefinition, &NodeDefinition), NodeError> {
    match op {
        Operation::Step { acc, item } => Ok((acc, item)),
        other => Err(NodeError::custom(format!("expected `step`, received `{}`", other.name()))),
    }
}

fn result_state(op: &Operation) -> Result<&NodeDefinition, NodeError> {
    match op {
        Operation::Result(acc) => Ok(acc),
        other => Err(NodeError::custom(format!("expected `result`, received `{}`", other.name()))),
    }
}

fn init_nil(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(data::nil()))
}

fn init_zero(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(data::value(0.0)))
}

fn init_empty(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(data::list(Vec::new())))
}

/// Flush nothing, keep state.
fn result_plain(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let state = result_state(op)?.clone();
    Ok(Outcome::Done(stage_step(state, Vec::new(), true)))
}

/// Step dependency on the stage's callable applied to the item.
fn apply_deps(cx: &DepsContext<'_>, op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let (_, item) = step_parts(op)?;
    let f = cx.definition().node_prop("f")?.clone();
    Ok(vec![NodeDependency::new(control::apply(f, [item.clone()]))])
}

fn count_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let n = cx.definition().node_prop("n")?.clone();
    Ok(vec![NodeDependency::new(n)])
}

fn map_step(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(stage_step(
        data::nil(),
        [deps[0].definition.clone()],
        false,
    )))
}

fn filter_step(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (_, item) = step_parts(op)?;
    let kept = truthy(&deps[0]).then(|| item.clone());
    Ok(Outcome::Done(stage_step(data::nil(), kept, false)))
}

fn take_while_step(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (_, item) = step_parts(op)?;
    Ok(Outcome::Done(if truthy(&deps[0]) {
        stage_step(data::nil(), [item.clone()], false)
    } else {
        stage_step(data::nil(), Vec::new(), true)
    }))
}

fn take_step(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (acc, item) = step_parts(op)?;
    let limit = counter(&deps[0].definition)?;
    let seen = counter(acc)? + 1.0;
    let forwarded = (seen <= limit).then(|| item.clone());
    Ok(Outcome::Done(stage_step(
        data::value(seen),
        forwarded,
        seen >= limit,
    )))
}

fn skip_step(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (acc, item) = step_parts(op)?;
    let offset = counter(&deps[0].definition)?;
    let skipped = counter(acc)?;
    Ok(Outcome::Done(if skipped < offset {
        stage_step(data::value(skipped + 1.0), Vec::new(), false)
    } else {
        stage_step(acc.clone(), [item.clone()], false)
    }))
}

fn first_step(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (_, item) = step_parts(op)?;
    Ok(Outcome::Done(stage_step(data::nil(), [item.clone()], true)))
}

fn last_step(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (_, item) = step_parts(op)?;
    Ok(Outcome::Done(stage_step(
        data::list([item.clone()]),
        Vec::new(),
        false,
    )))
}

fn last_result(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let state = result_state(op)?;
    let held = data::items_of(state).unwrap_or_default().to_vec();
    Ok(Outcome::Done(stage_step(data::nil(), held, true)))
}

fn count_step(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (acc, _) = step_parts(op)?;
    let seen = counter(acc)? + 1.0;
    Ok(Outcome::Done(stage_step(data::value(seen), Vec::new(), false)))
}

fn count_result(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let state = result_state(op)?.clone();
    Ok(Outcome::Done(stage_step(data::nil(), [state], true)))
}

/// Eager use of a stage: initialise it, then run `transform_start` over the items.
fn transform_items_deps(
    cx: &DepsContext<'_>,
    _op: &Operation,
) -> Result<Vec<NodeDependency>, NodeError> {
    Ok(vec![NodeDependency::node(cx.node().clone())
        .operation(Operation::Init)
        .until(Until::Static)])
}

fn transform_items_run(
    cx: &mut RunContext<'_>,
    op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Operation::TransformItems(items) = op else {
        return Err(NodeError::custom("expected `transformItems`"));
    };
    Ok(Outcome::Done(transform_start(
        cx.definition().clone(),
        deps[0].definition.clone(),
        items.clone(),
    )))
}

fn stage(
    tag: &'static str,
    init: RunFn,
    step: (Option<DepsFn>, RunFn),
    result: RunFn,
) -> NodeType {
    let ty = NodeType::new(tag)
        .run(OpKind::Init, init)
        .run(OpKind::Result, result)
        .handler(OpKind::TransformItems, transform_items_deps, transform_items_run);
    match step {
        (Some(deps), run) => ty.handler(OpKind::Step, deps, run),
        (None, run) => ty.run(OpKind::Step, run),
    }
}

pub(crate) fn register(registry: &mut Registry) {
    let with_f = |ty: NodeType| ty.prop("f", PropKind::Node);
    let with_n = |ty: NodeType| ty.prop("n", PropKind::Node);
    registry
        .register(with_f(stage(MAP, init_nil, (Some(apply_deps), map_step), result_plain)))
        .register(with_f(stage(
            FILTER,
            init_nil,
            (Some(apply_deps), filter_step),
            result_plain,
        )))
        .register(with_f(stage(
            TAKE_WHILE,
            init_nil,
            (Some(apply_deps), take_while_step),
            result_plain,
        )))
        .register(with_n(stage(TAKE, init_zero, (Some(count_deps), take_step), result_plain)))
        .register(with_n(stage(SKIP, init_zero, (Some(count_deps), skip_step), result_plain)))
        .register(stage(FIRST, init_nil, (None, first_step), result_plain))
        .register(stage(LAST, init_empty, (None, last_step), last_result))
        .register(stage(COUNT, init_zero, (None, count_step), count_result));
}
