//! Drivers running a transformer chain over a source.
//!
//! `transduce` pulls one item at a time from a lazy cursor and pushes it
//! through the combined reducer, stopping as soon as the reducer reports
//! `reduced`. `transform_items` materializes the source first and lets each
//! stage transform the whole list. Both speak the same stage protocol, so
//! they agree on every chain.
//!
//! Every step of a run is its own definition (`fold_step`, `fold_apply`,
//! `transform_step`, ...) that evaluates to the next one, so long inputs
//! become long hop chains rather than deep native recursion. These types are
//! registered as continuations: a chain is bounded by the input's length,
//! not by the engine's hop limit. Items travel by shared handle and output
//! accumulates in a buffer, so each step costs the same whatever its index.

use super::buffer;
use super::reducers::{chain, collect, unreduced, Directive, STAGE_STEP};
use super::sources::{ITER_DONE, ITER_ITEM};
use crate::address::GraphNode;
use crate::dependency::{NodeDependency, Until};
use crate::engine::{DepsContext, RunContext};
use crate::error::NodeError;
use crate::node::{NodeDefinition, Opaque, Prop};
use crate::nodes::data::{self, LIST};
use crate::operation::{OpKind, Operation};
use crate::registry::{NodeType, Outcome, PropKind, Registry};
use crate::value::Value;
use std::rc::Rc;

pub const TRANSDUCE: &str = "transduce";
pub const TRANSFORM_ITEMS: &str = "transform_items";
pub const FOLD_STEP: &str = "fold_step";
pub const FOLD_APPLY: &str = "fold_apply";
pub const FOLD_FINISH: &str = "fold_finish";
pub const TRANSFORM_CHAIN: &str = "transform_chain";
pub const TRANSFORM_STEP: &str = "transform_step";

/// Right fold of `transformers` into one reducer ending in `collect`.
pub fn compose(transformers: impl IntoIterator<Item = NodeDefinition>) -> NodeDefinition {
    let stages: Vec<NodeDefinition> = transformers.into_iter().collect();
    stages
        .into_iter()
        .rev()
        .fold(collect(), |next, stage| chain(stage, next))
}

/// Single pass over `source` (anything supporting `Iterate`), collecting
/// whatever the transformers let through.
pub fn transduce(
    source: NodeDefinition,
    transformers: impl IntoIterator<Item = NodeDefinition>,
) -> NodeDefinition {
    NodeDefinition::new(
        TRANSDUCE,
        [
            ("source", Prop::Node(source)),
            ("reducer", Prop::Node(compose(transformers))),
        ],
    )
}

/// Eager counterpart of [`transduce`] over `source`'s `GetItems`.
pub fn transform_items(
    source: NodeDefinition,
    transformers: impl IntoIterator<Item = NodeDefinition>,
) -> NodeDefinition {
    NodeDefinition::new(
        TRANSFORM_ITEMS,
        [
            ("source", Prop::Node(source)),
            ("stages", Prop::nodes(transformers)),
        ],
    )
}

fn fold_step(reducer: NodeDefinition, cursor: NodeDefinition, acc: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        FOLD_STEP,
        [
            ("reducer", Prop::Node(reducer)),
            ("cursor", Prop::Node(cursor)),
            ("acc", Prop::Node(acc)),
        ],
    )
}

fn fold_apply(
    reducer: NodeDefinition,
    cursor: NodeDefinition,
    acc: NodeDefinition,
    item: NodeDefinition,
) -> NodeDefinition {
    NodeDefinition::new(
        FOLD_APPLY,
        [
            ("reducer", Prop::Node(reducer)),
            ("cursor", Prop::Node(cursor)),
            ("acc", Prop::Node(acc)),
            ("item", Prop::Node(item)),
        ],
    )
}

fn fold_finish(reducer: NodeDefinition, acc: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        FOLD_FINISH,
        [("reducer", Prop::Node(reducer)), ("acc", Prop::Node(acc))],
    )
}

fn transform_chain(stages: &[NodeDefinition], items: &[NodeDefinition]) -> NodeDefinition {
    NodeDefinition::new(
        TRANSFORM_CHAIN,
        [
            ("stages", Prop::nodes(stages.iter().cloned())),
            ("items", Prop::nodes(items.iter().cloned())),
        ],
    )
}

/// One eager step of `stage`: feed `items[index]` with `state`, or flush
/// through `Result` once the items run out or the stage is done. `out` is a
/// buffer of what the stage forwarded so far.
pub(crate) fn transform_step(
    stage: NodeDefinition,
    state: NodeDefinition,
    items: Rc<Vec<NodeDefinition>>,
    index: usize,
    out: NodeDefinition,
    done: bool,
) -> NodeDefinition {
    NodeDefinition::new(
        TRANSFORM_STEP,
        [
            ("stage", Prop::Node(stage)),
            ("state", Prop::Node(state)),
            ("items", Prop::Opaque(Opaque::from_rc(items))),
            ("index", Prop::Value(Value::number(index as f64))),
            ("out", Prop::Node(out)),
            ("done", Prop::Value(Value::Bool(done))),
        ],
    )
}

/// First eager step of `stage` over `items`.
pub(crate) fn transform_start(
    stage: NodeDefinition,
    state: NodeDefinition,
    items: Rc<Vec<NodeDefinition>>,
) -> NodeDefinition {
    transform_step(stage, state, items, 0, buffer::empty(), false)
}

fn transduce_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    Ok(vec![
        NodeDependency::new(definition.node_prop("source")?.clone())
            .operation(Operation::Iterate)
            .until(Until::Supports(OpKind::Next)),
        NodeDependency::new(definition.node_prop("reducer")?.clone()).operation(Operation::Init),
    ])
}

fn transduce_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let reducer = cx.definition().node_prop("reducer")?.clone();
    let [cursor, acc] = deps else {
        return Err(NodeError::custom("`transduce` expects a cursor and an accumulator"));
    };
    Ok(Outcome::Done(fold_step(
        reducer,
        cursor.definition.clone(),
        acc.definition.clone(),
    )))
}

fn fold_step_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let cursor = cx.definition().node_prop("cursor")?.clone();
    Ok(vec![NodeDependency::new(cursor).operation(Operation::Next)])
}

fn fold_step_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let definition = cx.definition();
    let reducer = definition.node_prop("reducer")?.clone();
    let acc = definition.node_prop("acc")?.clone();
    let next = &deps[0].definition;
    match next.tag() {
        ITER_DONE => Ok(Outcome::Done(fold_finish(reducer, acc))),
        ITER_ITEM => Ok(Outcome::Done(fold_apply(
            reducer,
            next.node_prop("next")?.clone(),
            acc,
            next.node_prop("item")?.clone(),
        ))),
        other => Err(NodeError::mismatch(
            "next",
            "`iter_item` or `iter_done`",
            format!("`{other}`"),
        )),
    }
}

fn fold_apply_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let reducer = definition.node_prop("reducer")?.clone();
    Ok(vec![NodeDependency::new(reducer).operation(Operation::Step {
        acc: definition.node_prop("acc")?.clone(),
        item: definition.node_prop("item")?.clone(),
    })])
}

fn fold_apply_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let definition = cx.definition();
    let reducer = definition.node_prop("reducer")?.clone();
    let stepped = deps[0].definition.clone();
    Ok(Outcome::Done(match unreduced(&stepped) {
        Some(acc) => {
            log::trace!("reduced early at {:?}", cx.node());
            fold_finish(reducer, acc)
        }
        None => fold_step(reducer, definition.node_prop("cursor")?.clone(), stepped),
    }))
}

fn fold_finish_deps(
    cx: &DepsContext<'_>,
    _op: &Operation,
) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let reducer = definition.node_prop("reducer")?.clone();
    let acc = definition.node_prop("acc")?.clone();
    Ok(vec![NodeDependency::new(reducer).operation(Operation::Result(acc))])
}

fn forward_first(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Node(deps[0].clone()))
}

fn transform_items_deps(
    cx: &DepsContext<'_>,
    _op: &Operation,
) -> Result<Vec<NodeDependency>, NodeError> {
    let source = cx.definition().node_prop("source")?.clone();
    Ok(vec![NodeDependency::new(source)
        .operation(Operation::GetItems)
        .until(Until::Tag(LIST))])
}

fn transform_items_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let stages = cx.definition().nodes_prop("stages")?;
    let items = deps[0].definition.nodes_prop("items")?;
    Ok(Outcome::Done(transform_chain(stages, items)))
}

fn transform_chain_deps(
    cx: &DepsContext<'_>,
    _op: &Operation,
) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let Some(stage) = definition.nodes_prop("stages")?.first() else {
        return Ok(Vec::new());
    };
    let items = definition.nodes_prop("items")?;
    Ok(vec![NodeDependency::new(stage.clone())
        .operation(Operation::transform_items(items.iter().cloned()))
        .until(Until::Tag(LIST))])
}

fn transform_chain_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let definition = cx.definition();
    let stages = definition.nodes_prop("stages")?;
    let Some(result) = deps.first() else {
        return Ok(Outcome::Done(data::list(definition.nodes_prop("items")?.to_vec())));
    };
    let items = result.definition.nodes_prop("items")?;
    Ok(Outcome::Done(transform_chain(&stages[1..], items)))
}

struct StepProps {
    stage: NodeDefinition,
    state: NodeDefinition,
    items: Rc<Vec<NodeDefinition>>,
    index: usize,
    done: bool,
}

impl StepProps {
    fn read(definition: &NodeDefinition) -> Result<Self, NodeError> {
        Ok(Self {
            stage: definition.node_prop("stage")?.clone(),
            state: definition.node_prop("state")?.clone(),
            items: definition.opaque_prop::<Vec<NodeDefinition>>("items")?,
            index: definition.number_prop("index")? as usize,
            done: super::reducers::flag(definition, "done"),
        })
    }

    fn current(&self) -> Option<&NodeDefinition> {
        if self.done {
            return None;
        }
        self.items.get(self.index)
    }
}

fn transform_step_deps(
    cx: &DepsContext<'_>,
    _op: &Operation,
) -> Result<Vec<NodeDependency>, NodeError> {
    let props = StepProps::read(cx.definition())?;
    let operation = match props.current() {
        Some(item) => Operation::Step {
            acc: props.state.clone(),
            item: item.clone(),
        },
        None => Operation::Result(props.state.clone()),
    };
    Ok(vec![NodeDependency::new(props.stage)
        .operation(operation)
        .until(Until::Tag(STAGE_STEP))])
}

fn transform_step_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let definition = cx.definition();
    let props = StepProps::read(definition)?;
    let directive = Directive::read(&deps[0].definition)?;
    let out = buffer::append(definition.node_prop("out")?, directive.items)?;
    if props.current().is_none() {
        return Ok(Outcome::Done(data::list(buffer::items(&out)?)));
    }
    Ok(Outcome::Done(transform_step(
        props.stage,
        directive.state,
        props.items,
        props.index + 1,
        out,
        directive.done,
    )))
}

pub(crate) fn register(registry: &mut Registry) {
    registry
        .register(
            NodeType::new(TRANSDUCE)
                .prop("source", PropKind::Node)
                .prop("reducer", PropKind::Node)
                .handler(OpKind::Evaluate, transduce_deps, transduce_run),
        )
        .register(
            NodeType::new(FOLD_STEP)
                .continuation()
                .prop("reducer", PropKind::Node)
                .prop("cursor", PropKind::Node)
                .prop("acc", PropKind::Node)
                .handler(OpKind::Evaluate, fold_step_deps, fold_step_run),
        )
        .register(
            NodeType::new(FOLD_APPLY)
                .continuation()
                .prop("reducer", PropKind::Node)
                .prop("cursor", PropKind::Node)
                .prop("acc", PropKind::Node)
                .prop("item", PropKind::Node)
                .handler(OpKind::Evaluate, fold_apply_deps, fold_apply_run),
        )
        .register(
            NodeType::new(FOLD_FINISH)
                .prop("reducer", PropKind::Node)
                .prop("acc", PropKind::Node)
                .handler(OpKind::Evaluate, fold_finish_deps, forward_first),
        )
        .register(
            NodeType::new(TRANSFORM_ITEMS)
                .prop("source", PropKind::Node)
                .prop("stages", PropKind::Nodes)
                .handler(OpKind::Evaluate, transform_items_deps, transform_items_run),
        )
        .register(
            NodeType::new(TRANSFORM_CHAIN)
                .continuation()
                .prop("stages", PropKind::Nodes)
                .prop("items", PropKind::Nodes)
                .handler(OpKind::Evaluate, transform_chain_deps, transform_chain_run),
        )
        .register(
            NodeType::new(TRANSFORM_STEP)
                .continuation()
                .prop("stage", PropKind::Node)
                .prop("state", PropKind::Node)
                .prop("items", PropKind::Opaque)
                .prop("index", PropKind::Value)
                .prop("out", PropKind::Node)
                .prop("done", PropKind::Value)
                .handler(OpKind::Evaluate, transform_step_deps, transform_step_run),
        );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transduce::{count, map};

    #[test]
    fn compose_folds_right_into_collect() {
        let f = data::nil();
        let composed = compose([map(f.clone()), count()]);
        assert_eq!(composed, chain(map(f), chain(count(), collect())));
        assert_eq!(compose([]), collect());
    }

    #[test]
    fn finished_steps_stop_reading_items() {
        let items = Rc::new(vec![data::value(1.0), data::value(2.0)]);
        let step = transform_start(count(), data::value(0.0), items.clone());
        let props = StepProps::read(&step).unwrap();
        assert_eq!(props.current(), Some(&data::value(1.0)));

        let done = transform_step(count(), data::value(0.0), items, 0, buffer::empty(), true);
        assert!(StepProps::read(&done).unwrap().current().is_none());
    }
}
