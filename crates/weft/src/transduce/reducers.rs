//! Reducers and the stage protocol.
//!
//! A stage answers `Step` with a `stage_step` directive: its next state, the
//! items it forwards downstream and whether it is done. `chain(stage, next)`
//! turns a stage into a reducer by feeding forwarded items into `next` one
//! at a time. Its accumulator is `stage_acc(state, inner)`. `collect`
//! accumulates into a buffer and hands out a list from `Result`.

use super::buffer::{self, BUFFER};
use crate::address::GraphNode;
use crate::dependency::{NodeDependency, Until};
use crate::engine::{DepsContext, RunContext};
use crate::error::NodeError;
use crate::node::{NodeDefinition, Prop};
use crate::nodes::data;
use crate::operation::{OpKind, Operation};
use crate::registry::{NodeType, Outcome, PropKind, Registry};
use crate::value::Value;

pub const COLLECT: &str = "collect";
pub const CHAIN: &str = "chain";
pub const FEED: &str = "feed";
pub const REDUCED: &str = "reduced";
pub const STAGE_STEP: &str = "stage_step";
pub const STAGE_ACC: &str = "stage_acc";

/// Reducer appending every item to a list.
pub fn collect() -> NodeDefinition {
    NodeDefinition::from_props(COLLECT, Default::default())
}

pub fn chain(stage: NodeDefinition, next: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        CHAIN,
        [("stage", Prop::Node(stage)), ("next", Prop::Node(next))],
    )
}

/// Accumulator signalling that no further items should be pulled.
pub fn reduced(acc: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(REDUCED, [("acc", Prop::Node(acc))])
}

pub fn stage_step(
    state: NodeDefinition,
    items: impl IntoIterator<Item = NodeDefinition>,
    done: bool,
) -> NodeDefinition {
    NodeDefinition::new(
        STAGE_STEP,
        [
            ("state", Prop::Node(state)),
            ("items", Prop::nodes(items)),
            ("done", Prop::Value(Value::Bool(done))),
        ],
    )
}

pub fn stage_acc(state: NodeDefinition, inner: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        STAGE_ACC,
        [("state", Prop::Node(state)), ("inner", Prop::Node(inner))],
    )
}

fn feed(
    next: NodeDefinition,
    acc: NodeDefinition,
    items: &[NodeDefinition],
    state: NodeDefinition,
    done: bool,
    finish: bool,
) -> NodeDefinition {
    NodeDefinition::new(
        FEED,
        [
            ("next", Prop::Node(next)),
            ("acc", Prop::Node(acc)),
            ("items", Prop::nodes(items.iter().cloned())),
            ("state", Prop::Node(state)),
            ("done", Prop::Value(Value::Bool(done))),
            ("finish", Prop::Value(Value::Bool(finish))),
        ],
    )
}

/// `Some(acc)` when `definition` is a `reduced` wrapper.
pub fn unreduced(definition: &NodeDefinition) -> Option<NodeDefinition> {
    (definition.tag() == REDUCED)
        .then(|| definition.node_prop("acc").ok().cloned())
        .flatten()
}

pub(crate) fn flag(definition: &NodeDefinition, name: &'static str) -> bool {
    matches!(definition.value_prop(name), Ok(Value::Bool(true)))
}

/// Parts of a `stage_step` directive.
pub(crate) struct Directive {
    pub state: NodeDefinition,
    pub items: Vec<NodeDefinition>,
    pub done: bool,
}

impl Directive {
    pub fn read(definition: &NodeDefinition) -> Result<Self, NodeError> {
        Ok(Self {
            state: definition.node_prop("state")?.clone(),
            items: definition.nodes_prop("items")?.to_vec(),
            done: flag(definition, "done"),
        })
    }
}

fn split_acc(acc: &NodeDefinition) -> Result<(NodeDefinition, NodeDefinition), NodeError> {
    if acc.tag() != STAGE_ACC {
        return Err(NodeError::mismatch(
            "step",
            "a `stage_acc` accumulator",
            format!("`{}`", acc.tag()),
        ));
    }
    Ok((acc.node_prop("state")?.clone(), acc.node_prop("inner")?.clone()))
}

fn collect_init(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(buffer::empty()))
}

fn collect_step(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Operation::Step { acc, item } = op else {
        return Err(NodeError::custom("`collect` expected `step`"));
    };
    let acc = match data::items_of(acc) {
        Some(items) => buffer::append(&buffer::empty(), items.iter().cloned())?,
        None => acc.clone(),
    };
    Ok(Outcome::Done(buffer::append(&acc, [item.clone()])?))
}

fn collect_result(
    _cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Operation::Result(acc) = op else {
        return Err(NodeError::custom("`collect` expected `result`"));
    };
    if acc.tag() == BUFFER {
        return Ok(Outcome::Done(data::list(buffer::items(acc)?)));
    }
    Ok(Outcome::Done(acc.clone()))
}

fn chain_deps(cx: &DepsContext<'_>, op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let stage = definition.node_prop("stage")?.clone();
    let next = definition.node_prop("next")?.clone();
    Ok(match op {
        Operation::Init => vec![
            NodeDependency::new(stage).operation(Operation::Init),
            NodeDependency::new(next).operation(Operation::Init),
        ],
        Operation::Step { acc, item } => {
            let (state, _) = split_acc(acc)?;
            vec![NodeDependency::new(stage)
                .operation(Operation::Step {
                    acc: state,
                    item: item.clone(),
                })
                .until(Until::Tag(STAGE_STEP))]
        }
        Operation::Result(acc) => {
            let (state, _) = split_acc(acc)?;
            vec![NodeDependency::new(stage)
                .operation(Operation::Result(state))
                .until(Until::Tag(STAGE_STEP))]
        }
        other => {
            return Err(NodeError::UnsupportedOperation {
                tag: definition.tag().into(),
                operation: other.name(),
            })
        }
    })
}

fn chain_run(
    cx: &mut RunContext<'_>,
    op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let next = cx.definition().node_prop("next")?.clone();
    match op {
        Operation::Init => {
            let [state, inner] = deps else {
                return Err(NodeError::custom("`chain` init expects two results"));
            };
            Ok(Outcome::Done(stage_acc(
                state.definition.clone(),
                inner.definition.clone(),
            )))
        }
        Operation::Step { acc, .. } | Operation::Result(acc) => {
            let (_, inner) = split_acc(acc)?;
            let directive = Directive::read(&deps[0].definition)?;
            let finish = matches!(op, Operation::Result(_));
            Ok(Outcome::Done(feed(
                next,
                inner,
                &directive.items,
                directive.state,
                directive.done || finish,
                finish,
            )))
        }
        other => Err(NodeError::custom(format!("unexpected `{}`", other.name()))),
    }
}

fn feed_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let next = definition.node_prop("next")?.clone();
    let acc = definition.node_prop("acc")?.clone();
    let items = definition.nodes_prop("items")?;
    let operation = match items.first() {
        Some(item) => Operation::Step {
            acc,
            item: item.clone(),
        },
        None if flag(definition, "finish") => Operation::Result(acc),
        None => return Ok(Vec::new()),
    };
    Ok(vec![NodeDependency::new(next).operation(operation)])
}

fn feed_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let definition = cx.definition();
    let next = definition.node_prop("next")?.clone();
    let acc = definition.node_prop("acc")?.clone();
    let items = definition.nodes_prop("items")?;
    let state = definition.node_prop("state")?.clone();
    let done = flag(definition, "done");
    let finish = flag(definition, "finish");

    if items.is_empty() {
        if finish {
            return Ok(Outcome::Node(deps[0].clone()));
        }
        let acc = stage_acc(state, acc);
        return Ok(Outcome::Done(if done { reduced(acc) } else { acc }));
    }

    let stepped = deps[0].definition.clone();
    match unreduced(&stepped) {
        // Downstream is full: drop the remaining items.
        Some(inner) if finish => Ok(Outcome::Done(feed(next, inner, &[], state, true, true))),
        Some(inner) => Ok(Outcome::Done(reduced(stage_acc(state, inner)))),
        None => Ok(Outcome::Done(feed(next, stepped, &items[1..], state, done, finish))),
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry
        .register(
            NodeType::new(COLLECT)
                .run(OpKind::Init, collect_init)
                .run(OpKind::Step, collect_step)
                .run(OpKind::Result, collect_result),
        )
        .register(
            NodeType::new(CHAIN)
                .prop("stage", PropKind::Node)
                .prop("next", PropKind::Node)
                .handler(OpKind::Init, chain_deps, chain_run)
                .handler(OpKind::Step, chain_deps, chain_run)
                .handler(OpKind::Result, chain_deps, chain_run),
        )
        .register(
            NodeType::new(FEED)
                .continuation()
                .prop("next", PropKind::Node)
                .prop("acc", PropKind::Node)
                .prop("items", PropKind::Nodes)
                .prop("state", PropKind::Node)
                .prop("done", PropKind::Value)
                .prop("finish", PropKind::Value)
                .handler(OpKind::Evaluate, feed_deps, feed_run),
        )
        .register(NodeType::new(REDUCED).prop("acc", PropKind::Node))
        .register(
            NodeType::new(STAGE_STEP)
                .prop("state", PropKind::Node)
                .prop("items", PropKind::Nodes)
                .prop("done", PropKind::Value),
        )
        .register(
            NodeType::new(STAGE_ACC)
                .prop("state", PropKind::Node)
                .prop("inner", PropKind::Node),
        );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduced_unwraps() {
        let acc = data::list([data::value(1.0)]);
        assert_eq!(unreduced(&reduced(acc.clone())), Some(acc.clone()));
        assert_eq!(unreduced(&acc), None);
    }

    #[test]
    fn directive_round_trips_through_definition() {
        let step = stage_step(data::value(2.0), [data::value(7.0)], true);
        let directive = Directive::read(&step).unwrap();
        assert_eq!(directive.state, data::value(2.0));
        assert_eq!(directive.items, vec![data::value(7.0)]);
        assert!(directive.done);
    }

    #[test]
    fn chain_accumulator_must_be_stage_acc() {
        assert!(split_acc(&data::nil()).is_err());
        let (state, inner) = split_acc(&stage_acc(data::value(0.0), collect())).unwrap();
        assert_eq!(state, data::value(0.0));
        assert_eq!(inner, collect());
    }
}
