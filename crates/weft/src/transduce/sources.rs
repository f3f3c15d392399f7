//! Lazy sources and their cursors.
//!
//! `Iterate` on a source yields a cursor; `Next` on a cursor yields either
//! `iter_item {item, next}` or `iter_done`. Cursors are plain definitions, so
//! a traversal is a chain of memoized `Next` slots and nothing is
//! materialized ahead of the consumer.

use crate::address::GraphNode;
use crate::engine::RunContext;
use crate::error::NodeError;
use crate::node::{NodeDefinition, Prop, Props};
use crate::nodes::data;
use crate::operation::{OpKind, Operation};
use crate::registry::{NodeType, Outcome, PropKind, Registry};
use crate::value::Value;

pub const RANGE: &str = "range";
pub const RANGE_CURSOR: &str = "range_cursor";
pub const LIST_CURSOR: &str = "list_cursor";
pub const ITER_ITEM: &str = "iter_item";
pub const ITER_DONE: &str = "iter_done";

/// Numbers from `start` (inclusive) to `end` (exclusive), one apart.
pub fn range(start: f64, end: f64) -> NodeDefinition {
    NodeDefinition::new(
        RANGE,
        [
            ("start", Prop::Value(Value::number(start))),
            ("end", Prop::Value(Value::number(end))),
        ],
    )
}

fn range_cursor(at: f64, end: f64) -> NodeDefinition {
    NodeDefinition::new(
        RANGE_CURSOR,
        [
            ("at", Prop::Value(Value::number(at))),
            ("end", Prop::Value(Value::number(end))),
        ],
    )
}

/// Cursor over the items of a `list` node, starting at `index`.
pub fn list_cursor(list: NodeDefinition, index: usize) -> NodeDefinition {
    NodeDefinition::new(
        LIST_CURSOR,
        [
            ("list", Prop::Node(list)),
            ("index", Prop::Value(Value::number(index as f64))),
        ],
    )
}

pub fn iter_item(item: NodeDefinition, next: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        ITER_ITEM,
        [("item", Prop::Node(item)), ("next", Prop::Node(next))],
    )
}

pub fn iter_done() -> NodeDefinition {
    NodeDefinition::from_props(ITER_DONE, Props::new())
}

/// Both ends must be finite, or a traversal would never end.
fn bounds(
    definition: &NodeDefinition,
    from: &'static str,
    operation: &'static str,
) -> Result<(f64, f64), NodeError> {
    let (at, end) = (definition.number_prop(from)?, definition.number_prop("end")?);
    if !at.is_finite() || !end.is_finite() {
        return Err(NodeError::mismatch(
            operation,
            "finite range bounds",
            format!("{at}..{end}"),
        ));
    }
    Ok((at, end))
}

/// `at + 1`, unless `at` is past the precision where adding one changes it.
fn successor(at: f64, operation: &'static str) -> Result<f64, NodeError> {
    let next = at + 1.0;
    if next > at {
        Ok(next)
    } else {
        Err(NodeError::mismatch(
            operation,
            "a range position that can step by one",
            format!("{at}"),
        ))
    }
}

fn range_numbers(definition: &NodeDefinition) -> Result<Vec<NodeDefinition>, NodeError> {
    let (start, end) = bounds(definition, "start", "getItems")?;
    let mut items = Vec::new();
    let mut at = start;
    while at < end {
        items.push(data::value(at));
        at = successor(at, "getItems")?;
    }
    Ok(items)
}

fn length(start: f64, end: f64) -> f64 {
    (end - start).ceil().max(0.0)
}

fn range_iterate(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (start, end) = bounds(cx.definition(), "start", "iterate")?;
    Ok(Outcome::Done(range_cursor(start, end)))
}

fn range_get_items(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(data::list(range_numbers(cx.definition())?)))
}

fn range_length(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (start, end) = bounds(cx.definition(), "start", "length")?;
    Ok(Outcome::Done(data::value(length(start, end))))
}

fn range_next(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (at, end) = bounds(cx.definition(), "at", "next")?;
    Ok(Outcome::Done(if at < end {
        iter_item(data::value(at), range_cursor(successor(at, "next")?, end))
    } else {
        iter_done()
    }))
}

fn list_next(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let definition = cx.definition();
    let list = definition.node_prop("list")?;
    let index = definition.number_prop("index")? as usize;
    let items = data::items_of(list).ok_or_else(|| {
        NodeError::mismatch("next", "a `list` to traverse", format!("`{}`", list.tag()))
    })?;
    Ok(Outcome::Done(match items.get(index) {
        Some(item) => iter_item(item.clone(), list_cursor(list.clone(), index + 1)),
        None => iter_done(),
    }))
}

pub(crate) fn register(registry: &mut Registry) {
    registry
        .register(
            NodeType::new(RANGE)
                .prop("start", PropKind::Value)
                .prop("end", PropKind::Value)
                .run(OpKind::Iterate, range_iterate)
                .run(OpKind::GetItems, range_get_items)
                .run(OpKind::Length, range_length),
        )
        .register(
            NodeType::new(RANGE_CURSOR)
                .prop("at", PropKind::Value)
                .prop("end", PropKind::Value)
                .run(OpKind::Next, range_next),
        )
        .register(
            NodeType::new(LIST_CURSOR)
                .prop("list", PropKind::Node)
                .prop("index", PropKind::Value)
                .run(OpKind::Next, list_next),
        )
        .register(
            NodeType::new(ITER_ITEM)
                .prop("item", PropKind::Node)
                .prop("next", PropKind::Node),
        )
        .register(NodeType::new(ITER_DONE));
}
