//! Terminal data nodes and deep resolution.

use crate::address::GraphNode;
use crate::dependency::NodeDependency;
use crate::engine::{DepsContext, RunContext};
use crate::error::NodeError;
use crate::node::{NodeDefinition, Prop, Props};
use crate::operation::{OpKind, Operation};
use crate::registry::{NodeType, Outcome, PropKind, Registry};
use crate::transduce;
use crate::value::{ErrorValue, Key, Value};
use std::sync::Arc;

pub const VALUE: &str = "value";
pub const ERROR: &str = "error";
pub const PENDING: &str = "pending";
pub const LIST: &str = "list";
pub const RECORD: &str = "record";
pub const ALL: &str = "all";
pub const RESOLVED: &str = "resolved";

/// Data node for `value`. Lists and records become `list`/`record` nodes of
/// data nodes, errors become `error` nodes, so every piece of data has one
/// canonical definition.
pub fn value(value: impl Into<Value>) -> NodeDefinition {
    match value.into() {
        Value::Error(error) => self::error(error.as_ref().clone()),
        Value::Pending => pending(),
        Value::List(items) => list(items.iter().cloned().map(self::value)),
        Value::Record(fields) => record(
            fields
                .iter()
                .map(|(name, field)| (name.clone(), self::value(field.clone()))),
        ),
        other => NodeDefinition::new(VALUE, [("value", Prop::Value(other))]),
    }
}

pub fn nil() -> NodeDefinition {
    value(Value::Nil)
}

pub fn error(error: ErrorValue) -> NodeDefinition {
    NodeDefinition::new(ERROR, [("error", Prop::Value(Value::error(error)))])
}

/// Error node with just a message.
pub fn fail(message: impl Into<Arc<str>>) -> NodeDefinition {
    error(ErrorValue::new(message))
}

pub fn pending() -> NodeDefinition {
    NodeDefinition::from_props(PENDING, Props::new())
}

pub fn list(items: impl IntoIterator<Item = NodeDefinition>) -> NodeDefinition {
    NodeDefinition::new(LIST, [("items", Prop::nodes(items))])
}

pub fn record(
    fields: impl IntoIterator<Item = (impl Into<Arc<str>>, NodeDefinition)>,
) -> NodeDefinition {
    NodeDefinition::new(RECORD, [("fields", Prop::named(fields))])
}

/// Evaluates every item until static and yields a `list` of the results.
/// Errors and pending items are kept in place.
pub fn all(items: impl IntoIterator<Item = NodeDefinition>) -> NodeDefinition {
    NodeDefinition::new(ALL, [("items", Prop::nodes(items))])
}

/// Like [`all`] over named fields, yielding a `record`.
pub fn all_fields(
    fields: impl IntoIterator<Item = (impl Into<Arc<str>>, NodeDefinition)>,
) -> NodeDefinition {
    NodeDefinition::new(ALL, [("fields", Prop::named(fields))])
}

/// Deep resolution of `target` into static data.
pub fn resolved(target: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(RESOLVED, [("target", Prop::Node(target))])
}

pub(crate) fn items_of(definition: &NodeDefinition) -> Option<&[NodeDefinition]> {
    (definition.tag() == LIST)
        .then(|| definition.nodes_prop("items").ok())
        .flatten()
}

fn key_index(index: i64, len: usize) -> Option<usize> {
    let index = if index < 0 { len as i64 + index } else { index };
    usize::try_from(index).ok().filter(|i| *i < len)
}

fn child_key(operation: &Operation) -> Result<&Key, NodeError> {
    match operation {
        Operation::GetChild(key) => Ok(key),
        other => Err(NodeError::custom(format!(
            "expected `getChild`, received `{}`",
            other.name()
        ))),
    }
}

fn list_get_child(
    cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let items = cx.definition().nodes_prop("items")?;
    let item = match child_key(op)? {
        Key::Index(index) => key_index(*index, items.len()).map(|i| items[i].clone()),
        Key::Name(name) if name.as_ref() == "length" => Some(value(items.len() as f64)),
        Key::Name(_) => None,
    };
    Ok(Outcome::Done(item.unwrap_or_else(nil)))
}

fn list_get_items(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Node(cx.node().clone()))
}

fn list_length(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let len = cx.definition().nodes_prop("items")?.len();
    Ok(Outcome::Done(value(len as f64)))
}

fn list_iterate(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(transduce::list_cursor(cx.definition().clone(), 0)))
}

fn record_get_child(
    cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let fields = cx.definition().named_prop("fields")?;
    let field = match child_key(op)? {
        Key::Name(name) => fields.get(name).cloned(),
        Key::Index(_) => None,
    };
    Ok(Outcome::Done(field.unwrap_or_else(nil)))
}

fn all_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let targets: Vec<NodeDefinition> = match definition.prop("items") {
        Some(_) => definition.nodes_prop("items")?.to_vec(),
        None => definition.named_prop("fields")?.values().cloned().collect(),
    };
    Ok(targets
        .into_iter()
        .map(|target| NodeDependency::new(target).tolerant(true, true))
        .collect())
}

fn all_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let results = deps.iter().map(|dep| dep.definition.clone());
    let definition = cx.definition();
    if definition.prop("items").is_some() {
        return Ok(Outcome::Done(list(results)));
    }
    let names: Vec<Arc<str>> = definition.named_prop("fields")?.keys().cloned().collect();
    Ok(Outcome::Done(record(names.into_iter().zip(results))))
}

fn resolved_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let target = cx.definition().node_prop("target")?.clone();
    Ok(vec![NodeDependency::new(target).tolerant(true, true)])
}

fn resolved_run(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let target = &deps[0];
    let definition = &target.definition;
    // Nested definitions belong to the target's context, not ours.
    let expanded = match definition.tag() {
        LIST => all(definition.nodes_prop("items")?.iter().cloned().map(resolved)),
        RECORD => all_fields(
            definition
                .named_prop("fields")?
                .iter()
                .map(|(name, field)| (name.clone(), resolved(field.clone()))),
        ),
        _ => return Ok(Outcome::Node(target.clone())),
    };
    Ok(Outcome::Node(target.with_scope_from(expanded)))
}

pub(crate) fn register(registry: &mut Registry) {
    registry
        .register(NodeType::new(VALUE).prop("value", PropKind::Value))
        .register(NodeType::new(ERROR).prop("error", PropKind::Value))
        .register(NodeType::new(PENDING))
        .register(
            NodeType::new(LIST)
                .prop("items", PropKind::Nodes)
                .run(OpKind::GetChild, list_get_child)
                .run(OpKind::GetItems, list_get_items)
                .run(OpKind::Length, list_length)
                .run(OpKind::Iterate, list_iterate),
        )
        .register(
            NodeType::new(RECORD)
                .prop("fields", PropKind::Named)
                .run(OpKind::GetChild, record_get_child),
        )
        .register(
            NodeType::new(ALL)
                .optional("items", PropKind::Nodes)
                .optional("fields", PropKind::Named)
                .handler(OpKind::Evaluate, all_deps, all_run),
        )
        .register(
            NodeType::new(RESOLVED)
                .prop("target", PropKind::Node)
                .handler(OpKind::Evaluate, resolved_deps, resolved_run),
        );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_is_canonical() {
        assert_eq!(
            value(Value::numbers([1.0, 2.0])),
            list([value(1.0), value(2.0)])
        );
        assert!(value(Value::error(ErrorValue::new("x"))).is_error());
        assert!(value(Value::Pending).is_pending());
    }

    #[test]
    fn negative_index_counts_from_end() {
        assert_eq!(key_index(-1, 3), Some(2));
        assert_eq!(key_index(3, 3), None);
        assert_eq!(key_index(-4, 3), None);
    }

    #[test]
    fn items_of_only_reads_lists() {
        let items = list([nil(), nil()]);
        assert_eq!(items_of(&items).map(<[_]>::len), Some(2));
        assert!(items_of(&record([("a", nil())])).is_none());
    }
}
