//! Executor nodes resolving a QuerySet against a target node.
//!
//! `query_set` hands the whole set to targets that answer `Query` (remote
//! proxies) and otherwise runs it locally: one `query_at` per entry, each a
//! memoized slot, so identical entries issued by different subscribers share
//! one resolution.

use super::set::{QuerySet, QuerySetEntry, QuerySetOp};
use crate::address::GraphNode;
use crate::dependency::{NodeDependency, Until};
use crate::engine::{DepsContext, RunContext};
use crate::error::NodeError;
use crate::node::{NodeDefinition, Prop};
use crate::nodes::data::{self, LIST};
use crate::operation::{OpKind, Operation};
use crate::registry::{NodeType, Outcome, PropKind, Registry};
use crate::transduce;
use std::rc::Rc;

pub const QUERY_SET: &str = "query_set";
pub const QUERY_LOCAL: &str = "query_local";
pub const QUERY_AT: &str = "query_at";

/// Resolve `set` against `target`; evaluates to a `list` with one result per entry.
pub fn query_set(target: NodeDefinition, set: &QuerySet) -> NodeDefinition {
    query_set_of(target, set.to_definitions())
}

fn query_set_of(target: NodeDefinition, entries: Vec<NodeDefinition>) -> NodeDefinition {
    NodeDefinition::new(
        QUERY_SET,
        [("target", Prop::Node(target)), ("entries", Prop::nodes(entries))],
    )
}

fn query_local(target: NodeDefinition, entries: &[NodeDefinition]) -> NodeDefinition {
    NodeDefinition::new(
        QUERY_LOCAL,
        [
            ("target", Prop::Node(target)),
            ("entries", Prop::nodes(entries.iter().cloned())),
        ],
    )
}

fn query_at(target: NodeDefinition, entry: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        QUERY_AT,
        [("target", Prop::Node(target)), ("entry", Prop::Node(entry))],
    )
}

fn query_set_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let target = cx.definition().node_prop("target")?.clone();
    Ok(vec![
        NodeDependency::new(target).until(Until::SupportsOrStatic(OpKind::Query))
    ])
}

fn query_set_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let definition = cx.definition();
    let target = definition.node_prop("target")?.clone();
    let entries = definition.nodes_prop("entries")?.to_vec();
    let resolved = &deps[0];
    if cx.supports(resolved, OpKind::Query) {
        let set = QuerySet::from_definitions(&entries)?;
        return Ok(Outcome::Delegate(
            resolved.clone(),
            Operation::Query(Rc::new(set)),
        ));
    }
    // Entries walk the unevaluated target themselves, so mutations still
    // reach stateful nodes.
    Ok(Outcome::Done(query_local(target, &entries)))
}

fn query_local_deps(
    cx: &DepsContext<'_>,
    _op: &Operation,
) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let target = definition.node_prop("target")?;
    definition
        .nodes_prop("entries")?
        .iter()
        .map(|entry| {
            let allow_pending = matches!(
                entry.value_prop("allow_pending"),
                Ok(crate::value::Value::Bool(true))
            );
            Ok(NodeDependency::new(query_at(target.clone(), entry.clone()))
                .tolerant(true, allow_pending))
        })
        .collect()
}

fn query_local_run(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(data::list(
        deps.iter().map(|dep| dep.definition.clone()),
    )))
}

fn query_at_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let target = definition.node_prop("target")?.clone();
    let entry = QuerySetEntry::from_definition(definition.node_prop("entry")?)?;
    let dependency = match entry.op {
        QuerySetOp::Value => NodeDependency::new(target).operation(Operation::Resolve),
        QuerySetOp::Child { key } => NodeDependency::new(target)
            .operation(Operation::GetChild(key))
            .until(Until::Any),
        QuerySetOp::Items { transforms } if transforms.is_empty() => NodeDependency::new(target)
            .operation(Operation::GetItems)
            .until(Until::Tag(LIST)),
        QuerySetOp::Items { transforms } => {
            NodeDependency::new(transduce::transform_items(target, transforms))
                .until(Until::Tag(LIST))
        }
        QuerySetOp::Call { args } => NodeDependency::new(target)
            .operation(Operation::call(args))
            .until(Until::Any),
        QuerySetOp::Set { value } => NodeDependency::new(target)
            .operation(Operation::Set(value))
            .until(Until::Any),
    };
    Ok(vec![dependency])
}

fn query_at_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let entry = cx.definition().node_prop("entry")?;
    let children = entry.nodes_prop("children")?.to_vec();
    let result = &deps[0];
    let op = entry.value_prop("op")?.as_text().unwrap_or_default();
    // Definitions derived from the result live in the result's context.
    let next = match op {
        "value" => return Ok(Outcome::Node(result.clone())),
        "items" => data::all(
            result
                .definition
                .nodes_prop("items")?
                .iter()
                .map(|item| query_set_of(item.clone(), children.clone())),
        ),
        _ => query_set_of(result.definition.clone(), children),
    };
    Ok(Outcome::Node(result.with_scope_from(next)))
}

pub(crate) fn register(registry: &mut Registry) {
    registry
        .register(
            NodeType::new(QUERY_SET)
                .prop("target", PropKind::Node)
                .prop("entries", PropKind::Nodes)
                .handler(OpKind::Evaluate, query_set_deps, query_set_run),
        )
        .register(
            NodeType::new(QUERY_LOCAL)
                .prop("target", PropKind::Node)
                .prop("entries", PropKind::Nodes)
                .handler(OpKind::Evaluate, query_local_deps, query_local_run),
        )
        .register(
            NodeType::new(QUERY_AT)
                .prop("target", PropKind::Node)
                .prop("entry", PropKind::Node)
                .handler(OpKind::Evaluate, query_at_deps, query_at_run),
        );
}
