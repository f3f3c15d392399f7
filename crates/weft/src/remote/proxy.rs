//! Proxy nodes standing in for a graph on the other side of a pipeline.
//!
//! A `remote` node is a path into the remote graph. Navigation stays local;
//! every other operation becomes a QuerySet wrapped in child entries along
//! the path and is answered by a `remote_fetch` source holding the response
//! stream. Identical requests from several readers share one fetch instance.

use super::pipeline::Pipeline;
use super::request::{RemoteRequest, RequestMetadata};
use crate::address::GraphNode;
use crate::engine::RunContext;
use crate::error::NodeError;
use crate::node::{NodeDefinition, Prop};
use crate::nodes::data;
use crate::operation::{OpKind, Operation};
use crate::query::{QuerySet, QuerySetEntry, QuerySetOp};
use crate::registry::{NodeType, Outcome, PropKind, Registry, StateSpec};
use crate::value::{Key, Value};
use futures_util::StreamExt;
use std::any::Any;

pub const REMOTE: &str = "remote";
pub const REMOTE_FETCH: &str = "remote_fetch";

/// Proxy for the root of the graph behind `pipeline`.
pub fn proxy(pipeline: &Pipeline) -> NodeDefinition {
    remote(pipeline, &[])
}

/// Proxy for the node at `path` in the graph behind `pipeline`.
pub fn remote(pipeline: &Pipeline, path: &[Key]) -> NodeDefinition {
    NodeDefinition::new(
        REMOTE,
        [
            ("pipeline", pipeline.to_prop()),
            ("path", Prop::Value(path_value(path))),
        ],
    )
}

/// Tag every request issued through `proxy` with `session`. Requests of
/// different sessions are never batched together.
pub fn in_session(proxy: &NodeDefinition, session: &str) -> NodeDefinition {
    proxy.with_prop("session", Prop::Value(Value::text(session)))
}

fn path_value(path: &[Key]) -> Value {
    Value::list(path.iter().map(|key| match key {
        Key::Index(index) => Value::number(*index as f64),
        Key::Name(name) => Value::Text(name.clone()),
    }))
}

fn path_of(definition: &NodeDefinition) -> Result<Vec<Key>, NodeError> {
    let value = definition.value_prop("path")?;
    let items = value
        .as_list()
        .ok_or_else(|| NodeError::mismatch("evaluate", "a path list", value.kind()))?;
    items
        .iter()
        .map(|item| match item {
            Value::Text(name) => Ok(Key::Name(name.clone())),
            Value::Number(n) => Ok(Key::Index(n.0 as i64)),
            other => Err(NodeError::mismatch("evaluate", "a path key", other.kind())),
        })
        .collect()
}

fn session_of(definition: &NodeDefinition) -> Option<Prop> {
    definition.prop("session").cloned()
}

/// Fetch node for `entries` issued at the proxy's path. The response is
/// unwrapped `depth` levels of first results.
fn fetch(
    proxy: &NodeDefinition,
    entries: Vec<QuerySetEntry>,
    extra_depth: usize,
) -> Result<NodeDefinition, NodeError> {
    let path = path_of(proxy)?;
    let entries = path.iter().rev().fold(entries, |children, key| {
        vec![QuerySetEntry::child(key.clone(), children)]
    });
    let set = QuerySet::new(entries);
    let mut props = vec![
        ("pipeline", proxy.prop("pipeline").cloned().ok_or_else(|| {
            NodeError::custom("remote node has no pipeline")
        })?),
        ("entries", Prop::nodes(set.to_definitions())),
        (
            "depth",
            Prop::Value(Value::number((path.len() + extra_depth) as f64)),
        ),
    ];
    if let Some(session) = session_of(proxy) {
        props.push(("session", session));
    }
    Ok(NodeDefinition::new(REMOTE_FETCH, props))
}

fn remote_get_child(
    cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Operation::GetChild(key) = op else {
        return Err(NodeError::mismatch("getChild", "a key", op.name()));
    };
    let definition = cx.definition();
    let mut path = path_of(definition)?;
    path.push(key.clone());
    Ok(Outcome::Done(
        definition.with_prop("path", Prop::Value(path_value(&path))),
    ))
}

fn remote_query(
    cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Operation::Query(set) = op else {
        return Err(NodeError::mismatch("query", "a query set", op.name()));
    };
    Ok(Outcome::Done(fetch(cx.definition(), set.entries.clone(), 0)?))
}

fn remote_value(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(fetch(
        cx.definition(),
        vec![QuerySetEntry::value()],
        1,
    )?))
}

fn remote_call(
    cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let entry = match op {
        Operation::Call(args) => QuerySetOp::Call {
            args: args.as_ref().clone(),
        },
        Operation::Set(value) => QuerySetOp::Set {
            value: value.clone(),
        },
        other => return Err(NodeError::mismatch("call", "call or set", other.name())),
    };
    let entry = QuerySetEntry::new(entry).with_children([QuerySetEntry::value()]);
    Ok(Outcome::Done(fetch(cx.definition(), vec![entry], 2)?))
}

fn fetch_state(_definition: &NodeDefinition) -> Result<Box<dyn Any>, NodeError> {
    Ok(Box::new(()))
}

fn fetch_request(definition: &NodeDefinition) -> Result<RemoteRequest, NodeError> {
    let set = QuerySet::from_definitions(definition.nodes_prop("entries")?)?;
    let mut metadata = RequestMetadata {
        session: match definition.prop("session") {
            Some(Prop::Value(Value::Text(session))) => Some(session.clone()),
            _ => None,
        },
        ..RequestMetadata::default()
    };
    metadata.tolerance.allow_pending = set
        .entries
        .iter()
        .any(|entry| entry.tolerance.allow_pending);
    Ok(RemoteRequest::new(set).with_metadata(metadata))
}

fn fetch_subscribe(cx: &mut RunContext<'_>) -> Result<(), NodeError> {
    let pipeline = Pipeline::from_prop(cx.definition())?;
    let request = fetch_request(cx.definition())?;
    log::debug!(
        "remote fetch of {} entries",
        request.query_set.entries.len()
    );
    let responses = pipeline
        .call(request)
        .map(|response| data::value(response.results))
        .boxed_local();
    cx.attach(responses);
    Ok(())
}

fn fetch_unsubscribe(cx: &mut RunContext<'_>) -> Result<(), NodeError> {
    cx.detach();
    Ok(())
}

fn fetch_restart(cx: &mut RunContext<'_>) -> Result<(), NodeError> {
    cx.detach();
    fetch_subscribe(cx)
}

/// Strip `depth` levels of single-entry wrapping. Errors and pending results
/// surface as they are at whatever level they occur.
fn unwrap_levels(mut result: NodeDefinition, depth: usize) -> NodeDefinition {
    for _ in 0..depth {
        if result.is_error() || result.is_pending() {
            return result;
        }
        result = match data::items_of(&result).and_then(|items| items.first()) {
            Some(first) => first.clone(),
            None => return data::fail("malformed remote response"),
        };
    }
    result
}

fn fetch_evaluate(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let depth = cx.definition().number_prop("depth")? as usize;
    Ok(Outcome::Done(match cx.source() {
        Some(response) => unwrap_levels(response, depth),
        None => data::pending(),
    }))
}

pub(crate) fn register(registry: &mut Registry) {
    registry
        .register(
            NodeType::new(REMOTE)
                .prop("pipeline", PropKind::Opaque)
                .prop("path", PropKind::Value)
                .optional("session", PropKind::Value)
                .run(OpKind::GetChild, remote_get_child)
                .run(OpKind::Query, remote_query)
                .run(OpKind::Evaluate, remote_value)
                .run(OpKind::GetItems, remote_value)
                .run(OpKind::Call, remote_call)
                .run(OpKind::Set, remote_call),
        )
        .register(
            NodeType::new(REMOTE_FETCH)
                .prop("pipeline", PropKind::Opaque)
                .prop("entries", PropKind::Nodes)
                .prop("depth", PropKind::Value)
                .optional("session", PropKind::Value)
                .state(
                    StateSpec::new(fetch_state)
                        .on_subscribe(fetch_subscribe)
                        .on_unsubscribe(fetch_unsubscribe)
                        .on_invalidate(fetch_restart),
                )
                .run(OpKind::Evaluate, fetch_evaluate),
        );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::pipeline::{ResponseStream, Transport};
    use crate::remote::request::RemoteResponse;
    use futures_util::stream;

    struct Silent;

    impl Transport for Silent {
        fn call(&self, _request: RemoteRequest) -> ResponseStream {
            stream::pending().boxed_local()
        }
    }

    #[test]
    fn navigation_extends_the_path() {
        let pipeline = Pipeline::new(Silent);
        let root = proxy(&pipeline);
        let nested = remote(&pipeline, &[Key::name("users"), Key::Index(0)]);
        assert_eq!(path_of(&root).unwrap(), Vec::<Key>::new());
        assert_eq!(
            path_of(&nested).unwrap(),
            vec![Key::name("users"), Key::Index(0)]
        );
        assert_eq!(
            nested,
            remote(&pipeline, &[Key::name("users"), Key::Index(0)])
        );
    }

    #[test]
    fn fetch_wraps_entries_along_the_path() {
        let pipeline = Pipeline::new(Silent);
        let node = in_session(&remote(&pipeline, &[Key::name("a"), Key::name("b")]), "s1");
        let fetch = fetch(&node, vec![QuerySetEntry::value()], 1).unwrap();
        assert_eq!(fetch.number_prop("depth").unwrap(), 3.0);

        let request = fetch_request(&fetch).unwrap();
        assert_eq!(request.metadata.session.as_deref(), Some("s1"));
        assert_eq!(
            request.query_set,
            QuerySet::new([QuerySetEntry::child(
                "a",
                [QuerySetEntry::child("b", [QuerySetEntry::value()])]
            )])
        );
    }

    #[test]
    fn unwrapping_stops_at_errors() {
        let response = RemoteResponse {
            correlation_id: None,
            results: Value::list([Value::list([Value::number(7.0)])]),
        };
        let definition = data::value(response.results);
        assert_eq!(
            unwrap_levels(definition.clone(), 2).to_value(),
            Some(Value::number(7.0))
        );

        let failed = data::list([data::fail("gone")]);
        assert!(unwrap_levels(failed, 3).is_error());
        assert!(unwrap_levels(data::pending(), 2).is_pending());
        assert!(unwrap_levels(data::list([]), 1).is_error());
    }
}
