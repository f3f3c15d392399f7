//! Binding, scoping, function application, branching and asynchronous leaves.

use super::data;
use crate::address::GraphNode;
use crate::dependency::{NodeDependency, Until};
use crate::engine::{DepsContext, RunContext};
use crate::error::NodeError;
use crate::node::{Func, NodeDefinition, Opaque, Prop};
use crate::operation::{OpKind, Operation};
use crate::registry::{NodeType, Outcome, PropKind, Registry, StateSpec};
use crate::value::{Key, Value};
use futures_util::stream::LocalBoxStream;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const LOOKUP: &str = "lookup";
pub const WITH_CONTEXT: &str = "with_context";
pub const SCOPE: &str = "scope";
pub const GET: &str = "get";
pub const REF: &str = "ref";
pub const FN: &str = "fn";
pub const RUST_FN: &str = "rust_fn";
pub const APPLY: &str = "apply";
pub const RESOLVE: &str = "resolve";
pub const IF_ELSE: &str = "if_else";
pub const CATCH_ERROR: &str = "catch_error";
pub const DEFAULT: &str = "default";
pub const EVENT: &str = "event";
pub const EMIT: &str = "emit";
pub const INVALIDATE_ON: &str = "invalidate_on";
pub const FROM_STREAM: &str = "from_stream";

/// Produces a fresh stream each time a `from_stream` instance is subscribed.
pub struct StreamFactory(Box<dyn Fn() -> LocalBoxStream<'static, NodeDefinition>>);

impl StreamFactory {
    pub fn new(factory: impl Fn() -> LocalBoxStream<'static, NodeDefinition> + 'static) -> Self {
        Self(Box::new(factory))
    }
}

pub fn lookup(name: &str) -> NodeDefinition {
    NodeDefinition::new(LOOKUP, [("name", Prop::Value(Value::text(name)))])
}

/// Evaluate `body` in a child context binding each name to a node of the
/// current context.
pub fn with_context(
    bindings: impl IntoIterator<Item = (impl Into<Arc<str>>, NodeDefinition)>,
    body: NodeDefinition,
) -> NodeDefinition {
    NodeDefinition::new(
        WITH_CONTEXT,
        [("bindings", Prop::named(bindings)), ("body", Prop::Node(body))],
    )
}

/// Evaluate `body` as the root of a child scope with its own cache and events.
pub fn scope(body: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(SCOPE, [("body", Prop::Node(body))])
}

pub fn get(target: NodeDefinition, key: impl Into<Key>) -> NodeDefinition {
    let key = match key.into() {
        Key::Index(index) => Value::number(index as f64),
        Key::Name(name) => Value::Text(name),
    };
    NodeDefinition::new(
        GET,
        [("target", Prop::Node(target)), ("key", Prop::Value(key))],
    )
}

/// Dotted path relative to the root of the current scope. Builds a `ref`
/// node; `ref` itself is a Rust keyword.
pub fn reference(path: &str) -> NodeDefinition {
    NodeDefinition::new(REF, [("path", Prop::Value(Value::text(path)))])
}

/// Function node, tagged `fn`. Calling it binds `params` to the (resolved)
/// arguments in a child of the context the function was defined in.
pub fn func(params: &[&str], body: NodeDefinition) -> NodeDefinition {
    let params = Value::list(params.iter().map(|param| Value::text(*param)));
    NodeDefinition::new(
        FN,
        [("params", Prop::Value(params)), ("body", Prop::Node(body))],
    )
}

pub fn rust_fn(func: Func) -> NodeDefinition {
    NodeDefinition::new(RUST_FN, [("func", Prop::Func(func))])
}

pub fn apply(
    target: NodeDefinition,
    args: impl IntoIterator<Item = NodeDefinition>,
) -> NodeDefinition {
    NodeDefinition::new(
        APPLY,
        [("target", Prop::Node(target)), ("args", Prop::nodes(args))],
    )
}

/// Evaluate every dependency concurrently, then pass the latest static
/// results to `then`. The first error or pending result propagates instead.
pub fn resolve(
    deps: impl IntoIterator<Item = NodeDefinition>,
    then: Func,
) -> NodeDefinition {
    resolve_tolerant(deps, then, false, false)
}

pub fn resolve_tolerant(
    deps: impl IntoIterator<Item = NodeDefinition>,
    then: Func,
    allow_errors: bool,
    allow_pending: bool,
) -> NodeDefinition {
    NodeDefinition::new(
        RESOLVE,
        [
            ("deps", Prop::nodes(deps)),
            ("then", Prop::Func(then)),
            ("allow_errors", Prop::Value(Value::Bool(allow_errors))),
            ("allow_pending", Prop::Value(Value::Bool(allow_pending))),
        ],
    )
}

pub fn if_else(
    condition: NodeDefinition,
    then: NodeDefinition,
    otherwise: NodeDefinition,
) -> NodeDefinition {
    NodeDefinition::new(
        IF_ELSE,
        [
            ("condition", Prop::Node(condition)),
            ("then", Prop::Node(then)),
            ("else", Prop::Node(otherwise)),
        ],
    )
}

/// Evaluate `fallback` when `body` resolves to an error. The error is bound
/// as `error` in the fallback's context.
pub fn catch_error(body: NodeDefinition, fallback: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        CATCH_ERROR,
        [("body", Prop::Node(body)), ("fallback", Prop::Node(fallback))],
    )
}

/// Evaluate `fallback` while `body` is pending or nil.
pub fn default(body: NodeDefinition, fallback: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        DEFAULT,
        [("body", Prop::Node(body)), ("fallback", Prop::Node(fallback))],
    )
}

/// Latest payload of the scope event `name`, `initial` until the first one.
pub fn event(name: &str, initial: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        EVENT,
        [
            ("name", Prop::Value(Value::text(name))),
            ("initial", Prop::Node(initial)),
        ],
    )
}

/// Action emitting `payload` (resolved) as the scope event `name`.
pub fn emit(name: &str, payload: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        EMIT,
        [
            ("name", Prop::Value(Value::text(name))),
            ("payload", Prop::Node(payload)),
        ],
    )
}

/// `body`, invalidated whenever the scope event `name` is emitted.
pub fn invalidate_on(name: &str, body: NodeDefinition) -> NodeDefinition {
    NodeDefinition::new(
        INVALIDATE_ON,
        [
            ("name", Prop::Value(Value::text(name))),
            ("body", Prop::Node(body)),
        ],
    )
}

/// Pending until the stream produced by `factory` yields; then its latest item.
pub fn from_stream(factory: StreamFactory) -> NodeDefinition {
    NodeDefinition::new(FROM_STREAM, [("factory", Prop::Opaque(Opaque::new(factory)))])
}

fn text_prop(definition: &NodeDefinition, name: &'static str) -> Result<Arc<str>, NodeError> {
    match definition.value_prop(name)? {
        Value::Text(text) => Ok(text.clone()),
        other => Err(NodeError::mismatch(
            "evaluate",
            format!("text in `{name}`"),
            other.kind(),
        )),
    }
}

fn bool_prop(definition: &NodeDefinition, name: &'static str) -> bool {
    matches!(definition.value_prop(name), Ok(Value::Bool(true)))
}

fn into_key(value: &Value) -> Result<Key, NodeError> {
    match value {
        Value::Text(name) => Ok(Key::Name(name.clone())),
        Value::Number(n) if n.0.fract() == 0.0 => Ok(Key::Index(n.0 as i64)),
        other => Err(NodeError::mismatch("getChild", "a name or an index", other.kind())),
    }
}

/// `get` chain walking `path` from `root`.
pub(crate) fn path_from(root: NodeDefinition, path: &[Key]) -> NodeDefinition {
    path.iter().fold(root, |node, key| get(node, key.clone()))
}

fn lookup_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let name = text_prop(cx.definition(), "name")?;
    Ok(Outcome::Node(cx.lookup(&name)?))
}

fn with_context_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let node = cx.node().clone();
    let bindings: BTreeMap<Arc<str>, GraphNode> = node
        .definition
        .named_prop("bindings")?
        .iter()
        .map(|(name, bound)| (name.clone(), node.with_scope_from(bound.clone())))
        .collect();
    let context = cx.create_context(bindings)?;
    let body = node.definition.node_prop("body")?.clone();
    Ok(Outcome::Node(GraphNode::create(body, node.scope, context)))
}

fn scope_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let body = cx.definition().node_prop("body")?.clone();
    Ok(Outcome::Node(cx.child_scope(body)?))
}

fn get_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let key = into_key(definition.value_prop("key")?)?;
    let target = definition.node_prop("target")?.clone();
    Ok(vec![NodeDependency::new(target)
        .operation(Operation::GetChild(key))
        .until(Until::Any)])
}

fn forward_first(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    deps.first()
        .cloned()
        .map(Outcome::Node)
        .ok_or_else(|| NodeError::custom("missing dependency"))
}

fn ref_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let path = Key::parse_path(&text_prop(cx.definition(), "path")?);
    let root = cx.scope_root()?;
    let target = path_from(root.definition.clone(), &path);
    Ok(Outcome::Node(root.with_scope_from(target)))
}

fn fn_call(
    cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Operation::Call(args) = op else {
        return Err(NodeError::custom(format!("unexpected `{}`", op.name())));
    };
    let node = cx.node().clone();
    let params = node.definition.value_prop("params")?;
    let names = params.as_list().unwrap_or_default();
    let mut bindings = BTreeMap::new();
    for (index, name) in names.iter().enumerate() {
        let Some(name) = name.as_text() else {
            return Err(NodeError::mismatch("call", "text parameter names", name.kind()));
        };
        let arg = args.get(index).cloned().unwrap_or_else(data::nil);
        bindings.insert(Arc::from(name), node.with_scope_from(arg));
    }
    let context = cx.create_context(bindings)?;
    let body = node.definition.node_prop("body")?.clone();
    Ok(Outcome::Node(GraphNode::create(body, node.scope, context)))
}

fn rust_fn_call(
    cx: &mut RunContext<'_>,
    op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Operation::Call(args) = op else {
        return Err(NodeError::custom(format!("unexpected `{}`", op.name())));
    };
    let func = cx.definition().func_prop("func")?;
    Ok(Outcome::Done(func.call(args)))
}

fn apply_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let target = definition.node_prop("target")?.clone();
    let mut deps = vec![NodeDependency::new(target).until(Until::Supports(OpKind::Call))];
    deps.extend(
        definition
            .nodes_prop("args")?
            .iter()
            .cloned()
            .map(|arg| NodeDependency::new(arg).operation(Operation::Resolve)),
    );
    Ok(deps)
}

fn apply_run(
    _cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let (target, args) = deps
        .split_first()
        .ok_or_else(|| NodeError::custom("`apply` without a target"))?;
    let call = Operation::call(args.iter().map(|arg| arg.definition.clone()));
    Ok(Outcome::Delegate(target.clone(), call))
}

fn resolve_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let definition = cx.definition();
    let allow_errors = bool_prop(definition, "allow_errors");
    let allow_pending = bool_prop(definition, "allow_pending");
    Ok(definition
        .nodes_prop("deps")?
        .iter()
        .cloned()
        .map(|dep| NodeDependency::new(dep).tolerant(allow_errors, allow_pending))
        .collect())
}

fn resolve_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let results: Vec<NodeDefinition> = deps.iter().map(|dep| dep.definition.clone()).collect();
    let then = cx.definition().func_prop("then")?;
    Ok(Outcome::Done(then.call(&results)))
}

fn if_else_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let condition = cx.definition().node_prop("condition")?.clone();
    Ok(vec![NodeDependency::new(condition)])
}

fn if_else_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let truthy = deps
        .first()
        .and_then(|condition| condition.definition.to_value())
        .is_some_and(|value| value.is_truthy());
    let branch = if truthy { "then" } else { "else" };
    Ok(Outcome::Done(cx.definition().node_prop(branch)?.clone()))
}

fn body_tolerant(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let body = cx.definition().node_prop("body")?.clone();
    Ok(vec![NodeDependency::new(body).tolerant(true, true)])
}

fn catch_error_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Some(result) = deps.first() else {
        return Err(NodeError::custom("missing dependency"));
    };
    if !result.definition.is_error() {
        return Ok(Outcome::Node(result.clone()));
    }
    log::debug!("caught {:?}", result.definition);
    let node = cx.node().clone();
    let mut bindings = BTreeMap::new();
    bindings.insert(Arc::from("error"), node.with_scope_from(result.definition.clone()));
    let context = cx.create_context(bindings)?;
    let fallback = node.definition.node_prop("fallback")?.clone();
    Ok(Outcome::Node(GraphNode::create(fallback, node.scope, context)))
}

fn default_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let Some(result) = deps.first() else {
        return Err(NodeError::custom("missing dependency"));
    };
    let missing = result.definition.is_pending()
        || result.definition.to_value() == Some(Value::Nil);
    if missing {
        return Ok(Outcome::Done(cx.definition().node_prop("fallback")?.clone()));
    }
    Ok(Outcome::Node(result.clone()))
}

fn unit_state(_definition: &NodeDefinition) -> Result<Box<dyn Any>, NodeError> {
    Ok(Box::new(()))
}

fn event_subscribe(cx: &mut RunContext<'_>) -> Result<(), NodeError> {
    let name = text_prop(cx.definition(), "name")?;
    cx.listen(&name);
    Ok(())
}

fn latest_source(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    if let Some(latest) = cx.source() {
        return Ok(Outcome::Done(latest));
    }
    match cx.definition().prop("initial") {
        Some(Prop::Node(initial)) => Ok(Outcome::Done(initial.clone())),
        _ => Ok(Outcome::Done(data::pending())),
    }
}

fn emit_deps(cx: &DepsContext<'_>, _op: &Operation) -> Result<Vec<NodeDependency>, NodeError> {
    let payload = cx.definition().node_prop("payload")?.clone();
    Ok(vec![NodeDependency::new(payload).operation(Operation::Resolve)])
}

fn emit_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    let name = text_prop(cx.definition(), "name")?;
    let payload = deps
        .first()
        .map(|payload| payload.definition.clone())
        .unwrap_or_else(data::nil);
    cx.emit_event(&name, payload.clone());
    Ok(Outcome::Done(payload))
}

fn invalidate_on_subscribe(cx: &mut RunContext<'_>) -> Result<(), NodeError> {
    let name = text_prop(cx.definition(), "name")?;
    let body = cx.definition().node_prop("body")?.clone();
    let target = cx.node().with_scope_from(body);
    cx.invalidate_on(&name, target);
    Ok(())
}

fn body_run(
    cx: &mut RunContext<'_>,
    _op: &Operation,
    _deps: &[GraphNode],
) -> Result<Outcome, NodeError> {
    Ok(Outcome::Done(cx.definition().node_prop("body")?.clone()))
}

fn stream_subscribe(cx: &mut RunContext<'_>) -> Result<(), NodeError> {
    let factory = cx.definition().opaque_prop::<StreamFactory>("factory")?;
    cx.attach((factory.0)());
    Ok(())
}

fn stream_unsubscribe(cx: &mut RunContext<'_>) -> Result<(), NodeError> {
    cx.detach();
    Ok(())
}

fn stream_restart(cx: &mut RunContext<'_>) -> Result<(), NodeError> {
    cx.detach();
    stream_subscribe(cx)
}

pub(crate) fn register(registry: &mut Registry) {
    registry
        .register(
            NodeType::new(LOOKUP)
                .prop("name", PropKind::Value)
                .run(OpKind::Evaluate, lookup_run),
        )
        .register(
            NodeType::new(WITH_CONTEXT)
                .prop("bindings", PropKind::Named)
                .prop("body", PropKind::Node)
                .run(OpKind::Evaluate, with_context_run),
        )
        .register(
            NodeType::new(SCOPE)
                .prop("body", PropKind::Node)
                .run(OpKind::Evaluate, scope_run),
        )
        .register(
            NodeType::new(GET)
                .prop("target", PropKind::Node)
                .prop("key", PropKind::Value)
                .handler(OpKind::Evaluate, get_deps, forward_first),
        )
        .register(
            NodeType::new(REF)
                .prop("path", PropKind::Value)
                .run(OpKind::Evaluate, ref_run),
        )
        .register(
            NodeType::new(FN)
                .prop("params", PropKind::Value)
                .prop("body", PropKind::Node)
                .run(OpKind::Call, fn_call),
        )
        .register(
            NodeType::new(RUST_FN)
                .prop("func", PropKind::Func)
                .run(OpKind::Call, rust_fn_call),
        )
        .register(
            NodeType::new(APPLY)
                .prop("target", PropKind::Node)
                .prop("args", PropKind::Nodes)
                .handler(OpKind::Evaluate, apply_deps, apply_run),
        )
        .register(
            NodeType::new(RESOLVE)
                .prop("deps", PropKind::Nodes)
                .prop("then", PropKind::Func)
                .prop("allow_errors", PropKind::Value)
                .prop("allow_pending", PropKind::Value)
                .handler(OpKind::Evaluate, resolve_deps, resolve_run),
        )
        .register(
            NodeType::new(IF_ELSE)
                .prop("condition", PropKind::Node)
                .prop("then", PropKind::Node)
                .prop("else", PropKind::Node)
                .handler(OpKind::Evaluate, if_else_deps, if_else_run),
        )
        .register(
            NodeType::new(CATCH_ERROR)
                .prop("body", PropKind::Node)
                .prop("fallback", PropKind::Node)
                .handler(OpKind::Evaluate, body_tolerant, catch_error_run),
        )
        .register(
            NodeType::new(DEFAULT)
                .prop("body", PropKind::Node)
                .prop("fallback", PropKind::Node)
                .handler(OpKind::Evaluate, body_tolerant, default_run),
        )
        .register(
            NodeType::new(EVENT)
                .prop("name", PropKind::Value)
                .prop("initial", PropKind::Node)
                .state(StateSpec::new(unit_state).on_subscribe(event_subscribe))
                .run(OpKind::Evaluate, latest_source),
        )
        .register(
            NodeType::new(EMIT)
                .prop("name", PropKind::Value)
                .prop("payload", PropKind::Node)
                .one_shot()
                .handler(OpKind::Evaluate, emit_deps, emit_run),
        )
        .register(
            NodeType::new(INVALIDATE_ON)
                .prop("name", PropKind::Value)
                .prop("body", PropKind::Node)
                .state(StateSpec::new(unit_state).on_subscribe(invalidate_on_subscribe))
                .run(OpKind::Evaluate, body_run),
        )
        .register(
            NodeType::new(FROM_STREAM)
                .prop("factory", PropKind::Opaque)
                .state(
                    StateSpec::new(unit_state)
                        .on_subscribe(stream_subscribe)
                        .on_unsubscribe(stream_unsubscribe)
                        .on_invalidate(stream_restart),
                )
                .run(OpKind::Evaluate, latest_source),
        );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_come_from_text_or_whole_numbers() {
        assert_eq!(into_key(&Value::text("a")), Ok(Key::name("a")));
        assert_eq!(into_key(&Value::number(2.0)), Ok(Key::Index(2)));
        assert!(into_key(&Value::number(1.5)).is_err());
    }

    #[test]
    fn path_builds_get_chain() {
        let root = data::record([("a", data::nil())]);
        let chained = path_from(root.clone(), &Key::parse_path("a.0"));
        assert_eq!(chained, get(get(root, "a"), 0i64));
    }

    #[test]
    fn keyword_named_nodes_keep_their_tags() {
        let registry = Registry::with_builtins();
        let by_path = reference("a.b");
        assert_eq!(by_path.tag(), "ref");
        assert!(registry.validate(&by_path).is_ok());
        let function = func(&["x"], lookup("x"));
        assert_eq!(function.tag(), "fn");
        assert!(registry.validate(&function).is_ok());
        assert!(registry.supports("fn", OpKind::Call));
    }
}
