//! Node definitions: immutable, value-comparable descriptors `{tag, props}`.
//!
//! Definitions are produced by pure factory functions (see `nodes`,
//! `transduce`, `remote`) and compared structurally. The structural hash is
//! computed once at construction so definitions can key caches cheaply.

use crate::error::{NodeError, ShapeError};
use crate::nodes::data;
use crate::value::{ErrorValue, Value};
use rustc_hash::FxHasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

pub type Props = BTreeMap<Arc<str>, Prop>;

/// Native function carried by a definition. Compared by identity, so the same
/// `Func` cloned into two definitions keeps them equal.
#[derive(Clone)]
pub struct Func {
    name: Arc<str>,
    call: Rc<dyn Fn(&[NodeDefinition]) -> NodeDefinition>,
}

impl Func {
    pub fn new(
        name: impl Into<Arc<str>>,
        call: impl Fn(&[NodeDefinition]) -> NodeDefinition + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            call: Rc::new(call),
        }
    }

    /// Wrap a function over plain data. Non-data arguments produce an error node.
    pub fn values(name: impl Into<Arc<str>>, call: impl Fn(&[Value]) -> Value + 'static) -> Self {
        let name: Arc<str> = name.into();
        let label = name.clone();
        Self::new(name, move |args: &[NodeDefinition]| {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                match arg.to_value() {
                    Some(value) => values.push(value),
                    None => {
                        return data::error(ErrorValue::new(format!(
                            "`{label}` expected data arguments, received `{}`",
                            arg.tag()
                        )));
                    }
                }
            }
            data::value(call(&values))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[NodeDefinition]) -> NodeDefinition {
        (self.call)(args)
    }

    fn addr(&self) -> *const () {
        Rc::as_ptr(&self.call) as *const ()
    }
}

impl PartialEq for Func {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Func {}

impl Hash for Func {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Func({})", self.name)
    }
}

/// Host object carried by a definition (pipelines, stream factories, action
/// bodies). Compared by identity.
#[derive(Clone)]
pub struct Opaque(Rc<dyn Any>);

impl Opaque {
    pub fn new<T: 'static>(value: T) -> Self {
        Opaque(Rc::new(value))
    }

    pub fn from_rc<T: 'static>(value: Rc<T>) -> Self {
        Opaque(value)
    }

    pub fn downcast<T: 'static>(&self) -> Option<Rc<T>> {
        self.0.clone().downcast::<T>().ok()
    }

    fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Opaque {}

impl Hash for Opaque {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({:p})", self.addr())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Prop {
    Value(Value),
    Node(NodeDefinition),
    Nodes(Rc<Vec<NodeDefinition>>),
    Named(Rc<BTreeMap<Arc<str>, NodeDefinition>>),
    #[serde(skip)]
    Func(Func),
    #[serde(skip)]
    Opaque(Opaque),
}

impl Prop {
    pub fn nodes(items: impl IntoIterator<Item = NodeDefinition>) -> Self {
        Prop::Nodes(Rc::new(items.into_iter().collect()))
    }

    pub fn named(fields: impl IntoIterator<Item = (impl Into<Arc<str>>, NodeDefinition)>) -> Self {
        Prop::Named(Rc::new(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Prop::Value(_) => "value",
            Prop::Node(_) => "node",
            Prop::Nodes(_) => "nodes",
            Prop::Named(_) => "named nodes",
            Prop::Func(_) => "function",
            Prop::Opaque(_) => "opaque handle",
        }
    }
}

impl From<Value> for Prop {
    fn from(value: Value) -> Self {
        Prop::Value(value)
    }
}

impl From<NodeDefinition> for Prop {
    fn from(node: NodeDefinition) -> Self {
        Prop::Node(node)
    }
}

impl From<Func> for Prop {
    fn from(func: Func) -> Self {
        Prop::Func(func)
    }
}

struct Inner {
    tag: Arc<str>,
    props: Props,
    hash: u64,
}

#[derive(Clone)]
pub struct NodeDefinition(Rc<Inner>);

impl NodeDefinition {
    pub fn new(tag: impl Into<Arc<str>>, props: impl IntoIterator<Item = (&'static str, Prop)>) -> Self {
        Self::from_props(
            tag,
            props.into_iter().map(|(name, prop)| (Arc::from(name), prop)).collect(),
        )
    }

    pub fn from_props(tag: impl Into<Arc<str>>, props: Props) -> Self {
        let tag = tag.into();
        let mut hasher = FxHasher::default();
        tag.hash(&mut hasher);
        props.hash(&mut hasher);
        NodeDefinition(Rc::new(Inner {
            tag,
            props,
            hash: hasher.finish(),
        }))
    }

    pub fn tag(&self) -> &str {
        &self.0.tag
    }

    pub fn props(&self) -> &Props {
        &self.0.props
    }

    pub fn prop(&self, name: &str) -> Option<&Prop> {
        self.0.props.get(name)
    }

    /// Copy of this definition with one property replaced.
    pub fn with_prop(&self, name: &'static str, prop: Prop) -> Self {
        let mut props = self.0.props.clone();
        props.insert(Arc::from(name), prop);
        Self::from_props(self.0.tag.clone(), props)
    }

    fn expect_prop(&self, name: &'static str) -> Result<&Prop, ShapeError> {
        self.prop(name).ok_or_else(|| ShapeError::Missing {
            tag: self.0.tag.clone(),
            prop: name,
        })
    }

    fn wrong_kind(&self, name: &'static str, expected: &'static str, found: &Prop) -> NodeError {
        ShapeError::WrongKind {
            tag: self.0.tag.clone(),
            prop: name,
            expected,
            found: found.kind(),
        }
        .into()
    }

    pub fn value_prop(&self, name: &'static str) -> Result<&Value, NodeError> {
        match self.expect_prop(name)? {
            Prop::Value(value) => Ok(value),
            other => Err(self.wrong_kind(name, "value", other)),
        }
    }

    pub fn node_prop(&self, name: &'static str) -> Result<&NodeDefinition, NodeError> {
        match self.expect_prop(name)? {
            Prop::Node(node) => Ok(node),
            other => Err(self.wrong_kind(name, "node", other)),
        }
    }

    pub fn nodes_prop(&self, name: &'static str) -> Result<&[NodeDefinition], NodeError> {
        match self.expect_prop(name)? {
            Prop::Nodes(nodes) => Ok(nodes),
            other => Err(self.wrong_kind(name, "nodes", other)),
        }
    }

    pub fn named_prop(
        &self,
        name: &'static str,
    ) -> Result<&BTreeMap<Arc<str>, NodeDefinition>, NodeError> {
        match self.expect_prop(name)? {
            Prop::Named(named) => Ok(named),
            other => Err(self.wrong_kind(name, "named nodes", other)),
        }
    }

    pub fn func_prop(&self, name: &'static str) -> Result<&Func, NodeError> {
        match self.expect_prop(name)? {
            Prop::Func(func) => Ok(func),
            other => Err(self.wrong_kind(name, "function", other)),
        }
    }

    pub fn opaque_prop<T: 'static>(&self, name: &'static str) -> Result<Rc<T>, NodeError> {
        match self.expect_prop(name)? {
            Prop::Opaque(opaque) => opaque
                .downcast::<T>()
                .ok_or_else(|| self.wrong_kind(name, std::any::type_name::<T>(), &Prop::Opaque(opaque.clone()))),
            other => Err(self.wrong_kind(name, "opaque handle", other)),
        }
    }

    pub fn number_prop(&self, name: &'static str) -> Result<f64, NodeError> {
        let value = self.value_prop(name)?;
        value.as_number().ok_or_else(|| {
            ShapeError::WrongKind {
                tag: self.0.tag.clone(),
                prop: name,
                expected: "number",
                found: value.kind(),
            }
            .into()
        })
    }

    pub fn is_error(&self) -> bool {
        self.tag() == data::ERROR
    }

    pub fn is_pending(&self) -> bool {
        self.tag() == data::PENDING
    }

    pub fn as_error(&self) -> Option<ErrorValue> {
        if !self.is_error() {
            return None;
        }
        match self.prop("error") {
            Some(Prop::Value(Value::Error(error))) => Some(error.as_ref().clone()),
            _ => Some(ErrorValue::new("malformed error node")),
        }
    }

    /// Plain data held by a terminal data node, recursing through lists and
    /// records of data nodes. `None` when any part is not data.
    pub fn to_value(&self) -> Option<Value> {
        match self.tag() {
            data::VALUE => match self.prop("value") {
                Some(Prop::Value(value)) => Some(value.clone()),
                _ => None,
            },
            data::ERROR => self.as_error().map(Value::error),
            data::PENDING => Some(Value::Pending),
            data::LIST => {
                let items = self.nodes_prop("items").ok()?;
                items
                    .iter()
                    .map(NodeDefinition::to_value)
                    .collect::<Option<Vec<_>>>()
                    .map(Value::list)
            }
            data::RECORD => {
                let fields = self.named_prop("fields").ok()?;
                let mut out = BTreeMap::new();
                for (name, field) in fields {
                    out.insert(name.clone(), field.to_value()?);
                }
                Some(Value::Record(Arc::new(out)))
            }
            _ => None,
        }
    }
}

impl PartialEq for NodeDefinition {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
            || (self.0.hash == other.0.hash
                && self.0.tag == other.0.tag
                && self.0.props == other.0.props)
    }
}

impl Eq for NodeDefinition {}

impl Hash for NodeDefinition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.to_value() {
            return write!(f, "{}({value})", self.tag());
        }
        let mut tuple = f.debug_tuple(self.tag());
        for (name, prop) in self.props() {
            tuple.field(&format_args!("{name}={prop:?}"));
        }
        tuple.finish()
    }
}

#[derive(Serialize)]
struct DefinitionRef<'a> {
    tag: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    props: &'a Props,
}

#[derive(Deserialize)]
struct DefinitionOwned {
    tag: Arc<str>,
    #[serde(default)]
    props: Props,
}

impl Serialize for NodeDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DefinitionRef {
            tag: self.tag(),
            props: self.props(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeDefinition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let owned = DefinitionOwned::deserialize(deserializer)?;
        Ok(NodeDefinition::from_props(owned.tag, owned.props))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality_and_hash() {
        let a = data::list([data::value(Value::number(1.0)), data::nil()]);
        let b = data::list([data::value(Value::number(1.0)), data::nil()]);
        let mut ha = FxHasher::default();
        let mut hb = FxHasher::default();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(a, b);
        assert_eq!(ha.finish(), hb.finish());
        assert_ne!(a, data::list([data::nil()]));
    }

    #[test]
    fn func_identity() {
        let f = Func::values("id", |args| args[0].clone());
        let g = Func::values("id", |args| args[0].clone());
        let a = NodeDefinition::new("x", [("f", Prop::Func(f.clone()))]);
        let b = NodeDefinition::new("x", [("f", Prop::Func(f))]);
        let c = NodeDefinition::new("x", [("f", Prop::Func(g))]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn wrong_prop_kind_is_shape_error() {
        let def = NodeDefinition::new("x", [("n", Prop::Value(Value::text("no")))]);
        assert!(matches!(
            def.number_prop("n"),
            Err(NodeError::Shape(ShapeError::WrongKind { .. }))
        ));
        assert!(matches!(
            def.node_prop("missing"),
            Err(NodeError::Shape(ShapeError::Missing { .. }))
        ));
    }

    #[test]
    fn data_nodes_convert_to_values() {
        let def = data::list([data::value(Value::number(1.0)), data::record([("a", data::nil())])]);
        assert_eq!(
            def.to_value(),
            Some(Value::list([Value::number(1.0), Value::record([("a", Value::Nil)])]))
        );
    }
}
