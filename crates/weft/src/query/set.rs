//! QuerySets: the flat, mergeable, wire-safe form of a query.
//!
//! A `QuerySet` is an ordered list of entries. Each entry applies one
//! primitive operation at its position and carries the entries to run on
//! the result. Results mirror the request positionally: a `value` entry
//! yields the resolved value, every other entry yields the list of its
//! children's results (`items` yields one such list per item). An entry
//! whose own operation fails yields the error in place of that list.

use crate::node::{NodeDefinition, Prop};
use crate::registry::{NodeType, PropKind, Registry};
use crate::value::{Key, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const QUERY_ENTRY: &str = "query_entry";

/// Which non-data results an entry accepts in place of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub allow_errors: bool,
    pub allow_pending: bool,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            allow_errors: true,
            allow_pending: false,
        }
    }
}

impl Tolerance {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QuerySetOp {
    /// Deep resolution into plain data.
    Value,
    Child { key: Key },
    Items {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        transforms: Vec<NodeDefinition>,
    },
    Call { args: Vec<NodeDefinition> },
    Set { value: NodeDefinition },
}

impl QuerySetOp {
    pub fn name(&self) -> &'static str {
        match self {
            QuerySetOp::Value => "value",
            QuerySetOp::Child { .. } => "child",
            QuerySetOp::Items { .. } => "items",
            QuerySetOp::Call { .. } => "call",
            QuerySetOp::Set { .. } => "set",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySetEntry {
    #[serde(flatten)]
    pub op: QuerySetOp,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<QuerySetEntry>,
    #[serde(default, skip_serializing_if = "Tolerance::is_default")]
    pub tolerance: Tolerance,
}

impl QuerySetEntry {
    pub fn new(op: QuerySetOp) -> Self {
        Self {
            op,
            children: Vec::new(),
            tolerance: Tolerance::default(),
        }
    }

    pub fn value() -> Self {
        Self::new(QuerySetOp::Value)
    }

    pub fn child(key: impl Into<Key>, children: impl IntoIterator<Item = QuerySetEntry>) -> Self {
        Self::new(QuerySetOp::Child { key: key.into() }).with_children(children)
    }

    pub fn items(children: impl IntoIterator<Item = QuerySetEntry>) -> Self {
        Self::new(QuerySetOp::Items {
            transforms: Vec::new(),
        })
        .with_children(children)
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = QuerySetEntry>) -> Self {
        self.children = children.into_iter().collect();
        self
    }

    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Encode as a `query_entry` definition so executor nodes can carry it
    /// as a value-comparable prop.
    pub(crate) fn to_definition(&self) -> NodeDefinition {
        let mut props: Vec<(&'static str, Prop)> = vec![
            ("op", Prop::Value(Value::text(self.op.name()))),
            ("children", Prop::nodes(self.children.iter().map(Self::to_definition))),
            ("allow_errors", Prop::Value(Value::Bool(self.tolerance.allow_errors))),
            ("allow_pending", Prop::Value(Value::Bool(self.tolerance.allow_pending))),
        ];
        match &self.op {
            QuerySetOp::Value => {}
            QuerySetOp::Child { key } => props.push(("key", Prop::Value(key_value(key)))),
            QuerySetOp::Items { transforms } => {
                props.push(("transforms", Prop::nodes(transforms.iter().cloned())))
            }
            QuerySetOp::Call { args } => props.push(("args", Prop::nodes(args.iter().cloned()))),
            QuerySetOp::Set { value } => props.push(("value", Prop::Node(value.clone()))),
        }
        NodeDefinition::new(QUERY_ENTRY, props)
    }

    pub(crate) fn from_definition(
        definition: &NodeDefinition,
    ) -> Result<Self, crate::error::NodeError> {
        let op = match definition.value_prop("op")?.as_text() {
            Some("value") => QuerySetOp::Value,
            Some("child") => QuerySetOp::Child {
                key: value_key(definition.value_prop("key")?)?,
            },
            Some("items") => QuerySetOp::Items {
                transforms: definition.nodes_prop("transforms")?.to_vec(),
            },
            Some("call") => QuerySetOp::Call {
                args: definition.nodes_prop("args")?.to_vec(),
            },
            Some("set") => QuerySetOp::Set {
                value: definition.node_prop("value")?.clone(),
            },
            other => {
                return Err(crate::error::NodeError::mismatch(
                    "query",
                    "a query entry operation",
                    format!("{other:?}"),
                ))
            }
        };
        let children = definition
            .nodes_prop("children")?
            .iter()
            .map(Self::from_definition)
            .collect::<Result<Vec<_>, _>>()?;
        let flag = |name| matches!(definition.value_prop(name), Ok(Value::Bool(true)));
        Ok(Self {
            op,
            children,
            tolerance: Tolerance {
                allow_errors: flag("allow_errors"),
                allow_pending: flag("allow_pending"),
            },
        })
    }
}

fn key_value(key: &Key) -> Value {
    match key {
        Key::Index(index) => Value::number(*index as f64),
        Key::Name(name) => Value::Text(name.clone()),
    }
}

fn value_key(value: &Value) -> Result<Key, crate::error::NodeError> {
    match value {
        Value::Number(n) => Ok(Key::Index(n.0 as i64)),
        Value::Text(name) => Ok(Key::Name(Arc::clone(name))),
        other => Err(crate::error::NodeError::mismatch(
            "query",
            "a key",
            other.kind(),
        )),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuerySet {
    pub entries: Vec<QuerySetEntry>,
}

impl QuerySet {
    pub fn new(entries: impl IntoIterator<Item = QuerySetEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn to_definitions(&self) -> Vec<NodeDefinition> {
        self.entries.iter().map(QuerySetEntry::to_definition).collect()
    }

    pub(crate) fn from_definitions(
        definitions: &[NodeDefinition],
    ) -> Result<Self, crate::error::NodeError> {
        Ok(Self {
            entries: definitions
                .iter()
                .map(QuerySetEntry::from_definition)
                .collect::<Result<_, _>>()?,
        })
    }

    #[cfg(feature = "json")]
    pub fn to_json(&self) -> Result<String, crate::error::GraphError> {
        Ok(serde_json::to_string(self)?)
    }

    #[cfg(feature = "json")]
    pub fn from_json(json: &str) -> Result<Self, crate::error::GraphError> {
        Ok(serde_json::from_str(json)?)
    }
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register(
        NodeType::new(QUERY_ENTRY)
            .prop("op", PropKind::Value)
            .prop("children", PropKind::Nodes)
            .prop("allow_errors", PropKind::Value)
            .prop("allow_pending", PropKind::Value)
            .optional("key", PropKind::Value)
            .optional("transforms", PropKind::Nodes)
            .optional("args", PropKind::Nodes)
            .optional("value", PropKind::Node),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::data;

    fn sample() -> QuerySet {
        QuerySet::new([
            QuerySetEntry::child("user", [QuerySetEntry::child("name", [QuerySetEntry::value()])]),
            QuerySetEntry::child(
                "posts",
                [QuerySetEntry::items([QuerySetEntry::value()]).with_tolerance(Tolerance {
                    allow_errors: true,
                    allow_pending: true,
                })],
            ),
            QuerySetEntry::new(QuerySetOp::Call {
                args: vec![data::value(2.0)],
            })
            .with_children([QuerySetEntry::value()]),
        ])
    }

    #[test]
    fn entries_survive_definition_encoding() {
        let set = sample();
        let decoded = QuerySet::from_definitions(&set.to_definitions()).unwrap();
        assert_eq!(decoded, set);
    }

    #[cfg(feature = "json")]
    #[test]
    fn wire_format_is_lossless() {
        let set = sample();
        let json = set.to_json().unwrap();
        assert!(json.starts_with(r#"[{"op":"child","key":"user""#), "{json}");
        assert_eq!(QuerySet::from_json(&json).unwrap(), set);
    }

    #[test]
    fn default_tolerance_keeps_errors_only() {
        let tolerance = Tolerance::default();
        assert!(tolerance.allow_errors);
        assert!(!tolerance.allow_pending);
    }
}
