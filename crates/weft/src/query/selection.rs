//! Hierarchical queries and their lowering to QuerySets.

use super::set::{QuerySet, QuerySetEntry, QuerySetOp, Tolerance};
use crate::node::NodeDefinition;
use crate::value::{ErrorValue, Key, Value};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What to read at a position.
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    /// The resolved value.
    Leaf,
    /// Named fields, each reached through a key path.
    Fields(IndexMap<Arc<str>, Field>),
    /// Every item of a collection, after optional transformers.
    Entries {
        transforms: Vec<NodeDefinition>,
        item: Box<Selection>,
    },
    /// Call the position with `args`, then select from the result.
    Call {
        args: Vec<NodeDefinition>,
        then: Box<Selection>,
    },
    /// `fallback` while anything inside is still pending.
    Deferred {
        inner: Box<Selection>,
        fallback: Value,
    },
    /// `fallback` when the position resolves to an error.
    Catch {
        inner: Box<Selection>,
        fallback: Value,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub path: Vec<Key>,
    pub selection: Selection,
}

impl Field {
    pub fn new(path: impl IntoIterator<Item = Key>, selection: Selection) -> Self {
        Self {
            path: path.into_iter().collect(),
            selection,
        }
    }

    /// Leaf at a dotted path.
    pub fn leaf(path: &str) -> Self {
        Self::new(Key::parse_path(path), Selection::Leaf)
    }

    pub fn at(path: &str, selection: Selection) -> Self {
        Self::new(Key::parse_path(path), selection)
    }
}

impl Selection {
    pub fn fields<N: Into<Arc<str>>>(fields: impl IntoIterator<Item = (N, Field)>) -> Self {
        Selection::Fields(
            fields
                .into_iter()
                .map(|(name, field)| (name.into(), field))
                .collect(),
        )
    }

    pub fn entries(item: Selection) -> Self {
        Selection::Entries {
            transforms: Vec::new(),
            item: Box::new(item),
        }
    }

    pub fn transformed(transforms: impl IntoIterator<Item = NodeDefinition>, item: Selection) -> Self {
        Selection::Entries {
            transforms: transforms.into_iter().collect(),
            item: Box::new(item),
        }
    }

    pub fn call(args: impl IntoIterator<Item = NodeDefinition>, then: Selection) -> Self {
        Selection::Call {
            args: args.into_iter().collect(),
            then: Box::new(then),
        }
    }

    pub fn deferred(self, fallback: impl Into<Value>) -> Self {
        Selection::Deferred {
            inner: Box::new(self),
            fallback: fallback.into(),
        }
    }

    pub fn catch(self, fallback: impl Into<Value>) -> Self {
        Selection::Catch {
            inner: Box::new(self),
            fallback: fallback.into(),
        }
    }

    /// Entries for this position, in the order results come back.
    pub fn compile(&self) -> Vec<QuerySetEntry> {
        self.compile_with(Tolerance::default())
    }

    fn compile_with(&self, tolerance: Tolerance) -> Vec<QuerySetEntry> {
        let entries = match self {
            Selection::Leaf => vec![QuerySetEntry::value()],
            Selection::Fields(fields) => fields
                .iter()
                .map(|(name, field)| field.compile(name))
                .collect(),
            Selection::Entries { transforms, item } => vec![QuerySetEntry::new(QuerySetOp::Items {
                transforms: transforms.clone(),
            })
            .with_children(item.compile())],
            Selection::Call { args, then } => vec![QuerySetEntry::new(QuerySetOp::Call {
                args: args.clone(),
            })
            .with_children(then.compile())],
            Selection::Deferred { inner, .. } => {
                return inner.compile_with(Tolerance {
                    allow_pending: true,
                    ..tolerance
                })
            }
            Selection::Catch { inner, .. } => return inner.compile_with(tolerance),
        };
        entries
            .into_iter()
            .map(|mut entry| {
                entry.tolerance.allow_pending |= tolerance.allow_pending;
                entry
            })
            .collect()
    }

    /// Rebuild plain data from the results of [`Selection::compile`].
    /// `path` is where this selection sits; errors get it attached.
    pub fn assemble(&self, results: &Value, path: &[Key]) -> Value {
        match self {
            Selection::Deferred { inner, fallback } => {
                let value = inner.assemble(results, path);
                if contains_pending(&value) {
                    fallback.clone()
                } else {
                    value
                }
            }
            Selection::Catch { inner, fallback } => match inner.assemble(results, path) {
                Value::Error(_) => fallback.clone(),
                value => value,
            },
            _ => {
                let Some(results) = positional(results) else {
                    return locate(results, path);
                };
                self.assemble_level(results, path)
            }
        }
    }

    fn assemble_level(&self, results: &[Value], path: &[Key]) -> Value {
        let first = || results.first().cloned().unwrap_or_default();
        match self {
            Selection::Leaf => locate(&first(), path),
            Selection::Fields(fields) => {
                let mut out = BTreeMap::new();
                for (index, (name, field)) in fields.iter().enumerate() {
                    let result = results.get(index).cloned().unwrap_or_default();
                    out.insert(name.clone(), field.assemble(name, &result, path));
                }
                Value::Record(Arc::new(out))
            }
            Selection::Entries { item, .. } => {
                let items = first();
                let Some(items) = positional(&items) else {
                    return locate(&items, path);
                };
                Value::list(items.iter().enumerate().map(|(index, result)| {
                    let mut at = path.to_vec();
                    at.push(Key::Index(index as i64));
                    item.assemble(result, &at)
                }))
            }
            Selection::Call { then, .. } => then.assemble(&first(), path),
            Selection::Deferred { .. } | Selection::Catch { .. } => {
                self.assemble(&Value::list(results.iter().cloned()), path)
            }
        }
    }
}

impl Field {
    fn keys(&self, name: &Arc<str>) -> Vec<Key> {
        if self.path.is_empty() {
            vec![Key::Name(name.clone())]
        } else {
            self.path.clone()
        }
    }

    /// One `child` entry per path segment, nested, ending in the selection.
    fn compile(&self, name: &Arc<str>) -> QuerySetEntry {
        let keys = self.keys(name);
        let mut children = self.selection.compile();
        // A deferred selection tolerates its whole path being pending.
        let tolerance = Tolerance {
            allow_pending: children.iter().any(|child| child.tolerance.allow_pending),
            ..Tolerance::default()
        };
        let mut entry = None;
        for key in keys.into_iter().rev() {
            let next = QuerySetEntry::child(key, children).with_tolerance(tolerance);
            children = vec![next.clone()];
            entry = Some(next);
        }
        entry.unwrap_or_else(QuerySetEntry::value)
    }

    fn assemble(&self, name: &Arc<str>, result: &Value, path: &[Key]) -> Value {
        let keys = self.keys(name);
        let mut at = path.to_vec();
        let mut current = result.clone();
        for (depth, key) in keys.iter().enumerate() {
            at.push(key.clone());
            if depth + 1 == keys.len() {
                break;
            }
            // Intermediate segments hold exactly one child.
            current = match positional(&current) {
                Some(children) => children.first().cloned().unwrap_or_default(),
                None => return self.selection.assemble(&current, &at),
            };
        }
        self.selection.assemble(&current, &at)
    }
}

/// The list at a position, or `None` when an error or pending value stands
/// in for it.
fn positional(results: &Value) -> Option<&[Value]> {
    results.as_list()
}

/// Attach `path` to an error that does not carry one yet.
fn locate(value: &Value, path: &[Key]) -> Value {
    match value {
        Value::Error(error) if error.path.is_none() => {
            Value::error(ErrorValue::clone(error).at_path(path))
        }
        other => other.clone(),
    }
}

fn contains_pending(value: &Value) -> bool {
    match value {
        Value::Pending => true,
        Value::List(items) => items.iter().any(contains_pending),
        Value::Record(fields) => fields.values().any(contains_pending),
        _ => false,
    }
}

/// A selection against a target node. Without a target the graph root is used.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub target: Option<NodeDefinition>,
    pub selection: Selection,
}

impl Query {
    pub fn new(selection: Selection) -> Self {
        Self {
            target: None,
            selection,
        }
    }

    pub fn on(mut self, target: NodeDefinition) -> Self {
        self.target = Some(target);
        self
    }

    pub fn query_set(&self) -> QuerySet {
        QuerySet::new(self.selection.compile())
    }

    pub fn assemble(&self, results: &Value) -> Value {
        self.selection.assemble(results, &[])
    }

    /// Shorthand: `true` selects a leaf under the field's own name, a string
    /// selects a leaf at that dotted path and an object nests fields.
    #[cfg(feature = "json")]
    pub fn from_json(json: &str) -> Result<Self, crate::error::GraphError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Ok(Self::new(shorthand(&value)?))
    }
}

#[cfg(feature = "json")]
fn shorthand(value: &serde_json::Value) -> Result<Selection, crate::error::GraphError> {
    use serde::de::Error as _;
    let serde_json::Value::Object(map) = value else {
        return Err(serde_json::Error::custom("query shorthand must be an object").into());
    };
    let mut fields = IndexMap::new();
    for (name, spec) in map {
        let field = match spec {
            serde_json::Value::Bool(true) => Field::new(Vec::new(), Selection::Leaf),
            serde_json::Value::String(path) => Field::leaf(path),
            serde_json::Value::Object(_) => Field::new(Vec::new(), shorthand(spec)?),
            other => {
                return Err(serde_json::Error::custom(format!(
                    "unsupported shorthand for `{name}`: {other}"
                ))
                .into())
            }
        };
        fields.insert(Arc::<str>::from(name.as_str()), field);
    }
    Ok(Selection::Fields(fields))
}
