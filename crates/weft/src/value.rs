//! Plain data carried by terminal nodes.
//!
//! `Value` is what crosses the remote boundary and what query results are
//! assembled into. Everything inside is immutable and cheap to clone.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A path segment: record field name or list index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Index(i64),
    Name(Arc<str>),
}

impl Key {
    pub fn name(name: impl Into<Arc<str>>) -> Self {
        Key::Name(name.into())
    }

    /// Split a dotted path (`"user.posts.0"`) into keys. Numeric segments become indices.
    pub fn parse_path(path: &str) -> Vec<Key> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.parse::<i64>() {
                Ok(index) => Key::Index(index),
                Err(_) => Key::name(segment),
            })
            .collect()
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::name(name)
    }
}

impl From<i64> for Key {
    fn from(index: i64) -> Self {
        Key::Index(index)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(index) => write!(f, "{index}"),
            Key::Name(name) => write!(f, "{name}"),
        }
    }
}

/// First-class error value. Errors flow through the graph like any other result.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorValue {
    pub message: Arc<str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Arc<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Set once the error has been surfaced through a query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Key>>,
}

impl ErrorValue {
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
            code: None,
            data: None,
            path: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<Arc<str>>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach `prefix` in front of whatever path the error already carries.
    pub fn at_path(mut self, prefix: &[Key]) -> Self {
        let mut path = prefix.to_vec();
        path.extend(self.path.take().unwrap_or_default());
        self.path = Some(path);
        self
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{code}] ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(path) = &self.path {
            let joined: Vec<String> = path.iter().map(Key::to_string).collect();
            write!(f, " at `{}`", joined.join("."))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    /// Number (f64 with total ordering)
    Number(OrderedFloat<f64>),
    Text(Arc<str>),
    List(Arc<Vec<Value>>),
    Record(Arc<BTreeMap<Arc<str>, Value>>),
    Error(Arc<ErrorValue>),
    /// A result that has not arrived yet (only where a query tolerates it)
    Pending,
}

impl Value {
    pub fn number(n: f64) -> Self {
        Value::Number(OrderedFloat(n))
    }

    pub fn text(s: impl Into<Arc<str>>) -> Self {
        Value::Text(s.into())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(Arc::new(items.into_iter().collect()))
    }

    pub fn record(fields: impl IntoIterator<Item = (impl Into<Arc<str>>, Value)>) -> Self {
        Value::Record(Arc::new(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn error(error: ErrorValue) -> Self {
        Value::Error(Arc::new(error))
    }

    pub fn numbers(items: impl IntoIterator<Item = f64>) -> Self {
        Value::list(items.into_iter().map(Value::number))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n.0),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Truthiness used by predicates: nil, false, zero and empty text are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil | Value::Pending | Value::Error(_) => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.0 != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::List(_) | Value::Record(_) => true,
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        match (self, key) {
            (Value::Record(fields), Key::Name(name)) => fields.get(name),
            (Value::List(items), Key::Index(index)) => {
                let index = if *index < 0 {
                    items.len() as i64 + index
                } else {
                    *index
                };
                usize::try_from(index).ok().and_then(|i| items.get(i))
            }
            _ => None,
        }
    }

    /// Short type label used in mismatch messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Error(_) => "error",
            Value::Pending => "pending",
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

impl From<ErrorValue> for Value {
    fn from(error: ErrorValue) -> Self {
        Value::error(error)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", n.0),
            Value::Text(s) => write!(f, "\"{s}\""),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Error(error) => write!(f, "error({error})"),
            Value::Pending => write!(f, "pending"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dotted_path() {
        assert_eq!(
            Key::parse_path("user.posts.0"),
            vec![Key::name("user"), Key::name("posts"), Key::Index(0)]
        );
        assert!(Key::parse_path("").is_empty());
    }

    #[test]
    fn error_path_prefixing() {
        let error = ErrorValue::new("boom").at_path(&[Key::name("b")]);
        let error = error.at_path(&[Key::name("a")]);
        assert_eq!(error.path, Some(vec![Key::name("a"), Key::name("b")]));
        assert_eq!(error.to_string(), "boom at `a.b`");
    }

    #[test]
    fn negative_index_counts_from_end() {
        let list = Value::numbers([1.0, 2.0, 3.0]);
        assert_eq!(list.get(&Key::Index(-1)), Some(&Value::number(3.0)));
        assert_eq!(list.get(&Key::Index(7)), None);
    }
}
