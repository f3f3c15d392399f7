use crate::value::{ErrorValue, Value};
use std::sync::Arc;
use thiserror::Error;

/// Malformed node construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("`{tag}` is missing property `{prop}`")]
    Missing { tag: Arc<str>, prop: &'static str },
    #[error("`{tag}` property `{prop}` should be {expected}, found {found}")]
    WrongKind {
        tag: Arc<str>,
        prop: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("`{tag}` does not accept property `{prop}`")]
    Unexpected { tag: Arc<str>, prop: Arc<str> },
}

/// Failures raised while resolving an operation. They never cross the dispatch
/// boundary as panics; the engine turns them into error nodes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error("node type `{tag}` does not support `{operation}`")]
    UnsupportedOperation { tag: Arc<str>, operation: &'static str },
    #[error("unknown node type `{0}`")]
    UnknownType(Arc<str>),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("`{operation}` expected {expected}, received {received}")]
    TypeMismatch {
        operation: &'static str,
        expected: String,
        received: String,
    },
    #[error("name `{0}` not found")]
    NameNotFound(Arc<str>),
    #[error("binding `{0}` belongs to a foreign scope")]
    ForeignBinding(Arc<str>),
    #[error("dependency cycle through `{0}`")]
    Cycle(String),
    #[error("step limit of {0} exceeded")]
    StepLimit(usize),
    #[error("handle refers to a scope or context that no longer exists")]
    StaleHandle,
    #[error("{0}")]
    Custom(ErrorValue),
}

impl NodeError {
    pub fn custom(message: impl Into<Arc<str>>) -> Self {
        NodeError::Custom(ErrorValue::new(message))
    }

    pub fn mismatch(
        operation: &'static str,
        expected: impl Into<String>,
        received: impl Into<String>,
    ) -> Self {
        NodeError::TypeMismatch {
            operation,
            expected: expected.into(),
            received: received.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            NodeError::UnsupportedOperation { .. } => "unsupported_operation",
            NodeError::UnknownType(_) => "unknown_type",
            NodeError::Shape(_) => "invalid_shape",
            NodeError::TypeMismatch { .. } => "type_mismatch",
            NodeError::NameNotFound(_) => "name_not_found",
            NodeError::ForeignBinding(_) => "foreign_binding",
            NodeError::Cycle(_) => "cycle",
            NodeError::StepLimit(_) => "step_limit",
            NodeError::StaleHandle => "stale_handle",
            NodeError::Custom(_) => "custom",
        }
    }

    pub fn into_value(self) -> ErrorValue {
        match self {
            NodeError::Custom(error) => error,
            other => ErrorValue::new(other.to_string()).with_code(other.code()),
        }
    }
}

impl From<ErrorValue> for NodeError {
    fn from(error: ErrorValue) -> Self {
        NodeError::Custom(error)
    }
}

impl From<NodeError> for Value {
    fn from(error: NodeError) -> Self {
        Value::error(error.into_value())
    }
}

/// Host-facing failures of the `Graph` API and the remote adapters.
#[derive(Debug, Error)]
pub enum GraphError {
    #[cfg(feature = "json")]
    #[error("wire format: {0}")]
    Wire(#[from] serde_json::Error),
    #[error("definition cannot be serialized: {0}")]
    NotSerializable(&'static str),
    #[error("subscription is no longer attached to a live slot")]
    Detached,
    #[error("graph is busy resolving; call again after the current tick")]
    Busy,
    #[error("dispatch did not settle: {0}")]
    Unsettled(String),
    #[error(transparent)]
    Node(#[from] NodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_error_keeps_code_in_value() {
        let error = NodeError::NameNotFound("x".into()).into_value();
        assert_eq!(error.code.as_deref(), Some("name_not_found"));
        assert_eq!(error.message.as_ref(), "name `x` not found");
    }

    #[test]
    fn custom_error_passes_through() {
        let original = ErrorValue::new("nope").with_code("E1");
        assert_eq!(NodeError::Custom(original.clone()).into_value(), original);
    }
}
