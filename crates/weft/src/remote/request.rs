use crate::query::{QuerySet, Tolerance};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Request properties that must agree before two requests may be batched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Arc<str>>,
    #[serde(default)]
    pub tolerance: Tolerance,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Arc<str>>,
    pub query_set: QuerySet,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl RemoteRequest {
    pub fn new(query_set: QuerySet) -> Self {
        Self {
            correlation_id: None,
            query_set,
            metadata: RequestMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
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

/// One push of results for a request. A streaming request may receive many.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Arc<str>>,
    /// Positional results, one per entry of the request's QuerySet.
    pub results: Value,
}

impl RemoteResponse {
    #[cfg(feature = "json")]
    pub fn to_json(&self) -> Result<String, crate::error::GraphError> {
        Ok(serde_json::to_string(self)?)
    }

    #[cfg(feature = "json")]
    pub fn from_json(json: &str) -> Result<Self, crate::error::GraphError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::nodes::data;
    use crate::query::{QuerySetEntry, QuerySetOp};
    use crate::value::ErrorValue;

    #[test]
    fn request_round_trips() {
        let request = RemoteRequest {
            correlation_id: Some("01J0000000000000000000000".into()),
            query_set: QuerySet::new([
                QuerySetEntry::child("todos", [QuerySetEntry::items([QuerySetEntry::value()])]),
                QuerySetEntry::new(QuerySetOp::Set {
                    value: data::value("done"),
                }),
            ]),
            metadata: RequestMetadata {
                session: Some("s1".into()),
                tolerance: Tolerance::default(),
            },
        };
        let json = request.to_json().unwrap();
        assert_eq!(RemoteRequest::from_json(&json).unwrap(), request);
    }

    #[test]
    fn response_keeps_error_paths() {
        let response = RemoteResponse {
            correlation_id: None,
            results: Value::list([
                Value::number(1.0),
                Value::error(ErrorValue::new("missing").at_path(&["a".into()])),
                Value::Pending,
            ]),
        };
        let json = response.to_json().unwrap();
        assert_eq!(RemoteResponse::from_json(&json).unwrap(), response);
    }
}
