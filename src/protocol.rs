//! Wire protocol types: the operation request, the execution result that
//! passes through the transport verbatim, and the codec for the event
//! kinds a stream carries.

use crate::error::{TransportError, TransportResult};
use crate::sse::{encode_event, SseEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header binding a single-connection reservation to its follow-up
/// requests, both directions.
pub const STREAM_TOKEN_HEADER: &str = "x-graphql-event-stream-token";

/// Extension key carrying the per-reservation operation id.
pub const OPERATION_ID_EXTENSION: &str = "operationId";

/// Extension key carrying a persisted-query identifier.
pub const PERSISTED_QUERY_EXTENSION: &str = "persistedQuery";

/// A GraphQL operation request, as submitted by either engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// The document source. May be empty when `extensions.persistedQuery`
    /// names a stored document.
    #[serde(default)]
    pub query: String,
    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl OperationRequest {
    /// Creates a request for the given document.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Sets the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Sets the variables object.
    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Inserts one extension entry, creating the extensions object if needed.
    pub fn extension(mut self, key: impl Into<String>, value: Value) -> Self {
        match self.extensions {
            Some(Value::Object(ref mut map)) => {
                map.insert(key.into(), value);
            }
            _ => {
                let mut map = serde_json::Map::new();
                map.insert(key.into(), value);
                self.extensions = Some(Value::Object(map));
            }
        }
        self
    }

    /// Sets `extensions.operationId`.
    pub fn with_operation_id(self, id: impl Into<String>) -> Self {
        self.extension(OPERATION_ID_EXTENSION, Value::String(id.into()))
    }

    /// Reads `extensions.operationId`, if present and a string.
    pub fn operation_id(&self) -> Option<&str> {
        self.extensions
            .as_ref()?
            .get(OPERATION_ID_EXTENSION)?
            .as_str()
    }

    /// Reads `extensions.persistedQuery`, if present and a string.
    pub fn persisted_query(&self) -> Option<&str> {
        self.extensions
            .as_ref()?
            .get(PERSISTED_QUERY_EXTENSION)?
            .as_str()
    }

    /// Decodes an operation from a distinct-mode `GET` query string, the
    /// form `EventSource` clients use. `variables` and `extensions` arrive
    /// JSON-encoded inside their parameters.
    pub fn from_query_string(query_string: &str) -> TransportResult<Self> {
        let mut request = Self::default();
        let mut saw_query = false;
        for (key, value) in url::form_urlencoded::parse(query_string.as_bytes()) {
            match key.as_ref() {
                "query" => {
                    saw_query = true;
                    request.query = value.into_owned();
                }
                "operationName" => request.operation_name = Some(value.into_owned()),
                "variables" => {
                    request.variables = Some(serde_json::from_str(&value).map_err(|e| {
                        TransportError::bad_request(format!("invalid variables: {}", e))
                    })?);
                }
                "extensions" => {
                    request.extensions = Some(serde_json::from_str(&value).map_err(|e| {
                        TransportError::bad_request(format!("invalid extensions: {}", e))
                    })?);
                }
                _ => {}
            }
        }
        if !saw_query {
            return Err(TransportError::bad_request("missing query parameter"));
        }
        Ok(request)
    }
}

/// A single GraphQL error, passed through the transport as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphqlError {
    /// Creates an error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }
}

/// One emitted execution value. Opaque to the transport: fields are
/// forwarded without coercion and absent fields never hit the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphqlError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
    #[serde(rename = "hasNext", default, skip_serializing_if = "Option::is_none")]
    pub has_next: Option<bool>,
}

impl ExecutionResult {
    /// Creates a result carrying only data.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Creates a result carrying only errors.
    pub fn from_errors(errors: Vec<GraphqlError>) -> Self {
        Self {
            errors: Some(errors),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct NextData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    payload: ExecutionResult,
}

#[derive(Serialize, Deserialize)]
struct CompleteData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

/// A server-to-client protocol event. Terminal failures are HTTP
/// statuses, not stream events, so they have no variant here.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// One execution result. `id` is present iff the stream multiplexes
    /// several operations.
    Next {
        id: Option<String>,
        payload: ExecutionResult,
    },
    /// Normal termination of one operation.
    Complete { id: Option<String> },
    /// Liveness reply; clients discard it.
    Pong,
}

impl StreamMessage {
    /// Encodes this message as one SSE record.
    pub fn encode(&self) -> TransportResult<String> {
        let (name, data) = match self {
            Self::Next { id, payload } => (
                "next",
                serde_json::to_string(&NextData {
                    id: id.clone(),
                    payload: payload.clone(),
                })
                .map_err(|e| TransportError::serialize(e.to_string()))?,
            ),
            Self::Complete { id } => (
                "complete",
                serde_json::to_string(&CompleteData { id: id.clone() })
                    .map_err(|e| TransportError::serialize(e.to_string()))?,
            ),
            Self::Pong => ("pong", "{}".to_string()),
        };
        Ok(encode_event(name, &data))
    }

    /// Decodes a parsed SSE record into a protocol message.
    pub fn from_event(event: &SseEvent) -> TransportResult<Self> {
        match event.name.as_str() {
            "next" => {
                let next: NextData = serde_json::from_str(&event.data)
                    .map_err(|e| TransportError::parse(format!("invalid next event: {}", e)))?;
                Ok(Self::Next {
                    id: next.id,
                    payload: next.payload,
                })
            }
            "complete" => {
                let data = if event.data.is_empty() { "{}" } else { &event.data };
                let complete: CompleteData = serde_json::from_str(data).map_err(|e| {
                    TransportError::parse(format!("invalid complete event: {}", e))
                })?;
                Ok(Self::Complete { id: complete.id })
            }
            "pong" => Ok(Self::Pong),
            other => Err(TransportError::parse(format!(
                "unexpected event kind: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_request_wire_shape() {
        let request = OperationRequest::new("subscription { greetings }")
            .variables(json!({"lang": "fr"}))
            .with_operation_id("op-1");
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["query"], "subscription { greetings }");
        assert_eq!(wire["variables"]["lang"], "fr");
        assert_eq!(wire["extensions"]["operationId"], "op-1");
        assert!(wire.get("operationName").is_none());

        let back: OperationRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(back.operation_id(), Some("op-1"));
    }

    #[test]
    fn test_from_query_string() {
        let request = OperationRequest::from_query_string(
            "query=%7B%20hello%20%7D&operationName=Hello&variables=%7B%22id%22%3A1%7D",
        )
        .unwrap();
        assert_eq!(request.query, "{ hello }");
        assert_eq!(request.operation_name.as_deref(), Some("Hello"));
        assert_eq!(request.variables, Some(json!({"id": 1})));

        assert!(OperationRequest::from_query_string("operationName=Hello").is_err());
    }

    #[test]
    fn test_next_message_roundtrip() {
        let message = StreamMessage::Next {
            id: Some("a".to_string()),
            payload: ExecutionResult::data(json!({"greetings": "Hi"})),
        };
        let record = message.encode().unwrap();
        assert!(record.starts_with("event: next\n"));
        assert!(record.contains(r#""id":"a""#));

        let mut parser = crate::sse::SseParser::new();
        let events = parser.feed(record.as_bytes()).unwrap();
        assert_eq!(StreamMessage::from_event(&events[0]).unwrap(), message);
    }

    #[test]
    fn test_complete_without_id_is_empty_object() {
        let record = StreamMessage::Complete { id: None }.encode().unwrap();
        assert_eq!(record, "event: complete\ndata: {}\n\n");
    }

    #[test]
    fn test_result_passthrough_preserves_shape() {
        let raw = json!({
            "data": {"n": 1.5, "s": "x", "nested": [1, null, {"b": false}]},
            "extensions": {"traceId": "abc"},
            "hasNext": true
        });
        let result: ExecutionResult = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&result).unwrap(), raw);
    }

    #[test]
    fn test_unknown_event_kind_rejected() {
        let event = SseEvent {
            name: "ping".to_string(),
            data: "{}".to_string(),
        };
        assert!(StreamMessage::from_event(&event).is_err());
    }
}
