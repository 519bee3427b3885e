//! Envelope classification
//!
//! Turns one framed payload into classified envelopes. A payload holds a
//! single JSON object or a non-empty array of objects; arrays expand into
//! one envelope per element, order preserved.

use serde::Serialize;
use serde_json::{Map, Value};

use super::Dialect;
use super::message::{JSONRPC_VERSION, RequestId, ResponseError, error_codes};

/// One classified unit of incoming traffic
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Request(IncomingRequest),
    Notification(IncomingNotification),
    Response {
        id: RequestId,
        result: Value,
    },
    ErrorResponse {
        id: Option<RequestId>,
        error: ResponseError,
    },
    Invalid {
        id: Option<RequestId>,
        reason: String,
        malformed_json: bool,
    },
}

impl Envelope {
    fn invalid(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        Envelope::Invalid {
            id,
            reason: reason.into(),
            malformed_json: false,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Envelope::Response { .. } | Envelope::ErrorResponse { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingNotification {
    pub method: String,
    pub params: Value,
}

/// Envelopes decoded from one payload
#[derive(Debug, Clone, Default)]
pub struct ParsedPayload {
    pub envelopes: Vec<Envelope>,
    pub contains_response: bool,
}

impl ParsedPayload {
    fn single(envelope: Envelope) -> Self {
        Self {
            contains_response: envelope.is_response(),
            envelopes: vec![envelope],
        }
    }
}

impl Dialect {
    /// Classify one payload. Never fails: undecodable input becomes an
    /// `Invalid` envelope so the connection can keep going.
    pub fn parse(self, payload: &[u8]) -> ParsedPayload {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                return ParsedPayload::single(Envelope::Invalid {
                    id: None,
                    reason: e.to_string(),
                    malformed_json: true,
                });
            }
        };

        if !is_valid(&value) {
            return ParsedPayload::single(Envelope::invalid(
                None,
                "payload must be an object or a non-empty array of objects",
            ));
        }

        let envelopes: Vec<Envelope> = match value {
            Value::Array(items) => items.into_iter().map(|v| self.classify(v)).collect(),
            single => vec![self.classify(single)],
        };
        let contains_response = envelopes.iter().any(Envelope::is_response);

        ParsedPayload {
            envelopes,
            contains_response,
        }
    }

    fn classify(self, value: Value) -> Envelope {
        let Value::Object(obj) = value else {
            return Envelope::invalid(None, "message must be a JSON object");
        };
        match self {
            Dialect::JsonRpc => classify_jsonrpc(obj),
            Dialect::Dap => classify_dap(obj),
        }
    }
}

/// A top-level value must be an object or a non-empty array of objects.
pub fn is_valid(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => !items.is_empty() && items.iter().all(Value::is_object),
        _ => false,
    }
}

/// Absent or `null` params become `{}` to tolerate non-conformant peers.
fn normalize_params(params: Option<Value>) -> Value {
    match params {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v) => v,
    }
}

// ============================================================================
// JSON-RPC
// ============================================================================

fn classify_jsonrpc(mut obj: Map<String, Value>) -> Envelope {
    let id = match obj.get("id").map(RequestId::from_value) {
        None | Some(None) => None,
        Some(Some(Ok(id))) => Some(id),
        Some(Some(Err(reason))) => return Envelope::invalid(None, reason),
    };

    if let Some(version) = obj.get("jsonrpc")
        && version.as_str() != Some(JSONRPC_VERSION)
    {
        return Envelope::invalid(id, format!("unsupported jsonrpc version {version}"));
    }

    if let Some(method) = obj.remove("method") {
        let Value::String(method) = method else {
            return Envelope::invalid(id, "method must be a string");
        };
        let params = normalize_params(obj.remove("params"));
        return match id {
            Some(id) => Envelope::Request(IncomingRequest { id, method, params }),
            None => Envelope::Notification(IncomingNotification { method, params }),
        };
    }

    if let Some(error) = obj.remove("error") {
        return match serde_json::from_value::<ResponseError>(error) {
            Ok(error) => Envelope::ErrorResponse { id, error },
            Err(e) => Envelope::invalid(id, format!("malformed error object: {e}")),
        };
    }

    if let Some(result) = obj.remove("result") {
        return match id {
            Some(id) => Envelope::Response { id, result },
            None => Envelope::invalid(None, "response without id"),
        };
    }

    Envelope::invalid(id, "message has no method, result or error")
}

// ============================================================================
// DAP
// ============================================================================

fn classify_dap(mut obj: Map<String, Value>) -> Envelope {
    let Some(seq) = obj.get("seq").and_then(Value::as_i64) else {
        return Envelope::invalid(None, "missing integer field 'seq'");
    };
    let seq_id = Some(RequestId::Number(seq));

    let kind = match obj.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Envelope::invalid(seq_id, "missing string field 'type'"),
    };

    match kind.as_str() {
        "request" => {
            let Some(Value::String(command)) = obj.remove("command") else {
                return Envelope::invalid(seq_id, "request missing 'command'");
            };
            Envelope::Request(IncomingRequest {
                id: RequestId::Number(seq),
                method: command,
                params: normalize_params(obj.remove("arguments")),
            })
        }
        "event" => {
            let Some(Value::String(event)) = obj.remove("event") else {
                return Envelope::invalid(seq_id, "event missing 'event'");
            };
            Envelope::Notification(IncomingNotification {
                method: event,
                params: normalize_params(obj.remove("body")),
            })
        }
        "response" => {
            let Some(request_seq) = obj.get("request_seq").and_then(Value::as_i64) else {
                return Envelope::invalid(seq_id, "response missing integer 'request_seq'");
            };
            let Some(success) = obj.get("success").and_then(Value::as_bool) else {
                return Envelope::invalid(seq_id, "response missing boolean 'success'");
            };
            if !obj.get("command").is_some_and(Value::is_string) {
                return Envelope::invalid(seq_id, "response missing 'command'");
            }
            let id = RequestId::Number(request_seq);
            let body = obj.remove("body").unwrap_or(Value::Null);
            if success {
                Envelope::Response { id, result: body }
            } else {
                let message = obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string();
                Envelope::ErrorResponse {
                    id: Some(id),
                    error: dap_error(message, body),
                }
            }
        }
        other => Envelope::invalid(seq_id, format!("unknown message type '{other}'")),
    }
}

/// DAP failures carry a short `message` and an optional `body.error`
/// (`{id, format}`); fold both into the JSON-RPC error shape.
fn dap_error(message: String, body: Value) -> ResponseError {
    let code = if message == "cancelled" {
        error_codes::REQUEST_CANCELLED
    } else {
        body.pointer("/error/id")
            .and_then(Value::as_i64)
            .and_then(|id| i32::try_from(id).ok())
            .unwrap_or(error_codes::INTERNAL_ERROR)
    };
    let text = body
        .pointer("/error/format")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(message);

    match body {
        Value::Null => ResponseError::new(code, text),
        body => ResponseError::with_data(code, text, body),
    }
}
