//! Outgoing messages and their wire encoding per dialect

use serde::Serialize;
use serde_json::Value;

use super::Dialect;
use super::message::{
    JSONRPC_VERSION, Notification, Request, RequestId, Response, ResponseError,
};

/// A message queued for the output writer
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// `method` is the command being answered; DAP responses must echo it.
    Response {
        id: Option<RequestId>,
        method: Option<String>,
        result: Result<Value, ResponseError>,
    },
}

impl OutgoingMessage {
    pub fn success(id: RequestId, method: impl Into<String>, result: Value) -> Self {
        OutgoingMessage::Response {
            id: Some(id),
            method: Some(method.into()),
            result: Ok(result),
        }
    }

    pub fn failure(id: Option<RequestId>, method: Option<String>, error: ResponseError) -> Self {
        OutgoingMessage::Response {
            id,
            method,
            result: Err(error),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            OutgoingMessage::Request { method, .. } | OutgoingMessage::Notification { method, .. } => {
                Some(method)
            }
            OutgoingMessage::Response { method, .. } => method.as_deref(),
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, OutgoingMessage::Response { .. })
    }
}

/// DAP wire form of an outgoing message
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DapMessage<'a> {
    Request {
        seq: i64,
        command: &'a str,
        #[serde(skip_serializing_if = "is_null_body")]
        arguments: &'a Value,
    },
    Event {
        seq: i64,
        event: &'a str,
        #[serde(skip_serializing_if = "is_null_body")]
        body: &'a Value,
    },
    Response {
        seq: i64,
        request_seq: i64,
        success: bool,
        command: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

fn is_null_body(body: &&Value) -> bool {
    body.is_null()
}

impl Dialect {
    /// Serialize one outgoing message. `seq` is the writer-assigned
    /// sequence number; the JSON-RPC dialect ignores it.
    pub fn encode(self, seq: i64, message: &OutgoingMessage) -> serde_json::Result<Vec<u8>> {
        match self {
            Dialect::JsonRpc => encode_jsonrpc(message),
            Dialect::Dap => encode_dap(seq, message),
        }
    }
}

fn encode_jsonrpc(message: &OutgoingMessage) -> serde_json::Result<Vec<u8>> {
    match message {
        OutgoingMessage::Request { id, method, params } => serde_json::to_vec(&Request::new(
            id.clone(),
            method.clone(),
            omit_null(params),
        )),
        OutgoingMessage::Notification { method, params } => {
            serde_json::to_vec(&Notification::new(method.clone(), omit_null(params)))
        }
        OutgoingMessage::Response { id, result, .. } => {
            let response = match result {
                Ok(value) => Response {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id: id.clone(),
                    result: Some(value.clone()),
                    error: None,
                },
                Err(error) => Response::error(id.clone(), error.clone()),
            };
            serde_json::to_vec(&response)
        }
    }
}

/// JSON-RPC params must be structured when present
fn omit_null(params: &Value) -> Option<Value> {
    (!params.is_null()).then(|| params.clone())
}

fn encode_dap(seq: i64, message: &OutgoingMessage) -> serde_json::Result<Vec<u8>> {
    let wire = match message {
        OutgoingMessage::Request { method, params, .. } => DapMessage::Request {
            seq,
            command: method,
            arguments: params,
        },
        OutgoingMessage::Notification { method, params } => DapMessage::Event {
            seq,
            event: method,
            body: params,
        },
        OutgoingMessage::Response { id, method, result } => {
            let request_seq = id.as_ref().and_then(RequestId::as_number).unwrap_or(0);
            let command = method.as_deref().unwrap_or("");
            match result {
                Ok(body) => DapMessage::Response {
                    seq,
                    request_seq,
                    success: true,
                    command,
                    message: None,
                    body: (!body.is_null()).then(|| body.clone()),
                },
                Err(error) => DapMessage::Response {
                    seq,
                    request_seq,
                    success: false,
                    command,
                    message: Some(dap_short_message(error)),
                    body: Some(serde_json::json!({
                        "error": { "id": error.code, "format": error.message }
                    })),
                },
            }
        }
    };
    serde_json::to_vec(&wire)
}

/// DAP clients key retry behavior off a short failure tag in `message`.
fn dap_short_message(error: &ResponseError) -> &str {
    if error.is_cancelled() {
        "cancelled"
    } else {
        &error.message
    }
}
