//! Protocol layer
//!
//! Wire types, envelope classification and outgoing encoding for the two
//! editor protocol dialects:
//! - JSON-RPC 2.0 (Language Server Protocol style)
//! - Debug Adapter Protocol (`seq`/`type` field based)
//!
//! Both dialects share `Content-Length` framing, see [`crate::infra::transport`].

pub mod envelope;
pub mod message;
pub mod outgoing;

pub use envelope::{Envelope, IncomingNotification, IncomingRequest, ParsedPayload};
pub use message::{RequestId, ResponseError, error_codes};
pub use outgoing::OutgoingMessage;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message dialect spoken on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    JsonRpc,
    Dap,
}

impl Dialect {
    /// Method that carries a cancellation for another in-flight request.
    pub fn cancel_method(self) -> &'static str {
        match self {
            Dialect::JsonRpc => "$/cancelRequest",
            Dialect::Dap => "cancel",
        }
    }

    /// Id of the request a cancellation message targets, if it names one.
    pub fn cancel_target(self, params: &Value) -> Option<RequestId> {
        let raw = match self {
            Dialect::JsonRpc => params.get("id")?,
            Dialect::Dap => params.get("requestId")?,
        };
        RequestId::from_value(raw)?.ok()
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::JsonRpc => write!(f, "jsonrpc"),
            Dialect::Dap => write!(f, "dap"),
        }
    }
}
