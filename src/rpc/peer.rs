//! Peer handle for server-to-client traffic
//!
//! Outbound requests are numbered by the output writer's sequence, so the
//! id of a request equals its DAP `seq`. Responses are matched back
//! through [`PendingRequests`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use super::output::{AllowAll, OutputWriter};
use crate::error::PeerError;
use crate::protocol::{Dialect, OutgoingMessage, RequestId, ResponseError};

type ResponseSender = oneshot::Sender<Result<Value, ResponseError>>;
type ResponseReceiver = oneshot::Receiver<Result<Value, ResponseError>>;

/// Outbound requests awaiting a response
#[derive(Default)]
pub struct PendingRequests {
    waiting: DashMap<RequestId, ResponseSender>,
    closed: AtomicBool,
}

impl PendingRequests {
    fn register(&self, id: RequestId) -> Option<ResponseReceiver> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id.clone(), tx);
        if self.is_closed() {
            self.waiting.remove(&id);
            return None;
        }
        Some(rx)
    }

    /// Deliver a response. A string id holding a number also matches the
    /// numeric id. Returns false for unknown ids.
    pub fn complete(&self, id: &RequestId, result: Result<Value, ResponseError>) -> bool {
        let entry = self.waiting.remove(id).or_else(|| {
            let numeric = match id {
                RequestId::String(_) => RequestId::Number(id.as_number()?),
                RequestId::Number(_) => return None,
            };
            self.waiting.remove(&numeric)
        });

        match entry {
            Some((_, tx)) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: &RequestId) {
        self.waiting.remove(id);
    }

    /// Fail everything waiting and refuse new requests
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::Release);
        let count = self.waiting.len();
        self.waiting.clear();
        if count > 0 {
            tracing::debug!(count, "Failed pending outbound requests");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// Removes a pending entry if the caller stops waiting
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Sends notifications and requests to the remote side
#[derive(Clone)]
pub struct Peer {
    dialect: Dialect,
    output: Arc<OutputWriter>,
    pending: Arc<PendingRequests>,
    timeout: Duration,
}

impl Peer {
    pub fn new(
        dialect: Dialect,
        output: Arc<OutputWriter>,
        pending: Arc<PendingRequests>,
        timeout: Duration,
    ) -> Self {
        Self {
            dialect,
            output,
            pending,
            timeout,
        }
    }

    /// A peer with no connection behind it; every send fails with
    /// `OutputError::Closed`.
    pub fn detached(dialect: Dialect) -> Self {
        let output = Arc::new(OutputWriter::new(dialect, Arc::new(AllowAll)));
        output.close();
        Self::new(
            dialect,
            output,
            Arc::default(),
            crate::config::outbound_timeout(),
        )
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn send_notification(&self, method: &str, params: impl Serialize) -> Result<(), PeerError> {
        let params = serde_json::to_value(params)?;
        self.output.send(OutgoingMessage::Notification {
            method: method.to_string(),
            params,
        })?;
        Ok(())
    }

    /// Send a request and wait for its response. On timeout the remote
    /// side is told to cancel.
    pub async fn send_request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<R, PeerError> {
        let value = self.request_value(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn request_value(&self, method: &str, params: Value) -> Result<Value, PeerError> {
        if self.pending.is_closed() {
            return Err(PeerError::ConnectionClosed);
        }

        let mut receiver = None;
        let seq = self.output.enqueue_with(|seq| {
            let id = RequestId::Number(seq);
            receiver = self.pending.register(id.clone());
            OutgoingMessage::Request {
                id,
                method: method.to_string(),
                params,
            }
        })?;
        let id = RequestId::Number(seq);
        let Some(receiver) = receiver else {
            return Err(PeerError::ConnectionClosed);
        };
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) if error.is_cancelled() => Err(PeerError::Cancelled),
            Ok(Ok(Err(error))) => Err(PeerError::Remote(error)),
            Ok(Err(_)) => Err(PeerError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(%method, %id, "Outbound request timed out after {:?}", self.timeout);
                if let Err(e) = self.cancel_request(&id) {
                    tracing::debug!("Failed to send cancellation: {e}");
                }
                Err(PeerError::Timeout {
                    method: method.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Ask the remote side to cancel an outbound request
    pub fn cancel_request(&self, id: &RequestId) -> Result<(), PeerError> {
        let method = self.dialect.cancel_method().to_string();
        match self.dialect {
            Dialect::JsonRpc => self.output.send(OutgoingMessage::Notification {
                method,
                params: json!({ "id": id }),
            })?,
            Dialect::Dap => {
                self.output.enqueue_with(|seq| OutgoingMessage::Request {
                    id: RequestId::Number(seq),
                    method,
                    params: json!({ "requestId": id }),
                })?;
            }
        }
        Ok(())
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }
}
