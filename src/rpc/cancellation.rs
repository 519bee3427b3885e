//! Invocation handles and the live-request table used for cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::protocol::{IncomingRequest, RequestId};

struct LiveInvocation {
    generation: u64,
    token: CancellationToken,
    method: String,
}

/// In-flight requests by id
#[derive(Default)]
pub struct CancellationRegistry {
    live: DashMap<RequestId, LiveInvocation>,
    generation: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track `request` until the returned handle is dropped
    pub fn begin(self: &Arc<Self>, request: &IncomingRequest) -> InvocationHandle {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let previous = self.live.insert(
            request.id.clone(),
            LiveInvocation {
                generation,
                token: token.clone(),
                method: request.method.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::warn!(
                id = %request.id,
                previous = %previous.method,
                "Request id reused while still in flight"
            );
        }

        InvocationHandle {
            registry: Arc::clone(self),
            id: request.id.clone(),
            method: request.method.clone(),
            generation,
            token,
            on_complete: Vec::new(),
        }
    }

    /// Cancel the live invocation for `id`. Unknown or finished ids are
    /// ignored; returns whether anything was signalled.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let entry = self.live.get(id).or_else(|| {
            let alternate = match id {
                RequestId::String(s) => RequestId::Number(s.parse().ok()?),
                RequestId::Number(n) => RequestId::String(n.to_string()),
            };
            self.live.get(&alternate)
        });

        match entry {
            Some(live) => {
                tracing::debug!(%id, method = %live.method, "Cancelling request");
                live.token.cancel();
                true
            }
            None => {
                tracing::debug!(%id, "Cancellation for unknown or completed request");
                false
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, id: &RequestId) -> bool {
        self.live.contains_key(id)
    }
}

/// Lifecycle of one routed request. Dropping it forgets the id and runs
/// the completion callbacks.
pub struct InvocationHandle {
    registry: Arc<CancellationRegistry>,
    id: RequestId,
    method: String,
    generation: u64,
    token: CancellationToken,
    on_complete: Vec<Box<dyn FnOnce() + Send>>,
}

impl InvocationHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn on_complete(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_complete.push(Box::new(callback));
    }
}

impl Drop for InvocationHandle {
    fn drop(&mut self) {
        // A reused id may belong to a newer invocation by now
        self.registry
            .live
            .remove_if(&self.id, |_, live| live.generation == self.generation);
        for callback in self.on_complete.drain(..) {
            callback();
        }
    }
}
