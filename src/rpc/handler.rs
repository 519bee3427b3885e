//! Handler traits and the type-erased call surface
//!
//! Handlers are registered explicitly: a typed trait implementation, a
//! factory producing a fresh instance per call, or a plain async closure.
//! All of them are erased into [`ErasedHandler`], which takes raw JSON
//! params and yields a JSON result.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::peer::Peer;
use crate::error::HandlerError;
use crate::protocol::RequestId;

/// Scheduling discipline of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessType {
    /// Runs alone, in arrival order
    Serial,
    /// Runs concurrently with its batch, raced against content changes
    #[default]
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Request,
    Notification,
}

/// Per-registration overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerOptions {
    pub process_type: Option<ProcessType>,
    pub sequence: Option<bool>,
}

impl HandlerOptions {
    pub fn serial() -> Self {
        Self {
            process_type: Some(ProcessType::Serial),
            ..Self::default()
        }
    }

    pub fn parallel() -> Self {
        Self {
            process_type: Some(ProcessType::Parallel),
            ..Self::default()
        }
    }

    /// Mark the response as a sequence that aggregates across handlers
    pub fn sequence(mut self) -> Self {
        self.sequence = Some(true);
        self
    }
}

/// Invocation context handed to every handler
#[derive(Clone)]
pub struct RequestContext {
    id: Option<RequestId>,
    method: String,
    token: CancellationToken,
    content_modified: CancellationToken,
    peer: Peer,
}

impl RequestContext {
    pub fn new(
        id: Option<RequestId>,
        method: impl Into<String>,
        token: CancellationToken,
        content_modified: CancellationToken,
        peer: Peer,
    ) -> Self {
        Self {
            id,
            method: method.into(),
            token,
            content_modified,
            peer,
        }
    }

    /// `None` for notifications
    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Fired on explicit cancel, timeout or a lost content-modified race
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn content_modified(&self) -> &CancellationToken {
        &self.content_modified
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Await `fut`, giving up with `Cancelled` once the token fires.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, HandlerError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(HandlerError::Cancelled),
            output = fut => Ok(output),
        }
    }
}

/// Typed request handler
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    type Params: DeserializeOwned + Send + 'static;
    type Result: Serialize + Send + 'static;

    /// Method name tag; empty means the method must be given at registration
    const METHOD: &'static str = "";
    const PROCESS_TYPE: ProcessType = ProcessType::Parallel;
    /// Results are sequences and aggregate across handlers of one method
    const SEQUENCE: bool = false;

    async fn handle(
        &self,
        params: Self::Params,
        cx: RequestContext,
    ) -> Result<Self::Result, HandlerError>;
}

/// Typed notification handler
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    type Params: DeserializeOwned + Send + 'static;

    const METHOD: &'static str = "";
    const PROCESS_TYPE: ProcessType = ProcessType::Parallel;

    async fn handle(&self, params: Self::Params, cx: RequestContext) -> Result<(), HandlerError>;
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// Object-safe call surface shared by every registration style
pub trait ErasedHandler: Send + Sync {
    fn call(&self, params: Value, cx: RequestContext) -> HandlerFuture;
}

/// Decode params, retrying an empty object as `null` for handlers that
/// take `()` or `Option<T>`.
pub fn decode_params<P: DeserializeOwned>(params: Value) -> Result<P, HandlerError> {
    let retry_null = params.as_object().is_some_and(|map| map.is_empty());
    match serde_json::from_value::<P>(params) {
        Ok(params) => Ok(params),
        Err(err) => {
            if retry_null && let Ok(params) = serde_json::from_value::<P>(Value::Null) {
                return Ok(params);
            }
            Err(HandlerError::InvalidParams(err.to_string()))
        }
    }
}

pub(crate) struct RequestAdapter<H>(pub(crate) Arc<H>);

impl<H: RequestHandler> ErasedHandler for RequestAdapter<H> {
    fn call(&self, params: Value, cx: RequestContext) -> HandlerFuture {
        let handler = Arc::clone(&self.0);
        async move {
            let params = decode_params::<H::Params>(params)?;
            let result = handler.handle(params, cx).await?;
            Ok::<_, HandlerError>(serde_json::to_value(result)?)
        }
        .boxed()
    }
}

pub(crate) struct NotificationAdapter<H>(pub(crate) Arc<H>);

impl<H: NotificationHandler> ErasedHandler for NotificationAdapter<H> {
    fn call(&self, params: Value, cx: RequestContext) -> HandlerFuture {
        let handler = Arc::clone(&self.0);
        async move {
            let params = decode_params::<H::Params>(params)?;
            handler.handle(params, cx).await?;
            Ok::<_, HandlerError>(Value::Null)
        }
        .boxed()
    }
}

/// Builds a fresh handler for every invocation
pub(crate) struct FactoryAdapter<F, H> {
    factory: F,
    _handler: PhantomData<fn() -> H>,
}

impl<F, H> FactoryAdapter<F, H> {
    pub(crate) fn new(factory: F) -> Self {
        Self {
            factory,
            _handler: PhantomData,
        }
    }
}

impl<F, H> ErasedHandler for FactoryAdapter<F, H>
where
    F: Fn() -> H + Send + Sync,
    H: RequestHandler,
{
    fn call(&self, params: Value, cx: RequestContext) -> HandlerFuture {
        RequestAdapter(Arc::new((self.factory)())).call(params, cx)
    }
}

/// Async closure registration; `R = ()` for notifications
pub(crate) struct FnAdapter<F, P, R, Fut> {
    f: F,
    _marker: PhantomData<fn(P) -> (R, Fut)>,
}

impl<F, P, R, Fut> FnAdapter<F, P, R, Fut> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<F, P, R, Fut> ErasedHandler for FnAdapter<F, P, R, Fut>
where
    F: Fn(P, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn call(&self, params: Value, cx: RequestContext) -> HandlerFuture {
        let params = match decode_params::<P>(params) {
            Ok(params) => params,
            Err(err) => return futures::future::ready(Err(err)).boxed(),
        };
        let fut = (self.f)(params, cx);
        async move {
            let result = fut.await?;
            Ok::<_, HandlerError>(serde_json::to_value(result)?)
        }
        .boxed()
    }
}
