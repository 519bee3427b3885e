//! Connection
//!
//! Wires framing, classification, the registry, the scheduler and the
//! output writer together over one duplex byte stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::cancellation::CancellationRegistry;
use super::handler::{HandlerKind, ProcessType, RequestContext};
use super::output::{AllowAll, OutputFilter, OutputWriter};
use super::peer::{Peer, PendingRequests};
use super::registry::{HandlerDescriptor, HandlerRegistry};
use super::router;
use super::scheduler::{AbortReason, ProcessScheduler, SchedulerOptions, WorkItem};
use crate::config::{self, RuntimeConfig};
use crate::error::EditRpcResult;
use crate::infra::transport::FrameReader;
use crate::protocol::{
    Dialect, Envelope, IncomingNotification, IncomingRequest, OutgoingMessage, RequestId,
    ResponseError,
};

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Per-request execution limit, `None` for unlimited
    pub request_timeout: Option<Duration>,
    pub max_concurrency: Option<usize>,
    pub content_modified: bool,
    /// How long [`Peer::send_request`] waits for an answer
    pub outbound_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&config::runtime())
    }
}

impl From<&RuntimeConfig> for ConnectionOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            max_concurrency: config.max_concurrency,
            content_modified: config.content_modified,
            outbound_timeout: config.outbound_timeout(),
        }
    }
}

pub struct ConnectionBuilder {
    dialect: Dialect,
    registry: Arc<HandlerRegistry>,
    options: ConnectionOptions,
    filter: Arc<dyn OutputFilter>,
}

impl ConnectionBuilder {
    pub fn registry(mut self, registry: impl Into<Arc<HandlerRegistry>>) -> Self {
        self.registry = registry.into();
        self
    }

    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn output_filter(mut self, filter: Arc<dyn OutputFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn build(self) -> Connection {
        let output = Arc::new(OutputWriter::new(self.dialect, self.filter));
        let pending = Arc::new(PendingRequests::default());
        let peer = Peer::new(
            self.dialect,
            Arc::clone(&output),
            Arc::clone(&pending),
            self.options.outbound_timeout,
        );

        Connection {
            dialect: self.dialect,
            registry: self.registry,
            options: self.options,
            output,
            pending,
            cancellations: CancellationRegistry::new(),
            peer,
        }
    }
}

/// One protocol session over a reader/writer pair
pub struct Connection {
    dialect: Dialect,
    registry: Arc<HandlerRegistry>,
    options: ConnectionOptions,
    output: Arc<OutputWriter>,
    pending: Arc<PendingRequests>,
    cancellations: Arc<CancellationRegistry>,
    peer: Peer,
}

impl Connection {
    pub fn builder(dialect: Dialect) -> ConnectionBuilder {
        ConnectionBuilder {
            dialect,
            registry: Arc::new(HandlerRegistry::new()),
            options: ConnectionOptions::default(),
            filter: Arc::new(AllowAll),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn peer(&self) -> Peer {
        self.peer.clone()
    }

    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run until the reader hits EOF or a fatal framing error, then drain
    /// in-flight work and flush the writer.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> EditRpcResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer_task = self.output.start(writer)?;
        let scheduler = ProcessScheduler::new(SchedulerOptions {
            max_concurrency: self.options.max_concurrency,
            content_modified: self.options.content_modified,
        });
        tracing::debug!(dialect = %self.dialect, "Connection started");

        let mut frames = FrameReader::new(reader);
        let received = loop {
            match frames.read_frame().await {
                Ok(Some(payload)) => self.dispatch_payload(&payload, &scheduler),
                Ok(None) => break Ok(()),
                Err(e) => {
                    tracing::error!("Fatal framing error: {e}");
                    break Err(e);
                }
            }
        };

        // Handlers still waiting on the peer would never hear back
        self.pending.fail_all();
        scheduler.shutdown().await;
        self.output.close();
        let written = self.output.wait_for_shutdown().await;
        if let Err(e) = writer_task.await {
            tracing::error!("Output writer task failed: {e}");
        }
        tracing::debug!("Connection closed");

        received?;
        written?;
        Ok(())
    }

    fn dispatch_payload(&self, payload: &[u8], scheduler: &ProcessScheduler) {
        let parsed = self.dialect.parse(payload);
        if parsed.envelopes.len() > 1 {
            tracing::trace!(
                count = parsed.envelopes.len(),
                responses = parsed.contains_response,
                "Batch payload"
            );
        }
        for envelope in parsed.envelopes {
            self.dispatch(envelope, scheduler);
        }
    }

    fn dispatch(&self, envelope: Envelope, scheduler: &ProcessScheduler) {
        match envelope {
            Envelope::Request(request) => self.dispatch_request(request, scheduler),
            Envelope::Notification(notification) => {
                self.dispatch_notification(notification, scheduler)
            }
            Envelope::Response { id, result } => self.complete(id, Ok(result)),
            Envelope::ErrorResponse {
                id: Some(id),
                error,
            } => self.complete(id, Err(error)),
            Envelope::ErrorResponse { id: None, error } => {
                tracing::warn!("Peer reported an error without id: {error}");
            }
            Envelope::Invalid {
                id,
                reason,
                malformed_json,
            } => self.reject(id, &reason, malformed_json),
        }
    }

    fn dispatch_request(&self, request: IncomingRequest, scheduler: &ProcessScheduler) {
        // DAP cancellation is itself a request; answer it right away
        if request.method == self.dialect.cancel_method() {
            self.cancel_from(&request.params);
            self.send(OutgoingMessage::success(request.id, request.method, Value::Null));
            return;
        }

        let descriptors = self
            .registry
            .resolve_kind(&request.method, HandlerKind::Request);
        if descriptors.is_empty() {
            tracing::debug!(method = %request.method, id = %request.id, "Method not found");
            self.send(OutgoingMessage::failure(
                Some(request.id),
                Some(request.method.clone()),
                ResponseError::method_not_found(&request.method),
            ));
            return;
        }

        let process_type = effective_process_type(&descriptors);
        let mut handle = self.cancellations.begin(&request);
        let token = handle.token().clone();
        let started = Instant::now();
        {
            let method = request.method.clone();
            let id = request.id.clone();
            handle.on_complete(move || {
                tracing::trace!(%method, %id, elapsed = ?started.elapsed(), "Request finished");
            });
        }

        let output = Arc::clone(&self.output);
        let peer = self.peer.clone();
        let timeout = self.options.request_timeout;
        let name = format!("{} {}", request.method, request.id);
        let rejected_id = request.id.clone();
        let rejected_method = request.method.clone();

        let submitted = scheduler.submit(process_type, move |content_modified| {
            let cx = RequestContext::new(
                Some(request.id.clone()),
                request.method.clone(),
                token.clone(),
                content_modified.clone(),
                peer,
            );
            let abort_output = Arc::clone(&output);
            let abort_id = request.id.clone();
            let abort_method = request.method.clone();

            WorkItem::new(name, async move {
                let _handle = handle;
                let response = router::route_request(&descriptors, request, cx).await;
                send_logged(&output, response);
            })
            .with_cancellation(token)
            .with_timeout(timeout)
            .on_abort(move |reason| {
                let error = match reason {
                    AbortReason::ContentModified => ResponseError::content_modified(),
                    AbortReason::Cancelled | AbortReason::TimedOut => {
                        ResponseError::request_cancelled()
                    }
                };
                send_logged(
                    &abort_output,
                    OutgoingMessage::failure(Some(abort_id), Some(abort_method), error),
                );
            })
        });
        if !submitted {
            tracing::warn!(
                method = %rejected_method,
                id = %rejected_id,
                "Scheduler closed; cancelling request"
            );
            self.send(OutgoingMessage::failure(
                Some(rejected_id),
                Some(rejected_method),
                ResponseError::request_cancelled(),
            ));
        }
    }

    fn dispatch_notification(
        &self,
        notification: IncomingNotification,
        scheduler: &ProcessScheduler,
    ) {
        if self.dialect == Dialect::JsonRpc && notification.method == self.dialect.cancel_method()
        {
            self.cancel_from(&notification.params);
            return;
        }

        let descriptors = self
            .registry
            .resolve_kind(&notification.method, HandlerKind::Notification);
        if descriptors.is_empty() {
            tracing::debug!(method = %notification.method, "No handler for notification");
            return;
        }

        let process_type = effective_process_type(&descriptors);
        let peer = self.peer.clone();
        let name = notification.method.clone();

        let submitted = scheduler.submit(process_type, move |content_modified| {
            let token = CancellationToken::new();
            let cx = RequestContext::new(
                None,
                notification.method.clone(),
                token.clone(),
                content_modified.clone(),
                peer,
            );
            WorkItem::new(name, async move {
                router::route_notification(&descriptors, notification, cx).await;
            })
            .with_cancellation(token)
        });
        if !submitted {
            tracing::warn!("Scheduler closed; dropping notification");
        }
    }

    fn cancel_from(&self, params: &Value) {
        match self.dialect.cancel_target(params) {
            Some(id) => {
                self.cancellations.cancel(&id);
            }
            None => tracing::warn!("Cancellation without a usable request id: {params}"),
        }
    }

    fn complete(&self, id: RequestId, result: Result<Value, ResponseError>) {
        if !self.pending.complete(&id, result) {
            tracing::warn!(%id, "Response for unknown request");
        }
    }

    fn reject(&self, id: Option<RequestId>, reason: &str, malformed_json: bool) {
        match self.dialect {
            Dialect::JsonRpc => {
                tracing::warn!("Invalid message: {reason}");
                let error = if malformed_json {
                    ResponseError::parse_error(reason)
                } else {
                    ResponseError::invalid_request(reason)
                };
                self.send(OutgoingMessage::failure(id, None, error));
            }
            // DAP has no id-less error response
            Dialect::Dap => tracing::warn!("Dropping invalid message: {reason}"),
        }
    }

    fn send(&self, message: OutgoingMessage) {
        send_logged(&self.output, message);
    }
}

/// Serial wins when descriptors for one method disagree
fn effective_process_type(descriptors: &[Arc<HandlerDescriptor>]) -> ProcessType {
    if descriptors
        .iter()
        .any(|d| d.process_type() == ProcessType::Serial)
    {
        ProcessType::Serial
    } else {
        ProcessType::Parallel
    }
}

fn send_logged(output: &OutputWriter, message: OutgoingMessage) {
    if let Err(e) = output.send(message) {
        tracing::warn!("Failed to queue outgoing message: {e}");
    }
}
