//! Router
//!
//! Invokes resolved descriptors for one envelope. Handler failures,
//! including panics, are turned into error responses here and never
//! escape to the scheduler.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use serde_json::Value;

use super::handler::RequestContext;
use super::registry::HandlerDescriptor;
use crate::error::HandlerError;
use crate::protocol::{IncomingNotification, IncomingRequest, OutgoingMessage, ResponseError};

/// Invoke the handler(s) for a request and build its response.
///
/// Several descriptors that all declare sequence responses run
/// concurrently and their arrays are concatenated in registration order;
/// the first error in that order wins. Otherwise the first registered
/// descriptor answers alone.
pub async fn route_request(
    descriptors: &[Arc<HandlerDescriptor>],
    request: IncomingRequest,
    cx: RequestContext,
) -> OutgoingMessage {
    let IncomingRequest { id, method, params } = request;

    let result = match descriptors {
        [] => Err(HandlerError::Rpc(ResponseError::method_not_found(&method))),
        [single, ..] if descriptors.len() == 1 || !descriptors.iter().all(|d| d.is_sequence()) => {
            invoke(single, params, cx).await
        }
        _ => aggregate(descriptors, params, cx).await,
    };

    match result {
        Ok(value) => OutgoingMessage::success(id, method, value),
        Err(err) => {
            if !err.is_cancelled() {
                tracing::debug!(%method, %id, "Request failed: {err}");
            }
            OutgoingMessage::failure(Some(id), Some(method), err.to_response_error())
        }
    }
}

/// Invoke every handler for a notification. Failures are logged only.
pub async fn route_notification(
    descriptors: &[Arc<HandlerDescriptor>],
    notification: IncomingNotification,
    cx: RequestContext,
) {
    let IncomingNotification { method, params } = notification;
    let results = join_all(
        descriptors
            .iter()
            .map(|d| invoke(d, params.clone(), cx.clone())),
    )
    .await;

    for err in results.into_iter().filter_map(Result::err) {
        tracing::warn!(%method, "Notification handler failed: {err}");
    }
}

async fn aggregate(
    descriptors: &[Arc<HandlerDescriptor>],
    params: Value,
    cx: RequestContext,
) -> Result<Value, HandlerError> {
    let results = join_all(
        descriptors
            .iter()
            .map(|d| invoke(d, params.clone(), cx.clone())),
    )
    .await;

    let mut items = Vec::new();
    for result in results {
        match result? {
            Value::Array(values) => items.extend(values),
            Value::Null => {}
            other => items.push(other),
        }
    }
    Ok(Value::Array(items))
}

/// Call one handler with panics caught at both the call and the await.
async fn invoke(
    descriptor: &HandlerDescriptor,
    params: Value,
    cx: RequestContext,
) -> Result<Value, HandlerError> {
    let handler = descriptor.handler();
    let future = match catch_unwind(AssertUnwindSafe(|| handler.call(params, cx))) {
        Ok(future) => future,
        Err(panic) => return Err(panicked(descriptor, &*panic)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panicked(descriptor, &*panic)),
    }
}

fn panicked(descriptor: &HandlerDescriptor, payload: &(dyn Any + Send)) -> HandlerError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    tracing::error!(method = descriptor.method(), "Handler panicked: {detail}");
    HandlerError::Internal(detail)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::protocol::message::error_codes;
    use crate::protocol::{Dialect, RequestId};
    use crate::rpc::handler::HandlerOptions;
    use crate::rpc::peer::Peer;
    use crate::rpc::registry::HandlerRegistry;

    fn context() -> RequestContext {
        RequestContext::new(
            Some(RequestId::Number(1)),
            "m",
            CancellationToken::new(),
            CancellationToken::new(),
            Peer::detached(Dialect::JsonRpc),
        )
    }

    fn request(params: Value) -> IncomingRequest {
        IncomingRequest {
            id: RequestId::Number(1),
            method: "m".to_string(),
            params,
        }
    }

    fn result_of(message: OutgoingMessage) -> Result<Value, ResponseError> {
        match message {
            OutgoingMessage::Response { result, .. } => result,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_aggregates_sequence_results_in_registration_order() {
        let registry = HandlerRegistry::new();
        registry
            .on_request("m", HandlerOptions::default().sequence(), |_: Value, _cx| async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok(vec![1, 2])
            })
            .unwrap();
        registry
            .on_request("m", HandlerOptions::default().sequence(), |_: Value, _cx| async {
                Ok(vec![3])
            })
            .unwrap();

        let response = route_request(&registry.resolve("m"), request(json!({})), context()).await;
        assert_eq!(result_of(response).unwrap(), json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_aggregate_propagates_first_error() {
        let registry = HandlerRegistry::new();
        registry
            .on_request("m", HandlerOptions::default().sequence(), |_: Value, _cx| async {
                Ok(vec![1])
            })
            .unwrap();
        registry
            .on_request("m", HandlerOptions::default().sequence(), |_: Value, _cx| async {
                Err::<Vec<i32>, _>(HandlerError::internal("second"))
            })
            .unwrap();
        registry
            .on_request("m", HandlerOptions::default().sequence(), |_: Value, _cx| async {
                Err::<Vec<i32>, _>(HandlerError::InvalidParams("third".into()))
            })
            .unwrap();

        let response = route_request(&registry.resolve("m"), request(json!({})), context()).await;
        let err = result_of(response).unwrap_err();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert!(err.message.contains("second"));
    }

    #[tokio::test]
    async fn test_non_sequence_uses_first_handler() {
        let registry = HandlerRegistry::new();
        registry
            .on_request("m", HandlerOptions::default(), |_: Value, _cx| async { Ok("first") })
            .unwrap();
        registry
            .on_request("m", HandlerOptions::default(), |_: Value, _cx| async { Ok("second") })
            .unwrap();

        let response = route_request(&registry.resolve("m"), request(json!({})), context()).await;
        assert_eq!(result_of(response).unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let registry = HandlerRegistry::new();
        registry
            .on_request("m", HandlerOptions::default(), |_: Value, _cx| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .unwrap();

        let response = route_request(&registry.resolve("m"), request(json!({})), context()).await;
        let err = result_of(response).unwrap_err();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_invalid_params_and_cancellation() {
        let registry = HandlerRegistry::new();
        registry
            .on_request("typed", HandlerOptions::default(), |n: u32, _cx| async move { Ok(n) })
            .unwrap();
        registry
            .on_request("cancel", HandlerOptions::default(), |_: Value, cx: RequestContext| async move {
                cx.cancelled().await;
                Err::<(), _>(HandlerError::Cancelled)
            })
            .unwrap();

        let response =
            route_request(&registry.resolve("typed"), request(json!({"n": 1})), context()).await;
        assert_eq!(result_of(response).unwrap_err().code, error_codes::INVALID_PARAMS);

        let cx = context();
        cx.token().cancel();
        let response = route_request(&registry.resolve("cancel"), request(json!({})), cx).await;
        assert_eq!(result_of(response).unwrap_err().code, error_codes::REQUEST_CANCELLED);
    }

    #[tokio::test]
    async fn test_notification_failures_are_swallowed() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry
            .on_notification("n", HandlerOptions::default(), move |_: Value, _cx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        registry
            .on_notification("n", HandlerOptions::default(), |_: Value, _cx| async {
                Err(HandlerError::internal("ignored"))
            })
            .unwrap();

        route_notification(
            &registry.resolve("n"),
            IncomingNotification {
                method: "n".to_string(),
                params: json!({}),
            },
            context(),
        )
        .await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
