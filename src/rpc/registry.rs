//! Handler Registry
//!
//! Maps method names to handler descriptors. Registration is additive: a
//! method may have several descriptors, kept in registration order. Each
//! registration gets a token used to replace or remove exactly that entry.
//! Lookups return a snapshot, so unregistering never disturbs in-flight work.

use std::any::{TypeId, type_name};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::handler::{
    ErasedHandler, FactoryAdapter, FnAdapter, HandlerKind, HandlerOptions, NotificationAdapter,
    NotificationHandler, ProcessType, RequestAdapter, RequestContext, RequestHandler,
};
use crate::error::{HandlerError, RegistryError};

/// Static metadata and call surface for one registered handler
#[derive(Clone)]
pub struct HandlerDescriptor {
    method: String,
    kind: HandlerKind,
    handler_type: &'static str,
    params_type: &'static str,
    response_type: Option<&'static str>,
    process_type: ProcessType,
    sequence: bool,
    handler: Arc<dyn ErasedHandler>,
}

impl HandlerDescriptor {
    /// Typed request handler registered under `H::METHOD`
    pub fn request<H: RequestHandler>(handler: H) -> Self {
        Self::request_as(H::METHOD, handler)
    }

    pub fn request_as<H: RequestHandler>(method: impl Into<String>, handler: H) -> Self {
        Self {
            method: method.into(),
            kind: HandlerKind::Request,
            handler_type: type_name::<H>(),
            params_type: type_name::<H::Params>(),
            response_type: response_type::<H::Result>(),
            process_type: H::PROCESS_TYPE,
            sequence: H::SEQUENCE,
            handler: Arc::new(RequestAdapter(Arc::new(handler))),
        }
    }

    /// A fresh handler from `factory` serves each invocation
    pub fn request_factory<H, F>(method: impl Into<String>, factory: F) -> Self
    where
        H: RequestHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self {
            method: method.into(),
            kind: HandlerKind::Request,
            handler_type: type_name::<H>(),
            params_type: type_name::<H::Params>(),
            response_type: response_type::<H::Result>(),
            process_type: H::PROCESS_TYPE,
            sequence: H::SEQUENCE,
            handler: Arc::new(FactoryAdapter::<F, H>::new(factory)),
        }
    }

    pub fn notification<H: NotificationHandler>(handler: H) -> Self {
        Self::notification_as(H::METHOD, handler)
    }

    pub fn notification_as<H: NotificationHandler>(method: impl Into<String>, handler: H) -> Self {
        Self {
            method: method.into(),
            kind: HandlerKind::Notification,
            handler_type: type_name::<H>(),
            params_type: type_name::<H::Params>(),
            response_type: None,
            process_type: H::PROCESS_TYPE,
            sequence: false,
            handler: Arc::new(NotificationAdapter(Arc::new(handler))),
        }
    }

    /// Async closure answering requests
    pub fn from_request_fn<F, P, R, Fut>(method: impl Into<String>, f: F) -> Self
    where
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        Self {
            method: method.into(),
            kind: HandlerKind::Request,
            handler_type: type_name::<F>(),
            params_type: type_name::<P>(),
            response_type: response_type::<R>(),
            process_type: ProcessType::default(),
            sequence: false,
            handler: Arc::new(FnAdapter::<F, P, R, Fut>::new(f)),
        }
    }

    /// Async closure consuming notifications
    pub fn from_notification_fn<F, P, Fut>(method: impl Into<String>, f: F) -> Self
    where
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
    {
        Self {
            method: method.into(),
            kind: HandlerKind::Notification,
            handler_type: type_name::<F>(),
            params_type: type_name::<P>(),
            response_type: None,
            process_type: ProcessType::default(),
            sequence: false,
            handler: Arc::new(FnAdapter::<F, P, (), Fut>::new(f)),
        }
    }

    /// Explicit options take precedence over the handler type's defaults
    pub fn with_options(mut self, options: HandlerOptions) -> Self {
        if let Some(process_type) = options.process_type {
            self.process_type = process_type;
        }
        if let Some(sequence) = options.sequence {
            self.sequence = sequence;
        }
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn params_type(&self) -> &'static str {
        self.params_type
    }

    /// `None` for handlers that produce no value
    pub fn response_type(&self) -> Option<&'static str> {
        self.response_type
    }

    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    pub fn is_sequence(&self) -> bool {
        self.sequence
    }

    pub fn handler(&self) -> &Arc<dyn ErasedHandler> {
        &self.handler
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("method", &self.method)
            .field("kind", &self.kind)
            .field("handler_type", &self.handler_type)
            .field("params_type", &self.params_type)
            .field("response_type", &self.response_type)
            .field("process_type", &self.process_type)
            .field("sequence", &self.sequence)
            .finish()
    }
}

fn response_type<R: 'static>() -> Option<&'static str> {
    (TypeId::of::<R>() != TypeId::of::<()>()).then(type_name::<R>)
}

/// Handle for one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken(u64);

impl RegistrationToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Vec<(RegistrationToken, Arc<HandlerDescriptor>)>>,
    links: HashMap<String, String>,
}

/// Method name to descriptor table, read-mostly and safe to share
#[derive(Default)]
pub struct HandlerRegistry {
    state: RwLock<RegistryState>,
    next_token: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor alongside any existing ones for its method
    pub fn register(
        &self,
        descriptor: HandlerDescriptor,
    ) -> Result<RegistrationToken, RegistryError> {
        if descriptor.method.is_empty() {
            return Err(RegistryError::MissingMethod {
                handler: descriptor.handler_type,
            });
        }

        let token = RegistrationToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::debug!(
            method = %descriptor.method,
            params = descriptor.params_type,
            process_type = ?descriptor.process_type,
            "Registered handler"
        );

        let mut state = self.write();
        state
            .handlers
            .entry(descriptor.method.clone())
            .or_default()
            .push((token, Arc::new(descriptor)));
        Ok(token)
    }

    pub fn register_with(
        &self,
        descriptor: HandlerDescriptor,
        options: HandlerOptions,
    ) -> Result<RegistrationToken, RegistryError> {
        self.register(descriptor.with_options(options))
    }

    pub fn on_request<F, P, R, Fut>(
        &self,
        method: &str,
        options: HandlerOptions,
        f: F,
    ) -> Result<RegistrationToken, RegistryError>
    where
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register_with(HandlerDescriptor::from_request_fn(method, f), options)
    }

    pub fn on_notification<F, P, Fut>(
        &self,
        method: &str,
        options: HandlerOptions,
        f: F,
    ) -> Result<RegistrationToken, RegistryError>
    where
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
    {
        self.register_with(HandlerDescriptor::from_notification_fn(method, f), options)
    }

    /// Swap the descriptor behind `token`, keeping its position when the
    /// method is unchanged.
    pub fn replace(
        &self,
        token: RegistrationToken,
        descriptor: HandlerDescriptor,
    ) -> Result<(), RegistryError> {
        if descriptor.method.is_empty() {
            return Err(RegistryError::MissingMethod {
                handler: descriptor.handler_type,
            });
        }

        let mut state = self.write();
        let Some(current) = find_token(&state, token) else {
            return Err(RegistryError::UnknownToken(token.0));
        };

        let descriptor = Arc::new(descriptor);
        if current == descriptor.method {
            if let Some(slot) = state
                .handlers
                .get_mut(&current)
                .and_then(|entries| entries.iter_mut().find(|(t, _)| *t == token))
            {
                slot.1 = descriptor;
            }
        } else {
            remove_token(&mut state, &current, token);
            state
                .handlers
                .entry(descriptor.method.clone())
                .or_default()
                .push((token, descriptor));
        }
        Ok(())
    }

    /// Remove the registration behind `token`. Returns false if it was
    /// already gone.
    pub fn unregister(&self, token: RegistrationToken) -> bool {
        let mut state = self.write();
        match find_token(&state, token) {
            Some(method) => {
                remove_token(&mut state, &method, token);
                tracing::debug!(%method, token = token.0, "Unregistered handler");
                true
            }
            None => false,
        }
    }

    /// Dispatch `from` with the descriptors of `to`
    pub fn link(&self, from: impl Into<String>, to: impl Into<String>) {
        self.write().links.insert(from.into(), to.into());
    }

    /// Snapshot of the descriptors serving `method`, after following links
    pub fn resolve(&self, method: &str) -> Vec<Arc<HandlerDescriptor>> {
        let state = self.read();
        let target = follow_links(&state, method);
        state
            .handlers
            .get(target)
            .map(|entries| entries.iter().map(|(_, d)| Arc::clone(d)).collect())
            .unwrap_or_default()
    }

    /// Like [`resolve`](Self::resolve), restricted to one handler kind
    pub fn resolve_kind(&self, method: &str, kind: HandlerKind) -> Vec<Arc<HandlerDescriptor>> {
        self.resolve(method)
            .into_iter()
            .filter(|d| d.kind == kind)
            .collect()
    }

    pub fn contains(&self, method: &str) -> bool {
        !self.resolve(method).is_empty()
    }

    /// Registered and linked method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let state = self.read();
        let mut methods: Vec<String> = state
            .handlers
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(m, _)| m.clone())
            .chain(state.links.keys().cloned())
            .collect();
        methods.sort();
        methods.dedup();
        methods
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_token(state: &RegistryState, token: RegistrationToken) -> Option<String> {
    state
        .handlers
        .iter()
        .find(|(_, entries)| entries.iter().any(|(t, _)| *t == token))
        .map(|(method, _)| method.clone())
}

fn remove_token(state: &mut RegistryState, method: &str, token: RegistrationToken) {
    if let Some(entries) = state.handlers.get_mut(method) {
        entries.retain(|(t, _)| *t != token);
        if entries.is_empty() {
            state.handlers.remove(method);
        }
    }
}

fn follow_links<'a>(state: &'a RegistryState, method: &'a str) -> &'a str {
    let mut current = method;
    let mut seen = HashSet::new();
    while let Some(next) = state.links.get(current) {
        if !seen.insert(current) {
            tracing::warn!(method, "Link cycle detected");
            break;
        }
        current = next.as_str();
    }
    current
}
