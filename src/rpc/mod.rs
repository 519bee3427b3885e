//! Message handling runtime
//!
//! Handlers are registered per method in a [`HandlerRegistry`], routed by
//! [`router`], ordered by the [`ProcessScheduler`] and answered through a
//! single [`OutputWriter`]. [`Connection`] ties them to one byte stream.

pub mod cancellation;
pub mod connection;
pub mod handler;
pub mod output;
pub mod peer;
pub mod registry;
pub mod router;
pub mod scheduler;

pub use cancellation::{CancellationRegistry, InvocationHandle};
pub use connection::{Connection, ConnectionBuilder, ConnectionOptions};
pub use handler::{
    HandlerKind, HandlerOptions, NotificationHandler, ProcessType, RequestContext, RequestHandler,
};
pub use output::{AllowAll, InitializedFilter, OutputFilter, OutputWriter, WriterState};
pub use peer::{Peer, PendingRequests};
pub use registry::{HandlerDescriptor, HandlerRegistry, RegistrationToken};
pub use scheduler::{AbortReason, ProcessScheduler, SchedulerOptions, WorkItem};
