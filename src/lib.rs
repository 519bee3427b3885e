//! editrpc - transport and dispatch core for editor protocols
//!
//! Reads `Content-Length` framed JSON from a duplex stream, classifies it
//! as JSON-RPC 2.0 or Debug Adapter Protocol traffic, routes it to
//! registered handlers under a serial/parallel scheduling policy and
//! writes the answers back through a single ordered writer.

pub mod cli;
pub mod config;
pub mod error;
pub mod infra;
pub mod models;
pub mod protocol;
pub mod rpc;

pub use error::{EditRpcError, EditRpcResult};
pub use protocol::Dialect;
pub use rpc::{Connection, HandlerRegistry, Peer, RequestContext};
