//! Infrastructure layer
//!
//! Byte-stream plumbing shared by both protocol dialects.

pub mod transport;
