//! JSON-RPC message handling
//!
//! Provides the protocol message model and the router that dispatches inbound
//! messages to procedure handlers.

pub mod router;
pub mod rpc;
