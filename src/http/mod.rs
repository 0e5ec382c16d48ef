//! HTTP transport layer
//!
//! Provides the single configured endpoint: POST to submit messages, GET to
//! subscribe to the server-sent-event stream.

pub mod handlers;
