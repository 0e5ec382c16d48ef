//! Streaming sessions and outbound delivery
//!
//! Provides the registry of open server-sent-event sessions and the broadcaster
//! that writes protocol messages onto them.

pub mod broadcaster;
pub mod registry;

pub use broadcaster::{Broadcaster, ReplyPolicy, ReplyTarget};
pub use registry::{DeliveryReport, SessionId, SessionRegistry, SessionStream};
