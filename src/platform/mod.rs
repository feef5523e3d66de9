//! Messaging platform
//!
//! Agent registry, message types, the message queue and the router that
//! dispatches messages to agent handlers and type-level subscribers.

mod queue;
mod registry;
mod router;
mod traits;
mod types;

pub use queue::{MessageQueue, QueueOrdering, QueueStats};
pub use registry::{AgentRegistry, AgentStatusReport};
pub use router::{MessageRouter, RouterConfig, RouterStats};
pub use traits::{handler_fn, FnHandler, MessageHandler, SharedHandler};
pub use types::{
    Agent, AgentStatus, Message, MessageType, Metrics, Payload, StatusEvent, SYSTEM_AGENT,
};
