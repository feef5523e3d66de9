//! Handler trait implemented by agents and type-level subscribers

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use super::types::Message;
use crate::error::Result;

/// Receives messages dispatched by the router.
///
/// Returning an error (or panicking) counts as a handler failure: the router
/// logs it, bumps the sender's error counter and replies with an ERROR message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Shared handler reference as stored by the registry and router
pub type SharedHandler = Arc<dyn MessageHandler>;

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a shared handler
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
