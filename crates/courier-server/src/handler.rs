//! Application handler trait and the closure adapter used by `on()`.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Message;

/// Result of one handler invocation. Errors are caught at the dispatch
/// boundary and reported; they never reach the connection.
pub type HandlerResult = anyhow::Result<()>;

/// Something that reacts to a named message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: Message) -> HandlerResult;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: Message) -> HandlerResult {
        (self.0)(message).await
    }
}

/// Box an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
