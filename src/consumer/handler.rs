//! Message handler seam.
//!
//! A handler receives each item this worker claimed. Returning `Ok` reports an
//! outcome; returning `Err` (or panicking) is an exception, which always
//! returns the item to Pending.

use std::future::Future;

use async_trait::async_trait;

use super::dispatch::ReceivedItem;

/// What the handler reports for an item it processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    Rejected,
}

/// User processing logic, invoked once per claimed item.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, item: ReceivedItem) -> anyhow::Result<HandlerOutcome>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure `|item| async move { ... }` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ReceivedItem) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ReceivedItem) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send,
{
    async fn handle(&self, item: ReceivedItem) -> anyhow::Result<HandlerOutcome> {
        (self.f)(item).await
    }
}
