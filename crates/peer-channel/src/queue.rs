use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("delivery queue is shut down")]
pub struct QueueClosed;

/// Async consumer driven by an [`OrderedDeliveryQueue`]. A handler call is
/// never started before the previous one has finished.
#[async_trait]
pub trait DeliveryHandler<T: Send + 'static>: Send + 'static {
    async fn handle(&mut self, item: T);
}

/// Adapts an async closure into a [`DeliveryHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

#[async_trait]
impl<T, F, Fut> DeliveryHandler<T> for HandlerFn<F>
where
    T: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&mut self, item: T) {
        (self.0)(item).await
    }
}

/// FIFO queue drained by a single task that owns the handler.
pub struct OrderedDeliveryQueue<T> {
    sender: DeliverySender<T>,
    drain: JoinHandle<()>,
}

impl<T: Send + 'static> OrderedDeliveryQueue<T> {
    pub fn spawn<H>(mut handler: H) -> Self
    where
        H: DeliveryHandler<T>,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let drain = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                handler.handle(item).await;
            }
            trace!("delivery queue drained");
        });
        Self {
            sender: DeliverySender { tx },
            drain,
        }
    }

    pub fn enqueue(&self, item: T) -> Result<(), QueueClosed> {
        self.sender.enqueue(item)
    }

    /// Cloneable producer handle for callbacks that outlive a borrow of the queue.
    pub fn sender(&self) -> DeliverySender<T> {
        self.sender.clone()
    }

    /// Stops the drain task. Items not yet handled are dropped.
    pub fn shutdown(&self) {
        self.drain.abort();
    }
}

impl<T> Drop for OrderedDeliveryQueue<T> {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

pub struct DeliverySender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for DeliverySender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> DeliverySender<T> {
    pub fn enqueue(&self, item: T) -> Result<(), QueueClosed> {
        self.tx.send(item).map_err(|_| QueueClosed)
    }
}
