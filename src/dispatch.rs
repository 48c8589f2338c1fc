//! Serialized delivery of completion callbacks.
//!
//! Requests run on arbitrary worker tasks and complete in any order.
//! Every outcome is queued here and handed to the caller from a single
//! consumer, one at a time, never from the task that submitted the
//! request. An embedding application either lets [Dispatcher::spawn]
//! drive the queue on a background task or takes the [DeliveryQueue]
//! half and drives it on its own event loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// A queued, not-yet-delivered completion.
struct Delivery {
    cancelled: Arc<AtomicBool>,
    deliver: Box<dyn FnOnce() + Send>,
}

impl Delivery {
    fn fire(self) {
        // Checked at delivery time, so a result that was already queued
        // when the call was cancelled is still suppressed.
        if self.cancelled.load(Ordering::Acquire) {
            log::warn!("Request canceled; suppressing completion delivery");
            return;
        }
        (self.deliver)();
    }
}

/// Sending half: queues completions for serialized delivery.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Receiving half: the single consumer that runs the callbacks.
pub struct DeliveryQueue {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Dispatcher {
    /// Create a dispatcher together with its delivery queue.
    pub fn channel() -> (Self, DeliveryQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DeliveryQueue { rx })
    }

    /// Create a dispatcher whose queue is drained by a background task.
    ///
    /// Must be called within a tokio runtime. The task ends once the
    /// last dispatcher clone is dropped.
    pub fn spawn() -> Self {
        let (dispatcher, queue) = Self::channel();
        tokio::spawn(queue.run());
        dispatcher
    }

    /// Queue a completion.
    ///
    /// The cancellation flag is read again just before the callback
    /// runs; setting it any time before then suppresses delivery.
    pub(crate) fn post(
        &self,
        cancelled: Arc<AtomicBool>,
        deliver: impl FnOnce() + Send + 'static,
    ) {
        let delivery = Delivery {
            cancelled,
            deliver: Box::new(deliver),
        };
        if self.tx.send(delivery).is_err() {
            log::warn!("Delivery queue is gone; dropping a completion");
        }
    }
}

impl DeliveryQueue {
    /// Deliver queued completions until the last dispatcher is dropped.
    pub async fn run(mut self) {
        while let Some(delivery) = self.rx.recv().await {
            delivery.fire();
        }
    }
}
