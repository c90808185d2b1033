//! Bounded single-message receive.

use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::{BrokerSession, Delivery, Subscription};
use crate::error::{BrokerResult, HarnessError, Result};

/// Holds a subscription until it is released.
///
/// If the guard is dropped without [`release`](Self::release), for example
/// because the waiting future was cancelled, the consumer is cancelled on
/// the current Tokio runtime in the background.
struct SubscriptionGuard {
    inner: Option<Box<dyn Subscription>>,
}

impl SubscriptionGuard {
    fn new(subscription: Box<dyn Subscription>) -> Self {
        Self {
            inner: Some(subscription),
        }
    }

    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>> {
        match self.inner.as_mut() {
            Some(subscription) => subscription.next_delivery().await,
            None => None,
        }
    }

    async fn release(mut self) {
        if let Some(subscription) = self.inner.take() {
            cancel_quietly(subscription).await;
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Some(subscription) = self.inner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cancel_quietly(subscription));
            }
            Err(_) => warn!(
                queue = subscription.queue(),
                consumer_tag = subscription.consumer_tag(),
                "no runtime to cancel abandoned consumer"
            ),
        }
    }
}

async fn cancel_quietly(subscription: Box<dyn Subscription>) {
    let queue = subscription.queue().to_string();
    let consumer_tag = subscription.consumer_tag().to_string();
    match subscription.cancel().await {
        Ok(()) => debug!(queue = %queue, consumer_tag = %consumer_tag, "consumer cancelled"),
        Err(e) => warn!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            error = %e,
            "failed to cancel consumer"
        ),
    }
}

/// Receive exactly one message from `queue`, waiting at most `timeout`.
///
/// The message is acknowledged on receipt. The consumer registered for the
/// wait is cancelled whether or not a message arrived.
///
/// # Errors
///
/// - [`HarnessError::ReceiveTimeout`] if nothing arrived in time
/// - [`HarnessError::SubscriptionClosed`] if the consumer was shut down first
/// - [`HarnessError::Broker`] if subscribing or receiving failed
pub async fn consume_once(
    session: &dyn BrokerSession,
    queue: &str,
    timeout: Duration,
) -> Result<Delivery> {
    let subscription = session.subscribe(queue).await?;
    let mut guard = SubscriptionGuard::new(subscription);

    let outcome = tokio::time::timeout(timeout, guard.next_delivery()).await;
    guard.release().await;

    match outcome {
        Ok(Some(Ok(delivery))) => {
            debug!(
                queue,
                delivery_tag = delivery.envelope.delivery_tag,
                bytes = delivery.payload.len(),
                "received message"
            );
            Ok(delivery)
        }
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(None) => Err(HarnessError::SubscriptionClosed {
            queue: queue.to_string(),
        }),
        Err(_) => Err(HarnessError::ReceiveTimeout {
            queue: queue.to_string(),
            timeout,
        }),
    }
}
