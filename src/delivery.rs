use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::hub::{Hub, Payload, SubscriberId};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook {url}: {source}")]
    Webhook {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("could not serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("push client: {0}")]
    Push(#[from] axum::Error),
    #[error("mqtt: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

/// A downstream consumer fed by the hub: webhook, push client, MQTT.
#[async_trait]
pub trait Subscriber: Send + 'static {
    fn label(&self) -> String;

    /// Hand one payload on. Failures are counted, not retried by the caller.
    async fn accept(&mut self, payload: &Payload) -> Result<(), DeliveryError>;

    /// `false` once the consumer can never accept again.
    fn is_alive(&self) -> bool {
        true
    }
}

/// A running delivery loop for one subscriber.
pub struct DeliveryTask {
    pub id: SubscriberId,
    pub handle: JoinHandle<()>,
}

/// Register `subscriber` with the hub and drain its queue on a dedicated
/// task. The task ends when the subscription is removed or the subscriber
/// reports itself dead.
pub fn spawn_delivery<S: Subscriber>(hub: &Arc<Hub>, mut subscriber: S) -> DeliveryTask {
    let label = subscriber.label();
    let mut queue = hub.subscribe(label.clone());
    let id = queue.id();
    let hub = Arc::clone(hub);

    let handle = tokio::spawn(async move {
        let stats = queue.stats();
        while let Some(payload) = queue.recv().await {
            if let Err(err) = subscriber.accept(&payload).await {
                stats.record_failure();
                warn!("Delivery to {label} failed: {err}");
            }
            if !subscriber.is_alive() {
                info!("{label} is gone, unsubscribing");
                hub.unsubscribe(id);
                break;
            }
        }
        debug!("Delivery to {label} finished");
    });

    DeliveryTask { id, handle }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::health::Health;

    struct Recorder {
        seen: Arc<Mutex<Vec<Payload>>>,
        fail_every: Option<usize>,
        die_after: Option<usize>,
        calls: usize,
    }

    #[async_trait]
    impl Subscriber for Recorder {
        fn label(&self) -> String {
            "recorder".into()
        }

        async fn accept(&mut self, payload: &Payload) -> Result<(), DeliveryError> {
            self.calls += 1;
            if self.fail_every.is_some_and(|n| self.calls % n == 0) {
                return Err(DeliveryError::Serialize(
                    serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
                ));
            }
            self.seen.lock().push(payload.clone());
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.die_after.is_none_or(|n| self.calls < n)
        }
    }

    fn recorder(fail_every: Option<usize>, die_after: Option<usize>) -> (Recorder, Arc<Mutex<Vec<Payload>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Recorder {
                seen: Arc::clone(&seen),
                fail_every,
                die_after,
                calls: 0,
            },
            seen,
        )
    }

    fn payload(n: u64) -> Payload {
        Payload::External(serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_failures_are_counted_and_delivery_continues() {
        let hub = Arc::new(Hub::new(16, Arc::new(Health::default())));
        let (subscriber, seen) = recorder(Some(2), None);
        let task = spawn_delivery(&hub, subscriber);

        for n in 0..4 {
            hub.publish(payload(n));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.report()[0].failed, 2);

        hub.unsubscribe(task.id);
        task.handle.await.unwrap();
        assert_eq!(*seen.lock(), vec![payload(0), payload(2)]);
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_removed() {
        let hub = Arc::new(Hub::new(16, Arc::new(Health::default())));
        let (subscriber, seen) = recorder(None, Some(2));
        let task = spawn_delivery(&hub, subscriber);

        for n in 0..5 {
            hub.publish(payload(n));
        }
        task.handle.await.unwrap();
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
