use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Url};

use crate::delivery::{DeliveryError, Subscriber};
use crate::hub::Payload;

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// POSTs every payload as JSON to one URL, giving up after `attempts` tries.
pub struct WebhookSubscriber {
    client: Client,
    url: Url,
    attempts: u32,
    retry_delay: Duration,
}

impl WebhookSubscriber {
    pub fn new(client: Client, url: Url, attempts: u32) -> Self {
        WebhookSubscriber {
            client,
            url,
            attempts: attempts.max(1),
            retry_delay: RETRY_DELAY,
        }
    }
}

#[async_trait]
impl Subscriber for WebhookSubscriber {
    fn label(&self) -> String {
        format!("webhook {}", self.url)
    }

    async fn accept(&mut self, payload: &Payload) -> Result<(), DeliveryError> {
        let mut attempt = 1;
        loop {
            let result = self
                .client
                .post(self.url.clone())
                .json(payload)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match result {
                Ok(response) => {
                    debug!("Webhook {} answered {}", self.url, response.status());
                    return Ok(());
                }
                Err(err) if attempt < self.attempts => {
                    debug!("Webhook {} attempt {attempt} failed: {err}", self.url);
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(source) => {
                    return Err(DeliveryError::Webhook {
                        url: self.url.to_string(),
                        source,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::{RawFrame, decode};

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn subscriber(url: &str, attempts: u32) -> WebhookSubscriber {
        let mut webhook = WebhookSubscriber::new(
            Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
            Url::parse(url).unwrap(),
            attempts,
        );
        webhook.retry_delay = Duration::from_millis(10);
        webhook
    }

    #[tokio::test]
    async fn test_posts_decoded_event_as_json() {
        let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let app = Router::new().route(
            "/hook",
            post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                    StatusCode::OK
                }
            }),
        );
        let base = serve(app).await;
        let mut webhook = subscriber(&format!("{base}/hook"), 1);

        let event = decode(&RawFrame::new("AA:BB", vec![3, 1, 5])).unwrap();
        webhook.accept(&Payload::Decoded(event)).await.unwrap();

        let body = rx.recv().await.unwrap();
        assert_eq!(body["device_id"], "AA:BB");
        assert_eq!(body["kind"], "roll_state");
        assert_eq!(body["current_face"], 5);
    }

    #[tokio::test]
    async fn test_server_error_is_retried_then_reported() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/hook",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let base = serve(app).await;
        let mut webhook = subscriber(&format!("{base}/hook"), 3);

        let err = webhook
            .accept(&Payload::External(serde_json::json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Webhook { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut webhook = subscriber(&format!("http://{addr}/hook"), 2);
        let result = webhook
            .accept(&Payload::External(serde_json::json!({})))
            .await;
        assert!(matches!(result, Err(DeliveryError::Webhook { .. })));
    }
}
