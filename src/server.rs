use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionHandle;
use crate::health::HealthReport;
use crate::hub::{Hub, Payload};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub connection: ConnectionHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/data", post(publish))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Broadcast an arbitrary JSON object to every subscriber.
async fn publish(State(state): State<AppState>, body: Bytes) -> Response {
    let value = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(other) => {
            debug!("Rejected non-object payload: {other}");
            return (StatusCode::BAD_REQUEST, "Invalid request payload").into_response();
        }
        Err(err) => {
            debug!("Rejected malformed payload: {err}");
            return (StatusCode::BAD_REQUEST, "Invalid request payload").into_response();
        }
    };

    let queued = state.hub.publish(Payload::External(value));
    debug!("External payload queued for {queued} subscriber(s)");
    (StatusCode::OK, "Data received and broadcasted").into_response()
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(
        state
            .hub
            .health()
            .report(state.connection.state(), state.hub.report()),
    )
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt as _;

    use super::*;
    use crate::connection::{ConnectionMachine, ConnectionSettings};
    use crate::health::Health;
    use crate::radio::testing::SilentRadio;

    fn state() -> AppState {
        let (frames, _) = mpsc::channel(1);
        let (connection, _task) = ConnectionMachine::spawn(
            Arc::new(SilentRadio),
            ConnectionSettings::default(),
            frames,
        );
        AppState {
            hub: Arc::new(Hub::new(8, Arc::new(Health::default()))),
            connection,
        }
    }

    async fn post_data(app: Router, body: &'static str) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::post("/data")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_publish_broadcasts_object() {
        let state = state();
        let mut sub = state.hub.subscribe("test");

        let (status, body) = post_data(router(state.clone()), r#"{"face": 6, "note": "manual"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Data received and broadcasted");

        let payload = sub.recv().await.unwrap();
        assert_eq!(
            *payload,
            Payload::External(serde_json::json!({"face": 6, "note": "manual"}))
        );
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_payloads() {
        let state = state();
        let sub = state.hub.subscribe("test");

        for body in ["{not json", "[1, 2]", "42", ""] {
            let (status, text) = post_data(router(state.clone()), body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(text, "Invalid request payload");
        }
        assert_eq!(sub.stats().queued(), 0);
    }

    #[tokio::test]
    async fn test_health_reports_state_and_subscribers() {
        let state = state();
        let _sub = state.hub.subscribe("webhook http://localhost/hook");

        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let report: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report["status"], "ok");
        assert_eq!(report["connection"], "idle");
        assert_eq!(report["subscribers"][0]["label"], "webhook http://localhost/hook");
    }
}
