//! # HTTP API
//!
//! `POST /identify` over axum. Reconciliation takes blocking key locks, so
//! each request runs the engine on the blocking thread pool.

use crate::error::ReconcileError;
use crate::model::IdentifyRequest;
use crate::Unicontact;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Error body returned for every non-200 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn router(service: Arc<Unicontact>) -> Router {
    Router::new()
        .route("/identify", post(identify_handler))
        .with_state(service)
}

/// Serve until ctrl-c.
pub async fn serve(listener: TcpListener, service: Arc<Unicontact>) -> anyhow::Result<()> {
    info!("HTTP API server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

pub(crate) async fn identify_handler(
    State(service): State<Arc<Unicontact>>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match tokio::task::spawn_blocking(move || service.identify(request)).await {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Err(ReconcileError::Validation(err))) => {
            error_response(StatusCode::BAD_REQUEST, err.to_string())
        }
        Ok(Err(ReconcileError::Store(err))) => {
            error!(error = %err, "identify failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        Err(err) => {
            error!(error = %err, "identify task aborted");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "identify task aborted".to_string(),
            )
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContactId, IdentifyResponse};
    use axum::body::{to_bytes, Body};
    use axum::extract::FromRequest;
    use axum::http::Request;

    async fn call(service: &Arc<Unicontact>, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/identify")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let payload = Json::<IdentifyRequest>::from_request(request, &()).await;
        let response = identify_handler(State(Arc::clone(service)), payload).await;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn identify_returns_consolidated_contact() {
        let service = Arc::new(Unicontact::new());
        let (status, body) = call(&service, r#"{"email":"a@x.com","phoneNumber":"111"}"#).await;
        assert_eq!(status, StatusCode::OK);
        let response: IdentifyResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.contact.primary_contact_id, ContactId(1));

        let (status, body) = call(&service, r#"{"email":"a@x.com","phoneNumber":"222"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["contact"]["primaryContactId"], 1);
        assert_eq!(body["contact"]["phoneNumbers"], serde_json::json!(["111", "222"]));
        assert_eq!(body["contact"]["secondaryContactIds"], serde_json::json!([2]));
    }

    #[tokio::test]
    async fn identify_rejects_missing_identifiers() {
        let service = Arc::new(Unicontact::new());
        for body in [r#"{}"#, r#"{"email":null,"phoneNumber":null}"#] {
            let (status, body) = call(&service, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "email or phoneNumber required");
        }
        assert_eq!(service.metrics().commits, 0);
    }

    #[tokio::test]
    async fn identify_rejects_malformed_json() {
        let service = Arc::new(Unicontact::new());
        let (status, body) = call(&service, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some_and(|error| !error.is_empty()));
    }
}
