//! iyzico webhook endpoint
//!
//! The body is read as raw bytes and decoded here, so malformed JSON gets the
//! same `{success: false, error}` envelope as every other failure.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;

use crate::error::ApiError;
use crate::state::AppState;

/// Handle `POST /api/iyzico-webhook`
pub async fn iyzico_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected iyzico webhook with malformed JSON");
            return ApiError::Validation("Invalid JSON body".to_string()).into_response();
        }
    };

    let response = state.webhooks.handle(&payload).await;
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    (status, Json(response.body)).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use findco_billing::{
        BillingConfig, BillingEmailService, BillingService, EmailConfig, InMemoryRecordStore,
        RecordingNotifier, UserSubscriptionRecord,
    };
    use serde_json::json;
    use tower::ServiceExt;

    use crate::routes::create_router;
    use crate::state::AppState;

    fn app(config: BillingConfig) -> (axum::Router, Arc<InMemoryRecordStore>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let email = BillingEmailService::new(
            Arc::new(RecordingNotifier::new()),
            EmailConfig::default(),
            Duration::from_secs(1),
        );
        let billing = BillingService::with_email(config, store.clone(), email);
        (create_router(AppState::new(billing.webhooks.clone())), store)
    }

    async fn post(router: axum::Router, body: impl Into<Body>) -> (u16, serde_json::Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/iyzico-webhook")
                    .header("content-type", "application/json")
                    .body(body.into())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status().as_u16();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_activation_over_http() {
        let (router, store) = app(BillingConfig::default().with_secret("sandbox"));
        store.insert(UserSubscriptionRecord::new_free("a@x.com")).await;

        let body = json!({
            "eventType": "subscription.started",
            "customerEmail": "a@x.com",
            "pricingPlanName": "Pro"
        });
        let (status, json) = post(router, body.to_string()).await;

        assert_eq!(status, 200);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["package"], "Pro");
        assert!(json["data"]["endDate"].is_string());
        assert!(store.get("a@x.com").await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_unknown_event_over_http() {
        let (router, _) = app(BillingConfig::default().with_secret("sandbox"));
        let body = json!({ "eventType": "subscription.something_new" });
        let (status, json) = post(router, body.to_string()).await;

        assert_eq!(status, 200);
        assert_eq!(json, json!({ "success": true, "message": "Event ignored" }));
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let (router, _) = app(BillingConfig::default().with_secret("sandbox"));
        let (status, json) = post(router, "{not json").await;

        assert_eq!(status, 400);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Invalid JSON body");
    }

    #[tokio::test]
    async fn test_missing_secret_is_server_error() {
        let (router, _) = app(BillingConfig::default());
        let body = json!({ "eventType": "subscription.started", "customerEmail": "a@x.com" });
        let (status, json) = post(router, body.to_string()).await;

        assert_eq!(status, 500);
        assert_eq!(json["error"], "Server configuration error");
    }

    #[tokio::test]
    async fn test_oversized_period_over_http() {
        let (router, store) = app(BillingConfig::default().with_secret("sandbox"));
        store.insert(UserSubscriptionRecord::new_free("a@x.com")).await;

        let body = json!({
            "eventType": "subscription.started",
            "customerEmail": "a@x.com",
            "pricingPlan": { "paymentInterval": "YEARLY", "paymentIntervalCount": 100000 }
        });
        let (status, json) = post(router, body.to_string()).await;

        assert_eq!(status, 400);
        assert_eq!(json["success"], false);
        assert!(!store.get("a@x.com").await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let (router, _) = app(BillingConfig::default().with_secret("sandbox"));
        let body = json!({ "eventType": "subscription.cancelled", "customerEmail": "ghost@x.com" });
        let (status, json) = post(router, body.to_string()).await;

        assert_eq!(status, 404);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (router, _) = app(BillingConfig::default());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }
}
