//! Read-only web dashboard.
//!
//! Routes:
//! - `GET /health`
//! - `POST /auth/telegram` (login widget → session token)
//! - `GET /api/analytics`, `/api/accounts`, `/api/groups` (session required)
//! - `POST /api/bot/update_analytics` (`X-API-Key` required)

pub mod auth;
pub mod handlers;
pub mod pusher;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use pusher::AnalyticsPusher;

use crate::config::Config;
use crate::error::{AdError, Result};
use crate::store::Store;

/// Shared state for dashboard handlers.
#[derive(Clone)]
pub struct DashboardState {
    pub config: Arc<Config>,
    pub store: Store,
}

/// Handler error, rendered as `{"success": false, "error": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<AdError> for ApiError {
    fn from(err: AdError) -> Self {
        match err {
            AdError::NotFound(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(msg) => {
                error!("Dashboard request failed: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({ "success": false, "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the dashboard router.
pub fn router(state: DashboardState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/telegram", post(handlers::telegram_auth))
        .route("/api/bot/update_analytics", post(handlers::update_analytics))
        .with_state(state.clone());

    let session_routes = Router::new()
        .route("/api/analytics", get(handlers::get_analytics))
        .route("/api/accounts", get(handlers::get_accounts))
        .route("/api/groups", get(handlers::get_groups))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth::session_middleware,
        ))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(session_routes)
        .fallback(handlers::not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve the dashboard until `shutdown` fires.
pub async fn serve(config: Arc<Config>, store: Store, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", config.dashboard.host, config.dashboard.port);
    let app = router(DashboardState { config, store });
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AdError::Config(format!("failed to bind dashboard to {}: {}", addr, e)))?;
    info!("Dashboard listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Dashboard stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::auth::tests::{signed_payload, TOKEN};
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn state() -> DashboardState {
        let mut config = Config::default();
        config.bot.token = TOKEN.to_string();
        let store = Store::new_memory();
        store.create_user(42, None, None).await.unwrap();
        store.add_target_group(42, -1, "One").await.unwrap();
        DashboardState {
            config: Arc::new(config),
            store,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(app: &Router) -> String {
        let payload = signed_payload(42, crate::utils::time::now_ts());
        let response = app
            .clone()
            .oneshot(
                Request::post("/auth/telegram")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_some());
        body_json(response).await["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state().await);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_requires_session() {
        let app = router(state().await);
        let response = app
            .oneshot(Request::get("/api/analytics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_login_then_read_views() {
        let app = router(state().await);
        let token = login(&app).await;

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/groups")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["groups"]["regular_groups"][0]["name"], "One");

        let response = app
            .oneshot(
                Request::get("/api/analytics")
                    .header(header::COOKIE, format!("theme=dark; session={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["groups_count"], 1);
        assert_eq!(body["data"]["broadcast_running"], false);
    }

    #[tokio::test]
    async fn test_bad_widget_rejected() {
        let app = router(state().await);
        let mut payload = signed_payload(42, crate::utils::time::now_ts());
        payload.insert("hash".into(), Value::String("00".repeat(32)));
        let response = app
            .oneshot(
                Request::post("/auth/telegram")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_update_analytics_checks_key() {
        let st = state().await;
        let store = st.store.clone();
        let app = router(st);
        let request = |key: &str| {
            Request::post("/api/bot/update_analytics")
                .header(header::CONTENT_TYPE, "application/json")
                .header("X-API-Key", key)
                .body(Body::from(
                    r#"{"user_id": 42, "action": "increment_sent"}"#,
                ))
                .unwrap()
        };

        let response = app.clone().oneshot(request("wrong")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(store.analytics(42).await.total_sent, 0);

        let response = app.oneshot(request(TOKEN)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let analytics = store.analytics(42).await;
        assert_eq!(analytics.total_sent, 1);
        assert_eq!(analytics.total_broadcasts, 1);
    }

    #[tokio::test]
    async fn test_pushed_cycle_advances_rotation() {
        let st = state().await;
        let store = st.store.clone();
        store.set_saved_messages_count(42, 2).await.unwrap();
        let app = router(st);

        let response = app
            .oneshot(
                Request::post("/api/bot/update_analytics")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("X-API-Key", TOKEN)
                    .body(Body::from(r#"{"user_id": 42, "action": "increment_cycle"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.analytics(42).await.total_cycles, 1);
        assert_eq!(store.current_rotation(42).await, 1);
    }
}
