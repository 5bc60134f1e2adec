use std::sync::Arc;
use axum::{
    extract::State,
    response::{Html, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::feed::{FeedStatus, FeedStatusSnapshot};
use crate::relay::Broadcaster;

const INDEX_HTML: &str = include_str!("../../static/index.html");

#[derive(Clone)]
pub struct ApiState {
    pub broadcaster: Arc<Broadcaster>,
    pub feed_status: Arc<FeedStatus>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub subscribers: usize,
    pub dispatched: u64,
    pub feed: FeedStatusSnapshot,
}

// GET / - Demo page
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

// GET /api/health - Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "bitmex_relay",
        "timestamp": Utc::now()
    }))
}

// GET /api/stats - Relay and upstream feed counters
pub async fn stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        subscribers: state.broadcaster.subscriber_count(),
        dispatched: state.broadcaster.dispatched(),
        feed: state.feed_status.snapshot(),
    })
}

// Create the API router
pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .with_state(state);

    Router::new()
        .route("/", get(index))
        .nest("/api", api_routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::feed::ingestor::FeedState;
    use crate::feed::Update;
    use crate::relay::{Sink, SinkSettings};

    fn state() -> ApiState {
        ApiState {
            broadcaster: Arc::new(Broadcaster::new()),
            feed_status: Arc::new(FeedStatus::new()),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_stats_reports_subscribers() {
        let state = state();
        let sink = Arc::new(Sink::new(SinkSettings::default()));
        state.broadcaster.register(&sink);
        state.broadcaster.dispatch(&Update::new("XBTUSD", 1.0, "t"));

        let Json(stats) = stats(State(state)).await;
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.feed.state, FeedState::Connecting);
        assert!(stats.uptime_secs >= 0);
    }

    #[tokio::test]
    async fn test_router_serves_stats_and_index() {
        let app = create_api_router(state());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["subscribers"], 0);
        assert_eq!(json["feed"]["state"], "connecting");

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
