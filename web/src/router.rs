use crate::{controller::health_check_controller, ws, AppState};
use axum::{routing::get, Router};

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes(app_state.clone()))
        .merge(ws_routes(app_state))
}

fn health_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check_controller::health_check))
        .with_state(app_state)
}

fn ws_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::handler::ws_handler))
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use clap::Parser;
    use realtime::authorizer::{ChannelAuthorizer, InMemoryMembership};
    use realtime::codec::Codec;
    use realtime::identity::JwtTokenValidator;
    use realtime::Hub;
    use service::config::Config;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app_state() -> AppState {
        let codec = Arc::new(Codec::new());
        let (hub, _) = Hub::start(codec.clone());
        AppState {
            config: Config::parse_from(["peer_support_rs"]),
            hub,
            codec,
            validator: Arc::new(JwtTokenValidator::new(Some("test-secret"))),
            authorizer: Arc::new(ChannelAuthorizer::new(Arc::new(InMemoryMembership::new()))),
        }
    }

    #[tokio::test]
    async fn health_reports_online_count_and_stats() -> Result<()> {
        let response = define_routes(app_state())
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["onlineCount"], 0);
        assert_eq!(body["stats"]["slowConsumerEvictions"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn ws_route_rejects_plain_http_requests() -> Result<()> {
        let response = define_routes(app_state())
            .oneshot(Request::builder().uri("/ws").body(Body::empty())?)
            .await?;

        assert!(response.status().is_client_error());
        Ok(())
    }
}
