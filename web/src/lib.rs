use axum::http::{HeaderValue, Method};
use log::*;
use realtime::authorizer::ChannelAuthorizer;
use realtime::codec::Codec;
use realtime::connection::ClientSettings;
use realtime::identity::TokenValidator;
use realtime::Hub;
use service::config::Config;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

mod controller;
mod router;
mod ws;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub hub: Hub,
    pub codec: Arc<Codec>,
    pub validator: Arc<dyn TokenValidator>,
    pub authorizer: Arc<ChannelAuthorizer>,
}

impl AppState {
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            queue_capacity: self.config.ws_outbound_queue_capacity,
            heartbeat_interval: self.config.heartbeat_interval(),
            pong_timeout: self.config.pong_timeout(),
            write_timeout: self.config.write_timeout(),
            max_frame_bytes: self.config.ws_max_frame_bytes,
            max_auth_attempts: self.config.ws_max_auth_attempts,
        }
    }
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn init_server(
    app_state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let host = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let server_url = format!("{}:{}", host, app_state.config.port);

    let allowed_origins: Vec<HeaderValue> = app_state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(allowed_origins);

    let listener = tokio::net::TcpListener::bind(&server_url).await?;
    info!("Server starting... listening for connections on http://{server_url}");

    axum::serve(listener, router::define_routes(app_state).layer(cors_layer))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server stopped");
    Ok(())
}
