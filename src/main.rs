use log::*;
use realtime::authorizer::{ChannelAuthorizer, InMemoryMembership};
use realtime::codec::Codec;
use realtime::identity::JwtTokenValidator;
use realtime::Hub;
use service::{config::Config, logging::Logger};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = Config::new();
    Logger::init_logger(&config);

    info!(
        "Starting peer support realtime server [{}]...",
        config.runtime_env()
    );

    let codec = Arc::new(Codec::new());
    let (hub, hub_task) = Hub::start(codec.clone());

    let app_state = web::AppState {
        validator: Arc::new(JwtTokenValidator::new(config.jwt_secret().as_deref())),
        authorizer: Arc::new(ChannelAuthorizer::new(Arc::new(InMemoryMembership::new()))),
        config,
        hub: hub.clone(),
        codec,
    };

    if let Err(e) = web::init_server(app_state, shutdown_signal()).await {
        error!("Server failed: {e}");
    }

    hub.shutdown();
    if let Err(e) = hub_task.await {
        error!("Hub control loop ended abnormally: {e}");
    }
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal, stopping server..."),
        Err(e) => {
            error!("Unable to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    }
}
