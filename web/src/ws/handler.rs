use crate::AppState;
use async_stream::stream;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::future;
use futures::{SinkExt, StreamExt};
use log::*;
use realtime::connection::{Client, Frame};

/// Upgrades to a WebSocket and hands the socket to a connection actor.
/// Authentication happens over the socket with an `auth` frame.
pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(app_state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(socket: WebSocket, app_state: AppState) {
    let client = Client::new(
        app_state.hub.clone(),
        app_state.codec.clone(),
        app_state.validator.clone(),
        app_state.authorizer.clone(),
        app_state.client_settings(),
    );
    debug!("Establishing WebSocket connection {}", client.id().as_str());

    let (sender, mut receiver) = socket.split();

    let inbound = Box::pin(stream! {
        while let Some(message) = receiver.next().await {
            yield message.map(into_frame);
        }
    });
    let outbound = sender.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(into_message(frame))));

    client.run(inbound, outbound).await;
}

fn into_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}
