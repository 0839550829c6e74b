use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::state::AppState;

/// Upgrades to a WebSocket that relays bus events once the client subscribes.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let event_bus = state.event_bus.clone();
    ws.on_upgrade(move |socket| websocket::serve_connection(socket, event_bus))
}
