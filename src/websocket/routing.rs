use log::warn;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

pub const WEBSOCKET_PATH: &str = "/ws";

/// Handshake callback: only upgrades on [`WEBSOCKET_PATH`] are accepted.
pub fn route_request(req: &Request, response: Response) -> Result<Response, ErrorResponse> {
    let path = req.uri().path();

    if path == WEBSOCKET_PATH {
        Ok(response)
    } else {
        warn!("Rejecting WebSocket upgrade on unknown path '{}'", path);
        let mut rejection = ErrorResponse::new(Some("Invalid WebSocket path".to_string()));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    }
}
