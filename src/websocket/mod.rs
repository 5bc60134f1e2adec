pub mod protocol;
pub mod handler;
pub mod routing;

pub use handler::{ConnectionHandler, ConnectionSettings};
pub use routing::{route_request, WEBSOCKET_PATH};
