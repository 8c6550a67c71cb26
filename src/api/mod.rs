// WebSocket transport and health endpoint

pub mod health;
pub mod websocket;

pub use health::{health_handler, HealthResponse};
pub use websocket::{create_ws_router, ws_handler, Role, WsAppState};
