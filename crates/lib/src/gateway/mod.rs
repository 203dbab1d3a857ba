//! Gateway: HTTP + WebSocket control plane for the chat widget and admin panel.
//!
//! Single port serves HTTP and WebSocket. Protocol: `connect` first, then
//! requests (req/res) and events (session messages, cooldown ticks, shutdown).

mod protocol;
mod server;

pub use protocol::{ChatParams, ConnectParams, HelloOk, WsRequest, WsResponse};
pub use server::{run_gateway, serve, GatewayState};
