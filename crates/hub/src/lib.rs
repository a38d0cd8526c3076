//! tickhub-hub: fan-out of live market data to WebSocket clients
//!
//! `BroadcastHub` owns connection admission and the subscription index,
//! `Session` speaks the client protocol and `ws_router` wires both into axum.

pub mod error;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod ws;

pub use error::HubError;
pub use hub::{BroadcastHub, ClientSink, ConnectionId};
pub use metrics::encode_metrics;
pub use protocol::{parse_request, ClientRequest};
pub use session::Session;
pub use ws::{ws_router, WsState, CAPACITY_CLOSE_REASON};
