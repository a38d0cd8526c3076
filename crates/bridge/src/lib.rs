//! tickhub-bridge: store change notifications to client broadcasts
//!
//! Row triggers NOTIFY a small `{topic_key, time}` payload. The bridge
//! listens on a dedicated connection, skips topics nobody watches, and
//! re-reads the full row before handing it to the hub.

pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod messages;
pub mod metrics;

pub use dispatcher::{Dispatcher, EventHandler};
pub use error::BridgeError;
pub use listener::ChangeBridge;
pub use messages::{parse_notification, ChangeEvent, Channel};
