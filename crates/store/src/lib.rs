//! tickhub-store: market data persistence
//!
//! Store traits consumed by the collectors, the change bridge and the client
//! session, with a PostgreSQL implementation and an in-memory one for tests.

pub mod db;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use db::{create_pool, run_migrations};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use traits::{HistorySource, RecordLookup, RecordWriter, TopicSource};
