//! `db` crate: pure persistence layer.
//!
//! Provides the store contracts the engine consumes, an in-memory backend,
//! and a Postgres backend: connection pool, typed row structs, repository
//! functions, a table-backed job queue and a `LISTEN/NOTIFY` event bus.
//! No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pg;
pub mod pg_bus;
pub mod pg_queue;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use pg_bus::PgEventBus;
pub use pg_queue::PgJobQueue;
pub use pool::DbPool;
pub use store::{CredentialStore, ExecutionStore, WorkflowStore};
