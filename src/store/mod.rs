//! Persistence layer: libSQL-backed storage for recipients, catalog,
//! deliveries, injections and the event log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
