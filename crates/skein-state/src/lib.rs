pub mod backend;
pub mod postgres;
pub mod resolver;
pub mod snapshot;
pub mod sqlite;

pub use backend::{BackendHandle, SnapshotStore};
pub use postgres::PgStateStore;
pub use resolver::{BackendResolver, SharedConnector};
pub use snapshot::ExecutionSnapshot;
pub use sqlite::SqliteStateStore;
