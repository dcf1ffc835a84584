pub mod persistence;
pub mod query;
pub mod store;

pub use persistence::{STORE_SNAPSHOT_VERSION, SnapshotFormat, SnapshotManager, StoreSnapshot};
pub use query::{EntityQuery, Filter};
pub use store::{EntityStore, StoreCheckpoint};
