pub mod cache;
pub mod db;
pub mod engine;
pub mod maintenance;
pub mod record;
pub mod transaction;
pub mod types;

pub use cache::PayloadCache;
pub use db::RocksDB;
pub use engine::{SealedStore, SealedStoreConfig};
pub use maintenance::MaintenanceReport;
pub use record::StorageRecord;
pub use transaction::Transaction;
pub use types::{ItemMetadata, Receipt, StorageError, StoragePolicy, StorageStats};
