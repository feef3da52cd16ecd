pub mod column_families;
pub mod rocks_db;

pub use column_families::{all_column_families, CF_ITEMS, CF_META};
pub use rocks_db::RocksDB;
