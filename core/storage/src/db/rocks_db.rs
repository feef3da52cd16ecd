use super::column_families::all_column_families;
use anyhow::Result;
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

type KvItem = (Box<[u8]>, Box<[u8]>);

/// RocksDB wrapper for the sealed item store.
///
/// Payloads are sealed before they reach this layer, so RocksDB-level
/// compression is disabled: ciphertext does not compress and the attempt
/// only burns CPU inside the enclave.
pub struct RocksDB {
    db: Arc<DB>,
}

impl RocksDB {
    /// Open database with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_parallelism(path, num_cpus::get())
    }

    /// Open with a caller-imposed cap on background threads.
    pub fn open_with_parallelism(path: impl AsRef<Path>, threads: usize) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_compression_type(rocksdb::DBCompressionType::None);

        db_opts.set_write_buffer_size(32 * 1024 * 1024); // 32MB
        db_opts.set_max_write_buffer_number(3);
        db_opts.set_target_file_size_base(16 * 1024 * 1024); // 16MB
        db_opts.increase_parallelism(threads.clamp(1, num_cpus::get()) as i32);

        let cfs: Vec<ColumnFamilyDescriptor> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cfs)?;

        info!("sealed item store opened");
        Ok(Self { db: Arc::new(db) })
    }

    pub fn get_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf_handle = self.cf_handle(cf)?;
        Ok(self.db.get_cf(&cf_handle, key)?)
    }

    pub fn put_cf(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf_handle = self.cf_handle(cf)?;
        self.db.put_cf(&cf_handle, key, value)?;
        Ok(())
    }

    pub fn delete_cf(&self, cf: &str, key: &[u8]) -> Result<()> {
        let cf_handle = self.cf_handle(cf)?;
        self.db.delete_cf(&cf_handle, key)?;
        Ok(())
    }

    pub fn exists_cf(&self, cf: &str, key: &[u8]) -> Result<bool> {
        Ok(self.get_cf(cf, key)?.is_some())
    }

    /// Write a batch of operations atomically.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch)?;
        Ok(())
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch::default()
    }

    pub fn batch_put_cf(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let cf_handle = self.cf_handle(cf)?;
        batch.put_cf(&cf_handle, key, value);
        Ok(())
    }

    pub fn batch_delete_cf(&self, batch: &mut WriteBatch, cf: &str, key: &[u8]) -> Result<()> {
        let cf_handle = self.cf_handle(cf)?;
        batch.delete_cf(&cf_handle, key);
        Ok(())
    }

    /// Iterate a column family from the start.
    pub fn iter_cf(&self, cf: &str) -> Result<impl Iterator<Item = KvItem> + '_> {
        let cf_handle = self.cf_handle(cf)?;
        Ok(self
            .db
            .iterator_cf(&cf_handle, rocksdb::IteratorMode::Start)
            .filter_map(|r| r.ok()))
    }

    /// Iterate keys sharing a prefix.
    pub fn prefix_iter_cf(
        &self,
        cf: &str,
        prefix: &[u8],
    ) -> Result<impl Iterator<Item = KvItem> + '_> {
        let cf_handle = self.cf_handle(cf)?;
        Ok(self
            .db
            .prefix_iterator_cf(&cf_handle, prefix)
            .filter_map(|r| r.ok()))
    }

    pub fn compact_cf(&self, cf: &str) -> Result<()> {
        let cf_handle = self.cf_handle(cf)?;
        self.db
            .compact_range_cf(&cf_handle, None::<&[u8]>, None::<&[u8]>);
        debug!("compacted column family: {}", cf);
        Ok(())
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow::anyhow!("Column family {} not found", name))
    }

    /// Flush all column families to disk.
    pub fn flush(&self) -> Result<()> {
        for cf_name in all_column_families() {
            if let Ok(cf) = self.cf_handle(cf_name) {
                self.db.flush_cf(&cf)?;
            }
        }
        Ok(())
    }
}

impl Clone for RocksDB {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::column_families::{CF_ITEMS, CF_META};
    use tempfile::TempDir;

    #[test]
    fn test_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let db = RocksDB::open(temp_dir.path()).unwrap();

        db.put_cf(CF_ITEMS, b"key1", b"value1").unwrap();
        assert_eq!(
            db.get_cf(CF_ITEMS, b"key1").unwrap(),
            Some(b"value1".to_vec())
        );

        assert!(db.exists_cf(CF_ITEMS, b"key1").unwrap());
        assert!(!db.exists_cf(CF_ITEMS, b"key2").unwrap());

        db.delete_cf(CF_ITEMS, b"key1").unwrap();
        assert!(!db.exists_cf(CF_ITEMS, b"key1").unwrap());
    }

    #[test]
    fn test_batch_is_atomic_across_families() {
        let temp_dir = TempDir::new().unwrap();
        let db = RocksDB::open(temp_dir.path()).unwrap();

        let mut batch = db.batch();
        db.batch_put_cf(&mut batch, CF_ITEMS, b"a", b"1").unwrap();
        db.batch_put_cf(&mut batch, CF_META, b"a", b"meta").unwrap();
        db.write_batch(batch).unwrap();

        assert_eq!(db.get_cf(CF_ITEMS, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get_cf(CF_META, b"a").unwrap(), Some(b"meta".to_vec()));
    }

    #[test]
    fn test_prefix_iteration() {
        let temp_dir = TempDir::new().unwrap();
        let db = RocksDB::open(temp_dir.path()).unwrap();

        db.put_cf(CF_ITEMS, b"user:1:a", b"x").unwrap();
        db.put_cf(CF_ITEMS, b"user:1:b", b"y").unwrap();
        db.put_cf(CF_ITEMS, b"user:2:a", b"z").unwrap();

        let keys: Vec<_> = db
            .prefix_iter_cf(CF_ITEMS, b"user:1:")
            .unwrap()
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(b"user:1:"))
            .collect();
        assert_eq!(keys.len(), 2);
    }
}
