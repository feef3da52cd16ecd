//! Background maintenance: expired-item sweep and compaction advisories.

use crate::db::{CF_ITEMS, CF_META};
use crate::engine::{backend, now_secs, SealedStore};
use crate::record::StorageRecord;
use crate::types::StorageError;
use tracing::info;

/// Stored-to-plaintext size ratio above which compaction is advised.
/// Encryption and record framing inflate small items, so a modest
/// overshoot is normal and not worth a compaction pass.
const COMPACTION_RATIO_THRESHOLD: f64 = 1.5;

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub expired_removed: u64,
    pub compacted: bool,
}

impl SealedStore {
    /// Remove items whose TTL has elapsed, then compact the backing store
    /// when the fragmentation ratio warrants it.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, StorageError> {
        let mut report = MaintenanceReport::default();
        let now = now_secs();

        let mut expired = Vec::new();
        for (k, v) in self.db.iter_cf(CF_ITEMS).map_err(backend)? {
            if StorageRecord::decode(&v)?.is_expired(now) {
                expired.push(k.to_vec());
            }
        }

        for key_bytes in expired {
            let mut batch = self.db.batch();
            self.db
                .batch_delete_cf(&mut batch, CF_ITEMS, &key_bytes)
                .map_err(backend)?;
            self.db
                .batch_delete_cf(&mut batch, CF_META, &key_bytes)
                .map_err(backend)?;
            self.db.write_batch(batch).map_err(backend)?;
            if let Ok(key) = std::str::from_utf8(&key_bytes) {
                self.cache.invalidate(key);
            }
            report.expired_removed += 1;
        }

        let stats = self.stats()?;
        if stats.fragmentation_ratio > COMPACTION_RATIO_THRESHOLD || report.expired_removed > 0 {
            self.db.compact_cf(CF_ITEMS).map_err(backend)?;
            self.db.compact_cf(CF_META).map_err(backend)?;
            report.compacted = true;
        }

        info!(
            expired = report.expired_removed,
            compacted = report.compacted,
            "maintenance pass complete"
        );
        Ok(report)
    }
}
