/// Sealed item records, keyed by the logical string key.
pub const CF_ITEMS: &str = "items";

/// Per-item bookkeeping (sizes, timestamps, access counters).
pub const CF_META: &str = "meta";

pub fn all_column_families() -> Vec<&'static str> {
    vec![CF_ITEMS, CF_META]
}
