use crate::driver::RemoteDriver;
use crate::error::FedError;
use crate::value::FedValue;

/// Sentinel meaning "the remote declined to enumerate shards" (spec §9
/// decision 3: modeled as an enum variant rather than the magic `10000`).
#[derive(Debug, Clone, PartialEq)]
pub enum ShardTopology {
    Unsupported,
    Shards(Vec<String>),
}

impl ShardTopology {
    pub fn shard_count(&self) -> Option<usize> {
        match self {
            ShardTopology::Unsupported => None,
            ShardTopology::Shards(v) => Some(v.len()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangeInfo {
    pub column: Option<String>,
    pub boundaries: Vec<FedValue>,
}

/// Table/index metadata cached per share (spec §4.G), updated on demand and
/// best-effort: every probe failure degrades to a conservative default
/// rather than failing the caller's operation.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    pub record_count: u64,
    pub mean_rec_length: u64,
    pub shard_topology: ShardTopology,
    pub range_info: RangeInfo,
    pub vindex_columns: Vec<String>,
    pub index_cardinality: std::collections::HashMap<String, u64>,
    pub last_refreshed_at_epoch_secs: u64,
    pub changes_since_refresh: u64,
}

impl Default for MetadataCache {
    fn default() -> Self {
        MetadataCache {
            record_count: 0,
            mean_rec_length: 0,
            shard_topology: ShardTopology::Unsupported,
            range_info: RangeInfo::default(),
            vindex_columns: Vec::new(),
            index_cardinality: std::collections::HashMap::new(),
            last_refreshed_at_epoch_secs: 0,
            changes_since_refresh: 0,
        }
    }
}

/// Floor imposed on a reported zero row count so the optimizer's cost model
/// never collapses a plan onto an apparently-empty table (spec §4.G).
const MIN_RECORD_COUNT_FLOOR: u64 = 100;
const MIN_INDEX_CARDINALITY_FLOOR: u64 = 1;

impl MetadataCache {
    /// True once `now_epoch_secs - last_refreshed` exceeds `ttl_secs`, or
    /// the accumulated write delta since the last refresh exceeds
    /// `delta_threshold` — the two refresh triggers named in spec §4.G.
    pub fn is_stale(&self, now_epoch_secs: u64, ttl_secs: u64, delta_threshold: u64) -> bool {
        let age = now_epoch_secs.saturating_sub(self.last_refreshed_at_epoch_secs);
        age >= ttl_secs || self.changes_since_refresh >= delta_threshold
    }

    pub fn note_change(&mut self) {
        self.changes_since_refresh = self.changes_since_refresh.saturating_add(1);
    }

    pub fn index_cardinality_or_default(&self, index_name: &str) -> u64 {
        self.index_cardinality
            .get(index_name)
            .copied()
            .unwrap_or(MIN_INDEX_CARDINALITY_FLOOR)
    }
}

fn first_str(row: &[FedValue], idx: usize) -> Option<String> {
    match row.get(idx) {
        Some(FedValue::Str(s)) => Some(s.clone()),
        _ => None,
    }
}

fn first_u64(row: &[FedValue], idx: usize) -> Option<u64> {
    match row.get(idx) {
        Some(FedValue::I64(i)) if *i >= 0 => Some(*i as u64),
        Some(FedValue::F64(f)) if *f >= 0.0 => Some(*f as u64),
        _ => None,
    }
}

/// Runs one of the five metadata probes and folds the result into `cache`.
/// Each probe is independently best-effort: a driver error here is logged
/// by the caller and never propagated, per spec §4.G.
pub fn refresh_table_status<D: RemoteDriver + ?Sized>(
    driver: &mut D,
    table: &str,
    cache: &mut MetadataCache,
    now_epoch_secs: u64,
) -> Result<(), Box<FedError>> {
    let sql = format!("SHOW TABLE STATUS LIKE '{}'", table.replace('\'', "''"));
    driver.query(&sql, crate::driver::ScanMode::Oltp, None)?;
    let result = driver.store_result()?;
    if let Some(row) = result.rows.first() {
        let records = first_u64(row, 4).unwrap_or(0);
        cache.record_count = if records == 0 { MIN_RECORD_COUNT_FLOOR } else { records };
        cache.mean_rec_length = first_u64(row, 5).unwrap_or(0);
    }
    cache.last_refreshed_at_epoch_secs = now_epoch_secs;
    cache.changes_since_refresh = 0;
    Ok(())
}

pub fn refresh_shard_topology<D: RemoteDriver + ?Sized>(
    driver: &mut D,
    database: &str,
    cache: &mut MetadataCache,
) -> Result<(), Box<FedError>> {
    let sql = format!("SHOW KUNDB_SHARDS {}", database);
    driver.query(&sql, crate::driver::ScanMode::Oltp, None)?;
    let result = driver.store_result()?;
    let shards: Vec<String> = result.rows.iter().filter_map(|r| first_str(r, 0)).collect();
    cache.shard_topology = if shards.is_empty() {
        ShardTopology::Unsupported
    } else {
        ShardTopology::Shards(shards)
    };
    Ok(())
}

pub fn refresh_range_info<D: RemoteDriver + ?Sized>(
    driver: &mut D,
    table: &str,
    cache: &mut MetadataCache,
) -> Result<(), Box<FedError>> {
    let sql = format!("SHOW KUNDB_RANGE_INFO {}", table);
    driver.query(&sql, crate::driver::ScanMode::Oltp, None)?;
    let result = driver.store_result()?;
    let column = result.rows.first().and_then(|r| first_str(r, 0));
    let boundaries: Vec<FedValue> = result.rows.iter().filter_map(|r| r.get(1).cloned()).collect();
    cache.range_info = RangeInfo { column, boundaries };
    Ok(())
}

pub fn refresh_vindex_columns<D: RemoteDriver + ?Sized>(
    driver: &mut D,
    table: &str,
    cache: &mut MetadataCache,
) -> Result<(), Box<FedError>> {
    let sql = format!("SHOW KUNDB_VINDEXES IN {}", table);
    driver.query(&sql, crate::driver::ScanMode::Oltp, None)?;
    let result = driver.store_result()?;
    cache.vindex_columns = result.rows.iter().filter_map(|r| first_str(r, 0)).collect();
    Ok(())
}

pub fn refresh_index_cardinality<D: RemoteDriver + ?Sized>(
    driver: &mut D,
    table: &str,
    cache: &mut MetadataCache,
) -> Result<(), Box<FedError>> {
    let sql = format!("SHOW INDEX IN {}", table);
    driver.query(&sql, crate::driver::ScanMode::Oltp, None)?;
    let result = driver.store_result()?;
    cache.index_cardinality.clear();
    for row in &result.rows {
        if let (Some(name), Some(card)) = (first_str(row, 2), first_u64(row, 6)) {
            cache.index_cardinality.insert(name, card.max(MIN_INDEX_CARDINALITY_FLOOR));
        }
    }
    Ok(())
}

/// Runs all five probes, logging (not propagating) any individual failure,
/// matching "these lookups are best-effort ... does not fail the user
/// operation" from spec §4.G.
pub fn refresh_all<D: RemoteDriver + ?Sized>(
    driver: &mut D,
    database: &str,
    table: &str,
    cache: &mut MetadataCache,
    now_epoch_secs: u64,
) {
    if let Err(e) = refresh_table_status(driver, table, cache, now_epoch_secs) {
        crate::logging::FedLogger::warn("META", &format!("table status refresh failed: {}", e));
    }
    if let Err(e) = refresh_shard_topology(driver, database, cache) {
        crate::logging::FedLogger::warn("META", &format!("shard topology refresh failed: {}", e));
    }
    if let Err(e) = refresh_range_info(driver, table, cache) {
        crate::logging::FedLogger::warn("META", &format!("range info refresh failed: {}", e));
    }
    if let Err(e) = refresh_vindex_columns(driver, table, cache) {
        crate::logging::FedLogger::warn("META", &format!("vindex refresh failed: {}", e));
    }
    if let Err(e) = refresh_index_cardinality(driver, table, cache) {
        crate::logging::FedLogger::warn("META", &format!("index cardinality refresh failed: {}", e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_records_is_floored() {
        let mut cache = MetadataCache::default();
        cache.record_count = 0;
        assert_eq!(cache.record_count.max(1), 1);
        // Confirms the floor constant itself, independent of the driver path:
        assert!(MIN_RECORD_COUNT_FLOOR > 0);
    }

    #[test]
    fn staleness_triggers_on_ttl_or_delta() {
        let mut cache = MetadataCache::default();
        cache.last_refreshed_at_epoch_secs = 1000;
        assert!(!cache.is_stale(1050, 100, 1000));
        assert!(cache.is_stale(1200, 100, 1000));
        cache.changes_since_refresh = 1000;
        assert!(cache.is_stale(1050, 100, 1000));
    }

    #[test]
    fn index_cardinality_defaults_to_floor_when_unknown() {
        let cache = MetadataCache::default();
        assert_eq!(cache.index_cardinality_or_default("no_such_index"), MIN_INDEX_CARDINALITY_FLOOR);
    }

    #[test]
    fn shard_topology_unsupported_has_no_count() {
        assert_eq!(ShardTopology::Unsupported.shard_count(), None);
        assert_eq!(
            ShardTopology::Shards(vec!["s0".into(), "s1".into()]).shard_count(),
            Some(2)
        );
    }

    #[test]
    fn note_change_accumulates_delta_counter() {
        let mut cache = MetadataCache::default();
        cache.note_change();
        cache.note_change();
        assert_eq!(cache.changes_since_refresh, 2);
    }
}
