use crate::config::SessionConfig;
use crate::connstr::ConnectionDescriptor;
use crate::driver::{reconcile_and_send, RemoteDriver, ResultSet, RowRef, ScanMode};
use crate::error::FedError;
use crate::metadata::{MetadataCache, ShardTopology};
use crate::planner::{self, ParsedHint, PartialReadMode, PlanInputs, ScanPlan};
use crate::pool::SessionPool;
use crate::registry::Registry;
use crate::translator::{self, BulkInsertBuilder, InsertPolicy, KeyRange, LockMode};
use crate::value::FedValue;

/// Lock intent the executor passed to `store_lock` (spec §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    ReadNoInsert,
    AllowWrite,
    Write,
}

/// Bit flags behind `info()` (spec §4.G's metadata refresh trigger lives
/// behind this call in the real handler contract).
#[derive(Debug, Clone, Copy, Default)]
pub struct InfoFlags {
    pub row_count: bool,
    pub index_cardinality: bool,
}

/// Cost/selectivity signals the executor supplies ahead of a scan, folded
/// into a `PlanInputs` against the share's cached metadata (spec §4.F).
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub hint: Option<ParsedHint>,
    pub table_forces_partial_read: bool,
    pub estimated_rows: u64,
    pub active_limit: Option<u64>,
    pub join_breadth: u64,
    pub has_equality_predicate: bool,
    pub session_preference: PartialReadMode,
}

impl Default for ScanRequest {
    fn default() -> Self {
        ScanRequest {
            hint: None,
            table_forces_partial_read: false,
            estimated_rows: 0,
            active_limit: None,
            join_breadth: 1,
            has_equality_predicate: false,
            session_preference: PartialReadMode::None,
        }
    }
}

/// One federated table handle (spec §4.H / §3 "Per-handler statement
/// state"). Generalizes `hana_scan.rs`'s `VTab::bind/init/func` lifecycle
/// from a scan-only contract into the full open/rnd_*/index_*/write/
/// update/delete/position contract the spec names.
pub struct TableHandler {
    descriptor: ConnectionDescriptor,
    share_key: Vec<u8>,
    config: SessionConfig,
    pool: SessionPool,
    columns: Vec<String>,
    read_columns: Vec<String>,
    write_set: Vec<(String, FedValue)>,
    active_driver: Option<usize>,
    open_results: Vec<ResultSet>,
    scan_plan: Option<ScanPlan>,
    extra_filter: Option<String>,
    lock_type: LockType,
    ref_length: usize,
    stmt_scope_open: bool,
}

impl TableHandler {
    pub fn new(descriptor: ConnectionDescriptor, columns: Vec<String>, config: SessionConfig) -> Self {
        let share_key = Registry::global().acquire_share(&descriptor);
        let pool = SessionPool::new(&config);
        TableHandler {
            descriptor,
            share_key,
            config,
            pool,
            columns,
            read_columns: Vec::new(),
            write_set: Vec::new(),
            active_driver: None,
            open_results: Vec::new(),
            scan_plan: None,
            extra_filter: None,
            lock_type: LockType::ReadNoInsert,
            ref_length: std::mem::size_of::<RowRef>(),
            stmt_scope_open: false,
        }
    }

    /// `open`: records `ref_length`; the driver itself connects lazily on
    /// first use, per spec §4.A.
    pub fn open(&mut self) -> Result<(), Box<FedError>> {
        self.ref_length = std::mem::size_of::<RowRef>();
        Ok(())
    }

    pub fn ref_length(&self) -> usize {
        self.ref_length
    }

    fn ensure_driver(&mut self) -> Result<usize, Box<FedError>> {
        if let Some(idx) = self.active_driver {
            return Ok(idx);
        }
        let read_only = self.lock_type == LockType::ReadNoInsert;
        let idx = self.pool.acquire_index(&self.descriptor, read_only, self.config.max_retries)?;
        self.active_driver = Some(idx);
        Ok(idx)
    }

    fn driver(&mut self) -> Result<&mut dyn RemoteDriver, Box<FedError>> {
        let idx = self.ensure_driver()?;
        Ok(self.pool.driver_at(idx))
    }

    fn metadata_snapshot(&self) -> MetadataCache {
        Registry::global()
            .with_share_metadata(&self.share_key, |m| m.clone())
            .unwrap_or_default()
    }

    fn wants_transaction_scope(&mut self) -> bool {
        self.lock_type == LockType::Write
            || match self.active_driver {
                Some(idx) => !self.pool.driver_at(idx).actual_autocommit(),
                None => false,
            }
    }

    /// `start_stmt`/`external_lock(F_RDLCK|F_WRLCK)`: begins the statement's
    /// transaction scope *before* any of its reads or writes run. A write
    /// lock, or a driver that isn't already in autocommit mode, opens a
    /// statement-level savepoint unless the session already has an explicit
    /// transaction open. The call site (the vtab layer) invokes this once
    /// per statement, between `store_lock` and the statement's actual work,
    /// mirroring `ha_federatedx.cc`'s `start_stmt`/`external_lock` pair,
    /// which call `txn->stmt_begin()`/`txn->txn_begin()` at lock
    /// acquisition rather than at release.
    pub fn start_stmt(&mut self) -> Result<(), Box<FedError>> {
        self.ensure_driver()?;
        if self.wants_transaction_scope() && !self.pool.is_in_explicit_transaction() {
            self.pool.stmt_begin();
            self.stmt_scope_open = true;
        }
        Ok(())
    }

    /// `rnd_init(scan=true)`: frees any prior result, consults the planner
    /// against the share's cached metadata, emits the initial query, stores
    /// the result handle.
    pub fn rnd_init(&mut self, lock: LockMode, request: ScanRequest) -> Result<(), Box<FedError>> {
        self.free_all_results();
        // `build_select` bakes a lock mode's suffix onto the end of the
        // string it returns; a locked scan landing in a partial-read mode
        // with a range predicate or pushed-down filter needs that suffix
        // held separately so `ScanPlan::current_query` can put the WHERE
        // clause it appends *before* the lock suffix, not after it.
        let base = translator::build_select(
            "t",
            &self.columns,
            if self.read_columns.is_empty() { &self.columns } else { &self.read_columns },
            None,
            LockMode::None,
            !self.read_columns.is_empty(),
        );

        let metadata = self.metadata_snapshot();
        let shards = match &metadata.shard_topology {
            ShardTopology::Shards(v) => v.clone(),
            ShardTopology::Unsupported => Vec::new(),
        };
        let range_column = metadata.range_info.column.clone();
        let boundaries = metadata.range_info.boundaries.clone();

        let inputs = PlanInputs {
            config: &self.config,
            metadata: &metadata,
            hint: request.hint,
            table_forces_partial_read: request.table_forces_partial_read,
            estimated_rows: request.estimated_rows,
            active_limit: request.active_limit,
            join_breadth: request.join_breadth,
            has_equality_predicate: request.has_equality_predicate,
            session_preference: request.session_preference,
        };
        let mode = planner::choose_mode(&inputs);
        let segments = planner::build_segments(mode, &shards, range_column.as_deref(), &boundaries);

        let extra = self.extra_filter.clone();
        let mut plan = ScanPlan::new(segments, &base, lock.suffix());
        self.issue_current_segment(&mut plan, extra.as_deref())?;
        self.scan_plan = Some(plan);
        Ok(())
    }

    fn issue_current_segment(&mut self, plan: &mut ScanPlan, extra_filter: Option<&str>) -> Result<(), Box<FedError>> {
        let (sql, scan_info) = match plan.current_query(extra_filter) {
            Some(pair) => pair,
            None => return Ok(()),
        };
        let driver = self.driver()?;
        driver.query(&sql, ScanMode::Oltp, Some(&scan_info))?;
        let result = driver.store_result()?;
        self.open_results.push(result);
        Ok(())
    }

    /// `rnd_next(buf)`: fetches the next row; on end-of-result with plan
    /// segments remaining, advances transparently (spec §4.F "Scan
    /// execution").
    pub fn rnd_next(&mut self) -> Result<Option<Vec<FedValue>>, Box<FedError>> {
        loop {
            if let Some(result) = self.open_results.last_mut() {
                if let Some(row) = result.fetch_row() {
                    return Ok(Some(row.to_vec()));
                }
            }
            let has_more = match &mut self.scan_plan {
                Some(plan) => plan.advance(),
                None => false,
            };
            if !has_more {
                return Ok(None);
            }
            self.open_results.pop();
            let extra = self.extra_filter.clone();
            let mut plan = self.scan_plan.take().unwrap();
            self.issue_current_segment(&mut plan, extra.as_deref())?;
            self.scan_plan = Some(plan);
        }
    }

    pub fn rnd_end(&mut self) {
        self.free_all_results();
        self.scan_plan = None;
    }

    /// `index_init`: opens an indexed access using `range` as the key
    /// bounds (spec §4.H). The result is tracked in `open_results` the same
    /// way a scan segment's result is, so `index_end`/`rnd_end` free it
    /// uniformly.
    pub fn index_init(&mut self, range: &KeyRange) -> Result<(), Box<FedError>> {
        let where_body = translator::where_from_key_range(range, self.extra_filter.as_deref());
        let sql = translator::build_select(
            "t",
            &self.columns,
            if self.read_columns.is_empty() { &self.columns } else { &self.read_columns },
            where_body.as_deref(),
            LockMode::None,
            !self.read_columns.is_empty(),
        );
        let driver = self.driver()?;
        driver.query(&sql, ScanMode::Oltp, None)?;
        let result = driver.store_result()?;
        self.open_results.push(result);
        Ok(())
    }

    /// `index_next`: fetches the next row from the result `index_init` (or
    /// `read_range_first`) opened.
    pub fn index_next(&mut self) -> Result<Option<Vec<FedValue>>, Box<FedError>> {
        match self.open_results.last_mut() {
            Some(result) => Ok(result.fetch_row().map(|r| r.to_vec())),
            None => Ok(None),
        }
    }

    /// `index_end`: frees the result `index_init` opened.
    pub fn index_end(&mut self) {
        self.open_results.pop();
    }

    /// `index_read_*`: builds a WHERE from the key range, executes, returns
    /// the first matching row. A thin convenience wrapper around
    /// `index_init`/`index_next` for callers that want a single equality
    /// lookup without managing the cursor themselves.
    pub fn index_read(&mut self, range: &KeyRange) -> Result<Option<Vec<FedValue>>, Box<FedError>> {
        self.index_init(range)?;
        self.index_next()
    }

    /// `read_range_first`/`read_range_next`: the range-scan counterpart of
    /// `index_init`/`index_next` (spec §4.H), sharing the same `KeyRange`
    /// machinery — `KeyRange::from_records_in_range` is what drives
    /// `translator::where_from_key_range` to render `>=`/`<=` boundary
    /// comparisons instead of strict equality.
    pub fn read_range_first(&mut self, range: &KeyRange) -> Result<Option<Vec<FedValue>>, Box<FedError>> {
        self.index_init(range)?;
        self.index_next()
    }

    pub fn read_range_next(&mut self) -> Result<Option<Vec<FedValue>>, Box<FedError>> {
        self.index_next()
    }

    /// `position(row)`: records the current result handle and cursor.
    pub fn position(&self) -> Option<RowRef> {
        self.open_results.last().map(|r| r.mark_position())
    }

    /// `rnd_pos(ref)`: asks the driver to seek.
    pub fn rnd_pos(&mut self, pos: RowRef) -> Result<Option<Vec<FedValue>>, Box<FedError>> {
        let result = self
            .open_results
            .iter_mut()
            .find(|r| r.id == pos.result_id)
            .ok_or_else(FedError::end_of_file)?;
        result.seek_position(pos)?;
        Ok(result.fetch_row().map(|r| r.to_vec()))
    }

    fn free_all_results(&mut self) {
        self.open_results.clear();
    }

    pub fn set_write_set(&mut self, write_set: Vec<(String, FedValue)>) {
        self.write_set = write_set;
    }

    pub fn set_read_columns(&mut self, columns: Vec<String>) {
        self.read_columns = columns;
    }

    pub fn set_extra_filter(&mut self, filter: Option<String>) {
        self.extra_filter = filter;
    }

    fn note_write(&self) {
        Registry::global().with_share_metadata(&self.share_key, |m| m.note_change());
    }

    /// `write_row`: participates in the bulk window if one was declared by
    /// `start_bulk_insert`; otherwise sends a single-row INSERT immediately.
    pub fn write_row(&mut self, values: &[FedValue], bulk: Option<&mut BulkInsertBuilder>) -> Result<(), Box<FedError>> {
        match bulk {
            Some(builder) => {
                builder.push_row(values);
            }
            None => {
                let max_query_size = self.driver()?.max_query_size();
                let mut builder = BulkInsertBuilder::new("t", &self.columns, InsertPolicy::Plain, max_query_size, 1);
                builder.push_row(values);
                let statements = builder.finish();
                let driver = self.driver()?;
                for sql in &statements {
                    reconcile_and_send(driver, sql, false)?;
                }
            }
        }
        self.note_write();
        Ok(())
    }

    pub fn start_bulk_insert(&self) -> BulkInsertBuilder {
        BulkInsertBuilder::new("t", &self.columns, InsertPolicy::Plain, 16 * 1024 * 1024, self.config.bulk_batch_size)
    }

    pub fn end_bulk_insert(&mut self, builder: BulkInsertBuilder) -> Result<(), Box<FedError>> {
        let statements = builder.finish();
        let driver = self.driver()?;
        for sql in &statements {
            reconcile_and_send(driver, sql, false)?;
        }
        self.note_write();
        Ok(())
    }

    /// `update_row`: decomposes into DELETE+INSERT when the write touches a
    /// vindex column; a delete that touched more than one row fails with
    /// `FOUND_DUPP_UNIQUE` before the insert is attempted (spec §4.E).
    pub fn update_row(
        &mut self,
        old_key_condition: &str,
        has_primary_key: bool,
        touches_vindex_column: bool,
        old_image: &[(String, FedValue)],
    ) -> Result<(), Box<FedError>> {
        if touches_vindex_column {
            let decomposed = translator::build_decomposed_update("t", old_image, &self.write_set, old_key_condition);
            let driver = self.driver()?;
            reconcile_and_send(driver, &decomposed.delete, false)?;
            if driver.affected_rows() > 1 {
                return Err(FedError::duplicate_unique(
                    "update touching a sharding column deleted more than one remote row",
                ));
            }
            reconcile_and_send(driver, &decomposed.insert, false)?;
        } else {
            let sql = translator::build_update("t", &self.write_set, old_key_condition, has_primary_key, false, false)
                .expect("build_update only returns None when touches_vindex_column is set");
            reconcile_and_send(self.driver()?, &sql, false)?;
        }
        self.note_write();
        Ok(())
    }

    /// `delete_row`.
    pub fn delete_row(&mut self, row_condition: &str, has_primary_key_condition: bool, pushed_limit: Option<u64>) -> Result<(), Box<FedError>> {
        let sql = translator::build_delete("t", row_condition, has_primary_key_condition, pushed_limit, self.config.limit_expand_factor);
        reconcile_and_send(self.driver()?, &sql, false)?;
        self.note_write();
        Ok(())
    }

    /// `store_lock`: downgrades write locks to allow-write and
    /// read-no-insert to plain read outside explicit LOCK TABLES.
    pub fn store_lock(&mut self, requested: LockType, in_explicit_lock_tables: bool) -> LockType {
        self.lock_type = if in_explicit_lock_tables {
            requested
        } else {
            match requested {
                LockType::Write => LockType::AllowWrite,
                other => other,
            }
        };
        self.lock_type
    }

    /// `external_lock(F_UNLCK)`: releases the driver back to the pool.
    /// Only *finalizes* a statement-level savepoint scope that `start_stmt`
    /// opened for this statement — it never begins one itself. An explicit
    /// transaction's own scope is left open here for the eventual real
    /// commit/rollback, matching the original's `external_lock(F_UNLCK)`,
    /// which calls only `txn->release(&io)` and never `stmt_begin`.
    pub fn external_unlock(&mut self) -> Result<(), Box<FedError>> {
        if self.stmt_scope_open {
            self.pool.stmt_commit()?;
            self.stmt_scope_open = false;
        }

        if let Some(idx) = self.active_driver.take() {
            self.pool.release(idx);
        }
        Ok(())
    }

    /// `info(flags)`: refresh trigger for the metadata cache (spec §4.G).
    pub fn info(&mut self, flags: InfoFlags, now_epoch_secs: u64) -> Result<(), Box<FedError>> {
        if !flags.row_count && !flags.index_cardinality {
            return Ok(());
        }
        let ttl = self.config.metadata_ttl_secs;
        let delta = self.config.metadata_delta_threshold;
        let stale = Registry::global()
            .with_share_metadata(&self.share_key, |m| m.is_stale(now_epoch_secs, ttl, delta))
            .unwrap_or(true);
        if !stale {
            return Ok(());
        }
        let table = self.descriptor.table.clone();
        let database = self.descriptor.database.clone();
        let mut cache = self.metadata_snapshot();
        let driver = self.driver()?;
        crate::metadata::refresh_all(driver, &database, &table, &mut cache, now_epoch_secs);
        Registry::global().with_share_metadata(&self.share_key, |m| *m = cache);
        Ok(())
    }

    pub fn close(mut self) {
        self.free_all_results();
        if let Some(idx) = self.active_driver.take() {
            self.pool.release(idx);
        }
        Registry::global().release_share(&self.share_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connstr::{parse_connection_string, CatalogServerTable};

    fn descriptor() -> ConnectionDescriptor {
        parse_connection_string("standard://u:p@h:1/db/t", &CatalogServerTable::new()).unwrap()
    }

    fn handler() -> TableHandler {
        TableHandler::new(descriptor(), vec!["id".into()], SessionConfig::for_testing())
    }

    #[test]
    fn open_sets_ref_length_to_row_ref_size() {
        let mut h = handler();
        h.open().unwrap();
        assert_eq!(h.ref_length(), std::mem::size_of::<RowRef>());
        h.close();
    }

    #[test]
    fn store_lock_downgrades_write_to_allow_write_outside_explicit_lock() {
        let mut h = handler();
        let granted = h.store_lock(LockType::Write, false);
        assert_eq!(granted, LockType::AllowWrite);
        h.close();
    }

    #[test]
    fn store_lock_honors_explicit_lock_tables_request() {
        let mut h = handler();
        let granted = h.store_lock(LockType::Write, true);
        assert_eq!(granted, LockType::Write);
        h.close();
    }

    #[test]
    fn position_is_none_before_any_result_is_open() {
        let h = handler();
        assert!(h.position().is_none());
    }

    #[test]
    fn rnd_pos_on_unknown_result_id_is_end_of_file() {
        let mut h = handler();
        let err = h.rnd_pos(RowRef { result_id: 999, cursor: 0 }).unwrap_err();
        assert_eq!(err.code(), crate::error::FedErrorCode::EndOfFile);
        h.close();
    }

    #[test]
    fn start_stmt_then_external_unlock_brackets_a_write_lock_statement() {
        let mut h = handler();
        h.store_lock(LockType::Write, true);
        h.start_stmt().unwrap();
        assert!(h.stmt_scope_open);
        h.external_unlock().unwrap();
        assert!(!h.stmt_scope_open);
    }

    #[test]
    fn start_stmt_is_a_noop_for_a_plain_read_lock() {
        let mut h = handler();
        h.store_lock(LockType::ReadNoInsert, false);
        h.start_stmt().unwrap();
        assert!(!h.stmt_scope_open);
        h.external_unlock().unwrap();
    }

    #[test]
    fn index_next_with_no_open_result_returns_none() {
        let mut h = handler();
        assert!(h.index_next().unwrap().is_none());
        h.close();
    }

    #[test]
    fn info_is_a_noop_when_no_flags_are_requested() {
        let mut h = handler();
        h.info(InfoFlags::default(), 1000).unwrap();
        h.close();
    }
}
