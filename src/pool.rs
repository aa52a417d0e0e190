use crate::config::SessionConfig;
use crate::connstr::ConnectionDescriptor;
use crate::driver::{RemoteDriver, ShardedDriver, StandardDriver};
use crate::error::FedError;
use crate::registry::{Registry, ShareEntry};
use std::collections::HashMap;

/// Share identity the pool keys idle drivers by: "server" in spec §4.C
/// terms is really "server + database", since one session may hold
/// connections open to more than one remote table served by the same host.
pub type ShareKey = Vec<u8>;

enum AnyDriver {
    Standard(StandardDriver),
    Sharded(ShardedDriver),
}

impl AnyDriver {
    fn as_trait_mut(&mut self) -> &mut dyn RemoteDriver {
        match self {
            AnyDriver::Standard(d) => d,
            AnyDriver::Sharded(d) => d,
        }
    }

    fn build(descriptor: &ConnectionDescriptor, max_retries: u32) -> Self {
        match descriptor.scheme.as_str() {
            "sharded" | "hdbsqls" => AnyDriver::Sharded(ShardedDriver::new(
                vec![("default".to_string(), descriptor.clone())],
                max_retries,
            )),
            _ => AnyDriver::Standard(StandardDriver::new(descriptor.clone(), max_retries)),
        }
    }
}

struct PooledDriver {
    share_key: ShareKey,
    server_key: Vec<u8>,
    driver: AnyDriver,
    idle: bool,
}

/// Per-session connection pool and transaction context (spec §4.C). A
/// session is single-threaded, so acquisition never blocks within it; the
/// only thing that needs serializing across sessions is the process-wide
/// server registry, which `Registry` already guards with its own mutex.
pub struct SessionPool {
    drivers: Vec<PooledDriver>,
    max_drivers_per_share: usize,
    savepoint_level: u64,
    in_explicit_transaction: bool,
}

/// Borrowed handle the caller uses after `acquire` to reach the driver.
pub struct DriverHandle<'a> {
    pool: &'a mut SessionPool,
    index: usize,
}

impl<'a> DriverHandle<'a> {
    pub fn driver(&mut self) -> &mut dyn RemoteDriver {
        self.pool.drivers[self.index].driver.as_trait_mut()
    }
}

impl SessionPool {
    pub fn new(config: &SessionConfig) -> Self {
        SessionPool {
            drivers: Vec::new(),
            max_drivers_per_share: config.max_retries.max(1) as usize * 4,
            savepoint_level: 0,
            in_explicit_transaction: false,
        }
    }

    /// Acquires a driver for `descriptor`'s share, registering the share in
    /// the process-wide registry on first use (spec §4.C/§4.D). Prefers an
    /// idle driver already open for the same share; otherwise builds one,
    /// scheme-dispatched between `standard` and `sharded`.
    pub fn acquire(
        &mut self,
        descriptor: &ConnectionDescriptor,
        _read_only: bool,
        max_retries: u32,
    ) -> Result<DriverHandle<'_>, Box<FedError>> {
        let share_key = Registry::global().acquire_share(descriptor);
        let server_key = Registry::global().acquire_server(descriptor);

        if let Some(idx) = self
            .drivers
            .iter()
            .position(|d| d.share_key == share_key && d.idle)
        {
            self.drivers[idx].idle = false;
            Registry::global().release_share(&share_key);
            Registry::global().release_server(&server_key);
            return Ok(DriverHandle { pool: self, index: idx });
        }

        let per_share = self.drivers.iter().filter(|d| d.share_key == share_key).count();
        if per_share >= self.max_drivers_per_share {
            Registry::global().release_share(&share_key);
            Registry::global().release_server(&server_key);
            return Err(FedError::connect_failed(
                "connection pool exhausted for this share",
                None,
                None,
            ));
        }

        let driver = AnyDriver::build(descriptor, max_retries);
        self.drivers.push(PooledDriver {
            share_key: share_key.clone(),
            server_key: server_key.clone(),
            driver,
            idle: false,
        });
        let index = self.drivers.len() - 1;
        Ok(DriverHandle { pool: self, index })
    }

    /// Marks a driver idle and returns it to the pool without dropping the
    /// underlying connection; a subsequent `acquire` for the same share
    /// reuses it.
    pub fn release(&mut self, index: usize) {
        if let Some(d) = self.drivers.get_mut(index) {
            d.idle = true;
        }
    }

    /// Drops every driver that belongs to `share_key`, releasing the
    /// matching registry ref counts — used when a table is detached.
    pub fn evict_share(&mut self, share_key: &[u8]) {
        let mut i = 0;
        while i < self.drivers.len() {
            if self.drivers[i].share_key == share_key {
                let entry = self.drivers.remove(i);
                Registry::global().release_share(&entry.share_key);
                Registry::global().release_server(&entry.server_key);
            } else {
                i += 1;
            }
        }
    }

    fn active_indices(&self) -> Vec<usize> {
        self.drivers
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.idle)
            .map(|(i, _)| i)
            .collect()
    }

    /// Begins a new statement scope: bumps the per-session savepoint level
    /// counter and pushes it onto every currently-active driver's savepoint
    /// stack (spec §4.C: "nested savepoints from the executor map to higher
    /// levels").
    pub fn stmt_begin(&mut self) -> u64 {
        self.savepoint_level += 1;
        let level = self.savepoint_level;
        for idx in self.active_indices() {
            self.drivers[idx].driver.as_trait_mut().savepoints().set(level);
        }
        level
    }

    pub fn stmt_commit(&mut self) -> Result<(), Box<FedError>> {
        let level = self.savepoint_level;
        for idx in self.active_indices() {
            let driver = self.drivers[idx].driver.as_trait_mut();
            if let Some(action) = driver.savepoints().release(level) {
                driver.send_raw(&action.to_sql())?;
            }
        }
        Ok(())
    }

    pub fn stmt_rollback(&mut self) -> Result<(), Box<FedError>> {
        let level = self.savepoint_level.saturating_sub(1);
        for idx in self.active_indices() {
            let driver = self.drivers[idx].driver.as_trait_mut();
            if let Some(action) = driver.savepoints().rollback(level) {
                driver.send_raw(&action.to_sql())?;
            }
        }
        Ok(())
    }

    pub fn txn_begin(&mut self) {
        self.in_explicit_transaction = true;
        self.savepoint_level = 0;
    }

    pub fn txn_commit(&mut self) -> Result<(), Box<FedError>> {
        for idx in self.active_indices() {
            let driver = self.drivers[idx].driver.as_trait_mut();
            driver.commit()?;
        }
        self.in_explicit_transaction = false;
        self.savepoint_level = 0;
        Ok(())
    }

    pub fn txn_rollback(&mut self) -> Result<(), Box<FedError>> {
        let mut first_err = None;
        for idx in self.active_indices() {
            let driver = self.drivers[idx].driver.as_trait_mut();
            if let Err(e) = driver.rollback() {
                // A rollback on a dead socket is a warning, not fatal to the
                // whole loop: spec §4.H "rollback on a connection whose
                // socket is gone -> not-complete-rollback warning".
                crate::logging::FedLogger::warn("POOL", &e.to_string());
                first_err.get_or_insert(e);
            }
        }
        self.in_explicit_transaction = false;
        self.savepoint_level = 0;
        match first_err {
            Some(e) if e.code() != crate::error::FedErrorCode::WarningNotCompleteRollback => Err(e),
            _ => Ok(()),
        }
    }

    pub fn is_in_explicit_transaction(&self) -> bool {
        self.in_explicit_transaction
    }

    pub fn savepoint_level(&self) -> u64 {
        self.savepoint_level
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    /// Acquires a driver and returns its slot index directly, for callers
    /// (the handler surface) that hold the index across several method
    /// calls instead of a single borrowed `DriverHandle`.
    pub fn acquire_index(
        &mut self,
        descriptor: &ConnectionDescriptor,
        read_only: bool,
        max_retries: u32,
    ) -> Result<usize, Box<FedError>> {
        Ok(self.acquire(descriptor, read_only, max_retries)?.index)
    }

    pub fn driver_at(&mut self, index: usize) -> &mut dyn RemoteDriver {
        self.drivers[index].driver.as_trait_mut()
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        SessionPool::new(&SessionConfig::for_testing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connstr::{parse_connection_string, CatalogServerTable};

    fn descriptor(url: &str) -> ConnectionDescriptor {
        parse_connection_string(url, &CatalogServerTable::new()).unwrap()
    }

    #[test]
    fn acquire_then_release_reuses_the_same_driver_slot() {
        let mut pool = SessionPool::default();
        let d = descriptor("standard://u:p@h1:1/db/t");
        let idx = {
            let handle = pool.acquire(&d, false, 3).unwrap();
            handle.index
        };
        pool.release(idx);
        assert_eq!(pool.driver_count(), 1);
        let idx2 = {
            let handle = pool.acquire(&d, false, 3).unwrap();
            handle.index
        };
        assert_eq!(idx, idx2, "idle driver for the same share should be reused");
    }

    #[test]
    fn acquire_for_distinct_shares_creates_distinct_drivers() {
        let mut pool = SessionPool::default();
        let d1 = descriptor("standard://u:p@h1:1/db/t1");
        let d2 = descriptor("standard://u:p@h1:1/db/t2");
        let _h1 = pool.acquire(&d1, false, 3).unwrap();
        let _h2 = pool.acquire(&d2, false, 3).unwrap();
        assert_eq!(pool.driver_count(), 2);
    }

    #[test]
    fn stmt_begin_bumps_level_and_pushes_onto_active_drivers() {
        let mut pool = SessionPool::default();
        let d = descriptor("standard://u:p@h1:1/db/t");
        let _handle = pool.acquire(&d, false, 3).unwrap();
        let level = pool.stmt_begin();
        assert_eq!(level, 1);
        assert_eq!(pool.drivers[0].driver.as_trait_mut().savepoints().last(), 1);
    }

    #[test]
    fn nested_stmt_begin_maps_to_strictly_higher_levels() {
        let mut pool = SessionPool::default();
        let d = descriptor("standard://u:p@h1:1/db/t");
        let _handle = pool.acquire(&d, false, 3).unwrap();
        let l1 = pool.stmt_begin();
        let l2 = pool.stmt_begin();
        assert!(l2 > l1);
    }

    #[test]
    fn txn_begin_resets_statement_savepoint_counter() {
        let mut pool = SessionPool::default();
        pool.stmt_begin();
        pool.stmt_begin();
        pool.txn_begin();
        assert!(pool.is_in_explicit_transaction());
        assert_eq!(pool.savepoint_level(), 0);
    }

    #[test]
    fn evict_share_removes_matching_drivers_and_releases_registry_refs() {
        let mut pool = SessionPool::default();
        let d = descriptor("standard://u:p@h9:1/db/t");
        let share_key = {
            let handle = pool.acquire(&d, false, 3).unwrap();
            handle.pool.drivers[handle.index].share_key.clone()
        };
        pool.evict_share(&share_key);
        assert_eq!(pool.driver_count(), 0);
    }
}
