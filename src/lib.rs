use duckdb::{Connection, Result};
use duckdb_loadable_macros::duckdb_entrypoint_c_api;
use libduckdb_sys as ffi;
use std::error::Error;

mod config;
mod connstr;
mod driver;
mod error;
mod handler;
mod logging;
mod metadata;
mod planner;
mod pool;
mod registry;
mod savepoint;
mod translator;
mod value;
mod vtab;

pub use config::SessionConfig;
pub use connstr::{parse_connection_string, CatalogServerTable, ConnectionDescriptor, Scheme};
pub use driver::{RemoteDriver, ScanMode, ShardedDriver, StandardDriver};
pub use error::{FedError, FedErrorCode};
pub use handler::{InfoFlags, LockType, ScanRequest, TableHandler};
pub use translator::LockMode;
pub use value::FedValue;
pub use vtab::{
    FedAttachVTab, FedDeleteScalar, FedDetachScalar, FedExecuteScalar, FedInsertScalar,
    FedLookupVTab, FedScanVTab, FedTablesVTab, FedUpdateScalar,
};

/// Extension entrypoint (spec §0: the thin DuckDB integration layer). Every
/// registration here is a `vtab.rs` type standing in for one callable shape
/// of the table handler surface: scan, raw execute, and the discovery/attach
/// path, following `hana/src/lib.rs`'s registration pattern.
#[duckdb_entrypoint_c_api(ext_name = "fedtab", min_duckdb_version = "v1.3.2")]
pub unsafe fn extension_entrypoint(connection: Connection) -> Result<(), Box<dyn Error>> {
    connection.register_table_function::<vtab::FedScanVTab>("fedtab_scan")?;
    connection.register_table_function::<vtab::FedScanVTab>("fedtab_query")?;
    connection.register_table_function::<vtab::FedLookupVTab>("fedtab_lookup")?;

    connection.register_table_function::<vtab::FedAttachVTab>("fedtab_attach")?;
    connection.register_table_function::<vtab::FedTablesVTab>("fedtab_tables")?;

    connection.register_scalar_function::<vtab::FedExecuteScalar>("fedtab_execute")?;
    connection.register_scalar_function::<vtab::FedDetachScalar>("fedtab_detach")?;
    connection.register_scalar_function::<vtab::FedInsertScalar>("fedtab_insert")?;
    connection.register_scalar_function::<vtab::FedUpdateScalar>("fedtab_update")?;
    connection.register_scalar_function::<vtab::FedDeleteScalar>("fedtab_delete")?;

    Ok(())
}
