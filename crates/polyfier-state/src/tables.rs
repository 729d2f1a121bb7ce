//! redb table definitions for the Polyfier state store.
//!
//! Configuration tables map a content hash to its canonical form. The other
//! tables hold JSON-serialized records.

use polyfier_core::ConfigKind;
use redb::TableDefinition;

/// Table of canonical configurations of one kind, keyed by content hash.
pub fn config_table(kind: ConfigKind) -> TableDefinition<'static, u64, &'static str> {
    TableDefinition::new(kind.table_name())
}

/// Profile records keyed by profile content hash.
pub const PROFILES: TableDefinition<u64, &[u8]> = TableDefinition::new("profiles");

/// Orders keyed by `{worker_key}`.
pub const ORDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");

/// Control node history keyed by `{control_key}`.
pub const CONTROL_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("control_nodes");

/// Worker node history keyed by `{worker_key}`.
pub const WORKER_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("worker_nodes");

/// Results keyed by an append-only sequence number.
pub const RESULTS: TableDefinition<u64, &[u8]> = TableDefinition::new("results");
