//! Database control client seam.
//!
//! The engine never talks to the database directly; an implementation of
//! [`ClusterController`] is injected by the caller. Positions are exchanged
//! as 24-character WAL segment names (the database can render an LSN as a
//! segment name natively).

use std::collections::BTreeMap;

use crate::utils::errors::Result;

pub trait ClusterController: Send {
    /// Put the cluster into backup mode. Returns the WAL segment name of the
    /// backup start position.
    fn backup_start(&mut self, label: &str, fast: bool) -> Result<String>;

    /// Take the cluster out of backup mode. Returns the WAL segment name of
    /// the backup stop position.
    fn backup_stop(&mut self) -> Result<String>;

    /// Map of tablespace oid to tablespace name.
    fn tablespace_map(&mut self) -> Result<BTreeMap<String, String>>;

    /// Numeric database version, e.g. `9.2`.
    fn version(&mut self) -> Result<f64>;
}
