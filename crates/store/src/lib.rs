//! Relational store for sessions, the event journal, encrypted secrets, and
//! environment configs.
//!
//! One SQLite connection behind a mutex. Every hub task, API handler, and
//! the reaper go through this store; the mutex serializes statements, and
//! journal appends additionally run in a transaction so the dense-seq
//! invariant survives even if the store ever grows a connection pool.

mod db;
mod environments;
mod journal;
mod secrets;
mod sessions;

pub use db::Store;
pub use journal::EventRow;

pub(crate) use db::{map_db_err, now, parse_ts};
