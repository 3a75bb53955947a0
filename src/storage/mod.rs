//! Readers for structured stores written by agent runs.
//!
//! Agents that persist their sessions in a database are read through a
//! read-only connection opened on the run's own data directory.

pub mod crush_store;

pub use crush_store::{CrushMessage, CrushSession, CrushStore, CrushTotals};
