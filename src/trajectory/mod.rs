//! Trajectory Formatter.
//!
//! Turns whatever a run left behind into one readable trace document:
//! structured session data when an adapter recovered it, otherwise the
//! captured stdout and stderr.

pub mod formatter;
pub mod types;

pub use formatter::{format_trajectory, json_lines, render, RAW_OUTPUT_SOURCE};
pub use types::{TrajectoryDocument, TrajectorySource};
