//! Human-readable rendering of state dumps and topology.

pub mod report;

pub use report::{StateRecord, render_topology};
