//! rksd library: cooperative sync-module runtime, PTP timestamp collation
//! and best-instance clock selection.

pub mod adapters;
pub mod bic;
pub mod config;
pub mod domain;
pub mod engine;
mod error;
pub mod fmt;
pub mod runtime;
pub mod stats;
pub mod sync;

pub use bic::{Candidate, Rule, choose, select_instance};
pub use domain::timespec::Timespec;
pub use error::{Result, RksdError};
pub use sync::dataset::TimestampSet;
