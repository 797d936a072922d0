//! Core types and traits for the segmentation job orchestrator.
//!
//! The job record and its state machine live here together with the narrow
//! persistence and storage interfaces every other crate is written against.

mod config;
mod job;
mod metric;
mod traits;

pub use config::*;
pub use job::*;
pub use metric::*;
pub use traits::*;
