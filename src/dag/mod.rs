// src/dag/mod.rs

//! Project dependency ordering.
//!
//! - [`phases`] partitions projects into ordered phases so that every project
//!   runs strictly after all of its dependencies.

pub mod phases;

pub use phases::{Phase, build_phases};
