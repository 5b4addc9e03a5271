// src/config/mod.rs

//! Configuration loading and validation for testherd.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate basic invariants like dependency references (`validate.rs`).
//!
//! Cycle detection is deliberately left to [`crate::dag::build_phases`] so
//! that a cyclic configuration fails at scheduling time with a dedicated
//! error.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    ConfigFile, FixtureConfig, ProjectConfig, RawConfigFile, RunSection, default_test_match,
};
