//! ci-medic library crate
//!
//! Diagnoses CI failure logs, plans fixes for the auto-fixable findings and
//! applies them to a repository with checkpoint and rollback. The CLI in
//! `main.rs` is a thin wrapper; benchmarks and integration tests drive these
//! modules directly.

pub mod artifacts;
pub mod config;
pub mod diagnose;
pub mod exec;
pub mod input;
pub mod model;
pub mod patterns;
pub mod planner;
pub mod publish;
pub mod util;
