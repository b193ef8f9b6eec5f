//! # vigil-common
//!
//! Shared foundation for the Vigil application supervisor:
//! - **Errors**: the workspace-wide [`error::VigilError`] enum.
//! - **Types**: fault classifications, watchdog actions, lifecycle states,
//!   and scheduling-priority parsing.
//! - **Constants**: filesystem paths, list capacities, fault-limit
//!   intervals, and compiled-in resource-limit defaults.
//! - **Configuration**: the read-only [`config::ConfigStore`] interface and
//!   its in-memory YAML-backed implementation.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
