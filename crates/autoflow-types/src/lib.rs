//! Shared domain types for Autoflow.
//!
//! This crate has no async or I/O dependencies. Every other crate in the
//! workspace depends on it for workflow definitions, execution state,
//! lifecycle events and configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod fallback;
pub mod planner;
pub mod workflow;
