//! Infrastructure layer for Autoflow.
//!
//! Implements the traits defined in `autoflow-core`: SQLite storage for
//! workflow definitions and execution snapshots, the HTTP step handler, the
//! remote fallback agent client, and configuration loading from the data
//! directory.

pub mod config;
pub mod fallback;
pub mod handler;
pub mod planner;
pub mod sqlite;
