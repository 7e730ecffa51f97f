//! Workflow engine and repository trait definitions for Autoflow.
//!
//! This crate defines the "ports" (repository and collaborator traits) that
//! the infrastructure layer implements, plus the orchestrator that walks
//! workflow graphs. It depends only on `autoflow-types`, never on
//! `autoflow-infra` or any database/HTTP crate.

pub mod event;
pub mod repository;
pub mod workflow;
