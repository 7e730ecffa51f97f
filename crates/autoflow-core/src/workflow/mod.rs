//! Workflow engine.
//!
//! Definitions are validated graphs of steps held in a [`store::WorkflowStore`].
//! The [`orchestrator::Orchestrator`] walks them: each step's parameters are
//! resolved against the execution context, dispatched to a registered handler
//! under the retry controller, escalated to the fallback coordinator when
//! retries run out, and checked by the approval gate before traversal moves
//! on to parallel and sequential successors.

pub mod approval;
pub mod builtin;
pub mod condition;
pub mod definition;
pub mod dispatcher;
pub mod fallback;
pub mod graph;
pub mod handler;
pub mod orchestrator;
pub mod planner;
pub mod resolver;
pub mod retry;
pub mod store;
