//! # tw-engine
//!
//! The trial lifecycle engine: a per-trial reconciliation state machine that
//! applies patches, verifies readiness, runs the trial job, captures metrics,
//! and reports results to the remote optimizer. Also home to the workspace
//! client abstraction the engine drives everything through.

pub mod engine;
pub mod job;
pub mod readiness;
pub mod render;
pub mod values;
pub mod workspace;

pub use engine::{EngineError, ReconcileOutcome, TrialEngine};
pub use render::{BasicRenderer, RenderError, Renderer};
pub use workspace::{MemoryWorkspace, WorkspaceClient, WorkspaceError, WorkspaceObject};
