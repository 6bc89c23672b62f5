//! # tw-controller
//!
//! The experiment-level control loop: keeps the number of active child
//! trials at the replica cap while the remote optimizer still has work,
//! synchronizes the experiment definition with the remote service, allocates
//! a workspace namespace per trial, and reflects derived status.

pub mod allocate;
pub mod config;
pub mod controller;
pub mod queue;
pub mod sync;
pub mod workers;

pub use config::ControllerConfig;
pub use controller::{ControllerError, ExperimentController, ExperimentOutcome};
pub use queue::WorkQueue;
