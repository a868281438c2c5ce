//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepflow-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides an in-process
//! implementation used by tests and embedders.

pub mod memory;
pub mod workflow;
