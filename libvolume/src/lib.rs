//! # libvolume — node-local volume reconciliation for RK8s
//!
//! `libvolume` keeps the set of storage volumes actually attached and mounted
//! on a node consistent with the set of volumes the pods scheduled to that
//! node should have.  It runs continuously, survives agent crashes by
//! rebuilding state from on-disk mount artifacts, and never double-mounts or
//! loses track of in-use storage.  It follows the RK8s architecture
//! conventions (Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: pod/volume identity, state snapshots, reconstruction records. |
//! | [`error`] | [`VolumeError`] enum covering all failure modes, with transience classification. |
//! | [`cache`] | [`DesiredStateOfWorld`] / [`ActualStateOfWorld`] traits — the two state caches the loop diffs. |
//! | [`executor`] | [`OperationExecutor`] trait — serialized attach/mount/unmount/detach/expand dispatch. |
//! | [`plugin`] | [`VolumePlugin`] trait and [`PluginRegistry`] — backend-specific identity and paths. |
//! | [`reconstruct`] | Startup crash recovery from the on-disk pod volume layout. |
//! | [`reconciler`] | The periodic four-phase reconciliation loop. |
//!
//! ## Lifecycle
//!
//! The owning agent builds the caches and executor, runs
//! [`Reconstructor::reconstruct`] once before the desired state is populated,
//! feeds the result to [`Reconciler::set_reconstructed`], and then drives the
//! loop with [`Reconciler::run`].  Everything after that is automatic: each
//! tick unmounts unwanted volumes, mounts or attaches wanted ones, tears down
//! unused devices, and folds any still-pending reconstructed volumes into the
//! actual state cache in Uncertain state.

pub mod cache;
pub mod error;
pub mod executor;
pub mod plugin;
pub mod reconciler;
pub mod reconstruct;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the most commonly used items at crate root for convenience.
pub use cache::{ActualStateOfWorld, DesiredStateOfWorld};
pub use error::VolumeError;
pub use executor::OperationExecutor;
pub use plugin::{PluginRegistry, VolumePlugin};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use reconstruct::{Mounter, ReconstructResult, Reconstructor, SystemMounter};
pub use types::*;
