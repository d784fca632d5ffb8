//! Volume-manager error types.
//!
//! All errors in the `libvolume` crate are represented by the [`VolumeError`]
//! enum, which derives [`thiserror::Error`] and is `Clone` + `Serialize` so
//! that operation outcomes can be recorded, compared in tests, and surfaced
//! through the desired-state error channel.
//!
//! The reconciler distinguishes *expected* errors (an operation is already in
//! flight, or a previous failure is still in its backoff window) from real
//! failures: expected errors are suppressed to `debug` logging and simply
//! retried on a later tick, everything else is logged and retried because the
//! state snapshots are re-read fresh each tick.  Nothing here is ever treated
//! as fatal to the reconciliation loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for volume reconciliation operations.
#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeError {
    /// Another operation for the same volume (or pod+volume pair) is still
    /// running.  Expected under normal operation; retried next tick.
    #[error("operation on volume {volume} is already pending")]
    OperationPending {
        /// Unique volume name the pending operation belongs to.
        volume: String,
    },

    /// The exponential backoff window from a previous failure on this exact
    /// volume has not elapsed yet.  Expected; retried next tick.
    #[error("volume {volume} still in backoff for {remaining:?}")]
    BackoffActive {
        /// Unique volume name in cooldown.
        volume: String,
        /// Time left in the backoff window.
        remaining: Duration,
    },

    /// The volume is mounted with a conflicting SELinux context.  Terminal
    /// until the conflicting mount is unmounted; never retried as a mount.
    #[error("volume {volume} mounted with conflicting SELinux context: {reason}")]
    MismatchedSELinuxContext {
        /// Unique volume name.
        volume: String,
        /// Description of the conflict.
        reason: String,
    },

    /// An attach operation failed.
    #[error("attach of volume {volume} failed: {reason}")]
    AttachFailed { volume: String, reason: String },

    /// A detach operation failed.
    #[error("detach of volume {volume} failed: {reason}")]
    DetachFailed { volume: String, reason: String },

    /// A mount operation failed.
    #[error("mount of volume {volume} failed: {reason}")]
    MountFailed { volume: String, reason: String },

    /// An unmount operation failed.
    #[error("unmount of volume {volume} failed: {reason}")]
    UnmountFailed { volume: String, reason: String },

    /// An in-use filesystem expansion failed.
    #[error("expand of volume {volume} failed: {reason}")]
    ExpandFailed { volume: String, reason: String },

    /// Reconstruction of a single volume from disk failed.
    #[error("reconstruction of volume at {path} failed: {reason}")]
    ReconstructFailed { path: String, reason: String },

    /// No registered plugin matches the name recovered from disk.
    #[error("no volume plugin named {0}")]
    PluginNotFound(String),

    /// An expected mount directory or device symlink is absent.
    #[error("expected volume path {0} does not exist")]
    PathNotFound(String),

    /// A filesystem error outside any specific operation.
    #[error("io error at {path}: {reason}")]
    Io {
        /// Path the operation touched.
        path: String,
        /// Stringified source error.
        reason: String,
    },
}

impl VolumeError {
    /// `true` for errors that are part of normal operation and must be
    /// retried silently rather than logged as failures.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::OperationPending { .. } | Self::BackoffActive { .. }
        )
    }

    /// Create a [`VolumeError::Io`] from a path and anything that implements
    /// [`std::fmt::Display`].
    pub fn io<E: std::fmt::Display>(path: impl Into<String>, e: E) -> Self {
        Self::Io {
            path: path.into(),
            reason: e.to_string(),
        }
    }
}
