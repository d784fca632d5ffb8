//! Desired / actual state cache traits.
//!
//! The reconciliation engine never owns volume state.  It diffs two caches
//! maintained by the surrounding agent:
//!
//! * [`DesiredStateOfWorld`] — what *should* be mounted, derived from the pod
//!   specs scheduled to this node.
//! * [`ActualStateOfWorld`] — what *is* attached and mounted, the single
//!   source of truth for "what is real".
//!
//! Both traits are implemented with internal synchronization; the reconciler
//! only ever reads snapshots and issues mark-state calls, it never holds a
//! lock itself.

use std::path::Path;

use crate::types::{
    AttachedVolume, MountedVolume, PodUid, ReconstructedVolume, UniqueVolumeName, VolumeStatus,
    VolumeToMount,
};

/// Cache of volumes that should currently be mounted on this node.
pub trait DesiredStateOfWorld: Send + Sync {
    /// Snapshot of every `(pod, volume)` pair that should be mounted.
    fn volumes_to_mount(&self) -> Vec<VolumeToMount>;

    /// Whether `pod` should still have `volume` mounted with the given
    /// SELinux context.  The context is part of the mount's identity: a
    /// desired entry with a different context does not match.
    fn pod_exists_in_volume(
        &self,
        pod: &PodUid,
        volume: &UniqueVolumeName,
        selinux_context: Option<&str>,
    ) -> bool;

    /// Whether any pod desires `volume` with the given SELinux context.
    fn volume_exists(&self, volume: &UniqueVolumeName, selinux_context: Option<&str>) -> bool;

    /// Record a reconciliation error against the pod so it can be surfaced
    /// through the pod's event/status channel.
    fn add_error_to_pod(&self, pod: &PodUid, error: &str);
}

/// Cache of volumes currently attached to the node and mounted into pods.
pub trait ActualStateOfWorld: Send + Sync {
    /// Snapshot of every tracked `(pod, volume)` mount.  Includes Uncertain
    /// mounts: they must be torn down like real mounts when undesired.
    fn all_mounted_volumes(&self) -> Vec<MountedVolume>;

    /// Volumes attached to the node with no remaining pod mounts.
    fn unmounted_volumes(&self) -> Vec<AttachedVolume>;

    /// Status of `volume` for `pod`, evaluated against the desired size and
    /// SELinux context.  Exactly one [`VolumeStatus`] variant is returned;
    /// the reconciler dispatches on it directly.
    fn pod_volume_status(
        &self,
        pod: &PodUid,
        volume: &UniqueVolumeName,
        desired_size: u64,
        selinux_context: Option<&str>,
    ) -> VolumeStatus;

    /// Whether the cache believes `volume` is attached to this node.
    fn volume_exists(&self, volume: &UniqueVolumeName) -> bool;

    /// Remove `volume` from the attached set.  Used when this node is
    /// responsible for attach/detach and the volume needs no detach call.
    fn mark_volume_as_detached(&self, volume: &UniqueVolumeName);

    /// Record a reconstructed pod mount in Uncertain state, unless the cache
    /// already tracks a state for that `(pod, volume)` pair.  Returns `true`
    /// when the mark was applied.
    fn check_and_mark_volume_uncertain_via_reconstruction(
        &self,
        volume: &ReconstructedVolume,
    ) -> bool;

    /// Record a reconstructed node-global device mount in Uncertain state,
    /// unless the cache already tracks one.  Returns `true` when the mark
    /// was applied.
    fn check_and_mark_device_uncertain_via_reconstruction(
        &self,
        volume: &UniqueVolumeName,
        device_mount_path: &Path,
    ) -> bool;
}
