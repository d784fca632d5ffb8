//! Operation executor trait.
//!
//! The executor performs the actual attach / detach / mount / unmount /
//! expand work, each request running as an independent task.  It guarantees
//! at most one in-flight operation per [`UniqueVolumeName`] (and, for mounts
//! and unmounts, per pod + volume pair); a second request for the same volume
//! fails fast with [`VolumeError::OperationPending`].
//!
//! All methods return quickly: `Ok(())` means the operation was accepted (or
//! completed synchronously), not that the volume has reached its target
//! state — the reconciler observes outcomes on later ticks through the
//! actual state cache.

use async_trait::async_trait;

use crate::error::VolumeError;
use crate::types::{
    AttachedVolume, MountedVolume, PodUid, PodVolume, RecoveredSpec, UniqueVolumeName,
    VolumeToMount,
};

/// Serializing dispatcher for volume operations.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Attach the volume to this node.
    async fn attach_volume(&self, volume: &VolumeToMount) -> Result<(), VolumeError>;

    /// Detach the volume from this node.
    async fn detach_volume(&self, volume: &AttachedVolume) -> Result<(), VolumeError>;

    /// Mount the volume into the pod.  Idempotent; `is_remount` is threaded
    /// through for observability only.
    async fn mount_volume(&self, volume: &VolumeToMount, is_remount: bool)
    -> Result<(), VolumeError>;

    /// Unmount the volume from the pod.
    async fn unmount_volume(&self, volume: &MountedVolume) -> Result<(), VolumeError>;

    /// Unmount the node-global device mount.  Must complete before any
    /// detach of the same volume.
    async fn unmount_device(&self, volume: &AttachedVolume) -> Result<(), VolumeError>;

    /// Confirm that the control-plane controller has attached the volume,
    /// recording the device path in the actual state cache.
    async fn verify_controller_attached_volume(
        &self,
        volume: &VolumeToMount,
    ) -> Result<(), VolumeError>;

    /// Expand the in-use filesystem.  `current_size` is the size observed at
    /// mount time, letting the operation detect completion.
    async fn expand_in_use_volume(
        &self,
        volume: &VolumeToMount,
        current_size: u64,
    ) -> Result<(), VolumeError>;

    /// Recover a full volume spec from the on-disk mount layout described by
    /// `pod_volume`.  Used only during startup reconstruction.
    async fn reconstruct_volume(&self, pod_volume: &PodVolume)
    -> Result<RecoveredSpec, VolumeError>;

    /// Whether a mount artifact actually exists for `pod_volume` on disk.
    async fn check_volume_existence(&self, pod_volume: &PodVolume) -> Result<bool, VolumeError>;

    /// Whether an operation is already in flight for `volume` (optionally
    /// narrowed to one pod's mount).  The reconciler checks this before
    /// issuing a detach so it never races an in-flight mount.
    fn is_operation_pending(&self, volume: &UniqueVolumeName, pod: Option<&PodUid>) -> bool;
}
