//! Core volume-manager types: pod and volume identity, desired/actual state
//! snapshots, and reconstruction records.
//!
//! These types form the data model shared by the reconciler, the
//! reconstructor, and the cache/executor traits.  They are all
//! [`Serialize`]/[`Deserialize`] so snapshots can be dumped for debugging and
//! carried across process boundaries if a cache implementation needs to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque unique identifier of a pod.
///
/// A `PodUid` alone does not say where it came from; a pod rebuilt from disk
/// during reconstruction is represented by a [`PodStub`] with
/// `reconstructed = true`, so the two provenances can never be confused by
/// accident when both end up in the same map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PodUid(pub String);

impl fmt::Display for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PodUid {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PodUid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable cross-pod identity for a volume.
///
/// Two pods referencing the same attachable volume spec resolve to the same
/// `UniqueVolumeName`; this is what lets the reconciler avoid attaching a
/// volume twice.  See [`unique_volume_name`] for the derivation rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UniqueVolumeName(pub String);

impl fmt::Display for UniqueVolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UniqueVolumeName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Derive the [`UniqueVolumeName`] for a volume spec handled by the named
/// plugin.
///
/// Volumes that can be attached or device-mounted are shared across pods, so
/// their name is derived from the plugin and spec alone.  Everything else is
/// pod-local and carries the pod UID in its name, preventing two pods' local
/// volumes from colliding.
///
/// Reconstruction must call this with the *recovered* spec, never with just
/// the plugin name scraped from the directory layout: whether a volume is
/// attachable can depend on the spec contents.
pub fn unique_volume_name(
    spec: &VolumeSpec,
    plugin_name: &str,
    pod_uid: Option<&PodUid>,
) -> UniqueVolumeName {
    if spec.attachable || spec.device_mountable {
        UniqueVolumeName(format!("{plugin_name}/{}", spec.name))
    } else {
        let pod = pod_uid.map(|p| p.0.as_str()).unwrap_or("");
        UniqueVolumeName(format!("{pod}/{plugin_name}/{}", spec.name))
    }
}

// ---------------------------------------------------------------------------
// Volume specs
// ---------------------------------------------------------------------------

/// How a volume is consumed by the pod.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeMode {
    /// Mounted as a filesystem into the pod's volume directory.
    Filesystem,
    /// Mapped as a raw block device (symlink in the pod's device directory).
    Block,
}

/// The minimal volume spec the reconciliation engine needs.
///
/// Real specs are plugin-specific; the engine only cares about identity
/// derivation, mode, and sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Spec name, unique within the plugin.
    pub name: String,
    /// Whether the volume must be attached to the node before mounting.
    pub attachable: bool,
    /// Whether the volume has a node-global device mount shared by pods.
    pub device_mountable: bool,
    /// Filesystem or raw block consumption.
    pub mode: VolumeMode,
    /// Provisioned capacity in bytes, used to detect pending resizes.
    pub capacity_bytes: u64,
}

/// A pod known only by UID.
///
/// During reconstruction the full pod object is not available (the desired
/// state cache has not been populated yet), so the engine carries a stub with
/// only the UID recovered from the directory name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodStub {
    /// The pod UID.
    pub uid: PodUid,
    /// `true` when this stub was synthesized from on-disk artifacts rather
    /// than from the desired state cache.
    pub reconstructed: bool,
}

/// A single volume-use discovered from the desired state cache or from disk.
///
/// Identity: `(pod_uid, volume_spec_name)` is unique per pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodVolume {
    /// Pod this volume belongs to.
    pub pod_uid: PodUid,
    /// Volume name within the pod spec (the inner, per-pod name).
    pub volume_spec_name: String,
    /// On-disk mount directory (filesystem mode) or device symlink (block
    /// mode) for this pod's use of the volume.
    pub volume_path: PathBuf,
    /// Name of the plugin that handles this volume.
    pub plugin_name: String,
    /// Filesystem or block.
    pub mode: VolumeMode,
}

// ---------------------------------------------------------------------------
// Mount state
// ---------------------------------------------------------------------------

/// Tri-state mount status tracked by the actual state cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeMountState {
    /// The mount is confirmed.
    Mounted,
    /// The volume may be mounted (found on disk, or a prior attempt whose
    /// outcome is unknown).  Uncertain volumes must still be torn down as if
    /// they were mounted, but must never satisfy an idempotent skip check.
    Uncertain,
    /// The volume is not mounted.
    NotMounted,
}

/// Result of querying the actual state cache for one `(pod, volume)` pair.
///
/// Exactly one variant applies at a time; the reconciler dispatches on the
/// first match in its declared priority order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeStatus {
    /// Mounted with the desired parameters; nothing to do.
    Mounted,
    /// Possibly mounted; a (safe, idempotent) mount must be issued to confirm.
    Uncertain,
    /// Attached to the node but not mounted for this pod yet.
    NotMounted {
        /// Device path recorded at attach time, forwarded to the mount.
        device_path: String,
    },
    /// Mounted, but the cache has flagged the mount as requiring a remount
    /// (e.g. content refresh for certain volume types).
    RequiresRemount,
    /// Mounted, but the filesystem is smaller than the desired size and must
    /// be expanded in use.
    RequiresResize {
        /// Size observed at mount time, passed to the expand operation so it
        /// can detect completion.
        current_size: u64,
    },
    /// Mounted with a conflicting SELinux context.  Terminal until the
    /// existing mount is torn down; the reconciler must not retry the mount.
    MismatchedContext {
        /// Human-readable description of the conflict.
        reason: String,
    },
    /// Not attached to this node.
    NotAttached,
}

// ---------------------------------------------------------------------------
// State snapshots
// ---------------------------------------------------------------------------

/// A volume some pod wants mounted, as reported by the desired state cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeToMount {
    /// Cross-pod volume identity.
    pub unique_name: UniqueVolumeName,
    /// Pod that wants the volume.
    pub pod_uid: PodUid,
    /// Volume name within the pod spec.
    pub volume_spec_name: String,
    /// Plugin handling the volume.
    pub plugin_name: String,
    /// The volume spec.
    pub spec: VolumeSpec,
    /// Desired size in bytes; compared against the mounted size to detect
    /// pending expansions.
    pub desired_size: u64,
    /// SELinux mount context the pod requires, if any.
    pub selinux_context: Option<String>,
    /// Whether the control plane has reported this volume as in-use on this
    /// node.  Controller-managed attach waits for this before verifying.
    pub reported_in_use: bool,
}

/// A `(pod, volume)` mount currently tracked by the actual state cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountedVolume {
    /// Cross-pod volume identity.
    pub unique_name: UniqueVolumeName,
    /// Pod the volume is mounted into.
    pub pod_uid: PodUid,
    /// Volume name within the pod spec.
    pub volume_spec_name: String,
    /// Plugin handling the volume.
    pub plugin_name: String,
    /// SELinux context the volume was mounted with, if any.  Part of the
    /// mount's identity when matched against the desired state.
    pub selinux_context: Option<String>,
    /// Mounted or Uncertain; NotMounted entries never appear here.
    pub mount_state: VolumeMountState,
}

/// A volume attached to the node with no remaining pod mounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachedVolume {
    /// Cross-pod volume identity.
    pub unique_name: UniqueVolumeName,
    /// The volume spec.
    pub spec: VolumeSpec,
    /// Plugin handling the volume.
    pub plugin_name: String,
    /// SELinux context of the device mount, if any.
    pub selinux_context: Option<String>,
    /// State of the node-global device mount.
    pub device_mount_state: VolumeMountState,
    /// Node-global device mount path, when one exists.
    pub device_mount_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Reconstruction records
// ---------------------------------------------------------------------------

/// A volume spec recovered from on-disk artifacts, as returned by the
/// operation executor's reconstruction entry point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveredSpec {
    /// The recovered volume spec.
    pub spec: VolumeSpec,
    /// SELinux context recovered from the existing mount, if any.
    pub selinux_context: Option<String>,
}

/// One pod's use of a volume rebuilt from disk during crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconstructedVolume {
    /// Identity re-derived from the recovered spec.
    pub unique_name: UniqueVolumeName,
    /// Synthetic pod carrying only the UID read from the directory name.
    pub pod: PodStub,
    /// The recovered spec.
    pub spec: VolumeSpec,
    /// Plugin that handles the volume.
    pub plugin_name: String,
    /// Volume name within the pod spec.
    pub volume_spec_name: String,
    /// On-disk mount directory or device symlink that was verified to exist.
    pub volume_path: PathBuf,
    /// SELinux context recovered from the mount, if any.
    pub selinux_context: Option<String>,
    /// Unknown at reconstruction time; filled in later from node-level
    /// attachment metadata by the actual state cache.
    pub device_path: Option<String>,
}

/// All reconstructed uses of one volume, grouped by [`UniqueVolumeName`].
///
/// Created during reconstruction; consumed and deleted once the reconciler
/// has verified the volume is attached and pushed its pods into the actual
/// state cache in Uncertain state.  Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalVolumeInfo {
    /// Cross-pod volume identity.
    pub unique_name: UniqueVolumeName,
    /// The recovered spec (identical across all pods in `pods`).
    pub spec: VolumeSpec,
    /// Plugin that handles the volume.
    pub plugin_name: String,
    /// Node-global device mount path, when the plugin has one for this spec.
    pub device_mount_path: Option<PathBuf>,
    /// Per-pod reconstruction records, keyed by pod UID.
    pub pods: HashMap<PodUid, ReconstructedVolume>,
}
