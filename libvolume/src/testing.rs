//! In-memory test doubles for the cache, executor, plugin, and mounter
//! seams.
//!
//! These fakes keep their state in concurrent maps and record every call the
//! reconciler or reconstructor makes, so tests can assert on exact operation
//! traces (ordering included).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::{ActualStateOfWorld, DesiredStateOfWorld};
use crate::error::VolumeError;
use crate::executor::OperationExecutor;
use crate::plugin::{VolumePlugin, escape_plugin_name};
use crate::reconstruct::Mounter;
use crate::types::{
    AttachedVolume, MountedVolume, PodUid, PodVolume, ReconstructedVolume, RecoveredSpec,
    UniqueVolumeName, VolumeMode, VolumeMountState, VolumeSpec, VolumeStatus, VolumeToMount,
};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Build a [`VolumeSpec`] with the given name and attachability.
pub(crate) fn spec(name: &str, attachable: bool) -> VolumeSpec {
    VolumeSpec {
        name: name.into(),
        attachable,
        device_mountable: false,
        mode: VolumeMode::Filesystem,
        capacity_bytes: 1 << 20,
    }
}

/// Build a [`VolumeToMount`] for `pod` using plugin `fake`.
pub(crate) fn volume_to_mount(pod: &str, volume: &str, attachable: bool) -> VolumeToMount {
    let spec = spec(volume, attachable);
    let unique_name = crate::types::unique_volume_name(&spec, "fake", Some(&PodUid::from(pod)));
    VolumeToMount {
        unique_name,
        pod_uid: PodUid::from(pod),
        volume_spec_name: volume.into(),
        plugin_name: "fake".into(),
        desired_size: spec.capacity_bytes,
        spec,
        selinux_context: None,
        reported_in_use: true,
    }
}

/// Build a [`MountedVolume`] for `pod`.
pub(crate) fn mounted_volume(pod: &str, volume: &str, attachable: bool) -> MountedVolume {
    let spec = spec(volume, attachable);
    MountedVolume {
        unique_name: crate::types::unique_volume_name(&spec, "fake", Some(&PodUid::from(pod))),
        pod_uid: PodUid::from(pod),
        volume_spec_name: volume.into(),
        plugin_name: "fake".into(),
        selinux_context: None,
        mount_state: VolumeMountState::Mounted,
    }
}

/// Build an [`AttachedVolume`] with the given device mount state.
pub(crate) fn attached_volume(
    volume: &str,
    attachable: bool,
    device_mount_state: VolumeMountState,
) -> AttachedVolume {
    let spec = spec(volume, attachable);
    AttachedVolume {
        unique_name: crate::types::unique_volume_name(&spec, "fake", None),
        plugin_name: "fake".into(),
        spec,
        selinux_context: None,
        device_mount_state,
        device_mount_path: Some(PathBuf::from(format!("/var/lib/agent/global/{volume}"))),
    }
}

// ---------------------------------------------------------------------------
// Desired state fake
// ---------------------------------------------------------------------------

/// In-memory [`DesiredStateOfWorld`] keyed by `(pod, volume)`.
#[derive(Default)]
pub(crate) struct FakeDesiredState {
    volumes: DashMap<(PodUid, UniqueVolumeName), VolumeToMount>,
    pod_errors: Mutex<Vec<(PodUid, String)>>,
}

impl FakeDesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, volume: VolumeToMount) {
        self.volumes
            .insert((volume.pod_uid.clone(), volume.unique_name.clone()), volume);
    }

    pub fn pod_errors(&self) -> Vec<(PodUid, String)> {
        self.pod_errors.lock().unwrap().clone()
    }
}

impl DesiredStateOfWorld for FakeDesiredState {
    fn volumes_to_mount(&self) -> Vec<VolumeToMount> {
        let mut volumes: Vec<_> = self.volumes.iter().map(|e| e.value().clone()).collect();
        // Deterministic iteration order for trace assertions.
        volumes.sort_by(|a, b| (&a.pod_uid.0, &a.unique_name.0).cmp(&(&b.pod_uid.0, &b.unique_name.0)));
        volumes
    }

    fn pod_exists_in_volume(
        &self,
        pod: &PodUid,
        volume: &UniqueVolumeName,
        selinux_context: Option<&str>,
    ) -> bool {
        self.volumes
            .get(&(pod.clone(), volume.clone()))
            .is_some_and(|v| v.selinux_context.as_deref() == selinux_context)
    }

    fn volume_exists(&self, volume: &UniqueVolumeName, selinux_context: Option<&str>) -> bool {
        self.volumes.iter().any(|e| {
            e.value().unique_name == *volume
                && e.value().selinux_context.as_deref() == selinux_context
        })
    }

    fn add_error_to_pod(&self, pod: &PodUid, error: &str) {
        self.pod_errors
            .lock()
            .unwrap()
            .push((pod.clone(), error.to_owned()));
    }
}

// ---------------------------------------------------------------------------
// Actual state fake
// ---------------------------------------------------------------------------

/// In-memory [`ActualStateOfWorld`] with scripted per-pod statuses.
#[derive(Default)]
pub(crate) struct FakeActualState {
    statuses: DashMap<(PodUid, UniqueVolumeName), VolumeStatus>,
    mounted: DashMap<(PodUid, UniqueVolumeName), MountedVolume>,
    attached: DashMap<UniqueVolumeName, AttachedVolume>,
    /// Volumes known attached even without an `attached` snapshot entry.
    exists: DashMap<UniqueVolumeName, ()>,
    detached: Mutex<Vec<UniqueVolumeName>>,
    uncertain_volumes: Mutex<Vec<ReconstructedVolume>>,
    uncertain_devices: Mutex<Vec<(UniqueVolumeName, PathBuf)>>,
}

impl FakeActualState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the status returned for one `(pod, volume)` pair.
    pub fn set_status(&self, pod: &PodUid, volume: &UniqueVolumeName, status: VolumeStatus) {
        self.statuses.insert((pod.clone(), volume.clone()), status);
    }

    pub fn add_mounted(&self, volume: MountedVolume) {
        self.mounted
            .insert((volume.pod_uid.clone(), volume.unique_name.clone()), volume);
    }

    pub fn add_attached(&self, volume: AttachedVolume) {
        self.attached.insert(volume.unique_name.clone(), volume);
    }

    /// Mark the volume as known-attached for `volume_exists` queries.
    pub fn set_exists(&self, volume: &UniqueVolumeName) {
        self.exists.insert(volume.clone(), ());
    }

    pub fn detached(&self) -> Vec<UniqueVolumeName> {
        self.detached.lock().unwrap().clone()
    }

    pub fn uncertain_volume_marks(&self) -> Vec<ReconstructedVolume> {
        self.uncertain_volumes.lock().unwrap().clone()
    }

    pub fn uncertain_device_marks(&self) -> Vec<(UniqueVolumeName, PathBuf)> {
        self.uncertain_devices.lock().unwrap().clone()
    }
}

impl ActualStateOfWorld for FakeActualState {
    fn all_mounted_volumes(&self) -> Vec<MountedVolume> {
        let mut volumes: Vec<_> = self.mounted.iter().map(|e| e.value().clone()).collect();
        volumes.sort_by(|a, b| (&a.pod_uid.0, &a.unique_name.0).cmp(&(&b.pod_uid.0, &b.unique_name.0)));
        volumes
    }

    fn unmounted_volumes(&self) -> Vec<AttachedVolume> {
        let mut volumes: Vec<_> = self.attached.iter().map(|e| e.value().clone()).collect();
        volumes.sort_by(|a, b| a.unique_name.0.cmp(&b.unique_name.0));
        volumes
    }

    fn pod_volume_status(
        &self,
        pod: &PodUid,
        volume: &UniqueVolumeName,
        _desired_size: u64,
        _selinux_context: Option<&str>,
    ) -> VolumeStatus {
        self.statuses
            .get(&(pod.clone(), volume.clone()))
            .map(|s| s.value().clone())
            .unwrap_or(VolumeStatus::NotAttached)
    }

    fn volume_exists(&self, volume: &UniqueVolumeName) -> bool {
        self.attached.contains_key(volume) || self.exists.contains_key(volume)
    }

    fn mark_volume_as_detached(&self, volume: &UniqueVolumeName) {
        self.attached.remove(volume);
        self.detached.lock().unwrap().push(volume.clone());
    }

    fn check_and_mark_volume_uncertain_via_reconstruction(
        &self,
        volume: &ReconstructedVolume,
    ) -> bool {
        let key = (volume.pod.uid.clone(), volume.unique_name.clone());
        if self.statuses.contains_key(&key) {
            return false;
        }
        self.statuses.insert(key, VolumeStatus::Uncertain);
        self.mounted.insert(
            (volume.pod.uid.clone(), volume.unique_name.clone()),
            MountedVolume {
                unique_name: volume.unique_name.clone(),
                pod_uid: volume.pod.uid.clone(),
                volume_spec_name: volume.volume_spec_name.clone(),
                plugin_name: volume.plugin_name.clone(),
                selinux_context: volume.selinux_context.clone(),
                mount_state: VolumeMountState::Uncertain,
            },
        );
        self.uncertain_volumes.lock().unwrap().push(volume.clone());
        true
    }

    fn check_and_mark_device_uncertain_via_reconstruction(
        &self,
        volume: &UniqueVolumeName,
        device_mount_path: &Path,
    ) -> bool {
        let mut marks = self.uncertain_devices.lock().unwrap();
        if marks.iter().any(|(v, _)| v == volume) {
            return false;
        }
        marks.push((volume.clone(), device_mount_path.to_path_buf()));
        true
    }
}

// ---------------------------------------------------------------------------
// Recording executor
// ---------------------------------------------------------------------------

/// One accepted executor operation, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Attach(UniqueVolumeName),
    Detach(UniqueVolumeName),
    Mount {
        volume: UniqueVolumeName,
        pod: PodUid,
        is_remount: bool,
    },
    Unmount {
        volume: UniqueVolumeName,
        pod: PodUid,
    },
    UnmountDevice(UniqueVolumeName),
    VerifyAttached(UniqueVolumeName),
    Expand {
        volume: UniqueVolumeName,
        current_size: u64,
    },
}

/// [`OperationExecutor`] fake that records accepted operations and emulates
/// the per-volume serialization guarantee for attach.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    log: Mutex<Vec<Op>>,
    pending: DashMap<UniqueVolumeName, ()>,
    /// Scripted recovered specs for reconstruction, keyed by
    /// `(pod, volume_spec_name)`.
    recovered: DashMap<(PodUid, String), RecoveredSpec>,
    /// Scripted `check_volume_existence` answers; missing entries mean
    /// "artifact exists".
    existence: DashMap<(PodUid, String), bool>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations accepted so far, in dispatch order.
    pub fn ops(&self) -> Vec<Op> {
        self.log.lock().unwrap().clone()
    }

    /// Mark an operation as already in flight for `volume`; subsequent
    /// requests are rejected with [`VolumeError::OperationPending`].
    pub fn set_pending(&self, volume: &UniqueVolumeName) {
        self.pending.insert(volume.clone(), ());
    }

    pub fn set_recovered(&self, pod: &PodUid, volume_spec_name: &str, recovered: RecoveredSpec) {
        self.recovered
            .insert((pod.clone(), volume_spec_name.to_owned()), recovered);
    }

    fn gate(&self, volume: &UniqueVolumeName, op: Op) -> Result<(), VolumeError> {
        if self.pending.contains_key(volume) {
            return Err(VolumeError::OperationPending {
                volume: volume.0.clone(),
            });
        }
        self.log.lock().unwrap().push(op);
        Ok(())
    }
}

#[async_trait]
impl OperationExecutor for RecordingExecutor {
    async fn attach_volume(&self, volume: &VolumeToMount) -> Result<(), VolumeError> {
        self.gate(&volume.unique_name, Op::Attach(volume.unique_name.clone()))?;
        // An accepted attach stays in flight until the fake is reset, so a
        // second attach for the same unique name is rejected as pending.
        self.pending.insert(volume.unique_name.clone(), ());
        Ok(())
    }

    async fn detach_volume(&self, volume: &AttachedVolume) -> Result<(), VolumeError> {
        self.gate(&volume.unique_name, Op::Detach(volume.unique_name.clone()))
    }

    async fn mount_volume(
        &self,
        volume: &VolumeToMount,
        is_remount: bool,
    ) -> Result<(), VolumeError> {
        self.gate(
            &volume.unique_name,
            Op::Mount {
                volume: volume.unique_name.clone(),
                pod: volume.pod_uid.clone(),
                is_remount,
            },
        )
    }

    async fn unmount_volume(&self, volume: &MountedVolume) -> Result<(), VolumeError> {
        self.gate(
            &volume.unique_name,
            Op::Unmount {
                volume: volume.unique_name.clone(),
                pod: volume.pod_uid.clone(),
            },
        )
    }

    async fn unmount_device(&self, volume: &AttachedVolume) -> Result<(), VolumeError> {
        self.gate(
            &volume.unique_name,
            Op::UnmountDevice(volume.unique_name.clone()),
        )
    }

    async fn verify_controller_attached_volume(
        &self,
        volume: &VolumeToMount,
    ) -> Result<(), VolumeError> {
        self.gate(
            &volume.unique_name,
            Op::VerifyAttached(volume.unique_name.clone()),
        )
    }

    async fn expand_in_use_volume(
        &self,
        volume: &VolumeToMount,
        current_size: u64,
    ) -> Result<(), VolumeError> {
        self.gate(
            &volume.unique_name,
            Op::Expand {
                volume: volume.unique_name.clone(),
                current_size,
            },
        )
    }

    async fn reconstruct_volume(
        &self,
        pod_volume: &PodVolume,
    ) -> Result<RecoveredSpec, VolumeError> {
        self.recovered
            .get(&(pod_volume.pod_uid.clone(), pod_volume.volume_spec_name.clone()))
            .map(|r| r.value().clone())
            .ok_or_else(|| VolumeError::ReconstructFailed {
                path: pod_volume.volume_path.display().to_string(),
                reason: "no recoverable spec".into(),
            })
    }

    async fn check_volume_existence(&self, pod_volume: &PodVolume) -> Result<bool, VolumeError> {
        Ok(self
            .existence
            .get(&(pod_volume.pod_uid.clone(), pod_volume.volume_spec_name.clone()))
            .map(|e| *e.value())
            .unwrap_or(true))
    }

    fn is_operation_pending(&self, volume: &UniqueVolumeName, _pod: Option<&PodUid>) -> bool {
        self.pending.contains_key(volume)
    }
}

// ---------------------------------------------------------------------------
// Plugin and mounter fakes
// ---------------------------------------------------------------------------

/// [`VolumePlugin`] whose behavior is driven entirely by the spec flags.
pub(crate) struct FakePlugin {
    name: String,
    global_root: PathBuf,
}

impl FakePlugin {
    pub fn new(name: &str, global_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            global_root: global_root.into(),
        }
    }
}

impl VolumePlugin for FakePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_attach(&self, spec: &VolumeSpec) -> bool {
        spec.attachable
    }

    fn can_device_mount(&self, spec: &VolumeSpec) -> bool {
        spec.device_mountable
    }

    fn global_mount_path(&self, spec: &VolumeSpec) -> Option<PathBuf> {
        spec.device_mountable.then(|| {
            self.global_root
                .join(escape_plugin_name(&self.name))
                .join(&spec.name)
        })
    }
}

/// [`Mounter`] that records forced unmounts instead of touching the system.
#[derive(Default)]
pub(crate) struct FakeMounter {
    unmounted: Mutex<Vec<PathBuf>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.unmounted.lock().unwrap().clone()
    }
}

impl Mounter for FakeMounter {
    fn unmount(&self, path: &Path) -> Result<(), VolumeError> {
        self.unmounted.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}
