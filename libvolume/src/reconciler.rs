//! The periodic reconciliation loop.
//!
//! Each tick diffs the desired state of the world against the actual state
//! and drives the operation executor to close the gap.  A tick runs four
//! phases in a fixed order, because later phases depend on earlier ones
//! having run:
//!
//! 1. **Unmount** volumes no longer desired — a volume freed by a deleted pod
//!    must be released before another pod wanting the same unique name may
//!    mount it.
//! 2. **Mount or attach** desired volumes.
//! 3. **Unmount devices / detach** volumes attached but no longer used by
//!    any pod — the device unmount must precede the detach.
//! 4. **Merge** volumes recovered by the reconstructor into the actual state
//!    cache in Uncertain state.
//!
//! The tick itself is single-threaded and non-reentrant; individual
//! operations are dispatched to the executor and observed on later ticks
//! through the actual state cache.  No failure here is ever fatal: expected
//! errors (operation pending, backoff active) are suppressed to `debug`,
//! everything else is logged and naturally retried because both snapshots
//! are re-read fresh each tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{ActualStateOfWorld, DesiredStateOfWorld};
use crate::error::VolumeError;
use crate::executor::OperationExecutor;
use crate::types::{
    GlobalVolumeInfo, UniqueVolumeName, VolumeMountState, VolumeStatus, VolumeToMount,
};

/// Reconciler tuning knobs, fixed at construction.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Sleep between reconciliation ticks.
    pub sync_period: Duration,
    /// Whether a cluster-level controller manages attach/detach for this
    /// node.  When `false` the node attaches and detaches volumes itself.
    pub controller_attach_detach_enabled: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_millis(100),
            controller_attach_detach_enabled: true,
        }
    }
}

/// The ordered phases of one reconciliation tick.
///
/// The order is load-bearing: unmount before mount avoids cross-pod mount
/// conflicts, and the device unmount/detach phase relies on the pod unmount
/// phase having already released per-pod mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    UnmountVolumes,
    MountAttachVolumes,
    UnmountDetachDevices,
    MergeReconstructed,
}

impl Phase {
    const ORDER: [Phase; 4] = [
        Phase::UnmountVolumes,
        Phase::MountAttachVolumes,
        Phase::UnmountDetachDevices,
        Phase::MergeReconstructed,
    ];
}

/// The periodic control loop keeping actual volume state consistent with
/// desired volume state.
pub struct Reconciler {
    cfg: ReconcilerConfig,
    dsw: Arc<dyn DesiredStateOfWorld>,
    asw: Arc<dyn ActualStateOfWorld>,
    executor: Arc<dyn OperationExecutor>,
    /// Volumes recovered at startup and not yet handed to the actual state
    /// cache.  Touched only from the reconciliation tick, so unsynchronized.
    skipped_during_reconstruction: HashMap<UniqueVolumeName, GlobalVolumeInfo>,
    time_of_last_sync: Option<Instant>,
}

impl Reconciler {
    /// Create a reconciler over the given caches and executor.
    pub fn new(
        cfg: ReconcilerConfig,
        dsw: Arc<dyn DesiredStateOfWorld>,
        asw: Arc<dyn ActualStateOfWorld>,
        executor: Arc<dyn OperationExecutor>,
    ) -> Self {
        Self {
            cfg,
            dsw,
            asw,
            executor,
            skipped_during_reconstruction: HashMap::new(),
            time_of_last_sync: None,
        }
    }

    /// Feed the volumes recovered by the reconstructor into the loop.  Each
    /// entry is merged into the actual state cache at most once, on the
    /// first tick after the volume's attachment has been verified.
    pub fn set_reconstructed(&mut self, volumes: HashMap<UniqueVolumeName, GlobalVolumeInfo>) {
        self.skipped_during_reconstruction = volumes;
    }

    /// Whether at least one full tick has completed.  The owning agent gates
    /// pod startup on this.
    pub fn states_synced(&self) -> bool {
        self.time_of_last_sync.is_some()
    }

    /// Run the loop until `shutdown` flips to `true` (or its sender drops).
    ///
    /// In-flight operations dispatched to the executor are not cancelled;
    /// they finish or fail asynchronously.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.sync_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(period = ?self.cfg.sync_period, "reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconciler shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Execute one reconciliation tick.
    #[instrument(skip(self))]
    pub async fn reconcile(&mut self) {
        for phase in Phase::ORDER {
            match phase {
                Phase::UnmountVolumes => self.unmount_volumes().await,
                Phase::MountAttachVolumes => self.mount_or_attach_volumes().await,
                Phase::UnmountDetachDevices => self.unmount_detach_devices().await,
                Phase::MergeReconstructed => self.merge_reconstructed(),
            }
        }
        self.time_of_last_sync = Some(Instant::now());
    }

    /// Phase 1: unmount every tracked `(pod, volume)` mount the desired
    /// state no longer lists, matching on SELinux context as part of the
    /// mount's identity.  Uncertain mounts are torn down like real ones.
    async fn unmount_volumes(&self) {
        for mounted in self.asw.all_mounted_volumes() {
            if self.dsw.pod_exists_in_volume(
                &mounted.pod_uid,
                &mounted.unique_name,
                mounted.selinux_context.as_deref(),
            ) {
                continue;
            }
            info!(
                volume = %mounted.unique_name,
                pod = %mounted.pod_uid,
                "pod no longer requires volume, unmounting",
            );
            let result = self.executor.unmount_volume(&mounted).await;
            log_dispatch("unmount", &mounted.unique_name, result);
        }
    }

    /// Phase 2: for every desired `(pod, volume)` pair, dispatch at most one
    /// operation based on the cache's status.  First match wins; a fully
    /// satisfied volume triggers nothing.
    async fn mount_or_attach_volumes(&self) {
        for volume in self.dsw.volumes_to_mount() {
            let status = self.asw.pod_volume_status(
                &volume.pod_uid,
                &volume.unique_name,
                volume.desired_size,
                volume.selinux_context.as_deref(),
            );
            match status {
                VolumeStatus::MismatchedContext { reason } => {
                    // Terminal until the conflicting mount is removed by
                    // phase 1 on a later tick; retrying the mount here would
                    // oscillate forever.
                    let msg = format!(
                        "volume {} cannot be mounted: SELinux context mismatch: {reason}",
                        volume.unique_name
                    );
                    warn!(volume = %volume.unique_name, pod = %volume.pod_uid, %reason,
                        "SELinux context mismatch, waiting for unmount");
                    self.dsw.add_error_to_pod(&volume.pod_uid, &msg);
                }
                VolumeStatus::NotAttached => self.attach_or_wait(&volume).await,
                VolumeStatus::NotMounted { .. } | VolumeStatus::Uncertain => {
                    self.mount(&volume, false).await;
                }
                VolumeStatus::RequiresRemount => self.mount(&volume, true).await,
                VolumeStatus::RequiresResize { current_size } => {
                    let result = self
                        .executor
                        .expand_in_use_volume(&volume, current_size)
                        .await;
                    log_dispatch("expand", &volume.unique_name, result);
                }
                VolumeStatus::Mounted => {}
            }
        }
    }

    /// Attach-wait sub-flow for a volume the cache reports as not attached.
    ///
    /// When attach/detach is controller-managed (or the volume is not
    /// attachable at all) the reconciler waits for the control plane to
    /// report the volume in use before verifying the attachment; acting
    /// earlier would race a freshly scheduled pod.  Otherwise the node
    /// attaches the volume itself.
    async fn attach_or_wait(&self, volume: &VolumeToMount) {
        if self.cfg.controller_attach_detach_enabled || !volume.spec.attachable {
            if !volume.reported_in_use {
                debug!(volume = %volume.unique_name, pod = %volume.pod_uid,
                    "volume not yet reported in use, waiting");
                return;
            }
            let result = self.executor.verify_controller_attached_volume(volume).await;
            log_dispatch("verify attached", &volume.unique_name, result);
        } else {
            let result = self.executor.attach_volume(volume).await;
            log_dispatch("attach", &volume.unique_name, result);
        }
    }

    /// Dispatch a mount.  `is_remount` only affects observability; the
    /// operation itself is idempotent.
    async fn mount(&self, volume: &VolumeToMount, is_remount: bool) {
        match self.executor.mount_volume(volume, is_remount).await {
            Ok(()) => {
                info!(volume = %volume.unique_name, pod = %volume.pod_uid, is_remount,
                    "mount dispatched");
            }
            Err(e) if e.is_expected() => {
                debug!(volume = %volume.unique_name, error = %e, "mount deferred");
            }
            Err(e) => {
                error!(volume = %volume.unique_name, pod = %volume.pod_uid, error = %e,
                    "mount failed");
            }
        }
    }

    /// Phase 3: for every attached volume with no remaining pod mounts that
    /// no pod desires and no operation is pending on: unmount its device
    /// mount first; once the device is unmounted, detach it (or mark it
    /// detached directly when this node owns attach/detach or the volume is
    /// not attachable).  Detaching a still-mounted device is unsafe, so the
    /// device unmount strictly precedes the detach.
    async fn unmount_detach_devices(&self) {
        for attached in self.asw.unmounted_volumes() {
            if self
                .dsw
                .volume_exists(&attached.unique_name, attached.selinux_context.as_deref())
            {
                continue;
            }
            if self.executor.is_operation_pending(&attached.unique_name, None) {
                debug!(volume = %attached.unique_name,
                    "operation pending, skipping device teardown");
                continue;
            }

            if attached.device_mount_state != VolumeMountState::NotMounted {
                let result = self.executor.unmount_device(&attached).await;
                log_dispatch("unmount device", &attached.unique_name, result);
            } else if self.cfg.controller_attach_detach_enabled && attached.spec.attachable {
                let result = self.executor.detach_volume(&attached).await;
                log_dispatch("detach", &attached.unique_name, result);
            } else {
                // This node owns attach/detach (or the plugin cannot attach
                // at all): no detach call is needed, just drop the record.
                self.asw.mark_volume_as_detached(&attached.unique_name);
                info!(volume = %attached.unique_name, "volume marked detached");
            }
        }
    }

    /// Phase 4: hand reconstructed volumes to the actual state cache.
    ///
    /// Each volume is merged at most once, after its attachment has been
    /// verified.  Pods are marked Uncertain, never Mounted: the truth must
    /// come from a later real reconciliation pass.
    fn merge_reconstructed(&mut self) {
        if self.skipped_during_reconstruction.is_empty() {
            return;
        }

        let ready: Vec<UniqueVolumeName> = self
            .skipped_during_reconstruction
            .keys()
            .filter(|name| self.asw.volume_exists(name))
            .cloned()
            .collect();

        for name in ready {
            let Some(info) = self.skipped_during_reconstruction.remove(&name) else {
                continue;
            };
            for reconstructed in info.pods.values() {
                if self
                    .asw
                    .check_and_mark_volume_uncertain_via_reconstruction(reconstructed)
                {
                    debug!(volume = %name, pod = %reconstructed.pod.uid,
                        "reconstructed pod mount marked uncertain");
                }
            }
            if let Some(path) = &info.device_mount_path {
                self.asw
                    .check_and_mark_device_uncertain_via_reconstruction(&name, path);
            }
            info!(volume = %name, pods = info.pods.len(),
                "reconstructed volume merged as uncertain");
        }
    }
}

/// Log an operation dispatch result with the error classification applied:
/// expected errors are debug-level, real failures are errors.
fn log_dispatch(op: &str, volume: &UniqueVolumeName, result: Result<(), VolumeError>) {
    match result {
        Ok(()) => debug!(%volume, op, "operation dispatched"),
        Err(e) if e.is_expected() => debug!(%volume, op, error = %e, "operation deferred"),
        Err(e) => error!(%volume, op, error = %e, "operation failed"),
    }
}
