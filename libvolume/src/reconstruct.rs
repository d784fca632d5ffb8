//! Startup crash recovery: rebuild volume state from on-disk mount artifacts.
//!
//! After a restart the in-memory caches are empty, but mounts from the
//! previous process are still live on the node.  The [`Reconstructor`] scans
//! the per-pod volume directory layout, recovers a spec for each volume
//! through the operation executor, re-derives its [`UniqueVolumeName`], and
//! groups the results by volume so the reconciler can later merge them into
//! the actual state cache in Uncertain state.
//!
//! # On-disk layout
//!
//! ```text
//! <pods_root>/
//!   <pod-uid>/
//!     volumes/<escaped-plugin>/<volume-name>/          # filesystem mounts
//!     volume-devices/<escaped-plugin>/<volume-name>    # block device symlinks
//! ```
//!
//! Runs exactly once per process lifetime, in the window between process
//! start and desired-state population.  A single volume failing to
//! reconstruct never aborts the scan: it is counted and the volume is treated
//! as absent, which forces a later full mount rather than a false "already
//! mounted".

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::VolumeError;
use crate::executor::OperationExecutor;
use crate::plugin::{PluginRegistry, unescape_plugin_name};
use crate::types::{
    GlobalVolumeInfo, PodStub, PodUid, PodVolume, ReconstructedVolume, UniqueVolumeName,
    VolumeMode, unique_volume_name,
};

/// Subdirectory of a pod directory holding filesystem volume mounts.
pub const VOLUMES_DIR: &str = "volumes";
/// Subdirectory of a pod directory holding block device symlinks.
pub const VOLUME_DEVICES_DIR: &str = "volume-devices";

// ---------------------------------------------------------------------------
// Mounter seam
// ---------------------------------------------------------------------------

/// Minimal unmount capability used for orphan cleanup.
///
/// Injected so tests never need mount privileges; production uses
/// [`SystemMounter`].
pub trait Mounter: Send + Sync {
    /// Force-unmount the filesystem mounted at `path`.
    fn unmount(&self, path: &Path) -> Result<(), VolumeError>;
}

/// Production [`Mounter`] backed by `umount(2)`.
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn unmount(&self, path: &Path) -> Result<(), VolumeError> {
        nix::mount::umount(path).map_err(|e| VolumeError::UnmountFailed {
            volume: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Reconstructor
// ---------------------------------------------------------------------------

/// Outcome of one reconstruction scan.
#[derive(Default)]
pub struct ReconstructResult {
    /// Successfully reconstructed volumes, grouped by unique name.
    pub volumes: HashMap<UniqueVolumeName, GlobalVolumeInfo>,
    /// Volumes whose reconstruction failed and were treated as absent.
    pub failed: usize,
    /// Orphaned mounts (no matching plugin) that were force-unmounted.
    pub cleaned_orphans: usize,
}

/// Rebuilds volume state from the on-disk pod volume layout.
pub struct Reconstructor {
    pods_root: PathBuf,
    registry: Arc<PluginRegistry>,
    executor: Arc<dyn OperationExecutor>,
    mounter: Arc<dyn Mounter>,
}

impl Reconstructor {
    /// Create a reconstructor scanning `pods_root`.
    pub fn new(
        pods_root: impl Into<PathBuf>,
        registry: Arc<PluginRegistry>,
        executor: Arc<dyn OperationExecutor>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            pods_root: pods_root.into(),
            registry,
            executor,
            mounter,
        }
    }

    /// Scan the pod directories and rebuild per-volume state.
    ///
    /// Per-volume failures are isolated: they are logged, counted in
    /// [`ReconstructResult::failed`], and do not affect other volumes in the
    /// same scan.  Orphaned mounts with no matching plugin are
    /// force-unmounted immediately rather than handed to the reconciler,
    /// because an orphan with no identity cannot be tracked in any cache.
    #[instrument(skip(self), fields(pods_root = %self.pods_root.display()))]
    pub async fn reconstruct(&self) -> ReconstructResult {
        let mut result = ReconstructResult::default();

        let pod_volumes = match self.scan_pod_volumes().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to scan pod volume directories");
                return result;
            }
        };

        for pod_volume in pod_volumes {
            match self.reconstruct_volume(&pod_volume).await {
                Ok((reconstructed, device_mount_path)) => {
                    let entry = result
                        .volumes
                        .entry(reconstructed.unique_name.clone())
                        .or_insert_with(|| GlobalVolumeInfo {
                            unique_name: reconstructed.unique_name.clone(),
                            spec: reconstructed.spec.clone(),
                            plugin_name: reconstructed.plugin_name.clone(),
                            device_mount_path,
                            pods: HashMap::new(),
                        });
                    entry
                        .pods
                        .insert(reconstructed.pod.uid.clone(), reconstructed);
                }
                Err(VolumeError::PluginNotFound(plugin)) => {
                    self.cleanup_orphan(&pod_volume, &plugin, &mut result).await;
                }
                Err(e) => {
                    warn!(
                        pod = %pod_volume.pod_uid,
                        volume = %pod_volume.volume_spec_name,
                        error = %e,
                        "volume reconstruction failed, treating as absent",
                    );
                    result.failed += 1;
                }
            }
        }

        info!(
            volumes = result.volumes.len(),
            failed = result.failed,
            orphans = result.cleaned_orphans,
            "reconstruction complete",
        );
        result
    }

    /// Enumerate the per-pod volume directories, yielding records with only
    /// path-derived metadata.
    async fn scan_pod_volumes(&self) -> Result<Vec<PodVolume>, VolumeError> {
        let mut found = Vec::new();

        let mut pods = match tokio::fs::read_dir(&self.pods_root).await {
            Ok(d) => d,
            // A missing root simply means no pods ever ran on this node.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(VolumeError::io(self.pods_root.display().to_string(), e)),
        };

        while let Some(pod_entry) = pods
            .next_entry()
            .await
            .map_err(|e| VolumeError::io(self.pods_root.display().to_string(), e))?
        {
            let Some(pod_uid) = pod_entry.file_name().to_str().map(PodUid::from) else {
                continue;
            };
            let pod_dir = pod_entry.path();
            if !pod_dir.is_dir() {
                continue;
            }

            self.scan_tree(
                &pod_dir.join(VOLUMES_DIR),
                &pod_uid,
                VolumeMode::Filesystem,
                &mut found,
            )
            .await?;
            self.scan_tree(
                &pod_dir.join(VOLUME_DEVICES_DIR),
                &pod_uid,
                VolumeMode::Block,
                &mut found,
            )
            .await?;
        }

        debug!(count = found.len(), "pod volume scan finished");
        Ok(found)
    }

    /// Scan one `volumes/` or `volume-devices/` subtree of a pod directory.
    async fn scan_tree(
        &self,
        root: &Path,
        pod_uid: &PodUid,
        mode: VolumeMode,
        found: &mut Vec<PodVolume>,
    ) -> Result<(), VolumeError> {
        let mut plugins = match tokio::fs::read_dir(root).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(VolumeError::io(root.display().to_string(), e)),
        };

        while let Some(plugin_entry) = plugins
            .next_entry()
            .await
            .map_err(|e| VolumeError::io(root.display().to_string(), e))?
        {
            let Some(escaped) = plugin_entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let plugin_name = unescape_plugin_name(&escaped);
            let plugin_dir = plugin_entry.path();

            let mut volumes = match tokio::fs::read_dir(&plugin_dir).await {
                Ok(d) => d,
                Err(e) => return Err(VolumeError::io(plugin_dir.display().to_string(), e)),
            };

            while let Some(volume_entry) = volumes
                .next_entry()
                .await
                .map_err(|e| VolumeError::io(plugin_dir.display().to_string(), e))?
            {
                let Some(name) = volume_entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                found.push(PodVolume {
                    pod_uid: pod_uid.clone(),
                    volume_spec_name: name,
                    volume_path: volume_entry.path(),
                    plugin_name: plugin_name.clone(),
                    mode,
                });
            }
        }
        Ok(())
    }

    /// Rebuild one volume from its on-disk record.
    ///
    /// Returns the reconstructed volume and, for device-mountable specs, the
    /// plugin's node-global mount path used later when the device is marked
    /// uncertain.
    async fn reconstruct_volume(
        &self,
        pod_volume: &PodVolume,
    ) -> Result<(ReconstructedVolume, Option<PathBuf>), VolumeError> {
        let plugin = self
            .registry
            .lookup(&pod_volume.plugin_name)
            .ok_or_else(|| VolumeError::PluginNotFound(pod_volume.plugin_name.clone()))?;

        let recovered = self.executor.reconstruct_volume(pod_volume).await?;
        let spec = recovered.spec;

        // A block-mode on-disk record whose recovered spec is not block-mode
        // has no usable mapper; the inverse mismatch is equally unusable.
        if spec.mode != pod_volume.mode {
            return Err(VolumeError::ReconstructFailed {
                path: pod_volume.volume_path.display().to_string(),
                reason: format!(
                    "volume mode {:?} does not match on-disk record {:?}",
                    spec.mode, pod_volume.mode
                ),
            });
        }

        // The expected artifact must actually exist: a directory for
        // filesystem mounts, a symlink for block device maps.
        match pod_volume.mode {
            VolumeMode::Filesystem => {
                let meta = tokio::fs::metadata(&pod_volume.volume_path)
                    .await
                    .map_err(|_| {
                        VolumeError::PathNotFound(pod_volume.volume_path.display().to_string())
                    })?;
                if !meta.is_dir() {
                    return Err(VolumeError::PathNotFound(
                        pod_volume.volume_path.display().to_string(),
                    ));
                }
            }
            VolumeMode::Block => {
                let meta = tokio::fs::symlink_metadata(&pod_volume.volume_path)
                    .await
                    .map_err(|_| {
                        VolumeError::PathNotFound(pod_volume.volume_path.display().to_string())
                    })?;
                if !meta.file_type().is_symlink() {
                    return Err(VolumeError::PathNotFound(
                        pod_volume.volume_path.display().to_string(),
                    ));
                }
            }
        }

        // Identity comes from the recovered spec, not the plugin name alone:
        // whether the volume is shared across pods depends on spec contents.
        let unique_name = unique_volume_name(&spec, plugin.name(), Some(&pod_volume.pod_uid));
        let device_mount_path = plugin.global_mount_path(&spec);

        debug!(
            pod = %pod_volume.pod_uid,
            volume = %unique_name,
            mode = ?pod_volume.mode,
            "volume reconstructed",
        );

        Ok((
            ReconstructedVolume {
                unique_name,
                pod: PodStub {
                    uid: pod_volume.pod_uid.clone(),
                    reconstructed: true,
                },
                spec,
                plugin_name: pod_volume.plugin_name.clone(),
                volume_spec_name: pod_volume.volume_spec_name.clone(),
                volume_path: pod_volume.volume_path.clone(),
                selinux_context: recovered.selinux_context,
                device_path: None,
            },
            device_mount_path,
        ))
    }

    /// Force-unmount a mount that matches no registered plugin.
    ///
    /// Deferring this to the reconciler is not possible: without a plugin
    /// there is no identity to track the mount under in any cache.
    async fn cleanup_orphan(
        &self,
        pod_volume: &PodVolume,
        plugin: &str,
        result: &mut ReconstructResult,
    ) {
        warn!(
            pod = %pod_volume.pod_uid,
            path = %pod_volume.volume_path.display(),
            plugin,
            "orphaned mount with no matching plugin, force-unmounting",
        );

        match self.executor.check_volume_existence(pod_volume).await {
            Ok(true) => match self.mounter.unmount(&pod_volume.volume_path) {
                Ok(()) => result.cleaned_orphans += 1,
                Err(e) => {
                    warn!(path = %pod_volume.volume_path.display(), error = %e,
                        "failed to unmount orphaned mount");
                    result.failed += 1;
                }
            },
            Ok(false) => {
                // Nothing mounted; the leftover directory is harmless.
                result.cleaned_orphans += 1;
            }
            Err(e) => {
                warn!(path = %pod_volume.volume_path.display(), error = %e,
                    "failed to check orphaned mount");
                result.failed += 1;
            }
        }
    }
}
