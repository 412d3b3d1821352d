//! Volume plugin role traits.
//!
//! The node agent drives a plugin through these traits:
//!
//! 1. **Match**: [`VolumePlugin::can_support`] routes a spec to a plugin.
//! 2. **Mount**: [`VolumeMounter::set_up`] attaches the disk and
//!    bind-mounts it into the pod.
//! 3. **Unmount**: [`VolumeUnmounter::tear_down`] reverses the mount and
//!    detaches the disk once no pod uses it.
//! 4. **Provision / Delete**: [`Provisioner`] and [`Deleter`] create and
//!    remove provider disks for persistent volumes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::VolumeError;
use crate::host::VolumeHost;
use crate::types::{AccessMode, PersistentVolume, PodUid, VolumeAttributes, VolumeOptions, VolumeSpec};

/// A volume plugin registered with the node agent.
pub trait VolumePlugin: Send + Sync {
    /// Hand the plugin its host.  Called once by the registry.
    fn init(&self, host: Arc<dyn VolumeHost>) -> Result<(), VolumeError>;

    /// Stable plugin name, e.g. `"rk8s.io/vdisk"`.
    fn name(&self) -> &str;

    /// Whether this plugin handles `spec`.  Pure and total.
    fn can_support(&self, spec: &VolumeSpec) -> bool;

    /// Build a mounter for `spec` in pod `pod_uid`.
    fn new_mounter(
        &self,
        spec: &VolumeSpec,
        pod_uid: &PodUid,
    ) -> Result<Box<dyn VolumeMounter>, VolumeError>;

    /// Build an unmounter for `volume_name` in pod `pod_uid`.
    fn new_unmounter(
        &self,
        volume_name: &str,
        pod_uid: &PodUid,
    ) -> Result<Box<dyn VolumeUnmounter>, VolumeError>;

    /// This plugin as a provisioner factory, if it can provision.
    fn as_provisionable(&self) -> Option<&dyn ProvisionableVolumePlugin> {
        None
    }

    /// This plugin as a deleter factory, if it can delete.
    fn as_deletable(&self) -> Option<&dyn DeletableVolumePlugin> {
        None
    }
}

/// A plugin whose volumes can back persistent volumes.
pub trait PersistentVolumePlugin: VolumePlugin {
    /// Access modes the plugin's volumes support.
    fn get_access_modes(&self) -> Vec<AccessMode>;
}

/// A plugin that can create provider disks.
pub trait ProvisionableVolumePlugin: Send + Sync {
    /// Build a provisioner for `options`.
    fn new_provisioner(&self, options: VolumeOptions)
    -> Result<Box<dyn Provisioner>, VolumeError>;
}

/// A plugin that can delete provider disks.
pub trait DeletableVolumePlugin: Send + Sync {
    /// Build a deleter for the persistent volume in `spec`.
    fn new_deleter(&self, spec: &VolumeSpec) -> Result<Box<dyn Deleter>, VolumeError>;
}

/// Mounts one volume into one pod.
#[async_trait]
pub trait VolumeMounter: Send + Sync {
    /// Pod-local directory the volume is mounted at.
    fn get_path(&self) -> PathBuf;

    /// Static capabilities of the mount.
    fn get_attributes(&self) -> VolumeAttributes;

    /// Attach and mount at [`Self::get_path`].
    ///
    /// Idempotent: calling it on an already-mounted volume succeeds
    /// without mounting again.  `fs_group`, when given, becomes the group
    /// owner of the volume contents.
    async fn set_up(&self, fs_group: Option<u32>) -> Result<(), VolumeError> {
        self.set_up_at(&self.get_path(), fs_group).await
    }

    /// Attach and mount at `dir`.
    async fn set_up_at(&self, dir: &Path, fs_group: Option<u32>) -> Result<(), VolumeError>;
}

/// Unmounts one volume from one pod.
#[async_trait]
pub trait VolumeUnmounter: Send + Sync {
    /// Pod-local directory the volume is mounted at.
    fn get_path(&self) -> PathBuf;

    /// Unmount from [`Self::get_path`] and detach if unused.
    ///
    /// Idempotent, succeeds when nothing is mounted.
    async fn tear_down(&self) -> Result<(), VolumeError> {
        self.tear_down_at(&self.get_path()).await
    }

    /// Unmount from `dir` and detach if unused.
    async fn tear_down_at(&self, dir: &Path) -> Result<(), VolumeError>;
}

/// Creates a provider disk and fills in a persistent volume for it.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Default-valued persistent volume for the orchestrator to complete.
    fn new_persistent_volume_template(&self) -> Result<PersistentVolume, VolumeError>;

    /// Create the disk and write its identity and real capacity into `pv`.
    async fn provision(&self, pv: &mut PersistentVolume) -> Result<(), VolumeError>;
}

/// Deletes the provider disk behind a persistent volume.
#[async_trait]
pub trait Deleter: Send + Sync {
    /// Delete the disk.
    async fn delete(&self) -> Result<(), VolumeError>;
}
