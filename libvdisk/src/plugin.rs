//! The virtual-disk volume plugin.
//!
//! [`VDiskPlugin`] is the entry point the node agent registers.  It matches
//! specs carrying a [`DiskSource`](crate::types::DiskSource) and builds the
//! role objects ([`DiskMounter`], [`DiskUnmounter`], [`DiskProvisioner`],
//! [`DiskDeleter`]) that drive the injected
//! [`DiskManager`](crate::manager::DiskManager).
//!
//! All role objects built by one plugin share its key lock and its state
//! tracker, so mounts and unmounts of the same disk are serialized no matter
//! which pod they come from.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tracing::{debug, error};

use crate::config::{CONFIG, VDiskConfig};
use crate::error::VolumeError;
use crate::host::{VolumeHost, escape_qualified_name};
use crate::keymutex::KeyMutex;
use crate::manager::DiskManager;
use crate::mount::HostMounter;
use crate::mounter::{DiskMounter, DiskUnmounter};
use crate::provisioner::{DiskDeleter, DiskProvisioner};
use crate::state::{VolumeState, VolumeStates};
use crate::types::*;
use crate::volume::{
    DeletableVolumePlugin, Deleter, PersistentVolumePlugin, ProvisionableVolumePlugin,
    Provisioner, VolumeMounter, VolumePlugin, VolumeUnmounter,
};

/// Registered name of the plugin.
pub const PLUGIN_NAME: &str = "rk8s.io/vdisk";

/// Zero-argument factory used by the node agent to discover the plugins this
/// crate provides.
pub fn probe_volume_plugins() -> Vec<Arc<dyn VolumePlugin>> {
    vec![Arc::new(VDiskPlugin::new())]
}

/// Collaborators shared by every role object of one plugin.
#[derive(Clone)]
pub(crate) struct DiskContext {
    pub(crate) host: Arc<dyn VolumeHost>,
    pub(crate) manager: Arc<dyn DiskManager>,
    pub(crate) mounter: Arc<dyn HostMounter>,
    pub(crate) locks: Arc<KeyMutex>,
    pub(crate) states: Arc<VolumeStates>,
    pub(crate) config: VDiskConfig,
}

impl DiskContext {
    /// Node-wide plugin directory.
    pub(crate) fn plugin_dir(&self) -> PathBuf {
        self.host.get_plugin_dir(PLUGIN_NAME)
    }

    /// Node-global mount path of the attached device for `volume_id`.
    pub(crate) fn global_path(&self, volume_id: &VolumeId) -> PathBuf {
        self.plugin_dir()
            .join("mounts")
            .join(escape_qualified_name(&volume_id.0))
    }

    /// Pod-local mount path of `volume_name`.
    pub(crate) fn pod_volume_dir(&self, pod_uid: &PodUid, volume_name: &str) -> PathBuf {
        self.host
            .get_pod_volume_dir(pod_uid, &escape_qualified_name(PLUGIN_NAME), volume_name)
    }

    /// Lock key serializing SetUp and TearDown of one pod volume.
    pub(crate) fn pod_volume_key(pod_uid: &PodUid, volume_name: &str) -> String {
        format!("pod:{pod_uid}/{volume_name}")
    }

    /// Lock key serializing attach, detach and delete of one provider disk.
    pub(crate) fn volume_key(volume_id: &VolumeId) -> String {
        format!("volume:{volume_id}")
    }

    /// Identity sidecar written on mount so that an unmounter can resolve
    /// the provider volume from the pod and volume name alone.
    pub(crate) fn sidecar_path(&self, pod_uid: &PodUid, volume_name: &str) -> PathBuf {
        self.plugin_dir()
            .join("pods")
            .join(&pod_uid.0)
            .join(format!("{volume_name}.json"))
    }
}

/// Volume plugin for provider virtual disks.
pub struct VDiskPlugin {
    host: OnceLock<Arc<dyn VolumeHost>>,
    config: VDiskConfig,
    locks: Arc<KeyMutex>,
    states: Arc<VolumeStates>,
}

impl Default for VDiskPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl VDiskPlugin {
    /// Create a plugin using the process-wide [`CONFIG`].
    pub fn new() -> Self {
        Self::with_config(CONFIG.clone())
    }

    /// Create a plugin with an explicit configuration.
    pub fn with_config(config: VDiskConfig) -> Self {
        Self {
            host: OnceLock::new(),
            config,
            locks: Arc::new(KeyMutex::new()),
            states: Arc::new(VolumeStates::new()),
        }
    }

    /// Lifecycle state of `volume_id` as tracked by this plugin.
    pub fn volume_state(&self, volume_id: &VolumeId) -> VolumeState {
        self.states.state(volume_id)
    }

    fn context(&self) -> Result<DiskContext, VolumeError> {
        let host = self
            .host
            .get()
            .cloned()
            .ok_or_else(|| VolumeError::Internal(format!("plugin {PLUGIN_NAME} not initialized")))?;
        let manager = host.disk_manager().ok_or_else(|| {
            error!("disk provider not initialized properly");
            VolumeError::Internal("disk provider not initialized properly".to_owned())
        })?;
        Ok(DiskContext {
            mounter: host.mounter(),
            host,
            manager,
            locks: Arc::clone(&self.locks),
            states: Arc::clone(&self.states),
            config: self.config.clone(),
        })
    }

    /// Build a [`DiskMounter`] for `spec` in pod `pod_uid`.
    pub fn new_disk_mounter(
        &self,
        spec: &VolumeSpec,
        pod_uid: &PodUid,
    ) -> Result<DiskMounter, VolumeError> {
        let identity = VolumeIdentity::from_spec(spec)?;
        check_path_component("pod UID", &pod_uid.0)?;
        let ctx = self.context()?;
        debug!(volume = %identity.volume_name, volume_id = %identity.volume_id, %pod_uid, "new mounter");
        Ok(DiskMounter::new(ctx, identity, pod_uid.clone(), spec.read_only))
    }

    /// Build a [`DiskUnmounter`] for `volume_name` in pod `pod_uid`.
    pub fn new_disk_unmounter(
        &self,
        volume_name: &str,
        pod_uid: &PodUid,
    ) -> Result<DiskUnmounter, VolumeError> {
        check_path_component("volume name", volume_name)?;
        check_path_component("pod UID", &pod_uid.0)?;
        let ctx = self.context()?;
        Ok(DiskUnmounter::new(ctx, volume_name.to_owned(), pod_uid.clone()))
    }

    /// Build a [`DiskProvisioner`] for `options`.
    ///
    /// Empty access modes default to [`PersistentVolumePlugin::get_access_modes`].
    pub fn new_disk_provisioner(
        &self,
        mut options: VolumeOptions,
    ) -> Result<DiskProvisioner, VolumeError> {
        if options.capacity_bytes == 0 {
            return Err(VolumeError::InvalidSpec(
                "requested capacity must be positive".to_owned(),
            ));
        }
        if options.access_modes.is_empty() {
            options.access_modes = self.get_access_modes();
        }
        let ctx = self.context()?;
        Ok(DiskProvisioner::new(ctx, options))
    }

    /// Build a [`DiskDeleter`] for the persistent volume in `spec`.
    pub fn new_disk_deleter(&self, spec: &VolumeSpec) -> Result<DiskDeleter, VolumeError> {
        let source = match &spec.source {
            SpecSource::Persistent(pv) => pv.spec.vdisk.as_ref(),
            SpecSource::Inline(_) => None,
        }
        .ok_or_else(|| VolumeError::MissingSource(spec.name().to_owned()))?;
        if source.volume_id.0.is_empty() {
            return Err(VolumeError::InvalidSpec(format!(
                "volume {} has no provider volume ID",
                spec.name()
            )));
        }
        let identity = VolumeIdentity {
            volume_name: spec.name().to_owned(),
            volume_id: source.volume_id.clone(),
            fs_type: source.fs_type.clone(),
        };
        let ctx = self.context()?;
        Ok(DiskDeleter::new(ctx, identity))
    }
}

impl VolumePlugin for VDiskPlugin {
    fn init(&self, host: Arc<dyn VolumeHost>) -> Result<(), VolumeError> {
        self.host
            .set(host)
            .map_err(|_| VolumeError::Internal(format!("plugin {PLUGIN_NAME} already initialized")))
    }

    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        spec.disk_source().is_some()
    }

    fn new_mounter(
        &self,
        spec: &VolumeSpec,
        pod_uid: &PodUid,
    ) -> Result<Box<dyn VolumeMounter>, VolumeError> {
        Ok(Box::new(self.new_disk_mounter(spec, pod_uid)?))
    }

    fn new_unmounter(
        &self,
        volume_name: &str,
        pod_uid: &PodUid,
    ) -> Result<Box<dyn VolumeUnmounter>, VolumeError> {
        Ok(Box::new(self.new_disk_unmounter(volume_name, pod_uid)?))
    }

    fn as_provisionable(&self) -> Option<&dyn ProvisionableVolumePlugin> {
        Some(self)
    }

    fn as_deletable(&self) -> Option<&dyn DeletableVolumePlugin> {
        Some(self)
    }
}

impl PersistentVolumePlugin for VDiskPlugin {
    fn get_access_modes(&self) -> Vec<AccessMode> {
        vec![AccessMode::ReadWriteOnce]
    }
}

impl ProvisionableVolumePlugin for VDiskPlugin {
    fn new_provisioner(
        &self,
        options: VolumeOptions,
    ) -> Result<Box<dyn Provisioner>, VolumeError> {
        Ok(Box::new(self.new_disk_provisioner(options)?))
    }
}

impl DeletableVolumePlugin for VDiskPlugin {
    fn new_deleter(&self, spec: &VolumeSpec) -> Result<Box<dyn Deleter>, VolumeError> {
        Ok(Box::new(self.new_disk_deleter(spec)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str) -> DiskSource {
        DiskSource {
            volume_id: id.into(),
            fs_type: None,
        }
    }

    fn spec(inline: Option<DiskSource>, persistent: Option<DiskSource>) -> Vec<VolumeSpec> {
        let mut pv = PersistentVolume::default();
        pv.metadata.name = "pv".into();
        pv.spec.vdisk = persistent;
        vec![
            VolumeSpec::inline(InlineVolume {
                name: "vol".into(),
                vdisk: inline,
            }),
            VolumeSpec::from(pv),
        ]
    }

    #[test]
    fn can_support_either_branch() {
        let plugin = VDiskPlugin::with_config(VDiskConfig::default());
        let src = DiskSource::default();
        let specs = spec(Some(src.clone()), Some(src));
        assert!(specs.iter().all(|s| plugin.can_support(s)));

        let specs = spec(None, None);
        assert!(specs.iter().all(|s| !plugin.can_support(s)));
    }

    #[test]
    fn name_and_access_modes() {
        let plugin = VDiskPlugin::with_config(VDiskConfig::default());
        assert_eq!(plugin.name(), "rk8s.io/vdisk");
        assert_eq!(plugin.get_access_modes(), vec![AccessMode::ReadWriteOnce]);
        assert!(plugin.as_provisionable().is_some());
        assert!(plugin.as_deletable().is_some());
    }

    #[test]
    fn uninitialized_plugin_refuses_roles() {
        let plugin = VDiskPlugin::with_config(VDiskConfig::default());
        let specs = spec(Some(source("disk-1")), None);
        let err = plugin
            .new_disk_mounter(&specs[0], &PodUid::from("pod"))
            .err()
            .unwrap();
        assert!(matches!(err, VolumeError::Internal(_)));
    }

    #[test]
    fn invalid_spec_checked_before_host() {
        let plugin = VDiskPlugin::with_config(VDiskConfig::default());
        let specs = spec(None, None);
        let err = plugin
            .new_disk_mounter(&specs[0], &PodUid::from("pod"))
            .err()
            .unwrap();
        assert!(matches!(err, VolumeError::InvalidSpec(_)));

        let err = plugin.new_disk_deleter(&specs[1]).err().unwrap();
        assert_eq!(err, VolumeError::MissingSource("pv".into()));
    }

    #[test]
    fn unmounter_rejects_path_like_names() {
        let plugin = VDiskPlugin::with_config(VDiskConfig::default());
        let pod = PodUid::from("pod");
        for name in ["", "..", "../etc", "a/b"] {
            let err = plugin.new_disk_unmounter(name, &pod).err().unwrap();
            assert!(matches!(err, VolumeError::InvalidSpec(_)), "{name}");
        }
        let err = plugin.new_disk_unmounter("vol", &pod).err().unwrap();
        assert!(matches!(err, VolumeError::Internal(_)));
    }

    #[test]
    fn mounter_rejects_path_like_names() {
        let plugin = VDiskPlugin::with_config(VDiskConfig::default());
        let escaping = VolumeSpec::inline(InlineVolume {
            name: "../../../../escaped".into(),
            vdisk: Some(source("disk-1")),
        });
        let err = plugin
            .new_disk_mounter(&escaping, &PodUid::from("pod"))
            .err()
            .unwrap();
        assert!(matches!(err, VolumeError::InvalidSpec(_)));

        let specs = spec(Some(source("disk-1")), None);
        for pod in ["", "..", "../pod"] {
            let err = plugin
                .new_disk_mounter(&specs[0], &PodUid::from(pod))
                .err()
                .unwrap();
            assert!(matches!(err, VolumeError::InvalidSpec(_)), "{pod}");
            let err = plugin.new_disk_unmounter("vol", &PodUid::from(pod)).err().unwrap();
            assert!(matches!(err, VolumeError::InvalidSpec(_)), "{pod}");
        }
    }

    #[test]
    fn template_source_is_not_mountable() {
        let plugin = VDiskPlugin::with_config(VDiskConfig::default());
        let specs = spec(Some(DiskSource::default()), Some(DiskSource::default()));
        assert!(plugin.can_support(&specs[0]));
        let err = plugin
            .new_disk_mounter(&specs[0], &PodUid::from("pod"))
            .err()
            .unwrap();
        assert!(matches!(err, VolumeError::InvalidSpec(_)));
        let err = plugin.new_disk_deleter(&specs[1]).err().unwrap();
        assert!(matches!(err, VolumeError::InvalidSpec(_)));
    }

    #[test]
    fn probe_returns_one_plugin() {
        let plugins = probe_volume_plugins();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name(), PLUGIN_NAME);
    }
}
