//! Volume host: the node agent's side of the plugin contract.
//!
//! The host owns the on-disk layout and hands the plugin its collaborators.
//!
//! # On-disk layout
//!
//! ```text
//! <root_dir>/
//!   plugins/<escaped-plugin-name>/           # per-plugin state
//!     mounts/<volume-id>                     # node-global device mount
//!     pods/<pod-uid>/<volume-name>.json      # identity sidecar
//!   pods/<pod-uid>/volumes/<escaped-plugin-name>/<volume-name>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::VDiskConfig;
use crate::manager::DiskManager;
use crate::mount::HostMounter;
use crate::types::PodUid;

/// Make a qualified plugin name (`vendor/name`) safe to use as a single path
/// component by replacing `/` with `~`.
pub fn escape_qualified_name(name: &str) -> String {
    name.replace('/', "~")
}

/// Services the node agent provides to a volume plugin.
pub trait VolumeHost: Send + Sync {
    /// Directory for the plugin's node-wide state.
    fn get_plugin_dir(&self, plugin_name: &str) -> PathBuf;

    /// Directory where `volume_name` of pod `pod_uid` is mounted.
    /// `escaped_plugin_name` must already be passed through
    /// [`escape_qualified_name`].
    fn get_pod_volume_dir(
        &self,
        pod_uid: &PodUid,
        escaped_plugin_name: &str,
        volume_name: &str,
    ) -> PathBuf;

    /// Mount capability of this host.
    fn mounter(&self) -> Arc<dyn HostMounter>;

    /// Provider disk manager, if a provider is configured on this node.
    fn disk_manager(&self) -> Option<Arc<dyn DiskManager>>;
}

/// [`VolumeHost`] backed by a local root directory.
#[derive(Clone)]
pub struct LocalVolumeHost {
    root_dir: PathBuf,
    mounter: Arc<dyn HostMounter>,
    disk_manager: Option<Arc<dyn DiskManager>>,
}

impl LocalVolumeHost {
    /// Create a host rooted at `root_dir`.
    pub fn new(
        root_dir: impl Into<PathBuf>,
        mounter: Arc<dyn HostMounter>,
        disk_manager: Option<Arc<dyn DiskManager>>,
    ) -> Self {
        Self {
            root_dir: root_dir.into(),
            mounter,
            disk_manager,
        }
    }

    /// Create a host rooted at the configured [`VDiskConfig::root_dir`].
    pub fn from_config(
        config: &VDiskConfig,
        mounter: Arc<dyn HostMounter>,
        disk_manager: Option<Arc<dyn DiskManager>>,
    ) -> Self {
        Self::new(config.root_dir.clone(), mounter, disk_manager)
    }

    /// Root directory of this host.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

impl VolumeHost for LocalVolumeHost {
    fn get_plugin_dir(&self, plugin_name: &str) -> PathBuf {
        self.root_dir
            .join("plugins")
            .join(escape_qualified_name(plugin_name))
    }

    fn get_pod_volume_dir(
        &self,
        pod_uid: &PodUid,
        escaped_plugin_name: &str,
        volume_name: &str,
    ) -> PathBuf {
        self.root_dir
            .join("pods")
            .join(&pod_uid.0)
            .join("volumes")
            .join(escaped_plugin_name)
            .join(volume_name)
    }

    fn mounter(&self) -> Arc<dyn HostMounter> {
        Arc::clone(&self.mounter)
    }

    fn disk_manager(&self) -> Option<Arc<dyn DiskManager>> {
        self.disk_manager.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::SystemMounter;

    #[test]
    fn escapes_slashes() {
        assert_eq!(escape_qualified_name("rk8s.io/vdisk"), "rk8s.io~vdisk");
        assert_eq!(escape_qualified_name("plain"), "plain");
    }

    #[test]
    fn layout() {
        let host = LocalVolumeHost::new("/var/lib/rkl", Arc::new(SystemMounter), None);
        assert_eq!(
            host.get_plugin_dir("rk8s.io/vdisk"),
            PathBuf::from("/var/lib/rkl/plugins/rk8s.io~vdisk")
        );
        assert_eq!(
            host.get_pod_volume_dir(&PodUid::from("poduid"), "rk8s.io~vdisk", "data"),
            PathBuf::from("/var/lib/rkl/pods/poduid/volumes/rk8s.io~vdisk/data")
        );
        assert!(host.disk_manager().is_none());
    }

    #[test]
    fn rooted_at_configured_dir() {
        let config = VDiskConfig::from_lookup(|key| {
            (key == "VDISK_ROOT_DIR").then(|| "/srv/rkl".to_owned())
        });
        let host = LocalVolumeHost::from_config(&config, Arc::new(SystemMounter), None);
        assert_eq!(host.root_dir(), Path::new("/srv/rkl"));
        assert_eq!(
            host.get_plugin_dir("rk8s.io/vdisk"),
            PathBuf::from("/srv/rkl/plugins/rk8s.io~vdisk")
        );
    }
}
