//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use libvdisk::*;
use tokio::sync::{Barrier, Notify};

pub const TEST_VOLUME_ID: &str = "test-volume-name";

/// Install a `RUST_LOG`-driven subscriber once per test binary.
pub fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Fake mounter
// ---------------------------------------------------------------------------

/// One recorded mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub source: PathBuf,
    pub target: PathBuf,
    pub options: Vec<String>,
}

/// In-memory [`HostMounter`]; targets must exist on disk like with the real
/// syscalls.
#[derive(Default)]
pub struct FakeMounter {
    mounts: Mutex<Vec<MountPoint>>,
    pub fail_mount: Mutex<Option<String>>,
    pub unmount_calls: AtomicUsize,
}

impl FakeMounter {
    pub fn mounts(&self) -> Vec<MountPoint> {
        self.mounts.lock().unwrap().clone()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.mounts.lock().unwrap().iter().any(|m| m.target == target)
    }
}

#[async_trait]
impl HostMounter for FakeMounter {
    async fn is_likely_not_mount_point(&self, path: &Path) -> io::Result<bool> {
        tokio::fs::metadata(path).await?;
        Ok(!self.is_mounted(path))
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        _fs_type: Option<&str>,
        options: &[String],
    ) -> io::Result<()> {
        if let Some(reason) = self.fail_mount.lock().unwrap().clone() {
            return Err(io::Error::other(reason));
        }
        tokio::fs::metadata(target).await?;
        self.mounts.lock().unwrap().push(MountPoint {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options: options.to_vec(),
        });
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> io::Result<()> {
        self.unmount_calls.fetch_add(1, Ordering::SeqCst);
        let mut mounts = self.mounts.lock().unwrap();
        let before = mounts.len();
        mounts.retain(|m| m.target != target);
        if mounts.len() == before {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not mounted"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake disk manager
// ---------------------------------------------------------------------------

/// Scriptable [`DiskManager`].
pub struct FakeDiskManager {
    /// ID and KiB size returned by `create_volume`.
    pub created: (String, u64),
    /// Round requested sizes up to this many KiB instead of returning
    /// `created.1`.
    pub round_to_kib: Option<u64>,
    /// When set, `delete_volume` fails for any other ID.
    pub expect_delete_id: Option<String>,
    pub attach_error: Mutex<Option<ProviderError>>,
    pub detach_error: Mutex<Option<ProviderError>>,
    pub create_error: Mutex<Option<ProviderError>>,
    pub delete_error: Mutex<Option<ProviderError>>,
    /// Delete calls wait here until notified.
    pub delete_gate: Option<Arc<Notify>>,
    /// Attach calls wait here, to prove two attaches run concurrently.
    pub attach_barrier: Option<Arc<Barrier>>,
    pub attach_delay: Duration,

    pub attached: Mutex<HashSet<String>>,
    pub attach_requests: Mutex<Vec<AttachRequest>>,
    pub detached: Mutex<Vec<String>>,
    pub create_requests: Mutex<Vec<CreateVolumeRequest>>,
    pub deleted: Mutex<Vec<String>>,

    pub in_flight: Mutex<HashMap<String, usize>>,
    pub max_in_flight: AtomicUsize,
}

impl Default for FakeDiskManager {
    fn default() -> Self {
        Self {
            created: (TEST_VOLUME_ID.to_owned(), 1024 * 1024),
            round_to_kib: None,
            expect_delete_id: None,
            attach_error: Mutex::new(None),
            detach_error: Mutex::new(None),
            create_error: Mutex::new(None),
            delete_error: Mutex::new(None),
            delete_gate: None,
            attach_barrier: None,
            attach_delay: Duration::ZERO,
            attached: Mutex::new(HashSet::new()),
            attach_requests: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
            create_requests: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl FakeDiskManager {
    pub fn attach_count(&self) -> usize {
        self.attach_requests.lock().unwrap().len()
    }

    pub fn detach_count(&self) -> usize {
        self.detached.lock().unwrap().len()
    }
}

#[async_trait]
impl DiskManager for FakeDiskManager {
    async fn attach_disk(&self, req: &AttachRequest) -> Result<(), ProviderError> {
        let id = req.identity.volume_id.0.clone();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let n = in_flight.entry(id.clone()).or_default();
            *n += 1;
            self.max_in_flight.fetch_max(*n, Ordering::SeqCst);
        }
        if let Some(barrier) = &self.attach_barrier {
            barrier.wait().await;
        }
        if !self.attach_delay.is_zero() {
            tokio::time::sleep(self.attach_delay).await;
        }
        *self.in_flight.lock().unwrap().get_mut(&id).unwrap() -= 1;

        if let Some(e) = self.attach_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.attach_requests.lock().unwrap().push(req.clone());
        self.attached.lock().unwrap().insert(id);
        Ok(())
    }

    async fn detach_disk(&self, identity: &VolumeIdentity) -> Result<(), ProviderError> {
        if let Some(e) = self.detach_error.lock().unwrap().clone() {
            return Err(e);
        }
        if !self.attached.lock().unwrap().remove(&identity.volume_id.0) {
            return Err(ProviderError::Other(format!(
                "disk {} is not attached",
                identity.volume_id
            )));
        }
        self.detached.lock().unwrap().push(identity.volume_id.0.clone());
        Ok(())
    }

    async fn create_volume(
        &self,
        req: &CreateVolumeRequest,
    ) -> Result<ProvisionedDisk, ProviderError> {
        self.create_requests.lock().unwrap().push(req.clone());
        if let Some(e) = self.create_error.lock().unwrap().clone() {
            return Err(e);
        }
        let size_kib = match self.round_to_kib {
            Some(unit) => req.size_kib.div_ceil(unit) * unit,
            None => self.created.1,
        };
        Ok(ProvisionedDisk {
            volume_id: VolumeId(self.created.0.clone()),
            size_kib,
        })
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), ProviderError> {
        if let Some(gate) = &self.delete_gate {
            gate.notified().await;
        }
        if let Some(e) = self.delete_error.lock().unwrap().clone() {
            return Err(e);
        }
        if let Some(expected) = &self.expect_delete_id {
            if &volume_id.0 != expected {
                return Err(ProviderError::Other(format!(
                    "deleter got unexpected volume name: {volume_id}"
                )));
            }
        }
        self.deleted.lock().unwrap().push(volume_id.0.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A plugin initialized against a temp-dir host with fake collaborators.
pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub plugin: Arc<VDiskPlugin>,
    pub manager: Arc<FakeDiskManager>,
    pub mounter: Arc<FakeMounter>,
    pub host: Arc<LocalVolumeHost>,
}

impl Harness {
    pub fn new(manager: FakeDiskManager) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(manager);
        let mounter = Arc::new(FakeMounter::default());
        Self::with_parts(tmp, manager, mounter)
    }

    /// A second plugin instance over the same root and collaborators, as
    /// after a node agent restart.
    pub fn restarted(self) -> Self {
        Self::with_parts(self.tmp, self.manager, self.mounter)
    }

    fn with_parts(
        tmp: tempfile::TempDir,
        manager: Arc<FakeDiskManager>,
        mounter: Arc<FakeMounter>,
    ) -> Self {
        init_logger();
        let config = VDiskConfig {
            root_dir: tmp.path().to_path_buf(),
            ..VDiskConfig::default()
        };
        let host = Arc::new(LocalVolumeHost::from_config(
            &config,
            Arc::clone(&mounter) as Arc<dyn HostMounter>,
            Some(Arc::clone(&manager) as Arc<dyn DiskManager>),
        ));
        let plugin = Arc::new(VDiskPlugin::with_config(config));
        plugin
            .init(Arc::clone(&host) as Arc<dyn VolumeHost>)
            .expect("init plugin");
        Self {
            tmp,
            plugin,
            manager,
            mounter,
            host,
        }
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }
}

pub fn inline_spec(name: &str, volume_id: &str) -> VolumeSpec {
    VolumeSpec::inline(InlineVolume {
        name: name.to_owned(),
        vdisk: Some(DiskSource {
            volume_id: volume_id.into(),
            fs_type: Some("ext4".to_owned()),
        }),
    })
}

pub fn persistent_spec(name: &str, volume_id: &str) -> VolumeSpec {
    let mut pv = PersistentVolume::default();
    pv.metadata.name = name.to_owned();
    pv.spec.vdisk = Some(DiskSource {
        volume_id: volume_id.into(),
        fs_type: None,
    });
    VolumeSpec::from(pv)
}
