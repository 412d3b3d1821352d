//! Mount and unmount roles.
//!
//! [`DiskMounter::set_up_at`] runs under two key locks, always taken in the
//! same order: the pod volume (`pod_uid/volume_name`) and then the provider
//! disk (`volume_id`).
//!
//! 1. **Check**: an existing mount point at the target makes the call a
//!    no-op.
//! 2. **Attach**: the disk manager attaches the disk and mounts the device
//!    at the node-global path. The binding and identity sidecar are stored
//!    right away so a later teardown can always detach.
//! 3. **Bind**: the global path is bind-mounted into the pod directory.
//!
//! [`DiskUnmounter::tear_down_at`] reverses this and detaches the disk once
//! no other pod on the node binds it.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::{ProviderError, VolumeError};
use crate::mount::HostMounter;
use crate::plugin::DiskContext;
use crate::state::{VolumeEvent, VolumeState};
use crate::types::{AttachRequest, PodUid, VolumeAttributes, VolumeId, VolumeIdentity};
use crate::volume::{VolumeMounter, VolumeUnmounter};

const BIND_OPTION: &str = "bind";
const READ_ONLY_OPTION: &str = "ro";

/// Setgid bit applied to directories when a pod requests an fs group.
const SETGID: u32 = 0o2000;

/// `Ok(true)` when `dir` is a mount point.  A missing `dir` is not mounted.
async fn is_mount_point(mounter: &dyn HostMounter, dir: &Path) -> io::Result<bool> {
    match mounter.is_likely_not_mount_point(dir).await {
        Ok(not_mounted) => Ok(!not_mounted),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn attach_error(volume_id: &VolumeId, e: ProviderError) -> VolumeError {
    match e {
        ProviderError::AttachedElsewhere { node } => VolumeError::AlreadyAttachedElsewhere {
            volume_id: volume_id.to_string(),
            node,
        },
        other => VolumeError::AttachFailed {
            volume_id: volume_id.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Give group `gid` ownership of everything under `root` and set the setgid
/// bit on directories so new files inherit the group.  Symlinks are skipped.
fn set_volume_ownership(root: &Path, gid: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let gid = nix::unistd::Gid::from_raw(gid);
    let mut pending = vec![root.to_path_buf()];
    while let Some(path) = pending.pop() {
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            continue;
        }
        nix::unistd::chown(&path, None, Some(gid))?;
        if meta.is_dir() {
            let mut perms = meta.permissions();
            perms.set_mode(perms.mode() | SETGID);
            std::fs::set_permissions(&path, perms)?;
            for entry in std::fs::read_dir(&path)? {
                pending.push(entry?.path());
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DiskMounter
// ---------------------------------------------------------------------------

/// Attaches a disk and bind-mounts it into one pod.
pub struct DiskMounter {
    ctx: DiskContext,
    identity: VolumeIdentity,
    pod_uid: PodUid,
    read_only: bool,
}

impl DiskMounter {
    pub(crate) fn new(
        ctx: DiskContext,
        identity: VolumeIdentity,
        pod_uid: PodUid,
        read_only: bool,
    ) -> Self {
        Self {
            ctx,
            identity,
            pod_uid,
            read_only,
        }
    }

    /// Identity of the mounted volume.
    pub fn identity(&self) -> &VolumeIdentity {
        &self.identity
    }

    fn bind_options(&self) -> Vec<String> {
        let mut options = vec![BIND_OPTION.to_owned()];
        if self.read_only {
            options.push(READ_ONLY_OPTION.to_owned());
        }
        options
    }

    /// Record this pod's binding and identity sidecar, so that an unmounter
    /// can find and detach the disk even if the bind mount never happens.
    async fn record_binding(&self) -> Result<(), VolumeError> {
        self.ctx.states.bind(&self.identity, &self.pod_uid);

        let sidecar = self
            .ctx
            .sidecar_path(&self.pod_uid, &self.identity.volume_name);
        if let Some(parent) = sidecar.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VolumeError::mount(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&self.identity).map_err(VolumeError::internal)?;
        tokio::fs::write(&sidecar, json)
            .await
            .map_err(|e| VolumeError::mount(&sidecar, format!("write identity: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl VolumeMounter for DiskMounter {
    fn get_path(&self) -> PathBuf {
        self.ctx
            .pod_volume_dir(&self.pod_uid, &self.identity.volume_name)
    }

    fn get_attributes(&self) -> VolumeAttributes {
        VolumeAttributes {
            read_only: self.read_only,
            managed: !self.read_only,
            supports_selinux: true,
        }
    }

    #[instrument(skip(self), fields(volume_id = %self.identity.volume_id, pod_uid = %self.pod_uid))]
    async fn set_up_at(&self, dir: &Path, fs_group: Option<u32>) -> Result<(), VolumeError> {
        let volume_id = &self.identity.volume_id;
        let _pod_guard = self
            .ctx
            .locks
            .lock(&DiskContext::pod_volume_key(&self.pod_uid, &self.identity.volume_name))
            .await;
        let _volume_guard = self.ctx.locks.lock(&DiskContext::volume_key(volume_id)).await;

        if is_mount_point(self.ctx.mounter.as_ref(), dir)
            .await
            .map_err(|e| VolumeError::mount(dir, e))?
        {
            debug!(dir = %dir.display(), "target already mounted, assuming idempotent retry");
            // Covers mounts made before a restart that the tracker never saw.
            if self.ctx.states.state(volume_id) != VolumeState::Mounted {
                if !self.ctx.states.state(volume_id).is_attached() {
                    self.ctx.states.apply(volume_id, VolumeEvent::Attach)?;
                }
                self.ctx.states.apply(volume_id, VolumeEvent::Mount)?;
            }
            if self
                .ctx
                .states
                .lookup(&self.pod_uid, &self.identity.volume_name)
                .is_none()
            {
                self.record_binding().await?;
            }
            return Ok(());
        }

        self.ctx.states.check(volume_id, VolumeEvent::Attach)?;

        let global_path = self.ctx.global_path(volume_id);
        let req = AttachRequest {
            identity: self.identity.clone(),
            pod_uid: self.pod_uid.clone(),
            global_path: global_path.clone(),
            read_only: self.read_only,
        };
        self.ctx
            .manager
            .attach_disk(&req)
            .await
            .map_err(|e| attach_error(volume_id, e))?;
        if let Err(e) = self.ctx.states.apply(volume_id, VolumeEvent::Attach) {
            // An untracked attach would never be detached.
            if let Err(detach) = self.ctx.manager.detach_disk(&self.identity).await {
                warn!(error = %detach, "failed to roll back attach");
            }
            return Err(e);
        }
        info!(global_path = %global_path.display(), "disk attached");
        self.record_binding().await?;

        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(self.ctx.config.dir_mode)
            .create(dir)
            .await
            .map_err(|e| VolumeError::mount(dir, e))?;

        if let Err(e) = self
            .ctx
            .mounter
            .mount(&global_path, dir, None, &self.bind_options())
            .await
        {
            if let Err(rm) = tokio::fs::remove_dir(dir).await {
                warn!(dir = %dir.display(), error = %rm, "failed to clean up mount directory");
            }
            return Err(VolumeError::mount(dir, e));
        }
        self.ctx.states.apply(volume_id, VolumeEvent::Mount)?;

        if let Some(gid) = fs_group.filter(|_| !self.read_only) {
            let root = dir.to_path_buf();
            tokio::task::spawn_blocking(move || set_volume_ownership(&root, gid))
                .await
                .map_err(VolumeError::internal)?
                .map_err(|e| VolumeError::mount(dir, format!("set fs group {gid}: {e}")))?;
        }

        info!(
            dir = %dir.display(),
            read_only = self.read_only,
            "volume set up (bind-mount)",
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DiskUnmounter
// ---------------------------------------------------------------------------

/// Unmounts a volume from one pod and detaches the disk when unused.
pub struct DiskUnmounter {
    ctx: DiskContext,
    volume_name: String,
    pod_uid: PodUid,
}

impl DiskUnmounter {
    pub(crate) fn new(ctx: DiskContext, volume_name: String, pod_uid: PodUid) -> Self {
        Self {
            ctx,
            volume_name,
            pod_uid,
        }
    }

    /// Find the provider identity behind this pod's volume: first in the
    /// tracker, then in the identity sidecar left by a previous process or
    /// by a teardown whose detach failed.
    async fn resolve_identity(&self) -> Result<Option<VolumeIdentity>, VolumeError> {
        if let Some(identity) = self.ctx.states.lookup(&self.pod_uid, &self.volume_name) {
            return Ok(Some(identity));
        }

        let sidecar = self.ctx.sidecar_path(&self.pod_uid, &self.volume_name);
        let json = match tokio::fs::read_to_string(&sidecar).await {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VolumeError::Internal(format!(
                    "read identity {}: {e}",
                    sidecar.display()
                )));
            }
        };
        let identity: VolumeIdentity = serde_json::from_str(&json).map_err(|e| {
            VolumeError::Internal(format!("parse identity {}: {e}", sidecar.display()))
        })?;
        debug!(volume_id = %identity.volume_id, "identity recovered from sidecar");
        Ok(Some(identity))
    }

    async fn remove_sidecar(&self) {
        let sidecar = self.ctx.sidecar_path(&self.pod_uid, &self.volume_name);
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %sidecar.display(), error = %e, "failed to remove identity sidecar");
            }
        }
    }
}

#[async_trait]
impl VolumeUnmounter for DiskUnmounter {
    fn get_path(&self) -> PathBuf {
        self.ctx.pod_volume_dir(&self.pod_uid, &self.volume_name)
    }

    #[instrument(skip(self), fields(volume = %self.volume_name, pod_uid = %self.pod_uid))]
    async fn tear_down_at(&self, dir: &Path) -> Result<(), VolumeError> {
        let _pod_guard = self
            .ctx
            .locks
            .lock(&DiskContext::pod_volume_key(&self.pod_uid, &self.volume_name))
            .await;
        let identity = self.resolve_identity().await?;
        let _volume_guard = match &identity {
            Some(identity) => Some(
                self.ctx
                    .locks
                    .lock(&DiskContext::volume_key(&identity.volume_id))
                    .await,
            ),
            None => None,
        };
        if let Some(identity) = &identity {
            if self.ctx.states.lookup(&self.pod_uid, &self.volume_name).is_none() {
                self.ctx.states.restore(identity, &self.pod_uid);
            }
        }

        if is_mount_point(self.ctx.mounter.as_ref(), dir)
            .await
            .map_err(|e| VolumeError::unmount(dir, e))?
        {
            self.ctx
                .mounter
                .unmount(dir)
                .await
                .map_err(|e| VolumeError::unmount(dir, e))?;
            debug!(dir = %dir.display(), "bind mount removed");
        }

        match tokio::fs::remove_dir(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VolumeError::unmount(dir, format!("remove mount dir: {e}")));
            }
        }

        let Some(identity) = identity else {
            debug!("no identity recorded, nothing to detach");
            return Ok(());
        };
        let volume_id = &identity.volume_id;

        let remaining = self.ctx.states.unbind(&identity, &self.pod_uid);
        if remaining > 0 {
            debug!(%volume_id, remaining, "disk still mounted by other pods, skipping detach");
            self.remove_sidecar().await;
            return Ok(());
        }

        if self.ctx.states.state(volume_id) == VolumeState::Mounted {
            self.ctx.states.apply(volume_id, VolumeEvent::Unmount)?;
        }
        if self.ctx.states.state(volume_id).is_attached() {
            self.ctx
                .manager
                .detach_disk(&identity)
                .await
                .map_err(|e| VolumeError::DetachFailed {
                    volume_id: volume_id.to_string(),
                    reason: e.to_string(),
                })?;
            self.ctx.states.apply(volume_id, VolumeEvent::Detach)?;
            info!(%volume_id, "disk detached");
        }

        self.remove_sidecar().await;
        info!(dir = %dir.display(), "volume torn down");
        Ok(())
    }
}
