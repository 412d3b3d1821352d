//! Provision and delete roles.
//!
//! [`DiskProvisioner`] asks the disk manager for a new disk and writes the
//! result back into a persistent volume; [`DiskDeleter`] removes the disk
//! behind a persistent volume once it is no longer attached to this node.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::error::{ProviderError, VolumeError};
use crate::plugin::DiskContext;
use crate::state::VolumeEvent;
use crate::types::*;
use crate::volume::{Deleter, Provisioner};

/// Annotation recording which provisioner created a persistent volume.
pub const ANNOTATION_CREATED_BY: &str = "rk8s.io/createdby";
/// Value of [`ANNOTATION_CREATED_BY`] for volumes created by this plugin.
pub const CREATED_BY: &str = "vdisk-dynamic-provisioner";

/// Creates provider disks for persistent volumes.
pub struct DiskProvisioner {
    ctx: DiskContext,
    options: VolumeOptions,
}

impl DiskProvisioner {
    pub(crate) fn new(ctx: DiskContext, options: VolumeOptions) -> Self {
        Self { ctx, options }
    }

    /// Options this provisioner was built with, after defaulting.
    pub fn options(&self) -> &VolumeOptions {
        &self.options
    }

    /// Provider-side naming hint: the claim when known, else the PV name.
    fn disk_name(&self, pv: &PersistentVolume) -> String {
        if self.options.pvc_name.is_empty() {
            pv.metadata.name.clone()
        } else if self.options.pvc_namespace.is_empty() {
            self.options.pvc_name.clone()
        } else {
            format!("{}-{}", self.options.pvc_namespace, self.options.pvc_name)
        }
    }
}

#[async_trait]
impl Provisioner for DiskProvisioner {
    fn new_persistent_volume_template(&self) -> Result<PersistentVolume, VolumeError> {
        let name = if self.options.pv_name.is_empty() {
            format!("pvc-{}", uuid::Uuid::new_v4())
        } else {
            self.options.pv_name.clone()
        };
        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name,
                labels: HashMap::new(),
                annotations: HashMap::from([(
                    ANNOTATION_CREATED_BY.to_owned(),
                    CREATED_BY.to_owned(),
                )]),
            },
            spec: PersistentVolumeSpec {
                capacity_bytes: self.options.capacity_bytes,
                access_modes: self.options.access_modes.clone(),
                reclaim_policy: self.options.reclaim_policy,
                vdisk: Some(DiskSource {
                    volume_id: VolumeId::default(),
                    fs_type: Some(self.ctx.config.default_fs_type.clone()),
                }),
            },
        })
    }

    #[instrument(skip(self, pv), fields(pv = %pv.metadata.name))]
    async fn provision(&self, pv: &mut PersistentVolume) -> Result<(), VolumeError> {
        let requested = if pv.spec.capacity_bytes > 0 {
            pv.spec.capacity_bytes
        } else {
            self.options.capacity_bytes
        };
        let req = CreateVolumeRequest {
            name: self.disk_name(pv),
            size_kib: round_up_size(requested, KIB),
            access_modes: self.options.access_modes.clone(),
            parameters: self.options.parameters.clone(),
        };

        let disk = self
            .ctx
            .manager
            .create_volume(&req)
            .await
            .map_err(|e| VolumeError::ProvisionFailed {
                name: req.name.clone(),
                reason: e.to_string(),
            })?;
        {
            let _guard = self
                .ctx
                .locks
                .lock(&DiskContext::volume_key(&disk.volume_id))
                .await;
            // A record that already says the disk exists needs no update;
            // failing here would orphan the disk just created.
            if let Err(e) = self
                .ctx
                .states
                .apply(&disk.volume_id, VolumeEvent::Provision)
            {
                warn!(volume_id = %disk.volume_id, error = %e, "provisioned volume had unexpected local state");
            }
        }

        let allocated = disk.size_kib.saturating_mul(KIB);
        if allocated != requested {
            info!(requested, allocated, "provider rounded capacity");
        }

        let source = pv.spec.vdisk.get_or_insert_with(|| DiskSource {
            volume_id: VolumeId::default(),
            fs_type: Some(self.ctx.config.default_fs_type.clone()),
        });
        source.volume_id = disk.volume_id.clone();
        pv.spec.capacity_bytes = allocated;

        info!(volume_id = %disk.volume_id, size_kib = disk.size_kib, "volume provisioned");
        Ok(())
    }
}

/// Deletes the provider disk behind a persistent volume.
pub struct DiskDeleter {
    ctx: DiskContext,
    identity: VolumeIdentity,
}

impl DiskDeleter {
    pub(crate) fn new(ctx: DiskContext, identity: VolumeIdentity) -> Self {
        Self { ctx, identity }
    }

    /// Identity of the volume to delete.
    pub fn identity(&self) -> &VolumeIdentity {
        &self.identity
    }
}

#[async_trait]
impl Deleter for DiskDeleter {
    #[instrument(skip(self), fields(volume_id = %self.identity.volume_id))]
    async fn delete(&self) -> Result<(), VolumeError> {
        let volume_id = &self.identity.volume_id;
        let _guard = self.ctx.locks.lock(&DiskContext::volume_key(volume_id)).await;

        // Never detach on the caller's behalf; an attached disk is the
        // caller's to reconcile.
        self.ctx.states.check(volume_id, VolumeEvent::Delete)?;

        self.ctx
            .manager
            .delete_volume(volume_id)
            .await
            .map_err(|e| match e {
                ProviderError::NotFound => VolumeError::VolumeNotFound(volume_id.to_string()),
                ProviderError::InUse => VolumeError::StillAttached(volume_id.to_string()),
                other => VolumeError::DeleteFailed {
                    volume_id: volume_id.to_string(),
                    reason: other.to_string(),
                },
            })?;

        self.ctx.states.apply(volume_id, VolumeEvent::Delete)?;
        info!("volume deleted");
        Ok(())
    }
}
