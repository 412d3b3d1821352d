//! Disk manager trait.
//!
//! A [`DiskManager`] is the provider-specific component that talks to the
//! cloud disk API.  The plugin never retries or times out these calls; that
//! policy belongs to the manager and to the controller loop around the node
//! agent.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::{AttachRequest, CreateVolumeRequest, ProvisionedDisk, VolumeId, VolumeIdentity};

/// Provider disk API, injected into the plugin through the
/// [`VolumeHost`](crate::host::VolumeHost).
#[async_trait]
pub trait DiskManager: Send + Sync {
    /// Attach the disk to this node and make it available at
    /// `req.global_path`.
    async fn attach_disk(&self, req: &AttachRequest) -> Result<(), ProviderError>;

    /// Detach the disk from this node.
    async fn detach_disk(&self, identity: &VolumeIdentity) -> Result<(), ProviderError>;

    /// Create a new disk.
    ///
    /// The returned size may be larger than requested when the provider
    /// rounds up to its allocation granularity.
    async fn create_volume(&self, req: &CreateVolumeRequest)
    -> Result<ProvisionedDisk, ProviderError>;

    /// Delete a disk.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), ProviderError>;
}
