//! Core types: volume identity, specs, persistent volumes and requests.
//!
//! These types form the data model shared by the plugin roles, the injected
//! [`DiskManager`](crate::manager::DiskManager) and the on-disk identity
//! sidecars.  They are all [`Serialize`]/[`Deserialize`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::VolumeError;

/// One kibibyte, the provider's smallest allocation unit.
pub const KIB: u64 = 1024;
/// One mebibyte.
pub const MIB: u64 = 1024 * KIB;
/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// Round `size_bytes` up to a whole number of `alloc_unit`s and return the
/// number of units.
///
/// ```
/// use libvdisk::{round_up_size, GIB, MIB};
/// assert_eq!(round_up_size(1500 * MIB, GIB), 2);
/// assert_eq!(round_up_size(GIB, GIB), 1);
/// ```
pub fn round_up_size(size_bytes: u64, alloc_unit: u64) -> u64 {
    size_bytes.div_ceil(alloc_unit)
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque handle of a disk in the provider's namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// UID of the pod that owns a mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodUid(pub String);

impl fmt::Display for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PodUid {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PodUid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Access mode & reclaim policy
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// What happens to the provider disk once its claim is released.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    /// Keep the disk for manual reclamation.
    Retain,
    /// Delete the disk through the plugin's deleter.
    #[default]
    Delete,
}

// ---------------------------------------------------------------------------
// Volume sources & specs
// ---------------------------------------------------------------------------

/// Provider-specific fields identifying a remote virtual disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DiskSource {
    /// Provider volume ID.
    pub volume_id: VolumeId,
    /// Filesystem type, e.g. `"ext4"`.  `None` leaves the choice to the
    /// disk manager.
    #[serde(default)]
    pub fs_type: Option<String>,
}

/// A volume declared inline in a pod spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InlineVolume {
    /// Pod-scoped volume name.
    pub name: String,
    /// Virtual-disk source, if this volume is a vdisk.
    #[serde(default)]
    pub vdisk: Option<DiskSource>,
}

/// Object metadata carried by a [`PersistentVolume`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    /// Object name.
    pub name: String,
    /// Labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Durable properties of a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PersistentVolumeSpec {
    /// Capacity in bytes.
    pub capacity_bytes: u64,
    /// Supported access modes.
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    /// Reclaim policy.
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
    /// Virtual-disk source, if this PV is a vdisk.
    #[serde(default)]
    pub vdisk: Option<DiskSource>,
}

/// Cluster-level persistent volume object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PersistentVolume {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Spec.
    pub spec: PersistentVolumeSpec,
}

/// Populated branch of a [`VolumeSpec`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SpecSource {
    /// Volume declared inline in the pod.
    Inline(InlineVolume),
    /// Volume backed by a persistent volume object.
    Persistent(PersistentVolume),
}

/// The volume a plugin is asked to handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Inline or persistent source.
    pub source: SpecSource,
    /// Whether the volume must be mounted read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeSpec {
    /// Spec for an inline pod volume.
    pub fn inline(volume: InlineVolume) -> Self {
        Self {
            source: SpecSource::Inline(volume),
            read_only: false,
        }
    }

    /// Spec for a persistent volume.
    pub fn persistent(pv: PersistentVolume, read_only: bool) -> Self {
        Self {
            source: SpecSource::Persistent(pv),
            read_only,
        }
    }

    /// Name of the volume: the inline volume name or the PV name.
    pub fn name(&self) -> &str {
        match &self.source {
            SpecSource::Inline(v) => &v.name,
            SpecSource::Persistent(pv) => &pv.metadata.name,
        }
    }

    /// Virtual-disk source of whichever branch is populated.
    pub fn disk_source(&self) -> Option<&DiskSource> {
        match &self.source {
            SpecSource::Inline(v) => v.vdisk.as_ref(),
            SpecSource::Persistent(pv) => pv.spec.vdisk.as_ref(),
        }
    }
}

impl From<PersistentVolume> for VolumeSpec {
    fn from(pv: PersistentVolume) -> Self {
        Self::persistent(pv, false)
    }
}

// ---------------------------------------------------------------------------
// Identity & requests
// ---------------------------------------------------------------------------

/// Identity of one volume as seen by the plugin roles.
///
/// `volume_id` is the only key ever handed to the provider; `volume_name`
/// only names the pod-local mount directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeIdentity {
    /// Pod-scoped volume name.
    pub volume_name: String,
    /// Provider volume ID.
    pub volume_id: VolumeId,
    /// Filesystem type, if specified.
    #[serde(default)]
    pub fs_type: Option<String>,
}

/// Reject values that cannot be used as a single path component under the
/// pod and plugin directories.
pub(crate) fn check_path_component(kind: &str, value: &str) -> Result<(), VolumeError> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\0']) {
        return Err(VolumeError::InvalidSpec(format!("invalid {kind} {value:?}")));
    }
    Ok(())
}

impl VolumeIdentity {
    /// Extract the identity from a spec, failing if neither branch carries a
    /// virtual-disk source, the source has no volume ID yet, or the volume
    /// name is not a plain path component.
    pub fn from_spec(spec: &VolumeSpec) -> Result<Self, VolumeError> {
        let source = spec.disk_source().ok_or_else(|| {
            VolumeError::InvalidSpec(format!("volume {} has no vdisk source", spec.name()))
        })?;
        if source.volume_id.0.is_empty() {
            return Err(VolumeError::InvalidSpec(format!(
                "volume {} has no provider volume ID",
                spec.name()
            )));
        }
        check_path_component("volume name", spec.name())?;
        Ok(Self {
            volume_name: spec.name().to_owned(),
            volume_id: source.volume_id.clone(),
            fs_type: source.fs_type.clone(),
        })
    }
}

/// Request handed to the disk manager to attach a disk to this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachRequest {
    /// Volume to attach.
    pub identity: VolumeIdentity,
    /// Pod the attach is performed for.
    pub pod_uid: PodUid,
    /// Node-global path where the attached device is expected to be
    /// mounted, e.g. `<plugin-dir>/mounts/<volume-id>`.
    pub global_path: PathBuf,
    /// Whether the device should be mounted read-only.
    pub read_only: bool,
}

/// Options for provisioning a new volume.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeOptions {
    /// Requested capacity in bytes.
    pub capacity_bytes: u64,
    /// Requested access modes.  Empty means the plugin defaults.
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    /// Reclaim policy for the resulting PV.
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
    /// Name of the PV to create.  Empty means generate one.
    #[serde(default)]
    pub pv_name: String,
    /// Claim the volume is provisioned for, used as a naming hint.
    #[serde(default)]
    pub pvc_name: String,
    /// Namespace of the claim.
    #[serde(default)]
    pub pvc_namespace: String,
    /// Storage-class parameters forwarded to the disk manager.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request handed to the disk manager to create a disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateVolumeRequest {
    /// Naming hint for the provider-side disk.
    pub name: String,
    /// Requested size in KiB.
    pub size_kib: u64,
    /// Requested access modes.
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    /// Storage-class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Result of a successful create: the new disk and its real size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionedDisk {
    /// Provider volume ID.
    pub volume_id: VolumeId,
    /// Allocated size in KiB, after the provider's rounding.
    pub size_kib: u64,
}

/// Static capabilities of a mounted volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeAttributes {
    /// Mounted read-only.
    pub read_only: bool,
    /// Ownership of the mount is managed by the node agent.
    pub managed: bool,
    /// The mount supports SELinux relabelling.
    pub supports_selinux: bool,
}
