//! Error types for the virtual-disk plugin.
//!
//! [`VolumeError`] is what every lifecycle operation returns to the node
//! agent.  [`ProviderError`] is what an injected [`DiskManager`] reports; the
//! plugin wraps it with the operation and volume it was acting on before it
//! leaves the crate, so callers never see a bare provider fault.
//!
//! [`DiskManager`]: crate::manager::DiskManager

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for volume lifecycle operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// The volume specification is malformed or does not belong to this
    /// plugin.
    #[error("invalid volume spec: {0}")]
    InvalidSpec(String),

    /// A persistent volume carries no virtual-disk source.
    #[error("persistent volume {0} has no vdisk source")]
    MissingSource(String),

    /// The provider failed to attach the disk to this node.
    #[error("attach of volume {volume_id} failed: {reason}")]
    AttachFailed {
        /// Provider volume ID.
        volume_id: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The disk is held by another node and must be released there first.
    #[error("volume {volume_id} is already attached to node {node}")]
    AlreadyAttachedElsewhere {
        /// Provider volume ID.
        volume_id: String,
        /// Node currently holding the disk.
        node: String,
    },

    /// The provider failed to detach the disk from this node.
    #[error("detach of volume {volume_id} failed: {reason}")]
    DetachFailed {
        /// Provider volume ID.
        volume_id: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The provider could not create a volume.
    #[error("provisioning {name} failed: {reason}")]
    ProvisionFailed {
        /// Requested volume name.
        name: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The provider could not delete a volume.
    #[error("delete of volume {volume_id} failed: {reason}")]
    DeleteFailed {
        /// Provider volume ID.
        volume_id: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The volume is still attached to a node and cannot be deleted.
    #[error("volume {0} is still attached")]
    StillAttached(String),

    /// The provider does not know the volume.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// A mount (or mount preparation) step failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount step failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VolumeError {
    /// Create a [`VolumeError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`VolumeError::MountFailed`] for `path`.
    pub fn mount<E: std::fmt::Display>(path: impl AsRef<std::path::Path>, e: E) -> Self {
        Self::MountFailed {
            path: path.as_ref().display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Create a [`VolumeError::UnmountFailed`] for `path`.
    pub fn unmount<E: std::fmt::Display>(path: impl AsRef<std::path::Path>, e: E) -> Self {
        Self::UnmountFailed {
            path: path.as_ref().display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Whether the caller may retry the same call unchanged.
    ///
    /// Provider and host filesystem faults are transient.  Spec errors never
    /// heal on their own, and state-precondition errors need the caller to
    /// reconcile (detach elsewhere, finish teardown) before trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AttachFailed { .. }
                | Self::DetachFailed { .. }
                | Self::ProvisionFailed { .. }
                | Self::DeleteFailed { .. }
                | Self::MountFailed { .. }
                | Self::UnmountFailed { .. }
        )
    }
}

/// Error reported by a [`DiskManager`](crate::manager::DiskManager)
/// implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider has no such volume.
    #[error("volume not found")]
    NotFound,

    /// The volume is attached somewhere and cannot be removed.
    #[error("volume in use")]
    InUse,

    /// The disk is attached to a different node.
    #[error("attached to node {node}")]
    AttachedElsewhere {
        /// Node currently holding the disk.
        node: String,
    },

    /// The provider refused to allocate more storage.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The provider endpoint could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Any other provider fault.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Create a [`ProviderError::Other`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn other<E: std::fmt::Display>(e: E) -> Self {
        Self::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = VolumeError::StillAttached("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 is still attached");

        let err = VolumeError::mount("/var/lib/rkl/pods/p/volumes/x", "permission denied");
        assert_eq!(
            err.to_string(),
            "mount failed at /var/lib/rkl/pods/p/volumes/x: permission denied"
        );
    }

    #[test]
    fn retry_classification() {
        assert!(
            VolumeError::AttachFailed {
                volume_id: "v".into(),
                reason: "timeout".into(),
            }
            .is_retryable()
        );
        assert!(VolumeError::unmount("/mnt", "busy").is_retryable());
        assert!(!VolumeError::InvalidSpec("no source".into()).is_retryable());
        assert!(!VolumeError::StillAttached("v".into()).is_retryable());
        assert!(
            !VolumeError::AlreadyAttachedElsewhere {
                volume_id: "v".into(),
                node: "node-02".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = VolumeError::DeleteFailed {
            volume_id: "vol-1".into(),
            reason: "provider timeout".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: VolumeError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, de);
    }
}
