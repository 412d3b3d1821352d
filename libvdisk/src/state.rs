//! Volume lifecycle state machine.
//!
//! ```text
//! Unprovisioned -> Provisioned -> Attached -> Mounted
//!                  ^                 ^           |
//!                  |                 |           v
//!                  +-- Deleted <- Detached <- Unmounted
//! ```
//!
//! Every event moves at most one edge.  [`VolumeStates`] tracks the state of
//! each volume this node has touched together with the pod mounts (bindings)
//! that reference it; volumes the node has never seen are assumed to be
//! [`VolumeState::Provisioned`], since they exist on the provider side.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::VolumeError;
use crate::types::{PodUid, VolumeId, VolumeIdentity};

/// Lifecycle state of one volume, from this node's point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VolumeState {
    /// No provider disk exists yet.
    Unprovisioned,
    /// Disk exists and is not attached here.
    Provisioned,
    /// Disk is attached to this node but not bind-mounted into any pod.
    Attached,
    /// Disk is bind-mounted into at least one pod.
    Mounted,
    /// Last pod mount was removed; disk is still attached.
    Unmounted,
    /// Disk was detached from this node.
    Detached,
    /// Disk was deleted on the provider side.
    Deleted,
}

/// Lifecycle event applied to a [`VolumeState`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeEvent {
    /// Disk created by the provider.
    Provision,
    /// Disk attached to this node.
    Attach,
    /// Disk bind-mounted into a pod.
    Mount,
    /// Last pod mount removed.
    Unmount,
    /// Disk detached from this node.
    Detach,
    /// Disk deleted by the provider.
    Delete,
}

impl VolumeState {
    /// Whether the disk is attached to this node in this state.
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Attached | Self::Mounted | Self::Unmounted)
    }

    /// Apply `event`, returning the next state or the precondition error.
    ///
    /// Re-attaching an attached disk and re-mounting a mounted one are
    /// self-edges, so retried SetUp calls stay legal.
    pub fn transition(self, event: VolumeEvent, volume_id: &VolumeId) -> Result<Self, VolumeError> {
        use VolumeEvent as E;
        use VolumeState as S;

        let next = match (self, event) {
            // Providers may hand out a deleted disk's ID again.
            (S::Unprovisioned | S::Deleted, E::Provision) => S::Provisioned,

            (S::Provisioned | S::Detached | S::Attached | S::Unmounted, E::Attach) => S::Attached,
            (S::Mounted, E::Attach) => S::Mounted,
            (S::Unprovisioned | S::Deleted, E::Attach) => {
                return Err(VolumeError::VolumeNotFound(volume_id.to_string()));
            }

            (S::Attached | S::Unmounted | S::Mounted, E::Mount) => S::Mounted,

            (S::Mounted, E::Unmount) => S::Unmounted,

            (S::Attached | S::Unmounted, E::Detach) => S::Detached,

            (S::Provisioned | S::Detached, E::Delete) => S::Deleted,
            (s, E::Delete) if s.is_attached() => {
                return Err(VolumeError::StillAttached(volume_id.to_string()));
            }
            (S::Unprovisioned | S::Deleted, E::Delete) => {
                return Err(VolumeError::VolumeNotFound(volume_id.to_string()));
            }

            (from, event) => {
                return Err(VolumeError::Internal(format!(
                    "volume {volume_id}: illegal {event:?} in state {from:?}"
                )));
            }
        };
        Ok(next)
    }
}

/// A pod mount of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    pod_uid: PodUid,
    volume_name: String,
}

#[derive(Debug)]
struct VolumeRecord {
    state: VolumeState,
    bindings: HashSet<Binding>,
}

/// Node-local tracker of volume states and pod bindings.
///
/// # Thread safety
///
/// Both maps are [`DashMap`]s; callers serialize per-volume sequences with
/// the plugin's key lock, the tracker only guarantees each call is atomic.
#[derive(Debug, Default)]
pub struct VolumeStates {
    volumes: DashMap<VolumeId, VolumeRecord>,
    bindings: DashMap<(PodUid, String), VolumeIdentity>,
}

impl VolumeStates {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `volume_id`.
    pub fn state(&self, volume_id: &VolumeId) -> VolumeState {
        self.volumes
            .get(volume_id)
            .map(|r| r.state)
            .unwrap_or(VolumeState::Provisioned)
    }

    /// Check that `event` is legal for `volume_id` without applying it.
    pub fn check(&self, volume_id: &VolumeId, event: VolumeEvent) -> Result<VolumeState, VolumeError> {
        self.state(volume_id).transition(event, volume_id)
    }

    /// Apply `event` to `volume_id` and return the new state.
    pub fn apply(&self, volume_id: &VolumeId, event: VolumeEvent) -> Result<VolumeState, VolumeError> {
        let initial = if event == VolumeEvent::Provision {
            VolumeState::Unprovisioned
        } else {
            VolumeState::Provisioned
        };
        let mut record = self
            .volumes
            .entry(volume_id.clone())
            .or_insert_with(|| VolumeRecord {
                state: initial,
                bindings: HashSet::new(),
            });
        let next = record.state.transition(event, volume_id)?;
        debug!(%volume_id, from = ?record.state, to = ?next, ?event, "volume state");
        record.state = next;
        Ok(next)
    }

    /// Record that pod `pod_uid` mounts `identity`.
    pub fn bind(&self, identity: &VolumeIdentity, pod_uid: &PodUid) {
        self.bindings.insert(
            (pod_uid.clone(), identity.volume_name.clone()),
            identity.clone(),
        );
        if let Some(mut record) = self.volumes.get_mut(&identity.volume_id) {
            record.bindings.insert(Binding {
                pod_uid: pod_uid.clone(),
                volume_name: identity.volume_name.clone(),
            });
        }
    }

    /// Re-register a mount discovered on disk (e.g. from an identity
    /// sidecar after a restart) as mounted by pod `pod_uid`.
    pub fn restore(&self, identity: &VolumeIdentity, pod_uid: &PodUid) {
        {
            let mut record = self
                .volumes
                .entry(identity.volume_id.clone())
                .or_insert_with(|| VolumeRecord {
                    state: VolumeState::Mounted,
                    bindings: HashSet::new(),
                });
            if !record.state.is_attached() {
                record.state = VolumeState::Mounted;
            }
        }
        self.bind(identity, pod_uid);
    }

    /// Identity mounted by pod `pod_uid` under `volume_name`, if known.
    pub fn lookup(&self, pod_uid: &PodUid, volume_name: &str) -> Option<VolumeIdentity> {
        self.bindings
            .get(&(pod_uid.clone(), volume_name.to_owned()))
            .map(|r| r.clone())
    }

    /// Remove the binding of `identity` from pod `pod_uid` and return how
    /// many pods on this node still mount the same volume.
    pub fn unbind(&self, identity: &VolumeIdentity, pod_uid: &PodUid) -> usize {
        self.bindings
            .remove(&(pod_uid.clone(), identity.volume_name.clone()));
        match self.volumes.get_mut(&identity.volume_id) {
            Some(mut record) => {
                record.bindings.remove(&Binding {
                    pod_uid: pod_uid.clone(),
                    volume_name: identity.volume_name.clone(),
                });
                record.bindings.len()
            }
            None => 0,
        }
    }
}
