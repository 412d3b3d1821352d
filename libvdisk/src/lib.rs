//! # libvdisk — virtual-disk volume plugin for RK8s
//!
//! `libvdisk` lets the RKL node agent mount a provider's remote block
//! volume ("virtual disk") into a pod.  The plugin itself is a thin adapter:
//! it matches volume specs, sequences attach / bind-mount / unmount / detach
//! and create / delete, and delegates the real work to injected
//! collaborators: a provider [`DiskManager`], a [`HostMounter`] and a
//! [`VolumeHost`].  It follows the RK8s conventions (Tokio async runtime,
//! `tracing` for observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: `VolumeSpec`, `PersistentVolume`, `VolumeIdentity`, requests. |
//! | [`error`] | [`VolumeError`] and [`ProviderError`]. |
//! | [`config`] | [`VDiskConfig`] read from the environment. |
//! | [`manager`] | [`DiskManager`] trait — provider disk API. |
//! | [`mount`] | [`HostMounter`] trait and the `mount(2)`-backed [`SystemMounter`]. |
//! | [`host`] | [`VolumeHost`] trait and the directory-layout [`LocalVolumeHost`]. |
//! | [`keymutex`] | [`KeyMutex`], per-volume serialization of mount / unmount. |
//! | [`state`] | Volume lifecycle state machine and tracker. |
//! | [`volume`] | Plugin role traits. |
//! | [`plugin`] | [`VDiskPlugin`] and [`probe_volume_plugins`]. |
//! | [`mounter`] | [`DiskMounter`] / [`DiskUnmounter`]. |
//! | [`provisioner`] | [`DiskProvisioner`] / [`DiskDeleter`]. |
//! | [`registry`] | [`VolumePluginMgr`]. |

pub mod config;
pub mod error;
pub mod host;
pub mod keymutex;
pub mod manager;
pub mod mount;
pub mod mounter;
pub mod plugin;
pub mod provisioner;
pub mod registry;
pub mod state;
pub mod types;
pub mod volume;

// Re-export the most commonly used items at crate root for convenience.
pub use config::VDiskConfig;
pub use error::{ProviderError, VolumeError};
pub use host::{LocalVolumeHost, VolumeHost};
pub use keymutex::KeyMutex;
pub use manager::DiskManager;
pub use mount::{HostMounter, SystemMounter};
pub use mounter::{DiskMounter, DiskUnmounter};
pub use plugin::{PLUGIN_NAME, VDiskPlugin, probe_volume_plugins};
pub use provisioner::{DiskDeleter, DiskProvisioner};
pub use registry::VolumePluginMgr;
pub use state::{VolumeEvent, VolumeState};
pub use types::*;
pub use volume::*;
