//! Plugin configuration.
//!
//! Environment variables:
//! - `VDISK_ROOT_DIR`: node agent root directory holding `pods/` and
//!   `plugins/`. Defaults to `/var/lib/rkl`.
//! - `VDISK_DEFAULT_FS_TYPE`: filesystem type written into provisioned
//!   volume templates. Defaults to `ext4`.
//! - `VDISK_DIR_MODE`: octal permission bits for created mount directories.
//!   Defaults to `0750`.

use std::path::PathBuf;
use std::sync::LazyLock;

use tracing::warn;

const DEFAULT_ROOT_DIR: &str = "/var/lib/rkl";
const DEFAULT_FS_TYPE: &str = "ext4";
const DEFAULT_DIR_MODE: u32 = 0o750;

/// Configuration for the virtual-disk plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VDiskConfig {
    /// Root directory of the node agent.
    pub root_dir: PathBuf,
    /// Filesystem type for new volume templates.
    pub default_fs_type: String,
    /// Permission bits for mount directories.
    pub dir_mode: u32,
}

impl Default for VDiskConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            default_fs_type: DEFAULT_FS_TYPE.to_owned(),
            dir_mode: DEFAULT_DIR_MODE,
        }
    }
}

impl VDiskConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup, falling back to
    /// defaults for missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let dir_mode = match lookup("VDISK_DIR_MODE") {
            Some(raw) => match u32::from_str_radix(raw.trim_start_matches("0o"), 8) {
                Ok(mode) if mode <= 0o7777 => mode,
                _ => {
                    warn!(value = %raw, "ignoring invalid VDISK_DIR_MODE");
                    defaults.dir_mode
                }
            },
            None => defaults.dir_mode,
        };
        Self {
            root_dir: lookup("VDISK_ROOT_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.root_dir),
            default_fs_type: lookup("VDISK_DEFAULT_FS_TYPE")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.default_fs_type),
            dir_mode,
        }
    }
}

/// Globally initialized configuration, read from the environment at first
/// access.
pub static CONFIG: LazyLock<VDiskConfig> = LazyLock::new(VDiskConfig::from_env);
