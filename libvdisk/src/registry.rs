//! In-process plugin registry.
//!
//! [`VolumePluginMgr`] initializes a set of plugins against one host and
//! routes names and specs to them.

use std::sync::Arc;

use tracing::info;

use crate::error::VolumeError;
use crate::host::VolumeHost;
use crate::types::VolumeSpec;
use crate::volume::VolumePlugin;

/// Registry of initialized volume plugins.
#[derive(Default)]
pub struct VolumePluginMgr {
    plugins: Vec<Arc<dyn VolumePlugin>>,
}

impl VolumePluginMgr {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize `plugins` with `host` and register them.
    ///
    /// Fails on an empty or duplicate plugin name, or when a plugin's
    /// `init` fails; plugins registered before the failure stay registered.
    pub fn init_plugins(
        &mut self,
        plugins: Vec<Arc<dyn VolumePlugin>>,
        host: Arc<dyn VolumeHost>,
    ) -> Result<(), VolumeError> {
        for plugin in plugins {
            let name = plugin.name().to_owned();
            if name.is_empty() {
                return Err(VolumeError::InvalidSpec("volume plugin has an empty name".into()));
            }
            if self.plugins.iter().any(|p| p.name() == name) {
                return Err(VolumeError::InvalidSpec(format!(
                    "volume plugin {name} registered more than once"
                )));
            }
            plugin.init(Arc::clone(&host))?;
            info!(plugin = %name, "loaded volume plugin");
            self.plugins.push(plugin);
        }
        Ok(())
    }

    /// Plugin registered under `name`.
    pub fn find_plugin_by_name(&self, name: &str) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        self.plugins
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| VolumeError::InvalidSpec(format!("no volume plugin named {name}")))
    }

    /// The single plugin that supports `spec`.
    pub fn find_plugin_by_spec(
        &self,
        spec: &VolumeSpec,
    ) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        let mut matches = self.plugins.iter().filter(|p| p.can_support(spec));
        match (matches.next(), matches.next()) {
            (Some(plugin), None) => Ok(Arc::clone(plugin)),
            (None, _) => Err(VolumeError::InvalidSpec(format!(
                "no volume plugin matched volume {}",
                spec.name()
            ))),
            (Some(_), Some(_)) => Err(VolumeError::InvalidSpec(format!(
                "multiple volume plugins matched volume {}",
                spec.name()
            ))),
        }
    }

    /// Plugin registered under `name`, if it can provision.
    pub fn find_provisionable_plugin_by_name(
        &self,
        name: &str,
    ) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        let plugin = self.find_plugin_by_name(name)?;
        if plugin.as_provisionable().is_none() {
            return Err(VolumeError::InvalidSpec(format!(
                "volume plugin {name} cannot provision"
            )));
        }
        Ok(plugin)
    }

    /// The plugin that supports `spec`, if it can delete.
    pub fn find_deletable_plugin_by_spec(
        &self,
        spec: &VolumeSpec,
    ) -> Result<Arc<dyn VolumePlugin>, VolumeError> {
        let plugin = self.find_plugin_by_spec(spec)?;
        if plugin.as_deletable().is_none() {
            return Err(VolumeError::InvalidSpec(format!(
                "volume plugin {} cannot delete",
                plugin.name()
            )));
        }
        Ok(plugin)
    }

    /// Names of all registered plugins.
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }
}
