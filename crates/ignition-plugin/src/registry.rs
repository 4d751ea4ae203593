//! The loaded plugin set.

use std::collections::HashMap;
use std::sync::Arc;

use ignition_device::Device;
use ignition_errors::{Result, UpdateError};
use tracing::{debug, warn};

use crate::handler::DeviceHandler;

/// The set of device-family handlers loaded into the engine.
///
/// Devices record the name of the plugin that claimed them; dispatch is a
/// name lookup. Registration order is preserved for diagnostics.
#[derive(Default)]
pub struct PluginRegistry {
    by_name: HashMap<String, Arc<dyn DeviceHandler>>,
    order: Vec<String>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later handler with the same name wins.
    pub fn register(&mut self, handler: Arc<dyn DeviceHandler>) {
        let name = handler.name().to_string();
        if self.by_name.insert(name.clone(), handler).is_some() {
            warn!(plugin = %name, "replacing already-registered plugin");
        } else {
            debug!(plugin = %name, "registered plugin");
            self.order.push(name);
        }
    }

    /// Look up a handler by plugin name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DeviceHandler>> {
        self.by_name.get(name).cloned()
    }

    /// The handler responsible for a device.
    pub fn handler_for(&self, device: &Device) -> Result<Arc<dyn DeviceHandler>> {
        self.get(&device.plugin).ok_or_else(|| {
            UpdateError::not_found(format!(
                "device {} claims unknown plugin '{}'",
                device.id, device.plugin
            ))
        })
    }

    /// Registered plugin names, registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedHandler(&'static str);

    impl DeviceHandler for NamedHandler {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_register_and_dispatch() -> Result<()> {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(NamedHandler("usb-dock")));
        registry.register(Arc::new(NamedHandler("hid-keyboard")));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), ["usb-dock", "hid-keyboard"]);

        let device = Device::new("usb-dock", "usb:1", "0", "Dock");
        let handler = registry.handler_for(&device)?;
        assert_eq!(handler.name(), "usb-dock");
        Ok(())
    }

    #[test]
    fn test_unknown_plugin_errors() {
        let registry = PluginRegistry::new();
        let device = Device::new("ghost", "x", "y", "Ghost");
        let err = registry.handler_for(&device);
        assert!(err.is_err_and(|e| e.kind() == ignition_errors::ErrorKind::NotFound));
    }
}
