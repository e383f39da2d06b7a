//! Read-only snapshot of the registered device backends.

use std::fmt;

use crate::backend::legality::DeviceCapabilities;
use crate::backend::registry::{self, ErasedBackend};

/// One device known to a facade.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub description: String,
    pub capabilities: DeviceCapabilities,
    pub is_thread_safe: bool,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.description)
    }
}

/// Devices taken from the global backend registry at construction.
///
/// Later registrations are not observed. Ids match ignoring ASCII case.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceInfo>,
}

impl DeviceRegistry {
    pub fn snapshot() -> Self {
        let mut devices: Vec<DeviceInfo> = Vec::new();
        for id in registry::list_backends() {
            if devices.iter().any(|known| known.id.eq_ignore_ascii_case(&id)) {
                continue;
            }
            let Some(backend) = registry::create_backend(&id) else {
                continue;
            };
            devices.push(DeviceInfo {
                description: backend.device_description(),
                capabilities: backend.capabilities(),
                is_thread_safe: backend.is_thread_safe(),
                id,
            });
        }
        tracing::debug!(
            devices = ?devices.iter().map(|device| device.id.as_str()).collect::<Vec<_>>(),
            "device registry snapshot"
        );
        Self { devices }
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn get(&self, id: &str) -> Option<&DeviceInfo> {
        self.devices
            .iter()
            .find(|device| device.id.eq_ignore_ascii_case(id))
    }

    pub fn supports_device(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// `(id, description)` pairs in registry order.
    pub fn list_devices(&self) -> Vec<(String, String)> {
        self.devices
            .iter()
            .map(|device| (device.id.clone(), device.description.clone()))
            .collect()
    }

    /// Fresh backend instance for a snapshotted device.
    pub(crate) fn instantiate(&self, id: &str) -> Option<Box<dyn ErasedBackend>> {
        let device = self.get(id)?;
        registry::create_backend(&device.id)
    }
}
