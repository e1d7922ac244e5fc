//! Registry of configured video nodes

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::device::{DeviceCoordinator, DeviceId};
use super::pipeline::PipelineListener;
use super::session::Session;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::status::StatusBus;

/// All device coordinators built from one configuration
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Arc<DeviceCoordinator>>,
    status: Arc<StatusBus>,
}

impl DeviceRegistry {
    pub fn new(config: &BridgeConfig, status: Arc<StatusBus>) -> Result<Self> {
        let mut devices = HashMap::new();
        for device in &config.devices {
            if devices.contains_key(&device.id) {
                return Err(BridgeError::Config(format!("duplicate device id {}", device.id)));
            }
            let coordinator = DeviceCoordinator::builder(device.clone())
                .channel(config.channel.clone())
                .telemetry(config.telemetry.clone())
                .status(status.clone())
                .build()?;
            devices.insert(device.id, coordinator);
        }
        info!("Device registry ready with {} device(s)", devices.len());
        Ok(Self { devices, status })
    }

    pub fn device(&self, id: DeviceId) -> Result<Arc<DeviceCoordinator>> {
        self.devices
            .get(&id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("video device {}", id)))
    }

    /// Open a session on device `id`
    pub fn open(&self, id: DeviceId) -> Result<Session> {
        self.device(id)?.open()
    }

    pub fn connect_pipeline(&self, id: DeviceId) -> Result<PipelineListener> {
        Ok(self.device(id)?.connect_pipeline())
    }

    /// Device ids in ascending order
    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn status(&self) -> &Arc<StatusBus> {
        &self.status
    }

    pub fn shutdown(&self) {
        for id in self.ids() {
            if let Some(device) = self.devices.get(&id) {
                device.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::status::BridgeStatus;

    fn two_devices() -> BridgeConfig {
        BridgeConfig {
            devices: vec![
                DeviceConfig::default(),
                DeviceConfig {
                    id: 1,
                    reserved_base: 0xc000_0000,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = DeviceRegistry::new(&two_devices(), Arc::new(StatusBus::new())).unwrap();
        assert_eq!(registry.ids(), vec![0, 1]);
        assert_eq!(registry.device(1).unwrap().query_caps().bus_info, "platform:viv1");
        assert!(matches!(registry.open(7), Err(BridgeError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let mut config = two_devices();
        config.devices[1].id = 0;
        assert!(matches!(
            DeviceRegistry::new(&config, Arc::new(StatusBus::new())),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_session_events_reach_status_bus() {
        let status = Arc::new(StatusBus::new());
        let mut rx = status.subscribe();
        let registry = DeviceRegistry::new(&two_devices(), status).unwrap();

        let session = registry.open(1).unwrap();
        match rx.try_recv().unwrap() {
            BridgeStatus::SessionStateChanged { device, state, .. } => {
                assert_eq!(device, 1);
                assert_eq!(state, "idle");
            }
            other => panic!("unexpected status {:?}", other),
        }
        drop(session);

        registry.shutdown();
        assert!(registry.device(0).unwrap().is_shut_down());
        assert!(matches!(registry.open(0), Err(BridgeError::InvalidState(_))));
    }
}
