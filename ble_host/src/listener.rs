//! Public callback-trait surface, spec.md §4.9. Every method is
//! implementable as a no-op; `device_found` is the one with a meaningful
//! default answer (`true`, keep tracking) since silently discarding every
//! discovered device would make discovery useless out of the box.

use std::sync::Arc;

use async_trait::async_trait;
use ble_shared::addr::Address;
use strum::{Display, EnumString};

use crate::device::{Device, DeviceDisconnectReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum DiscoveryPolicy {
    Auto,
    PauseWhenConnected,
    PauseUntilConnected,
    PauseUntilReady,
    PauseUntilDisconnected,
}

#[async_trait]
pub trait AdapterStatusListener: Send + Sync {
    async fn adapter_settings_changed(&self, _powered: bool, _discoverable: bool) {}
    async fn discovering_changed(&self, _discovering: bool) {}
    /// Returning `false` discards the device: no further callbacks, removed
    /// from tracking immediately.
    async fn device_found(&self, _device: Arc<Device>) -> bool {
        true
    }
    async fn device_updated(&self, _device: Arc<Device>) {}
    async fn device_connected(&self, _device: Arc<Device>) {}
    async fn device_pairing_state(&self, _device: Arc<Device>, _state: ble_smp::PairingState) {}
    /// Handlers may perform long-running work here (GATT discovery, etc.).
    async fn device_ready(&self, _device: Arc<Device>) {}
    async fn device_disconnected(&self, _device: Arc<Device>, _reason: DeviceDisconnectReason) {}
}

#[async_trait]
pub trait ChangedAdapterSetListener: Send + Sync {
    async fn adapter_added(&self, _dev_id: u16) {}
    async fn adapter_removed(&self, _dev_id: u16) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    #[async_trait]
    impl AdapterStatusListener for Noop {}

    #[tokio::test]
    async fn default_device_found_keeps_the_device() {
        let noop = Noop;
        let device = Device::new_for_test(Address::ZERO);
        assert!(noop.device_found(device).await);
    }
}
