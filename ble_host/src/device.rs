//! Device lifecycle: the per-peer state machine, L2CAP channel/ATT-GATT/SMP
//! wiring, and the key-bin persist/apply lifecycle around pairing. One
//! `Device` is created the moment a peer is discovered or connects inbound,
//! and lives until `remove()` drops it from the Adapter's device map.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ble_gatt::{DiscoveredCharacteristic, DiscoveredService, GattCharListener, GattClient};
use ble_l2cap::{L2capChannel, L2capMux, SecurityLevel};
use ble_mgmt::{LongTermKey, ManagementChannel, ManagementSocket};
use ble_shared::addr::{Address, AddressType};
use ble_shared::listener::ListenerList;
use ble_smp::{IoCapability, PairingMode, PairingParams, PairingRole, PairingState, SmpDriver, SmpEventListener, SmpKeyBundle};
use strum::{Display, EnumString};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::HostError;
use crate::listener::AdapterStatusListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceRole {
    Central,
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Discovered,
    Advertising,
    Connecting,
    Connected,
    Pairing,
    Ready,
    Disconnected,
    Removed,
}

impl DeviceState {
    fn set(cell: &AtomicU8, state: DeviceState) {
        cell.store(state as u8, Ordering::SeqCst);
    }

    fn get(cell: &AtomicU8) -> DeviceState {
        match cell.load(Ordering::SeqCst) {
            0 => Self::Discovered,
            1 => Self::Advertising,
            2 => Self::Connecting,
            3 => Self::Connected,
            4 => Self::Pairing,
            5 => Self::Ready,
            6 => Self::Disconnected,
            _ => Self::Removed,
        }
    }
}

/// `PairingFailed` is reserved for a disconnect the host itself triggers
/// after `pair()` fails; the HCI disconnect reason byte carries no such
/// signal on its own, so today the Adapter only ever produces the other
/// three variants from `EVT_DISCONNECTION_COMPLETE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDisconnectReason {
    LocalRequest,
    RemoteRequest,
    LinkLoss,
    PairingFailed,
}

/// One resolved GATT characteristic, cached after `get_gatt_services`.
#[derive(Debug, Clone)]
pub struct ResolvedCharacteristic {
    pub service: DiscoveredService,
    pub characteristic: DiscoveredCharacteristic,
}

pub struct Device {
    pub address: Address,
    pub address_type: AddressType,
    role: Mutex<DeviceRole>,
    state: AtomicU8,
    handle: AtomicU16,
    local: (Address, AddressType),
    key_dir: PathBuf,

    att_channel: AsyncMutex<Option<Arc<L2capChannel>>>,
    gatt_client: AsyncMutex<Option<Arc<GattClient>>>,
    smp: AsyncMutex<Option<Arc<SmpDriver>>>,
    services: Mutex<Vec<DiscoveredService>>,
    pairing_mode: Mutex<PairingMode>,
    security_level: Mutex<SecurityLevel>,

    char_listeners: ListenerList<dyn GattCharListener>,
}

/// Bridges live SMP IO-capability callbacks out to `AdapterStatusListener::
/// device_pairing_state`; `Completed`/`Failed` have no dedicated SMP hook and
/// are fanned out directly by `Device::pair` once `driver.run()` resolves.
struct PairingStateBridge {
    device: Arc<Device>,
    listeners: Arc<ListenerList<dyn AdapterStatusListener>>,
}

impl PairingStateBridge {
    async fn fan_out(&self, state: PairingState) {
        for listener in self.listeners.snapshot().iter() {
            listener.device_pairing_state(self.device.clone(), state).await;
        }
    }
}

#[async_trait]
impl SmpEventListener for PairingStateBridge {
    async fn passkey_expected(&self) {
        self.fan_out(PairingState::PasskeyExpected).await;
    }

    async fn numeric_compare_expected(&self, _value: u32) {
        self.fan_out(PairingState::NumericCompareExpected).await;
    }

    async fn passkey_notify(&self, _value: u32) {
        self.fan_out(PairingState::PasskeyNotify).await;
    }
}

fn security_rank(level: SecurityLevel) -> u8 {
    match level {
        SecurityLevel::None => 0,
        SecurityLevel::EncryptedNoAuth => 1,
        SecurityLevel::EncryptedAuth => 2,
        SecurityLevel::ScAuth => 3,
    }
}

impl Device {
    pub fn new(address: Address, address_type: AddressType, role: DeviceRole, local: (Address, AddressType), key_dir: PathBuf) -> Arc<Self> {
        let initial = match role {
            DeviceRole::Central => DeviceState::Discovered,
            DeviceRole::Peripheral => DeviceState::Advertising,
        };
        Arc::new(Self {
            address,
            address_type,
            role: Mutex::new(role),
            state: AtomicU8::new(initial as u8),
            handle: AtomicU16::new(0),
            local,
            key_dir,
            att_channel: AsyncMutex::new(None),
            gatt_client: AsyncMutex::new(None),
            smp: AsyncMutex::new(None),
            services: Mutex::new(Vec::new()),
            pairing_mode: Mutex::new(PairingMode::None),
            security_level: Mutex::new(SecurityLevel::None),
            char_listeners: ListenerList::new(),
        })
    }

    #[cfg(test)]
    pub fn new_for_test(address: Address) -> Arc<Self> {
        Self::new(address, AddressType::Public, DeviceRole::Central, (Address::ZERO, AddressType::Public), PathBuf::from("/tmp"))
    }

    pub fn role(&self) -> DeviceRole {
        *self.role.lock().unwrap()
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::get(&self.state)
    }

    fn set_state(&self, state: DeviceState) {
        DeviceState::set(&self.state, state);
    }

    pub fn connection_handle(&self) -> u16 {
        self.handle.load(Ordering::Acquire)
    }

    /// Invoked by the Adapter when the HCI connection-complete event for
    /// this peer arrives: opens the fixed ATT channel and moves the device
    /// to `Connected`. The SMP channel is opened lazily, only when pairing
    /// is actually requested.
    pub(crate) async fn on_connected(self: &Arc<Self>, mux: &Arc<L2capMux>, handle: u16) -> Result<(), HostError> {
        self.handle.store(handle, Ordering::Release);
        let att = mux
            .connect(handle, self.local, (self.address, self.address_type), ble_l2cap::CID_ATT, SecurityLevel::None)
            .await?;
        let att = Arc::new(att);
        *self.att_channel.lock().await = Some(att.clone());
        *self.gatt_client.lock().await = Some(GattClient::spawn(att));
        self.set_state(DeviceState::Connected);
        Ok(())
    }

    pub(crate) fn on_disconnected(&self) {
        self.handle.store(0, Ordering::Release);
        self.set_state(DeviceState::Disconnected);
    }

    pub async fn disconnect(&self) -> Result<(), HostError> {
        if let Some(att) = self.att_channel.lock().await.take() {
            att.close();
        }
        self.gatt_client.lock().await.take();
        self.set_state(DeviceState::Disconnected);
        Ok(())
    }

    /// Drives the SMP pairing state machine to completion, persisting the
    /// resulting key bundle on success and removing any stored file on
    /// failure, per spec.md §4.5. Fans out every intermediate and final
    /// `PairingState` through `listeners` as `device_pairing_state`; does not
    /// itself move the device to `Ready` — that is the Adapter's job, once
    /// GATT discovery also completes.
    pub async fn pair(
        self: &Arc<Self>,
        mux: &Arc<L2capMux>,
        listeners: Arc<ListenerList<dyn AdapterStatusListener>>,
        io_capability: IoCapability,
        mitm_required: bool,
    ) -> Result<SmpKeyBundle, HostError> {
        self.set_state(DeviceState::Pairing);
        let smp_channel = mux
            .connect(
                self.connection_handle(),
                self.local,
                (self.address, self.address_type),
                ble_l2cap::CID_SMP,
                SecurityLevel::None,
            )
            .await?;
        let params = PairingParams { io_capability, mitm_required, ..Default::default() };
        let role = match self.role() {
            DeviceRole::Central => PairingRole::Initiator,
            DeviceRole::Peripheral => PairingRole::Responder,
        };
        let driver = SmpDriver::new(Arc::new(smp_channel), self.local, (self.address, self.address_type), role, params);
        let bridge = Arc::new(PairingStateBridge { device: self.clone(), listeners: listeners.clone() });
        driver.add_listener(bridge);
        *self.smp.lock().await = Some(driver.clone());

        match driver.run().await {
            Ok(bundle) => {
                if let Err(err) = bundle.write_atomic(&self.key_dir) {
                    tracing::warn!("failed to persist key bundle for {}: {}", self.address, err);
                }
                *self.pairing_mode.lock().unwrap() = bundle.pairing_mode.unwrap_or(PairingMode::None);
                self.set_state(DeviceState::Connected);
                for listener in listeners.snapshot().iter() {
                    listener.device_pairing_state(self.clone(), PairingState::Completed).await;
                }
                Ok(bundle)
            }
            Err(err) => {
                let _ = SmpKeyBundle::remove(&self.key_dir, self.local.0, self.address);
                self.set_state(DeviceState::Disconnected);
                for listener in listeners.snapshot().iter() {
                    listener.device_pairing_state(self.clone(), PairingState::Failed).await;
                }
                Err(err.into())
            }
        }
    }

    pub async fn set_pairing_passkey(&self, value: u32) -> Result<(), HostError> {
        let guard = self.smp.lock().await;
        let driver = guard.as_ref().ok_or(HostError::NotReady)?;
        driver.set_passkey(value).await;
        Ok(())
    }

    pub async fn set_numeric_compare(&self, accept: bool) -> Result<(), HostError> {
        let guard = self.smp.lock().await;
        let driver = guard.as_ref().ok_or(HostError::NotReady)?;
        driver.set_numeric_compare(accept).await;
        Ok(())
    }

    /// Probes for a persisted key bundle for this peer without applying it;
    /// `upload_keys` is the entry point that actually uploads the LTK and
    /// marks the device `PrePaired`. Returns `Ok(None)` if no stored bundle
    /// exists for this peer.
    pub fn load_persisted_keys(&self) -> Result<Option<SmpKeyBundle>, HostError> {
        let file_name = format!("{}_{}.key", strip_colons(&self.local.0.to_string()), strip_colons(&self.address.to_string()));
        let path = self.key_dir.join(file_name);
        match SmpKeyBundle::read(&path) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(ble_smp::SmpInternalError::KeyBinIo(_)) => Ok(None),
            Err(err) => Err(HostError::from(ble_smp::SmpError::from(err))),
        }
    }

    /// Pre-paired reuse: uploads a persisted key bundle's LTK to the
    /// controller before any encrypted traffic and marks the device's
    /// pairing mode `PrePaired` (spec.md §4.5, §8 P8).
    pub async fn upload_keys(&self, mgmt: &Arc<ManagementSocket>, bundle: SmpKeyBundle) -> Result<(), HostError> {
        let material = bundle.ltk_responder.or(bundle.ltk_initiator).ok_or(HostError::InvalidArgument)?;
        let ltk = LongTermKey {
            address: self.address,
            address_type: self.address_type,
            authenticated: bundle.authenticated,
            master: matches!(self.role(), DeviceRole::Central),
            encryption_size: 16,
            encrypted_diversifier: material.ediv,
            random_number: material.rand,
            value: material.value,
        };
        mgmt.upload_long_term_keys(&[ltk]).await?;
        *self.pairing_mode.lock().unwrap() = PairingMode::PrePaired;
        Ok(())
    }

    pub fn pairing_mode(&self) -> PairingMode {
        *self.pairing_mode.lock().unwrap()
    }

    pub fn security_level(&self) -> SecurityLevel {
        *self.security_level.lock().unwrap()
    }

    /// Removes any persisted key bundle and resets the pairing mode,
    /// per spec.md §6.
    pub fn unpair(&self) -> Result<(), HostError> {
        SmpKeyBundle::remove(&self.key_dir, self.local.0, self.address).map_err(|err| HostError::from(ble_smp::SmpError::from(err)))?;
        *self.pairing_mode.lock().unwrap() = PairingMode::None;
        *self.security_level.lock().unwrap() = SecurityLevel::None;
        Ok(())
    }

    /// Pairs to at least `level`, a no-op if already satisfied.
    pub async fn set_conn_security(
        self: &Arc<Self>,
        mux: &Arc<L2capMux>,
        listeners: Arc<ListenerList<dyn AdapterStatusListener>>,
        level: SecurityLevel,
    ) -> Result<(), HostError> {
        if security_rank(self.security_level()) >= security_rank(level) {
            return Ok(());
        }
        let (io_capability, mitm) = match level {
            SecurityLevel::None | SecurityLevel::EncryptedNoAuth => (IoCapability::NoInputNoOutput, false),
            SecurityLevel::EncryptedAuth | SecurityLevel::ScAuth => (IoCapability::KeyboardDisplay, true),
        };
        self.pair(mux, listeners, io_capability, mitm).await?;
        *self.security_level.lock().unwrap() = level;
        Ok(())
    }

    pub async fn set_conn_security_best(self: &Arc<Self>, mux: &Arc<L2capMux>, listeners: Arc<ListenerList<dyn AdapterStatusListener>>) -> Result<(), HostError> {
        self.set_conn_security(mux, listeners, SecurityLevel::ScAuth).await
    }

    pub async fn set_conn_security_auto(self: &Arc<Self>, mux: &Arc<L2capMux>, listeners: Arc<ListenerList<dyn AdapterStatusListener>>) -> Result<(), HostError> {
        self.set_conn_security(mux, listeners, SecurityLevel::EncryptedNoAuth).await
    }

    /// Tears this device's own channels/state down; dropping it from the
    /// Adapter's device map is the Adapter's responsibility (spec.md §4.8).
    pub async fn remove(&self) -> Result<(), HostError> {
        if let Some(att) = self.att_channel.lock().await.take() {
            att.close();
        }
        self.gatt_client.lock().await.take();
        self.smp.lock().await.take();
        self.char_listeners.clear();
        self.handle.store(0, Ordering::Release);
        self.set_state(DeviceState::Removed);
        Ok(())
    }

    pub async fn get_gatt_services(&self) -> Result<Vec<DiscoveredService>, HostError> {
        let guard = self.gatt_client.lock().await;
        let client = guard.as_ref().ok_or(HostError::NotReady)?;
        let services = client.discover_primary_services().await?;
        *self.services.lock().unwrap() = services.clone();
        Ok(services)
    }

    pub async fn find(&self, service_uuid: uuid::Uuid, characteristic_uuid: uuid::Uuid) -> Result<Option<ResolvedCharacteristic>, HostError> {
        let guard = self.gatt_client.lock().await;
        let client = guard.as_ref().ok_or(HostError::NotReady)?;
        let services = self.services.lock().unwrap().clone();
        for service in services {
            if service.uuid != service_uuid {
                continue;
            }
            let chars = client.discover_characteristics(service.handle_range.clone()).await?;
            if let Some(characteristic) = chars.into_iter().find(|c| c.uuid == characteristic_uuid) {
                return Ok(Some(ResolvedCharacteristic { service, characteristic }));
            }
        }
        Ok(None)
    }

    pub async fn read_value(&self, handle: u16) -> Result<Vec<u8>, HostError> {
        let guard = self.gatt_client.lock().await;
        let client = guard.as_ref().ok_or(HostError::NotReady)?;
        Ok(client.read_value(handle).await?)
    }

    pub async fn write_value(&self, handle: u16, value: &[u8], with_response: bool) -> Result<(), HostError> {
        let guard = self.gatt_client.lock().await;
        let client = guard.as_ref().ok_or(HostError::NotReady)?;
        Ok(client.write_value(handle, value, with_response).await?)
    }

    pub async fn add_char_listener(&self, listener: Arc<dyn GattCharListener>) -> Result<(), HostError> {
        let guard = self.gatt_client.lock().await;
        let client = guard.as_ref().ok_or(HostError::NotReady)?;
        client.add_listener(listener.clone());
        self.char_listeners.add(listener);
        Ok(())
    }

    pub fn remove_all_char_listener(&self) {
        self.char_listeners.clear();
    }

    pub fn mark_ready(&self) {
        self.set_state(DeviceState::Ready);
    }
}

/// `<local_addr>_<remote_addr>.key`, mirrored from `ble_smp::keybin`'s
/// private naming scheme so a not-yet-connected device can probe for a
/// stored bundle without first building one.
fn strip_colons(addr: &str) -> String {
    addr.chars().filter(|c| *c != ':').collect::<String>().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_central_device_starts_discovered() {
        let device = Device::new(Address::ZERO, AddressType::Public, DeviceRole::Central, (Address::ZERO, AddressType::Public), PathBuf::from("/tmp"));
        assert_eq!(device.state(), DeviceState::Discovered);
        assert_eq!(device.connection_handle(), 0);
    }

    #[test]
    fn fresh_peripheral_device_starts_advertising() {
        let device = Device::new(Address::ZERO, AddressType::Public, DeviceRole::Peripheral, (Address::ZERO, AddressType::Public), PathBuf::from("/tmp"));
        assert_eq!(device.state(), DeviceState::Advertising);
    }

    #[test]
    fn missing_persisted_keys_returns_none() {
        let device = Device::new_for_test(Address::ZERO);
        assert!(device.load_persisted_keys().unwrap().is_none());
    }
}
