//! Adapter lifecycle: the management-channel power/config sequence, LE scan
//! and advertising driving, and the HCI event loop that turns connection
//! and advertising-report events into `Device` state transitions and
//! listener fan-out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ble_gatt::GattServer;
use ble_hci::{HciEngine, HciEngineHandle};
use ble_l2cap::L2capMux;
use ble_mgmt::{DefaultConnParams, ManagementChannel, ManagementSocket, ManagementSocketHandle, SecureConnectionsMode};
use ble_octets::Writer;
use ble_shared::addr::{Address, AddressType};
use ble_shared::listener::ListenerList;
use ble_shared::shutdown::Shutdown;
use tokio::sync::{mpsc, oneshot};

use crate::device::{Device, DeviceDisconnectReason, DeviceRole, DeviceState};
use crate::error::HostError;
use crate::listener::{AdapterStatusListener, DiscoveryPolicy};

const LE_META_CONNECTION_COMPLETE_SUBEVENT: u8 = 0x01;
const LE_META_ADVERTISING_REPORT_SUBEVENT: u8 = 0x02;
const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;

/// LE controller event bits this stack relies on: connection complete,
/// advertising report, long term key request, connection update complete.
const LE_EVENT_MASK: u64 = 0x0000_0000_0000_001F;

pub struct Adapter {
    dev_id: u16,
    local_address: (Address, AddressType),
    hci: Arc<HciEngine>,
    mgmt: Arc<ManagementSocket>,
    mux: Arc<L2capMux>,
    devices: Mutex<HashMap<Address, Arc<Device>>>,
    listeners: Arc<ListenerList<dyn AdapterStatusListener>>,
    discovery_policy: Mutex<DiscoveryPolicy>,
    discovering: AtomicBool,
    powered: AtomicBool,
    advertising: AtomicBool,
    gatt_server: Mutex<Option<Arc<GattServer>>>,
    pending_connections: Mutex<HashMap<Address, oneshot::Sender<Result<Arc<Device>, HostError>>>>,
    key_dir: PathBuf,
    shutdown: Shutdown,
}

pub struct AdapterHandle {
    _hci_handle: HciEngineHandle,
    _mgmt_handle: ManagementSocketHandle,
    _shutdown_complete_rx: mpsc::Receiver<()>,
}

impl Adapter {
    pub async fn open(dev_id: u16, local_address: (Address, AddressType), key_dir: PathBuf) -> Result<(Arc<Self>, AdapterHandle), HostError> {
        let (hci, hci_handle) = HciEngine::spawn(dev_id).await?;
        let (mgmt, mgmt_handle) = ManagementSocket::spawn().await?;
        let mux = L2capMux::new(hci.clone());

        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);
        let shutdown = Shutdown::new(close_tx, shutdown_complete_tx);

        let adapter = Arc::new(Self {
            dev_id,
            local_address,
            hci,
            mgmt,
            mux,
            devices: Mutex::new(HashMap::new()),
            listeners: Arc::new(ListenerList::new()),
            discovery_policy: Mutex::new(DiscoveryPolicy::Auto),
            discovering: AtomicBool::new(false),
            powered: AtomicBool::new(false),
            advertising: AtomicBool::new(false),
            gatt_server: Mutex::new(None),
            pending_connections: Mutex::new(HashMap::new()),
            key_dir,
            shutdown,
        });

        let events = adapter.hci.subscribe().await?;
        tokio::spawn(Self::event_loop(adapter.clone(), events, close_rx));

        Ok((
            adapter,
            AdapterHandle {
                _hci_handle: hci_handle,
                _mgmt_handle: mgmt_handle,
                _shutdown_complete_rx: shutdown_complete_rx,
            },
        ))
    }

    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }

    pub fn local_address(&self) -> (Address, AddressType) {
        self.local_address
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Acquire)
    }

    pub fn add_status_listener(&self, listener: Arc<dyn AdapterStatusListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_status_listener(&self, listener: &Arc<dyn AdapterStatusListener>) {
        self.listeners.remove(listener);
    }

    /// Power-cycles the controller through reset, event-mask configuration,
    /// and the requested powered state, as one sequence the management
    /// channel and raw HCI channel cooperate on.
    pub async fn initialize(&self, power_on: bool) -> Result<(), HostError> {
        self.mgmt.set_powered(false).await?;
        self.hci.send_command_default(ble_hci::opcodes::RESET, Vec::new()).await?;

        let mut w = Writer::with_capacity(8);
        w.put_u64_le(LE_EVENT_MASK);
        self.hci.send_command_default(ble_hci::opcodes::LE_SET_EVENT_MASK, w.into_vec()).await?;

        self.mgmt.set_powered(power_on).await?;
        self.powered.store(power_on, Ordering::Release);
        self.notify_settings_changed(power_on).await;
        Ok(())
    }

    pub async fn set_powered(&self, on: bool) -> Result<(), HostError> {
        self.mgmt.set_powered(on).await?;
        self.powered.store(on, Ordering::Release);
        self.notify_settings_changed(on).await;
        Ok(())
    }

    pub async fn set_name(&self, name: &str, short_name: &str) -> Result<(), HostError> {
        Ok(self.mgmt.set_name(name, short_name).await?)
    }

    pub async fn set_secure_connections(&self, mode: SecureConnectionsMode) -> Result<(), HostError> {
        Ok(self.mgmt.set_secure_connections(mode).await?)
    }

    pub async fn set_default_conn_params(&self, params: DefaultConnParams) -> Result<(), HostError> {
        Ok(self.mgmt.set_default_conn_params(params).await?)
    }

    async fn notify_settings_changed(&self, powered: bool) {
        for listener in self.listeners.snapshot().iter() {
            listener.adapter_settings_changed(powered, self.advertising.load(Ordering::Acquire)).await;
        }
    }

    /// spec.md's five discovery policies resolve to one invariant: scanning
    /// stays enabled unless the policy says otherwise given the current
    /// connected-device count. `PauseUntilReady` pauses only through the
    /// connect-then-pair window, not once a device settles into `Ready`.
    fn discovery_should_run(&self, policy: DiscoveryPolicy) -> bool {
        let devices = self.devices.lock().unwrap();
        let any_connected = devices.values().any(|d| matches!(d.state(), DeviceState::Connected | DeviceState::Pairing | DeviceState::Ready));
        let any_mid_connect = devices.values().any(|d| matches!(d.state(), DeviceState::Connected | DeviceState::Pairing));
        match policy {
            DiscoveryPolicy::Auto => true,
            DiscoveryPolicy::PauseWhenConnected => !any_connected,
            DiscoveryPolicy::PauseUntilConnected => !any_connected,
            DiscoveryPolicy::PauseUntilReady => !any_mid_connect,
            DiscoveryPolicy::PauseUntilDisconnected => any_connected,
        }
    }

    pub async fn start_discovery(&self, policy: DiscoveryPolicy, active_scan: bool, interval: u16, window: u16, filter_duplicates: bool) -> Result<(), HostError> {
        *self.discovery_policy.lock().unwrap() = policy;
        if !self.discovery_should_run(policy) {
            return Ok(());
        }
        self.enable_scanning(active_scan, interval, window, filter_duplicates).await
    }

    async fn enable_scanning(&self, active_scan: bool, interval: u16, window: u16, filter_duplicates: bool) -> Result<(), HostError> {
        let mut params = Writer::with_capacity(7);
        params.put_u8(active_scan as u8).put_u16_le(interval).put_u16_le(window).put_u8(0x00).put_u8(0x00);
        self.hci.send_command_default(ble_hci::opcodes::LE_SET_SCAN_PARAMETERS, params.into_vec()).await?;

        let enable_params = vec![0x01, filter_duplicates as u8];
        self.hci.send_command_default(ble_hci::opcodes::LE_SET_SCAN_ENABLE, enable_params).await?;

        self.discovering.store(true, Ordering::Release);
        self.fan_out_discovering(true).await;
        Ok(())
    }

    pub async fn stop_discovery(&self) -> Result<(), HostError> {
        self.disable_scanning().await
    }

    async fn disable_scanning(&self) -> Result<(), HostError> {
        self.hci.send_command_default(ble_hci::opcodes::LE_SET_SCAN_ENABLE, vec![0x00, 0x00]).await?;
        self.discovering.store(false, Ordering::Release);
        self.fan_out_discovering(false).await;
        Ok(())
    }

    async fn fan_out_discovering(&self, discovering: bool) {
        for listener in self.listeners.snapshot().iter() {
            listener.discovering_changed(discovering).await;
        }
    }

    /// Re-evaluates the active policy against the current connected-device
    /// count; called after every connect/disconnect transition.
    async fn reconcile_discovery(&self) {
        let policy = *self.discovery_policy.lock().unwrap();
        let should_run = self.discovery_should_run(policy);
        if should_run == self.discovering.load(Ordering::Acquire) {
            return;
        }
        let result = if should_run { self.enable_scanning(true, 0x0010, 0x0010, true).await } else { self.disable_scanning().await };
        if let Err(err) = result {
            tracing::warn!("failed to reconcile discovery state: {}", err);
        }
    }

    pub async fn start_advertising(
        &self,
        gatt_server: Option<Arc<GattServer>>,
        adv_data: Vec<u8>,
        scan_rsp_data: Vec<u8>,
        interval_min: u16,
        interval_max: u16,
    ) -> Result<(), HostError> {
        *self.gatt_server.lock().unwrap() = gatt_server;

        let mut params = Writer::with_capacity(15);
        params
            .put_u16_le(interval_min)
            .put_u16_le(interval_max)
            .put_u8(0x00) // adv_type: ADV_IND
            .put_u8(0x00) // own_address_type: public
            .put_u8(0x00) // direct_address_type
            .put_address(Address::ZERO)
            .put_u8(0x07) // channel_map: 37/38/39
            .put_u8(0x00); // filter_policy: accept all
        self.hci.send_command_default(ble_hci::opcodes::LE_SET_ADVERTISING_PARAMETERS, params.into_vec()).await?;

        self.hci.send_command_default(ble_hci::opcodes::LE_SET_ADVERTISING_DATA, pad_ad_data(&adv_data)).await?;
        self.hci
            .send_command_default(ble_hci::opcodes::LE_SET_SCAN_RESPONSE_DATA, pad_ad_data(&scan_rsp_data))
            .await?;
        self.hci.send_command_default(ble_hci::opcodes::LE_SET_ADVERTISE_ENABLE, vec![0x01]).await?;

        self.advertising.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn stop_advertising(&self) -> Result<(), HostError> {
        self.hci.send_command_default(ble_hci::opcodes::LE_SET_ADVERTISE_ENABLE, vec![0x00]).await?;
        self.advertising.store(false, Ordering::Release);
        Ok(())
    }

    /// Issues `LE Create Connection` and awaits the matching Connection
    /// Complete event, correlated by peer address.
    pub async fn connect_le(self: &Arc<Self>, address: Address, address_type: AddressType) -> Result<Arc<Device>, HostError> {
        let device = {
            let mut devices = self.devices.lock().unwrap();
            devices
                .entry(address)
                .or_insert_with(|| Device::new(address, address_type, DeviceRole::Central, self.local_address, self.key_dir.clone()))
                .clone()
        };

        let (tx, rx) = oneshot::channel();
        self.pending_connections.lock().unwrap().insert(address, tx);

        let mut params = Writer::with_capacity(25);
        params
            .put_u16_le(0x0010) // scan_interval
            .put_u16_le(0x0010) // scan_window
            .put_u8(0x00) // initiator_filter_policy: use peer address
            .put_u8(match address_type {
                AddressType::Public => 0x00,
                _ => 0x01,
            })
            .put_address(address)
            .put_u8(0x00) // own_address_type
            .put_u16_le(0x0018) // conn_interval_min
            .put_u16_le(0x0028) // conn_interval_max
            .put_u16_le(0x0000) // conn_latency
            .put_u16_le(0x01f4) // supervision_timeout
            .put_u16_le(0x0000) // min_ce_length
            .put_u16_le(0x0000); // max_ce_length

        if let Err(err) = self.hci.send_command_default(ble_hci::opcodes::LE_CREATE_CONNECTION, params.into_vec()).await {
            self.pending_connections.lock().unwrap().remove(&address);
            return Err(err.into());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(HostError::Cancelled),
        }
    }

    pub fn device(&self, address: Address) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&address).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    pub fn mux(&self) -> &Arc<L2capMux> {
        &self.mux
    }

    /// Cancels any in-flight connection attempt, tears the device's own
    /// channels/state down, and drops it from the device map (spec.md §4.8).
    pub async fn remove_device(&self, address: Address) -> Option<Arc<Device>> {
        let device = self.devices.lock().unwrap().remove(&address)?;
        self.pending_connections.lock().unwrap().remove(&address);
        if let Err(err) = device.remove().await {
            tracing::warn!("failed to tear down device {} during removal: {}", address, err);
        }
        Some(device)
    }

    /// As `remove_device`, but also releases a `PauseUntilDisconnected`
    /// discovery pause the application held open for this device (spec.md
    /// §4.8).
    pub async fn remove_device_pausing_discovery(&self, address: Address) -> Option<Arc<Device>> {
        let device = self.remove_device(address).await;
        self.reconcile_discovery().await;
        device
    }

    /// Drives SMP pairing to completion, then GATT discovery, then marks the
    /// device `Ready` and fans out `device_ready`/reconciles discovery —
    /// centralized here since only the Adapter holds the listener list and
    /// `reconcile_discovery`.
    pub async fn pair_device(self: &Arc<Self>, address: Address, io_capability: ble_smp::IoCapability, mitm_required: bool) -> Result<(), HostError> {
        let device = self.device(address).ok_or(HostError::NoSuchDevice)?;
        device.pair(&self.mux, self.listeners.clone(), io_capability, mitm_required).await?;
        self.finish_device_ready(&device).await;
        Ok(())
    }

    /// Shared tail of both the explicit-pairing path and the pre-paired-
    /// reuse path: GATT discovery, `Ready`, `device_ready` fan-out, and a
    /// discovery-policy reconciliation.
    async fn finish_device_ready(self: &Arc<Self>, device: &Arc<Device>) {
        if let Err(err) = device.get_gatt_services().await {
            tracing::warn!("gatt discovery failed for {}: {}", device.address, err);
        }
        device.mark_ready();
        for listener in self.listeners.snapshot().iter() {
            listener.device_ready(device.clone()).await;
        }
        self.reconcile_discovery().await;
    }

    pub async fn reset(&self) -> Result<(), HostError> {
        self.hci.send_command_default(ble_hci::opcodes::RESET, Vec::new()).await?;
        Ok(())
    }

    pub fn close(&self) {
        drop(self.shutdown.drop_guard());
        self.mgmt.shutdown();
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Arc<ble_hci::EventFrame>>, mut close_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = close_rx.recv() => {
                    tracing::info!("adapter event loop stopping on shutdown signal");
                    return;
                }
                event = events.recv() => {
                    match event {
                        Some(evt) => self.handle_event(&evt).await,
                        None => {
                            tracing::warn!("hci event stream ended, adapter event loop stopping");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, evt: &ble_hci::EventFrame) {
        if let Some((sub_event, params)) = evt.le_meta_sub_event() {
            match sub_event {
                LE_META_ADVERTISING_REPORT_SUBEVENT => self.handle_advertising_report(params).await,
                LE_META_CONNECTION_COMPLETE_SUBEVENT => self.handle_connection_complete(params).await,
                _ => {}
            }
            return;
        }
        if evt.code == EVT_DISCONNECTION_COMPLETE {
            self.handle_disconnection_complete(&evt.params).await;
        }
    }

    /// Parses a single LE Advertising Report (multi-report batches are not
    /// split; `num_reports` is read and assumed to be 1, matching every
    /// observed recent controller behavior with extended scanning off).
    async fn handle_advertising_report(self: &Arc<Self>, params: &[u8]) {
        // num_reports(1) event_type(1) address_type(1) address(6) data_length(1) data(n) rssi(1)
        if params.len() < 11 {
            return;
        }
        let address_type_raw = params[2];
        let address = Address::from_hci_bytes([params[3], params[4], params[5], params[6], params[7], params[8]]);
        let data_len = params[9] as usize;
        if params.len() < 10 + data_len + 1 {
            return;
        }
        let address_type = AddressType::from_hci_field(address_type_raw, None);

        let device = {
            let mut devices = self.devices.lock().unwrap();
            devices
                .entry(address)
                .or_insert_with(|| Device::new(address, address_type, DeviceRole::Central, self.local_address, self.key_dir.clone()))
                .clone()
        };

        let mut keep = true;
        for listener in self.listeners.snapshot().iter() {
            if !listener.device_found(device.clone()).await {
                keep = false;
            }
        }
        if !keep {
            self.devices.lock().unwrap().remove(&address);
        }
    }

    async fn handle_connection_complete(self: &Arc<Self>, params: &[u8]) {
        if params.len() < 9 {
            return;
        }
        let status = params[0];
        let handle = u16::from_le_bytes([params[1], params[2]]);
        let address = Address::from_hci_bytes([params[3], params[4], params[5], params[6], params[7], params[8]]);

        if status != 0 {
            if let Some(tx) = self.pending_connections.lock().unwrap().remove(&address) {
                let _ = tx.send(Err(HostError::CommandFailed(status)));
            }
            return;
        }

        let device = {
            let mut devices = self.devices.lock().unwrap();
            devices
                .entry(address)
                .or_insert_with(|| Device::new(address, AddressType::Public, DeviceRole::Peripheral, self.local_address, self.key_dir.clone()))
                .clone()
        };

        if let Err(err) = device.on_connected(&self.mux, handle).await {
            if let Some(tx) = self.pending_connections.lock().unwrap().remove(&address) {
                let _ = tx.send(Err(err));
            }
            return;
        }

        let gatt_server = self.gatt_server.lock().unwrap().clone();
        if let Some(server) = gatt_server {
            if device.role() == DeviceRole::Peripheral {
                if let Ok(att_channel) = self
                    .mux
                    .connect(handle, self.local_address, (address, device.address_type), ble_l2cap::CID_ATT, ble_l2cap::SecurityLevel::None)
                    .await
                {
                    let session = Arc::new(server.serve(address, Arc::new(att_channel)));
                    tokio::spawn(session.run());
                }
            }
        }

        for listener in self.listeners.snapshot().iter() {
            listener.device_connected(device.clone()).await;
        }
        self.reconcile_discovery().await;

        self.apply_persisted_keys_if_any(&device).await;

        if let Some(tx) = self.pending_connections.lock().unwrap().remove(&address) {
            let _ = tx.send(Ok(device));
        }
    }

    /// Pre-paired reuse (spec.md §4.5, §8 P8): if a key bundle was already
    /// persisted for this peer, upload its LTK before any encrypted traffic
    /// and skip straight to `device_pairing_state = Completed`/`Ready`
    /// instead of re-running SMP pairing.
    async fn apply_persisted_keys_if_any(self: &Arc<Self>, device: &Arc<Device>) {
        let bundle = match device.load_persisted_keys() {
            Ok(Some(bundle)) => bundle,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("failed to probe persisted keys for {}: {}", device.address, err);
                return;
            }
        };
        if let Err(err) = device.upload_keys(&self.mgmt, bundle).await {
            tracing::warn!("failed to upload persisted keys for {}: {}", device.address, err);
            return;
        }
        for listener in self.listeners.snapshot().iter() {
            listener.device_pairing_state(device.clone(), ble_smp::PairingState::Completed).await;
        }
        self.finish_device_ready(device).await;
    }

    async fn handle_disconnection_complete(self: &Arc<Self>, params: &[u8]) {
        if params.len() < 4 {
            return;
        }
        let handle = u16::from_le_bytes([params[1], params[2]]);
        let reason_code = params[3];

        let device = { self.devices.lock().unwrap().values().find(|d| d.connection_handle() == handle).cloned() };
        let Some(device) = device else { return };

        device.on_disconnected();
        let reason = match reason_code {
            0x13 => DeviceDisconnectReason::RemoteRequest,
            0x16 => DeviceDisconnectReason::LocalRequest,
            _ => DeviceDisconnectReason::LinkLoss,
        };
        for listener in self.listeners.snapshot().iter() {
            listener.device_disconnected(device.clone(), reason).await;
        }
        self.reconcile_discovery().await;
    }
}

/// Pads/truncates advertising or scan-response payload to the fixed 31-byte
/// HCI field, prefixed with its actual length.
fn pad_ad_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    let len = data.len().min(31);
    out.push(len as u8);
    out.extend_from_slice(&data[..len]);
    out.resize(32, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_ad_data_prefixes_length_and_pads_to_32_bytes() {
        let out = pad_ad_data(&[0x02, 0x01, 0x06]);
        assert_eq!(out.len(), 32);
        assert_eq!(out[0], 3);
        assert_eq!(&out[1..4], &[0x02, 0x01, 0x06]);
        assert!(out[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn pad_ad_data_truncates_oversized_payload() {
        let out = pad_ad_data(&[0xAA; 40]);
        assert_eq!(out[0], 31);
        assert_eq!(out.len(), 32);
    }
}
