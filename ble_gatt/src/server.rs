//! Declarative ATT/GATT server: a fixed attribute tree built before
//! advertising starts, served per-connection over the ATT L2CAP channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ble_l2cap::L2capChannel;
use ble_shared::addr::Address;
use ble_shared::UuidExt;
use tokio::sync::{oneshot, RwLock as AsyncRwLock};
use uuid::Uuid;

use crate::client::{CCCD_INDICATE, CCCD_NOTIFY, UUID_CHARACTERISTIC, UUID_CLIENT_CHAR_CONFIG, UUID_PRIMARY_SERVICE};
use crate::error::GattError;
use crate::pdu::{error_code, AttPdu, GroupAttrData, InformationData, TypeAttrData};

const INITIAL_MTU: u16 = 23;
const INDICATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Characteristic property bits, Core Vol 3 Part G §3.3.1.1.
pub mod char_props {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
}

#[derive(Debug, Clone)]
pub struct DescriptorSpec {
    pub uuid: Uuid,
    pub initial_value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub properties: u8,
    pub initial_value: Vec<u8>,
    pub descriptors: Vec<DescriptorSpec>,
}

impl CharacteristicSpec {
    pub fn new(uuid: Uuid, properties: u8, initial_value: Vec<u8>) -> Self {
        Self { uuid, properties, initial_value, descriptors: Vec::new() }
    }

    pub fn with_descriptor(mut self, uuid: Uuid, initial_value: Vec<u8>) -> Self {
        self.descriptors.push(DescriptorSpec { uuid, initial_value });
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicSpec>,
}

impl ServiceSpec {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, characteristics: Vec::new() }
    }

    pub fn with_characteristic(mut self, characteristic: CharacteristicSpec) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttributeKind {
    PrimaryService,
    CharacteristicDecl { value_handle: u16, properties: u8 },
    CharacteristicValue,
    Descriptor,
    Cccd,
}

#[derive(Debug, Clone)]
struct Attribute {
    handle: u16,
    uuid: Uuid,
    kind: AttributeKind,
    service_end: u16,
}

/// Identifies a descriptor or characteristic value for listener callbacks.
#[derive(Debug, Clone, Copy)]
pub struct AttributeLocation {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub descriptor_uuid: Option<Uuid>,
}

#[async_trait]
pub trait GattServerListener: Send + Sync {
    async fn read_char_value(&self, _device: Address, _location: AttributeLocation, stored: &[u8]) -> Result<Vec<u8>, u8> {
        Ok(stored.to_vec())
    }
    async fn write_char_value(&self, _device: Address, _location: AttributeLocation, _value: &[u8]) -> Result<(), u8> {
        Ok(())
    }
    async fn write_char_value_done(&self, _device: Address, _location: AttributeLocation, _value: &[u8]) {}
    async fn read_descriptor_value(&self, _device: Address, _location: AttributeLocation, stored: &[u8]) -> Result<Vec<u8>, u8> {
        Ok(stored.to_vec())
    }
    async fn write_descriptor_value(&self, _device: Address, _location: AttributeLocation, _value: &[u8]) -> Result<(), u8> {
        Ok(())
    }
    async fn write_descriptor_value_done(&self, _device: Address, _location: AttributeLocation, _value: &[u8]) {}
    async fn client_char_config_changed(
        &self,
        _device: Address,
        _location: AttributeLocation,
        _notify_enabled: bool,
        _indicate_enabled: bool,
    ) {
    }
}

struct NoopListener;
#[async_trait]
impl GattServerListener for NoopListener {}

pub struct GattServer {
    attributes: Vec<Attribute>,
    values: HashMap<u16, AsyncRwLock<Vec<u8>>>,
    locations: HashMap<u16, AttributeLocation>,
    cccd: Mutex<HashMap<(Address, u16), u16>>,
    listener: Arc<dyn GattServerListener>,
    max_mtu: u16,
}

pub struct GattServerBuilder {
    services: Vec<ServiceSpec>,
    max_mtu: u16,
    listener: Arc<dyn GattServerListener>,
}

impl GattServerBuilder {
    pub fn new() -> Self {
        Self { services: Vec::new(), max_mtu: 247, listener: Arc::new(NoopListener) }
    }

    pub fn service(mut self, service: ServiceSpec) -> Self {
        self.services.push(service);
        self
    }

    pub fn max_mtu(mut self, mtu: u16) -> Self {
        self.max_mtu = mtu;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn GattServerListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn build(self) -> Arc<GattServer> {
        let mut attributes = Vec::new();
        let mut values = HashMap::new();
        let mut locations = HashMap::new();
        let mut handle: u16 = 1;

        for service in &self.services {
            let service_handle = handle;
            handle += 1;
            let mut char_slots = Vec::new();
            for characteristic in &service.characteristics {
                let decl_handle = handle;
                let value_handle = handle + 1;
                handle += 2;
                char_slots.push((decl_handle, value_handle, characteristic));
                values.insert(value_handle, AsyncRwLock::new(characteristic.initial_value.clone()));
                locations.insert(
                    value_handle,
                    AttributeLocation { service_uuid: service.uuid, characteristic_uuid: characteristic.uuid, descriptor_uuid: None },
                );
                for descriptor in &characteristic.descriptors {
                    let dh = handle;
                    handle += 1;
                    values.insert(dh, AsyncRwLock::new(descriptor.initial_value.clone()));
                    locations.insert(
                        dh,
                        AttributeLocation {
                            service_uuid: service.uuid,
                            characteristic_uuid: characteristic.uuid,
                            descriptor_uuid: Some(descriptor.uuid),
                        },
                    );
                    attributes.push(Attribute { handle: dh, uuid: descriptor.uuid, kind: AttributeKind::Descriptor, service_end: 0 });
                }
                if characteristic.properties & (char_props::NOTIFY | char_props::INDICATE) != 0 {
                    let cccd_handle = handle;
                    handle += 1;
                    values.insert(cccd_handle, AsyncRwLock::new(vec![0x00, 0x00]));
                    locations.insert(
                        cccd_handle,
                        AttributeLocation {
                            service_uuid: service.uuid,
                            characteristic_uuid: characteristic.uuid,
                            descriptor_uuid: Some(Uuid::from_u16(UUID_CLIENT_CHAR_CONFIG)),
                        },
                    );
                    attributes.push(Attribute {
                        handle: cccd_handle,
                        uuid: Uuid::from_u16(UUID_CLIENT_CHAR_CONFIG),
                        kind: AttributeKind::Cccd,
                        service_end: 0,
                    });
                }
            }
            let service_end = handle - 1;
            attributes.push(Attribute { handle: service_handle, uuid: service.uuid, kind: AttributeKind::PrimaryService, service_end });
            for (decl_handle, value_handle, characteristic) in char_slots {
                attributes.push(Attribute {
                    handle: decl_handle,
                    uuid: Uuid::from_u16(UUID_CHARACTERISTIC),
                    kind: AttributeKind::CharacteristicDecl { value_handle, properties: characteristic.properties },
                    service_end: 0,
                });
                attributes.push(Attribute { handle: value_handle, uuid: characteristic.uuid, kind: AttributeKind::CharacteristicValue, service_end: 0 });
            }
        }
        attributes.sort_by_key(|a| a.handle);

        Arc::new(GattServer {
            attributes,
            values,
            locations,
            cccd: Mutex::new(HashMap::new()),
            listener: self.listener,
            max_mtu: self.max_mtu,
        })
    }
}

impl GattServer {
    pub fn value_handle_for(&self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Option<u16> {
        self.locations.iter().find_map(|(handle, loc)| {
            (loc.service_uuid == service_uuid && loc.characteristic_uuid == characteristic_uuid && loc.descriptor_uuid.is_none())
                .then_some(*handle)
        })
    }

    fn cccd_handle_for_value(&self, value_handle: u16) -> Option<u16> {
        let location = self.locations.get(&value_handle)?;
        self.locations.iter().find_map(|(handle, loc)| {
            (loc.characteristic_uuid == location.characteristic_uuid
                && loc.descriptor_uuid == Some(Uuid::from_u16(UUID_CLIENT_CHAR_CONFIG)))
            .then_some(*handle)
        })
    }

    pub fn serve(self: Arc<Self>, device: Address, channel: Arc<L2capChannel>) -> GattServerSession {
        GattServerSession { server: self, device, channel, mtu: AtomicU16::new(INITIAL_MTU), indication_ack: Mutex::new(None) }
    }
}

pub struct GattServerSession {
    server: Arc<GattServer>,
    device: Address,
    channel: Arc<L2capChannel>,
    mtu: AtomicU16,
    indication_ack: Mutex<Option<oneshot::Sender<()>>>,
}

impl GattServerSession {
    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    /// Drives the ATT request loop for this connection until the channel closes.
    pub async fn run(self: Arc<Self>) {
        loop {
            let bytes = match self.channel.read(Duration::from_secs(3600)).await {
                Ok(bytes) => bytes,
                Err(ble_l2cap::L2capError::Timeout) => continue,
                Err(_) => break,
            };
            let request = match AttPdu::parse(&bytes) {
                Ok(req) => req,
                Err(_) => continue,
            };
            if matches!(request, AttPdu::HandleValueCnf) {
                if let Some(tx) = self.indication_ack.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                continue;
            }
            if matches!(request, AttPdu::WriteCmd { .. }) {
                self.handle_write_cmd(request).await;
                continue;
            }
            let response = self.handle_request(request).await;
            if self.channel.write(&response.to_bytes()).await.is_err() {
                break;
            }
        }
    }

    async fn handle_write_cmd(&self, request: AttPdu) {
        if let AttPdu::WriteCmd { handle, value } = request {
            let _ = self.commit_write(handle, &value).await;
        }
    }

    async fn handle_request(&self, request: AttPdu) -> AttPdu {
        match request {
            AttPdu::ExchangeMtuReq { mtu: peer_mtu } => {
                let negotiated = peer_mtu.min(self.server.max_mtu);
                self.mtu.store(negotiated, Ordering::Release);
                AttPdu::ExchangeMtuRsp { mtu: negotiated.min(self.server.max_mtu) }
            }
            AttPdu::ReadByGroupTypeReq { start_handle, end_handle, group_type } => self.read_by_group_type(start_handle, end_handle, group_type),
            AttPdu::ReadByTypeReq { start_handle, end_handle, attribute_type } => self.read_by_type(start_handle, end_handle, attribute_type),
            AttPdu::FindInformationReq { start_handle, end_handle } => self.find_information(start_handle, end_handle),
            AttPdu::ReadReq { handle } => self.read_value(handle, 0).await,
            AttPdu::ReadBlobReq { handle, offset } => self.read_value(handle, offset).await,
            AttPdu::WriteReq { handle, value } => match self.commit_write(handle, &value).await {
                Ok(()) => AttPdu::WriteRsp,
                Err(code) => error_rsp(crate::pdu::opcode::WRITE_REQ, handle, code),
            },
            other => error_rsp(other.opcode(), 0, error_code::REQUEST_NOT_SUPPORTED),
        }
    }

    fn read_by_group_type(&self, start: u16, end: u16, group_type: Uuid) -> AttPdu {
        if group_type != Uuid::from_u16(UUID_PRIMARY_SERVICE) {
            return error_rsp(crate::pdu::opcode::READ_BY_GROUP_TYPE_REQ, start, error_code::UNSUPPORTED_GROUP_TYPE);
        }
        let data: Vec<GroupAttrData> = self
            .server
            .attributes
            .iter()
            .filter(|a| matches!(a.kind, AttributeKind::PrimaryService) && a.handle >= start && a.handle <= end)
            .map(|a| GroupAttrData { handle: a.handle, end_group_handle: a.service_end, value: uuid_bytes(&a.uuid) })
            .collect();
        if data.is_empty() {
            error_rsp(crate::pdu::opcode::READ_BY_GROUP_TYPE_REQ, start, error_code::ATTRIBUTE_NOT_FOUND)
        } else {
            AttPdu::ReadByGroupTypeRsp { data }
        }
    }

    fn read_by_type(&self, start: u16, end: u16, attribute_type: Uuid) -> AttPdu {
        if attribute_type != Uuid::from_u16(UUID_CHARACTERISTIC) {
            return error_rsp(crate::pdu::opcode::READ_BY_TYPE_REQ, start, error_code::ATTRIBUTE_NOT_FOUND);
        }
        let data: Vec<TypeAttrData> = self
            .server
            .attributes
            .iter()
            .filter_map(|a| match a.kind {
                AttributeKind::CharacteristicDecl { value_handle, properties } if a.handle >= start && a.handle <= end => {
                    let value_uuid = self.server.attributes.iter().find(|v| v.handle == value_handle)?;
                    let mut value = Vec::with_capacity(3 + 16);
                    value.push(properties);
                    value.extend_from_slice(&value_handle.to_le_bytes());
                    value.extend_from_slice(&uuid_bytes(&value_uuid.uuid));
                    Some(TypeAttrData { handle: a.handle, value })
                }
                _ => None,
            })
            .collect();
        if data.is_empty() {
            error_rsp(crate::pdu::opcode::READ_BY_TYPE_REQ, start, error_code::ATTRIBUTE_NOT_FOUND)
        } else {
            AttPdu::ReadByTypeRsp { data }
        }
    }

    fn find_information(&self, start: u16, end: u16) -> AttPdu {
        let data: Vec<InformationData> = self
            .server
            .attributes
            .iter()
            .filter(|a| a.handle >= start && a.handle <= end)
            .map(|a| {
                let uuid = match a.kind {
                    AttributeKind::PrimaryService => Uuid::from_u16(UUID_PRIMARY_SERVICE),
                    AttributeKind::CharacteristicDecl { .. } => Uuid::from_u16(UUID_CHARACTERISTIC),
                    _ => a.uuid,
                };
                InformationData { handle: a.handle, uuid }
            })
            .collect();
        if data.is_empty() {
            error_rsp(crate::pdu::opcode::FIND_INFORMATION_REQ, start, error_code::ATTRIBUTE_NOT_FOUND)
        } else {
            AttPdu::FindInformationRsp { data }
        }
    }

    async fn read_value(&self, handle: u16, offset: u16) -> AttPdu {
        let Some(lock) = self.server.values.get(&handle) else {
            return error_rsp(crate::pdu::opcode::READ_REQ, handle, error_code::INVALID_HANDLE);
        };
        let stored = lock.read().await;
        let location = self.server.locations.get(&handle).copied();
        let full = if let Some(location) = location {
            let outcome = if location.descriptor_uuid.is_some() {
                self.server.listener.read_descriptor_value(self.device, location, &stored).await
            } else {
                self.server.listener.read_char_value(self.device, location, &stored).await
            };
            match outcome {
                Ok(value) => value,
                Err(code) => return error_rsp(crate::pdu::opcode::READ_REQ, handle, code),
            }
        } else {
            stored.clone()
        };
        let offset = offset as usize;
        if offset > full.len() {
            return error_rsp(crate::pdu::opcode::READ_BLOB_REQ, handle, error_code::INVALID_OFFSET);
        }
        let ceiling = (self.mtu() - 1) as usize;
        let slice = &full[offset..];
        let chunk: Vec<u8> = slice.iter().take(ceiling).copied().collect();
        if offset == 0 {
            AttPdu::ReadRsp { value: chunk }
        } else {
            AttPdu::ReadBlobRsp { value: chunk }
        }
    }

    async fn commit_write(&self, handle: u16, value: &[u8]) -> Result<(), u8> {
        let Some(lock) = self.server.values.get(&handle) else {
            return Err(error_code::INVALID_HANDLE);
        };
        let Some(location) = self.server.locations.get(&handle).copied() else {
            return Err(error_code::INVALID_HANDLE);
        };
        if location.descriptor_uuid == Some(Uuid::from_u16(UUID_CLIENT_CHAR_CONFIG)) {
            if value.len() != 2 {
                return Err(error_code::INVALID_ATTRIBUTE_VALUE_LENGTH);
            }
            self.server.listener.write_descriptor_value(self.device, location, value).await?;
            *lock.write().await = value.to_vec();
            let bits = u16::from_le_bytes([value[0], value[1]]);
            self.server.cccd.lock().unwrap().insert((self.device, handle), bits);
            self.server
                .listener
                .client_char_config_changed(self.device, location, bits & CCCD_NOTIFY != 0, bits & CCCD_INDICATE != 0)
                .await;
            self.server.listener.write_descriptor_value_done(self.device, location, value).await;
            return Ok(());
        }
        if location.descriptor_uuid.is_some() {
            self.server.listener.write_descriptor_value(self.device, location, value).await?;
            *lock.write().await = value.to_vec();
            self.server.listener.write_descriptor_value_done(self.device, location, value).await;
        } else {
            self.server.listener.write_char_value(self.device, location, value).await?;
            *lock.write().await = value.to_vec();
            self.server.listener.write_char_value_done(self.device, location, value).await;
        }
        Ok(())
    }

    /// Sends a notification if the client has enabled it via CCCD; a no-op otherwise.
    pub async fn send_notification(&self, value_handle: u16, value: Vec<u8>) -> Result<(), GattError> {
        if !self.cccd_enabled(value_handle, CCCD_NOTIFY) {
            return Ok(());
        }
        self.channel.write(&AttPdu::HandleValueNtf { handle: value_handle, value }.to_bytes()).await?;
        Ok(())
    }

    /// Sends an indication if enabled, awaiting confirmation with a 30 s timeout.
    pub async fn send_indication(&self, value_handle: u16, value: Vec<u8>) -> Result<(), GattError> {
        if !self.cccd_enabled(value_handle, CCCD_INDICATE) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        *self.indication_ack.lock().unwrap() = Some(tx);
        self.channel.write(&AttPdu::HandleValueInd { handle: value_handle, value }.to_bytes()).await?;
        match tokio::time::timeout(INDICATION_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GattError::PeerClosed),
            Err(_) => {
                self.indication_ack.lock().unwrap().take();
                Err(GattError::Timeout)
            }
        }
    }

    fn cccd_enabled(&self, value_handle: u16, bit: u16) -> bool {
        let Some(cccd_handle) = self.server.cccd_handle_for_value(value_handle) else {
            return false;
        };
        self.server
            .cccd
            .lock()
            .unwrap()
            .get(&(self.device, cccd_handle))
            .is_some_and(|bits| bits & bit != 0)
    }
}

fn uuid_bytes(uuid: &Uuid) -> Vec<u8> {
    match uuid.short_form_u16() {
        Some(short) => short.to_le_bytes().to_vec(),
        None => uuid.as_bytes().iter().rev().copied().collect(),
    }
}

fn error_rsp(opcode: u8, handle: u16, code: u8) -> AttPdu {
    AttPdu::ErrorRsp { request_opcode: opcode, handle, error_code: code }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_server() -> Arc<GattServer> {
        GattServerBuilder::new()
            .service(
                ServiceSpec::new(Uuid::from_u16(0x180A)).with_characteristic(CharacteristicSpec::new(
                    Uuid::from_u16(0x2A29),
                    char_props::READ,
                    b"Gothel Software".to_vec(),
                )),
            )
            .build()
    }

    #[test]
    fn builder_assigns_sequential_handles() {
        let server = build_server();
        assert_eq!(server.attributes.len(), 2);
        let service = server.attributes.iter().find(|a| matches!(a.kind, AttributeKind::PrimaryService)).unwrap();
        assert_eq!(service.handle, 1);
        assert_eq!(service.service_end, 3);
    }

    #[test]
    fn value_handle_for_resolves_declared_characteristic() {
        let server = build_server();
        let handle = server.value_handle_for(Uuid::from_u16(0x180A), Uuid::from_u16(0x2A29));
        assert_eq!(handle, Some(3));
    }

    #[test]
    fn notify_capable_characteristic_gets_a_cccd() {
        let server = GattServerBuilder::new()
            .service(
                ServiceSpec::new(Uuid::from_u16(0x1234)).with_characteristic(CharacteristicSpec::new(
                    Uuid::from_u16(0x5678),
                    char_props::NOTIFY,
                    vec![0x00],
                )),
            )
            .build();
        assert!(server.attributes.iter().any(|a| matches!(a.kind, AttributeKind::Cccd)));
    }
}
