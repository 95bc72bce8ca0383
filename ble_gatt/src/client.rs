//! GATT client built on the ATT L2CAP channel: MTU exchange, service and
//! characteristic discovery, attribute read/write, and notification /
//! indication routing to registered listeners.

use std::ops::Range;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ble_l2cap::L2capChannel;
use ble_shared::listener::ListenerList;
use ble_shared::UuidExt;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::error::GattError;
use crate::pdu::{error_code, AttPdu};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle poll interval for the background reader; notifications and
/// indications can arrive at any time between requests.
const READER_POLL: Duration = Duration::from_secs(3600);

pub const UUID_PRIMARY_SERVICE: u16 = 0x2800;
pub const UUID_CHARACTERISTIC: u16 = 0x2803;
pub const UUID_CLIENT_CHAR_CONFIG: u16 = 0x2902;

pub const CCCD_NOTIFY: u16 = 0x0001;
pub const CCCD_INDICATE: u16 = 0x0002;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub handle_range: Range<u16>,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub decl_handle: u16,
    pub value_handle: u16,
    pub properties: u8,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDescriptor {
    pub handle: u16,
    pub uuid: Uuid,
}

/// Routes inbound pushes to the application, keyed by value handle. Every
/// method must be implementable as a no-op.
#[async_trait]
pub trait GattCharListener: Send + Sync {
    async fn notification_received(&self, _value_handle: u16, _value: Vec<u8>, _timestamp_unix_ms: u64) {}
    async fn indication_received(&self, _value_handle: u16, _value: Vec<u8>, _timestamp_unix_ms: u64, _confirmation_sent: bool) {}
}

pub struct GattClient {
    channel: Arc<L2capChannel>,
    mtu: AtomicU16,
    pending: Mutex<Option<oneshot::Sender<AttPdu>>>,
    request_lock: AsyncMutex<()>,
    listeners: ListenerList<dyn GattCharListener>,
}

impl GattClient {
    pub fn spawn(channel: Arc<L2capChannel>) -> Arc<Self> {
        let client = Arc::new(Self {
            channel: channel.clone(),
            mtu: AtomicU16::new(channel.mtu()),
            pending: Mutex::new(None),
            request_lock: AsyncMutex::new(()),
            listeners: ListenerList::new(),
        });
        let task_client = client.clone();
        tokio::spawn(async move { task_client.reader_loop().await });
        client
    }

    pub fn add_listener(&self, listener: Arc<dyn GattCharListener>) {
        self.listeners.add(listener);
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    async fn reader_loop(self: Arc<Self>) {
        while self.channel.is_open() {
            match self.channel.read(READER_POLL).await {
                Ok(bytes) => self.dispatch(bytes).await,
                Err(ble_l2cap::L2capError::Timeout) => continue,
                Err(_) => break,
            }
        }
        if let Some(tx) = self.pending.lock().unwrap().take() {
            drop(tx); // wakes the waiting request with a RecvError -> PeerClosed
        }
    }

    async fn dispatch(&self, bytes: Vec<u8>) {
        let pdu = match AttPdu::parse(&bytes) {
            Ok(pdu) => pdu,
            Err(err) => {
                tracing::warn!("malformed att pdu from peer: {}", err);
                return;
            }
        };
        match pdu {
            AttPdu::HandleValueNtf { handle, value } => {
                let ts = now_unix_ms();
                for l in self.listeners.snapshot().iter() {
                    l.notification_received(handle, value.clone(), ts).await;
                }
            }
            AttPdu::HandleValueInd { handle, value } => {
                let ts = now_unix_ms();
                for l in self.listeners.snapshot().iter() {
                    l.indication_received(handle, value.clone(), ts, true).await;
                }
                if let Err(err) = self.channel.write(&AttPdu::HandleValueCnf.to_bytes()).await {
                    tracing::debug!("failed to confirm indication: {}", err);
                }
            }
            other => {
                if let Some(tx) = self.pending.lock().unwrap().take() {
                    let _ = tx.send(other);
                } else {
                    tracing::debug!("att response with no matching request dropped: opcode {:#04x}", other.opcode());
                }
            }
        }
    }

    async fn request(&self, pdu: AttPdu) -> Result<AttPdu, GattError> {
        let _guard = self.request_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap() = Some(tx);
        self.channel.write(&pdu.to_bytes()).await?;
        match tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(AttPdu::ErrorRsp { request_opcode, handle, error_code })) => {
                Err(GattError::AttError { opcode: request_opcode, handle, code: error_code })
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GattError::PeerClosed),
            Err(_) => {
                self.pending.lock().unwrap().take();
                Err(GattError::Timeout)
            }
        }
    }

    pub async fn exchange_mtu(&self, desired: u16) -> Result<u16, GattError> {
        let response = self.request(AttPdu::ExchangeMtuReq { mtu: desired }).await?;
        let AttPdu::ExchangeMtuRsp { mtu: peer_mtu } = response else {
            return Err(crate::error::GattInternalError::UnexpectedPdu.into());
        };
        let negotiated = desired.min(peer_mtu);
        self.mtu.store(negotiated, Ordering::Release);
        self.channel.set_mtu(negotiated);
        Ok(negotiated)
    }

    pub async fn discover_primary_services(&self) -> Result<Vec<DiscoveredService>, GattError> {
        let mut out = Vec::new();
        let mut start = 0x0001u16;
        loop {
            let response = self
                .request(AttPdu::ReadByGroupTypeReq {
                    start_handle: start,
                    end_handle: 0xFFFF,
                    group_type: Uuid::from_u16(UUID_PRIMARY_SERVICE),
                })
                .await;
            let data = match response {
                Ok(AttPdu::ReadByGroupTypeRsp { data }) => data,
                Ok(_) => return Err(crate::error::GattInternalError::UnexpectedPdu.into()),
                Err(GattError::AttError { code, .. }) if matches!(code, error_code::INVALID_HANDLE | error_code::ATTRIBUTE_NOT_FOUND) => break,
                Err(err) => return Err(err),
            };
            if data.is_empty() {
                break;
            }
            let last_end = data.last().unwrap().end_group_handle;
            for entry in data {
                let uuid = parse_group_uuid(&entry.value);
                out.push(DiscoveredService { handle_range: entry.handle..entry.end_group_handle.wrapping_add(1), uuid });
            }
            if last_end == 0xFFFF {
                break;
            }
            start = last_end + 1;
        }
        Ok(out)
    }

    pub async fn discover_characteristics(&self, service_range: Range<u16>) -> Result<Vec<DiscoveredCharacteristic>, GattError> {
        let mut out = Vec::new();
        let mut start = service_range.start;
        loop {
            let response = self
                .request(AttPdu::ReadByTypeReq {
                    start_handle: start,
                    end_handle: service_range.end.saturating_sub(1).max(start),
                    attribute_type: Uuid::from_u16(UUID_CHARACTERISTIC),
                })
                .await;
            let data = match response {
                Ok(AttPdu::ReadByTypeRsp { data }) => data,
                Ok(_) => return Err(crate::error::GattInternalError::UnexpectedPdu.into()),
                Err(GattError::AttError { code, .. }) if matches!(code, error_code::INVALID_HANDLE | error_code::ATTRIBUTE_NOT_FOUND) => break,
                Err(err) => return Err(err),
            };
            if data.is_empty() {
                break;
            }
            let last_handle = data.last().unwrap().handle;
            for entry in &data {
                if entry.value.len() < 3 {
                    continue;
                }
                let properties = entry.value[0];
                let value_handle = u16::from_le_bytes([entry.value[1], entry.value[2]]);
                let uuid = parse_characteristic_uuid(&entry.value[3..]);
                out.push(DiscoveredCharacteristic { decl_handle: entry.handle, value_handle, properties, uuid });
            }
            if last_handle >= service_range.end.saturating_sub(1) {
                break;
            }
            start = last_handle + 1;
        }
        Ok(out)
    }

    pub async fn discover_descriptors(&self, char_range: Range<u16>) -> Result<Vec<DiscoveredDescriptor>, GattError> {
        let mut out = Vec::new();
        let mut start = char_range.start;
        loop {
            let response = self
                .request(AttPdu::FindInformationReq { start_handle: start, end_handle: char_range.end })
                .await;
            let data = match response {
                Ok(AttPdu::FindInformationRsp { data }) => data,
                Ok(_) => return Err(crate::error::GattInternalError::UnexpectedPdu.into()),
                Err(GattError::AttError { code, .. }) if matches!(code, error_code::INVALID_HANDLE | error_code::ATTRIBUTE_NOT_FOUND) => break,
                Err(err) => return Err(err),
            };
            if data.is_empty() {
                break;
            }
            let last_handle = data.last().unwrap().handle;
            for entry in data {
                out.push(DiscoveredDescriptor { handle: entry.handle, uuid: entry.uuid });
            }
            if last_handle >= char_range.end {
                break;
            }
            start = last_handle + 1;
        }
        Ok(out)
    }

    pub async fn read_value(&self, handle: u16) -> Result<Vec<u8>, GattError> {
        let response = self.request(AttPdu::ReadReq { handle }).await?;
        let AttPdu::ReadRsp { value: mut full } = response else {
            return Err(crate::error::GattInternalError::UnexpectedPdu.into());
        };
        let chunk_ceiling = (self.mtu() - 1) as usize;
        while full.len() % chunk_ceiling == 0 && !full.is_empty() {
            let response = self
                .request(AttPdu::ReadBlobReq { handle, offset: full.len() as u16 })
                .await?;
            let AttPdu::ReadBlobRsp { value: chunk } = response else {
                return Err(crate::error::GattInternalError::UnexpectedPdu.into());
            };
            let chunk_len = chunk.len();
            full.extend(chunk);
            if chunk_len < chunk_ceiling {
                break;
            }
        }
        Ok(full)
    }

    pub async fn write_value(&self, handle: u16, value: &[u8], with_response: bool) -> Result<(), GattError> {
        if with_response {
            self.request(AttPdu::WriteReq { handle, value: value.to_vec() }).await?;
            Ok(())
        } else {
            self.channel.write(&AttPdu::WriteCmd { handle, value: value.to_vec() }.to_bytes()).await?;
            Ok(())
        }
    }

    pub async fn write_cccd(&self, descriptor_handle: u16, notify: bool, indicate: bool) -> Result<(), GattError> {
        let mut bits = 0u16;
        if notify {
            bits |= CCCD_NOTIFY;
        }
        if indicate {
            bits |= CCCD_INDICATE;
        }
        self.write_value(descriptor_handle, &bits.to_le_bytes(), true).await
    }
}

fn parse_group_uuid(value: &[u8]) -> Uuid {
    let mut r = ble_octets::Reader::new(value);
    r.get_uuid_sized(value.len()).unwrap_or(Uuid::nil())
}

fn parse_characteristic_uuid(value: &[u8]) -> Uuid {
    let mut r = ble_octets::Reader::new(value);
    r.get_uuid_sized(value.len()).unwrap_or(Uuid::nil())
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cccd_bits_combine_notify_and_indicate() {
        let mut bits = 0u16;
        bits |= CCCD_NOTIFY;
        bits |= CCCD_INDICATE;
        assert_eq!(bits, 0x0003);
    }

    #[test]
    fn group_uuid_parses_16bit_short_form() {
        let uuid = parse_group_uuid(&[0x00, 0x18]);
        assert_eq!(uuid, Uuid::from_u16(0x1800));
    }
}
