//! L2CAP channel connected to a fixed CID over an already-established LE
//! link. Built from scratch as a software layer above HCI ACL-Data frames
//! rather than a kernel socket: `L2capMux` owns the one reassembly/demux
//! task a connection handle needs, `L2capChannel` is a lightweight handle
//! into it that callers `read`/`write`/`close`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_hci::{HciEngine, PacketBoundary};
use ble_shared::{Address, AddressType};
use strum::{Display, EnumString};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time;

use crate::error::L2capError;
use crate::reassembly::Reassembler;

/// Legacy (pre-Data-Length-Extension) LE ACL payload ceiling; conservative
/// default until the engine surfaces the negotiated controller value.
const DEFAULT_ACL_FRAGMENT_SIZE: usize = 27;

pub const ATT_DEFAULT_MTU: u16 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum SecurityLevel {
    None,
    EncryptedNoAuth,
    EncryptedAuth,
    ScAuth,
}

struct PeerAddr {
    #[allow(dead_code)]
    address: Address,
    #[allow(dead_code)]
    address_type: AddressType,
}

struct DemuxState {
    channels: Mutex<HashMap<u16, mpsc::Sender<Vec<u8>>>>,
    closed: AtomicBool,
}

/// Owns the one ACL-Data subscription and reassembler a connection handle
/// needs; every `L2capChannel` for that handle routes through it.
struct Demux {
    handle: u16,
    state: Arc<DemuxState>,
}

impl Demux {
    fn spawn(engine: Arc<HciEngine>, handle: u16) -> Result<Self, L2capError> {
        let state = Arc::new(DemuxState {
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let task_state = state.clone();
        let task_engine = engine.clone();
        tokio::spawn(async move {
            let mut acl_rx = match task_engine.subscribe_acl().await {
                Ok(rx) => rx,
                Err(err) => {
                    tracing::error!("l2cap demux for handle {:#06x} failed to subscribe: {}", handle, err);
                    return;
                }
            };
            let mut reasm = Reassembler::new();
            while let Some(acl) = acl_rx.recv().await {
                if acl.handle != handle {
                    continue;
                }
                let is_first = !matches!(acl.boundary, PacketBoundary::Continuing);
                match reasm.feed(is_first, &acl.data) {
                    Ok(frames) => {
                        let channels = task_state.channels.lock().unwrap();
                        for frame in frames {
                            if let Some(tx) = channels.get(&frame.cid) {
                                let _ = tx.try_send(frame.payload);
                            } else {
                                tracing::debug!("l2cap frame for unregistered cid {:#06x} dropped", frame.cid);
                            }
                        }
                    }
                    Err(err) => tracing::warn!("l2cap reassembly error on handle {:#06x}: {}", handle, err),
                }
            }
            task_state.closed.store(true, Ordering::SeqCst);
        });
        Ok(Self { handle, state })
    }
}

/// Multiplexes one or more fixed-CID channels over one connection handle's
/// ACL stream. Created once per connection; `connect` opens a channel.
pub struct L2capMux {
    engine: Arc<HciEngine>,
    demuxers: Mutex<HashMap<u16, Arc<Demux>>>,
}

impl L2capMux {
    pub fn new(engine: Arc<HciEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            demuxers: Mutex::new(HashMap::new()),
        })
    }

    fn demux_for(&self, handle: u16) -> Result<Arc<Demux>, L2capError> {
        let mut demuxers = self.demuxers.lock().unwrap();
        if let Some(d) = demuxers.get(&handle) {
            return Ok(d.clone());
        }
        let demux = Arc::new(Demux::spawn(self.engine.clone(), handle)?);
        demuxers.insert(handle, demux.clone());
        Ok(demux)
    }

    /// Opens a channel to `cid` over `handle`. `local`/`remote` are carried
    /// for callers that need them (SMP key-bin naming, logging); this layer
    /// does not itself validate the link is encrypted to `security_level` —
    /// that is `ble_smp`'s responsibility, raised on demand.
    pub async fn connect(
        self: &Arc<Self>,
        handle: u16,
        local: (Address, AddressType),
        remote: (Address, AddressType),
        cid: u16,
        security_level: SecurityLevel,
    ) -> Result<L2capChannel, L2capError> {
        let demux = self.demux_for(handle)?;
        let (tx, rx) = mpsc::channel(32);
        demux.state.channels.lock().unwrap().insert(cid, tx);

        Ok(L2capChannel {
            handle,
            cid,
            engine: self.engine.clone(),
            demux,
            local: PeerAddr {
                address: local.0,
                address_type: local.1,
            },
            remote: PeerAddr {
                address: remote.0,
                address_type: remote.1,
            },
            security_level,
            mtu: AtomicU16::new(ATT_DEFAULT_MTU),
            rx: AsyncMutex::new(rx),
            open: AtomicBool::new(true),
        })
    }
}

/// One fixed-CID L2CAP channel. `read`/`write` operate on whole L2CAP SDUs;
/// fragmentation/reassembly across ACL packets is internal.
pub struct L2capChannel {
    handle: u16,
    cid: u16,
    engine: Arc<HciEngine>,
    demux: Arc<Demux>,
    #[allow(dead_code)]
    local: PeerAddr,
    #[allow(dead_code)]
    remote: PeerAddr,
    security_level: SecurityLevel,
    mtu: AtomicU16,
    rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    open: AtomicBool,
}

impl L2capChannel {
    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.demux.state.closed.load(Ordering::Acquire)
    }

    pub async fn read(&self, timeout: Duration) -> Result<Vec<u8>, L2capError> {
        if !self.is_open() {
            return Err(L2capError::Closed);
        }
        let mut rx = self.rx.lock().await;
        match time::timeout(timeout, rx.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(L2capError::PeerClosed),
            Err(_) => Err(L2capError::Timeout),
        }
    }

    pub async fn write(&self, payload: &[u8]) -> Result<(), L2capError> {
        if !self.is_open() {
            return Err(L2capError::Closed);
        }
        let mut w = ble_octets::Writer::with_capacity(4 + payload.len());
        w.put_u16_le(payload.len() as u16);
        w.put_u16_le(self.cid);
        w.put_bytes(payload);
        let frame = w.into_vec();

        let mut chunks = frame.chunks(DEFAULT_ACL_FRAGMENT_SIZE);
        if let Some(first) = chunks.next() {
            self.engine
                .send_acl_data(self.handle, PacketBoundary::FirstAutoFlushable, first.to_vec())
                .await?;
        }
        for chunk in chunks {
            self.engine
                .send_acl_data(self.handle, PacketBoundary::Continuing, chunk.to_vec())
                .await?;
        }
        Ok(())
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.demux.state.channels.lock().unwrap().remove(&self.cid);
        }
    }
}

impl Drop for L2capChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_level_round_trips_display_and_parse() {
        assert_eq!(SecurityLevel::EncryptedAuth.to_string(), "encrypted-auth");
        assert_eq!("sc-auth".parse::<SecurityLevel>().unwrap(), SecurityLevel::ScAuth);
    }

    #[test]
    fn default_mtu_matches_att_minimum() {
        assert_eq!(ATT_DEFAULT_MTU, 23);
    }
}
