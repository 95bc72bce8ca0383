//! SMP pairing driver: drives inbound PDUs on the SMP CID through feature
//! exchange, key derivation (LE Legacy and LE Secure Connections), and key
//! distribution, surfacing IO-capability callbacks to the application along
//! the way. One driver instance lives for exactly one pairing attempt on
//! one connection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ble_l2cap::L2capChannel;
use ble_shared::listener::ListenerList;
use ble_shared::{Address, AddressType};
use rand::RngCore;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time;

use crate::crypto::{self, EcdhKeyPair, IoCapability, PairingMethod};
use crate::error::SmpError;
use crate::keybin::{LongTermKeyMaterial, PairingMode, PairingRole, SmpKeyBundle};
use crate::pdu::{IdentityAddress, PairingFeatures, SmpPdu};

const WATCHDOG: Duration = Duration::from_secs(3);
const LEGACY_WATCHDOG_RETRIES: u32 = 1;

const AUTH_REQ_BONDING: u8 = 0x01;
const AUTH_REQ_MITM: u8 = 0x04;
const AUTH_REQ_SC: u8 = 0x08;

const KEY_DIST_ENC: u8 = 0x01;
const KEY_DIST_ID: u8 = 0x02;
const KEY_DIST_SIGN: u8 = 0x04;
const KEY_DIST_LINK: u8 = 0x08;

pub const REASON_PASSKEY_ENTRY_FAILED: u8 = 0x01;
pub const REASON_AUTHENTICATION_REQUIREMENTS: u8 = 0x03;
pub const REASON_CONFIRM_VALUE_FAILED: u8 = 0x04;
pub const REASON_UNSPECIFIED: u8 = 0x08;
pub const REASON_DHKEY_CHECK_FAILED: u8 = 0x0B;
pub const REASON_NUMERIC_COMPARISON_FAILED: u8 = 0x0C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    FeatureExchangeStarted,
    FeatureExchangeCompleted,
    PasskeyExpected,
    NumericCompareExpected,
    PasskeyNotify,
    OobExpected,
    KeyDistribution,
    Completed,
    Failed,
}

impl PairingState {
    fn set(cell: &AtomicU8, state: PairingState) {
        cell.store(state as u8, Ordering::SeqCst);
    }

    fn get(cell: &AtomicU8) -> PairingState {
        match cell.load(Ordering::SeqCst) {
            0 => PairingState::Idle,
            1 => PairingState::FeatureExchangeStarted,
            2 => PairingState::FeatureExchangeCompleted,
            3 => PairingState::PasskeyExpected,
            4 => PairingState::NumericCompareExpected,
            5 => PairingState::PasskeyNotify,
            6 => PairingState::OobExpected,
            7 => PairingState::KeyDistribution,
            8 => PairingState::Completed,
            _ => PairingState::Failed,
        }
    }
}

/// Callbacks the application answers asynchronously as pairing progresses.
/// Every method must be implementable as a no-op.
#[async_trait]
pub trait SmpEventListener: Send + Sync {
    async fn passkey_expected(&self) {}
    async fn numeric_compare_expected(&self, _value: u32) {}
    async fn passkey_notify(&self, _value: u32) {}
}

/// Local IO-capability and bonding configuration for one pairing attempt.
#[derive(Debug, Clone, Copy)]
pub struct PairingParams {
    pub io_capability: IoCapability,
    pub mitm_required: bool,
    pub bonding: bool,
    pub secure_connections_supported: bool,
    pub max_encryption_key_size: u8,
    pub distribute_id_key: bool,
    pub distribute_sign_key: bool,
    pub distribute_link_key: bool,
}

impl Default for PairingParams {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            mitm_required: false,
            bonding: true,
            secure_connections_supported: true,
            max_encryption_key_size: 16,
            distribute_id_key: true,
            distribute_sign_key: false,
            distribute_link_key: false,
        }
    }
}

impl PairingParams {
    fn auth_req(&self) -> u8 {
        let mut v = 0u8;
        if self.bonding {
            v |= AUTH_REQ_BONDING;
        }
        if self.mitm_required {
            v |= AUTH_REQ_MITM;
        }
        if self.secure_connections_supported {
            v |= AUTH_REQ_SC;
        }
        v
    }

    fn key_distribution(&self) -> u8 {
        let mut v = KEY_DIST_ENC;
        if self.distribute_id_key {
            v |= KEY_DIST_ID;
        }
        if self.distribute_sign_key {
            v |= KEY_DIST_SIGN;
        }
        if self.distribute_link_key {
            v |= KEY_DIST_LINK;
        }
        v
    }

    fn features(&self) -> PairingFeatures {
        PairingFeatures {
            io_capability: self.io_capability.as_wire(),
            oob_data_flag: 0,
            auth_req: self.auth_req(),
            max_encryption_key_size: self.max_encryption_key_size,
            initiator_key_distribution: self.key_distribution(),
            responder_key_distribution: self.key_distribution(),
        }
    }
}

#[derive(Default)]
struct DistributedKeys {
    ltk: Option<LongTermKeyMaterial>,
    irk: Option<[u8; 16]>,
    csrk: Option<[u8; 16]>,
    link_key: Option<[u8; 16]>,
}

/// Drives one pairing attempt over an already-open SMP L2CAP channel.
pub struct SmpDriver {
    channel: Arc<L2capChannel>,
    local: (Address, AddressType),
    remote: (Address, AddressType),
    role: PairingRole,
    params: PairingParams,
    state: AtomicU8,
    listeners: ListenerList<dyn SmpEventListener>,
    passkey_reply: AsyncMutex<Option<oneshot::Sender<Option<u32>>>>,
    numeric_compare_reply: AsyncMutex<Option<oneshot::Sender<bool>>>,
}

impl SmpDriver {
    pub fn new(channel: Arc<L2capChannel>, local: (Address, AddressType), remote: (Address, AddressType), role: PairingRole, params: PairingParams) -> Arc<Self> {
        Arc::new(Self {
            channel,
            local,
            remote,
            role,
            params,
            state: AtomicU8::new(PairingState::Idle as u8),
            listeners: ListenerList::new(),
            passkey_reply: AsyncMutex::new(None),
            numeric_compare_reply: AsyncMutex::new(None),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn SmpEventListener>) {
        self.listeners.add(listener);
    }

    pub fn state(&self) -> PairingState {
        PairingState::get(&self.state)
    }

    /// Answers a `PasskeyExpected` callback. `None` reports user cancellation.
    pub async fn set_passkey(&self, value: u32) {
        if let Some(tx) = self.passkey_reply.lock().await.take() {
            let _ = tx.send(Some(value));
        }
    }

    pub async fn set_passkey_negative(&self) {
        if let Some(tx) = self.passkey_reply.lock().await.take() {
            let _ = tx.send(None);
        }
    }

    pub async fn set_numeric_compare(&self, accept: bool) {
        if let Some(tx) = self.numeric_compare_reply.lock().await.take() {
            let _ = tx.send(accept);
        }
    }

    /// Runs the full pairing attempt to completion, returning the derived
    /// key bundle. A persisted key-bin is the caller's responsibility.
    pub async fn run(self: &Arc<Self>) -> Result<SmpKeyBundle, SmpError> {
        match self.run_inner().await {
            Ok(bundle) => {
                PairingState::set(&self.state, PairingState::Completed);
                Ok(bundle)
            }
            Err(err) => {
                PairingState::set(&self.state, PairingState::Failed);
                Err(err)
            }
        }
    }

    async fn run_inner(self: &Arc<Self>) -> Result<SmpKeyBundle, SmpError> {
        let (local_features, remote_features) = self.exchange_features().await?;
        PairingState::set(&self.state, PairingState::FeatureExchangeCompleted);

        let secure_connections = self.params.secure_connections_supported && (remote_features.auth_req & AUTH_REQ_SC != 0);
        let initiator_mitm = match self.role {
            PairingRole::Initiator => self.params.mitm_required,
            PairingRole::Responder => remote_features.auth_req & AUTH_REQ_MITM != 0,
        };
        let responder_mitm = match self.role {
            PairingRole::Initiator => remote_features.auth_req & AUTH_REQ_MITM != 0,
            PairingRole::Responder => self.params.mitm_required,
        };
        let remote_io = IoCapability::from_wire(remote_features.io_capability).unwrap_or(IoCapability::NoInputNoOutput);
        let method = crypto::select_pairing_method(
            false,
            false,
            initiator_mitm,
            responder_mitm,
            secure_connections,
            self.params.io_capability,
            remote_io,
        );

        let key_size = local_features.max_encryption_key_size.min(remote_features.max_encryption_key_size);

        let (ltk, authenticated) = if secure_connections {
            self.sc_pairing(method, remote_io, &local_features, &remote_features).await?
        } else {
            self.legacy_pairing(method, remote_io).await?
        };
        let ltk = truncate_key(ltk, key_size);

        let keys = self.key_distribution(&local_features, &remote_features, ltk, secure_connections).await?;

        Ok(SmpKeyBundle {
            local: Some(self.local),
            remote: Some(self.remote),
            security_level: if authenticated { 2 } else { 1 },
            io_capability: self.params.io_capability.as_wire(),
            pairing_role: Some(self.role),
            pairing_mode: Some(pairing_mode_for(method)),
            valid: true,
            secure_connections,
            authenticated,
            ltk_initiator: match self.role {
                PairingRole::Initiator => keys.ltk,
                PairingRole::Responder => None,
            },
            ltk_responder: match self.role {
                PairingRole::Responder => keys.ltk,
                PairingRole::Initiator => None,
            },
            irk: keys.irk,
            csrk: keys.csrk,
            link_key: keys.link_key,
        })
    }

    async fn send(&self, pdu: &SmpPdu) -> Result<(), SmpError> {
        self.channel.write(&pdu.to_bytes()).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<SmpPdu, SmpError> {
        let bytes = self.channel.read(WATCHDOG).await?;
        Ok(SmpPdu::parse(&bytes)?)
    }

    async fn exchange_features(self: &Arc<Self>) -> Result<(PairingFeatures, PairingFeatures), SmpError> {
        PairingState::set(&self.state, PairingState::FeatureExchangeStarted);
        let local_features = self.params.features();
        match self.role {
            PairingRole::Initiator => {
                self.send(&SmpPdu::PairingRequest(local_features)).await?;
                match self.recv().await? {
                    SmpPdu::PairingResponse(f) => Ok((local_features, f)),
                    SmpPdu::PairingFailed(reason) => Err(SmpError::Failed(reason)),
                    _ => Err(SmpError::InvalidState("expected PairingResponse")),
                }
            }
            PairingRole::Responder => match self.recv().await? {
                SmpPdu::PairingRequest(f) => {
                    self.send(&SmpPdu::PairingResponse(local_features)).await?;
                    Ok((local_features, f))
                }
                SmpPdu::PairingFailed(reason) => Err(SmpError::Failed(reason)),
                _ => Err(SmpError::InvalidState("expected PairingRequest")),
            },
        }
    }

    /// Association-model-specific TK (temporary key) determination, per
    /// Core Vol 3 Part H §2.3.5.1. OOB is not wired to a transport here, so
    /// it degrades to Just Works.
    async fn determine_tk(self: &Arc<Self>, method: PairingMethod, remote_io: IoCapability) -> Result<[u8; 16], SmpError> {
        match method {
            PairingMethod::JustWorks | PairingMethod::OutOfBand => Ok([0u8; 16]),
            PairingMethod::NumericComparison => Ok([0u8; 16]),
            PairingMethod::PasskeyEntry => {
                let displays = matches!(self.params.io_capability, IoCapability::DisplayOnly | IoCapability::DisplayYesNo)
                    && matches!(remote_io, IoCapability::KeyboardOnly | IoCapability::KeyboardDisplay);
                let passkey = if displays {
                    let value = rand::thread_rng().next_u32() % 1_000_000;
                    self.notify_listeners_passkey(value).await;
                    value
                } else {
                    PairingState::set(&self.state, PairingState::PasskeyExpected);
                    let (tx, rx) = oneshot::channel();
                    *self.passkey_reply.lock().await = Some(tx);
                    self.notify_listeners_passkey_expected().await;
                    rx.await.map_err(|_| SmpError::Internal(crate::error::SmpInternalError::CallbackDropped))?
                        .ok_or(SmpError::Failed(REASON_PASSKEY_ENTRY_FAILED))?
                };
                let mut tk = [0u8; 16];
                tk[0..4].copy_from_slice(&passkey.to_le_bytes());
                Ok(tk)
            }
        }
    }

    async fn legacy_pairing(self: &Arc<Self>, method: PairingMethod, remote_io: IoCapability) -> Result<([u8; 16], bool), SmpError> {
        let tk = self.determine_tk(method, remote_io).await?;
        let authenticated = !matches!(method, PairingMethod::JustWorks);

        let mut local_rand = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut local_rand);

        let preq = SmpPdu::PairingRequest(self.params.features()).to_bytes();
        let pres = SmpPdu::PairingResponse(self.params.features()).to_bytes();
        let (pres7, preq7) = (fixed7(&pres), fixed7(&preq));

        let (initiator_addr, initiator_type, responder_addr, responder_type) = match self.role {
            PairingRole::Initiator => (self.local.0, self.local.1, self.remote.0, self.remote.1),
            PairingRole::Responder => (self.remote.0, self.remote.1, self.local.0, self.local.1),
        };

        let local_confirm = crypto::c1(
            &tk,
            &local_rand,
            &pres7,
            &preq7,
            address_type_wire(initiator_type),
            &initiator_addr.to_hci_bytes(),
            address_type_wire(responder_type),
            &responder_addr.to_hci_bytes(),
        );

        let remote_rand = match self.role {
            PairingRole::Initiator => {
                self.send(&SmpPdu::PairingConfirm(local_confirm)).await?;
                let remote_confirm = expect_confirm(self.recv().await?)?;
                self.send(&SmpPdu::PairingRandom(local_rand)).await?;
                let remote_rand = expect_random(self.recv().await?)?;
                let expected = crypto::c1(
                    &tk,
                    &remote_rand,
                    &pres7,
                    &preq7,
                    address_type_wire(initiator_type),
                    &initiator_addr.to_hci_bytes(),
                    address_type_wire(responder_type),
                    &responder_addr.to_hci_bytes(),
                );
                if expected != remote_confirm {
                    return Err(SmpError::Failed(REASON_CONFIRM_VALUE_FAILED));
                }
                remote_rand
            }
            PairingRole::Responder => {
                let remote_confirm = expect_confirm(self.recv().await?)?;
                self.send(&SmpPdu::PairingConfirm(local_confirm)).await?;
                let remote_rand = expect_random(self.recv().await?)?;
                self.send(&SmpPdu::PairingRandom(local_rand)).await?;
                let expected = crypto::c1(
                    &tk,
                    &remote_rand,
                    &pres7,
                    &preq7,
                    address_type_wire(initiator_type),
                    &initiator_addr.to_hci_bytes(),
                    address_type_wire(responder_type),
                    &responder_addr.to_hci_bytes(),
                );
                if expected != remote_confirm {
                    return Err(SmpError::Failed(REASON_CONFIRM_VALUE_FAILED));
                }
                remote_rand
            }
        };

        let (r1, r2) = match self.role {
            PairingRole::Initiator => (remote_rand, local_rand),
            PairingRole::Responder => (local_rand, remote_rand),
        };
        let stk = crypto::s1(&tk, &r1, &r2);
        Ok((stk, authenticated))
    }

    async fn sc_pairing(
        self: &Arc<Self>,
        method: PairingMethod,
        remote_io: IoCapability,
        local_features: &PairingFeatures,
        remote_features: &PairingFeatures,
    ) -> Result<([u8; 16], bool), SmpError> {
        let keypair = EcdhKeyPair::generate();
        let (local_x, local_y) = keypair.public_coordinates();

        self.send(&SmpPdu::PairingPublicKey { x: local_x, y: local_y }).await?;
        let (remote_x, remote_y) = match self.recv().await? {
            SmpPdu::PairingPublicKey { x, y } => (x, y),
            SmpPdu::PairingFailed(reason) => return Err(SmpError::Failed(reason)),
            _ => return Err(SmpError::InvalidState("expected PairingPublicKey")),
        };
        let dhkey = keypair
            .diffie_hellman(remote_x, remote_y)
            .ok_or(SmpError::Failed(REASON_DHKEY_CHECK_FAILED))?;

        let authenticated = !matches!(method, PairingMethod::JustWorks);
        let (local_nonce, remote_nonce) = self.sc_commitment_exchange(method, &local_x, &remote_x, remote_io).await?;

        let (a1, a2) = self.address_fields();
        let (mac_key, ltk) = crypto::f5(&dhkey, &local_nonce, &remote_nonce, &a1, &a2);

        if matches!(method, PairingMethod::NumericComparison) {
            let check = crypto::g2(&local_x, &remote_x, &local_nonce, &remote_nonce);
            PairingState::set(&self.state, PairingState::NumericCompareExpected);
            let (tx, rx) = oneshot::channel();
            *self.numeric_compare_reply.lock().await = Some(tx);
            self.notify_listeners_numeric_compare(check).await;
            let accepted = rx.await.map_err(|_| SmpError::Internal(crate::error::SmpInternalError::CallbackDropped))?;
            if !accepted {
                return Err(SmpError::Failed(REASON_NUMERIC_COMPARISON_FAILED));
            }
        }

        let io_cap_bytes = |f: &PairingFeatures| [f.io_capability, f.oob_data_flag, f.auth_req];
        let (local_io_cap, remote_io_cap) = (io_cap_bytes(local_features), io_cap_bytes(remote_features));

        let (initiator_nonce, responder_nonce, initiator_io_cap, responder_io_cap) = match self.role {
            PairingRole::Initiator => (local_nonce, remote_nonce, local_io_cap, remote_io_cap),
            PairingRole::Responder => (remote_nonce, local_nonce, remote_io_cap, local_io_cap),
        };

        let local_check = crypto::f6(&mac_key, &initiator_nonce, &responder_nonce, &[0u8; 16], &initiator_io_cap, &a1, &a2);
        let remote_check = match self.role {
            PairingRole::Initiator => {
                self.send(&SmpPdu::PairingDhKeyCheck(local_check)).await?;
                expect_dhkey_check(self.recv().await?)?
            }
            PairingRole::Responder => {
                let check = expect_dhkey_check(self.recv().await?)?;
                self.send(&SmpPdu::PairingDhKeyCheck(local_check)).await?;
                check
            }
        };
        let expected = crypto::f6(&mac_key, &responder_nonce, &initiator_nonce, &[0u8; 16], &responder_io_cap, &a2, &a1);
        if expected != remote_check {
            return Err(SmpError::Failed(REASON_DHKEY_CHECK_FAILED));
        }

        Ok((ltk, authenticated))
    }

    async fn sc_commitment_exchange(
        self: &Arc<Self>,
        method: PairingMethod,
        local_x: &[u8; 32],
        remote_x_hint: &[u8; 32],
        remote_io: IoCapability,
    ) -> Result<([u8; 16], [u8; 16]), SmpError> {
        let _ = remote_io;
        let rounds = if matches!(method, PairingMethod::PasskeyEntry) { 20 } else { 1 };
        let mut local_nonce = [0u8; 16];
        let mut remote_nonce = [0u8; 16];

        for _ in 0..rounds {
            rand::thread_rng().fill_bytes(&mut local_nonce);
            let z = if matches!(method, PairingMethod::PasskeyEntry) { 0x80 } else { 0x00 };
            let local_confirm = crypto::f4(local_x, remote_x_hint, &local_nonce, z);

            remote_nonce = match self.role {
                PairingRole::Initiator => {
                    self.send(&SmpPdu::PairingConfirm(local_confirm)).await?;
                    let remote_confirm = expect_confirm(self.recv().await?)?;
                    self.send(&SmpPdu::PairingRandom(local_nonce)).await?;
                    let remote_rand = expect_random(self.recv().await?)?;
                    let expected = crypto::f4(remote_x_hint, local_x, &remote_rand, z);
                    if expected != remote_confirm {
                        return Err(SmpError::Failed(REASON_CONFIRM_VALUE_FAILED));
                    }
                    remote_rand
                }
                PairingRole::Responder => {
                    let remote_confirm = expect_confirm(self.recv().await?)?;
                    self.send(&SmpPdu::PairingConfirm(local_confirm)).await?;
                    let remote_rand = expect_random(self.recv().await?)?;
                    self.send(&SmpPdu::PairingRandom(local_nonce)).await?;
                    let expected = crypto::f4(remote_x_hint, local_x, &remote_rand, z);
                    if expected != remote_confirm {
                        return Err(SmpError::Failed(REASON_CONFIRM_VALUE_FAILED));
                    }
                    remote_rand
                }
            };
        }

        Ok((local_nonce, remote_nonce))
    }

    fn address_fields(&self) -> ([u8; 7], [u8; 7]) {
        let (initiator, responder) = match self.role {
            PairingRole::Initiator => (self.local, self.remote),
            PairingRole::Responder => (self.remote, self.local),
        };
        (peer_address_field(initiator.0, initiator.1), peer_address_field(responder.0, responder.1))
    }

    async fn key_distribution(
        self: &Arc<Self>,
        local_features: &PairingFeatures,
        remote_features: &PairingFeatures,
        ltk: [u8; 16],
        secure_connections: bool,
    ) -> Result<DistributedKeys, SmpError> {
        PairingState::set(&self.state, PairingState::KeyDistribution);
        let mut attempts = if secure_connections { 1 } else { 1 + LEGACY_WATCHDOG_RETRIES };
        loop {
            match time::timeout(WATCHDOG, self.key_distribution_once(local_features, remote_features, ltk, secure_connections)).await {
                Ok(result) => return result,
                Err(_) if attempts > 1 => {
                    tracing::warn!("smp key distribution watchdog expired, retrying (legacy omitted-notification workaround)");
                    attempts -= 1;
                }
                Err(_) => return Err(SmpError::WatchdogExpired),
            }
        }
    }

    async fn key_distribution_once(
        &self,
        local_features: &PairingFeatures,
        remote_features: &PairingFeatures,
        ltk: [u8; 16],
        secure_connections: bool,
    ) -> Result<DistributedKeys, SmpError> {
        let (our_dist, their_dist) = match self.role {
            PairingRole::Initiator => (local_features.initiator_key_distribution, remote_features.responder_key_distribution),
            PairingRole::Responder => (local_features.responder_key_distribution, remote_features.initiator_key_distribution),
        };

        if our_dist & KEY_DIST_ENC != 0 && !secure_connections {
            let mut ediv_bytes = [0u8; 2];
            let mut rand_bytes = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut ediv_bytes);
            rand::thread_rng().fill_bytes(&mut rand_bytes);
            self.send(&SmpPdu::EncryptionInformation(ltk)).await?;
            self.send(&SmpPdu::MasterIdentification {
                ediv: u16::from_le_bytes(ediv_bytes),
                rand: u64::from_le_bytes(rand_bytes),
            })
            .await?;
        }
        if our_dist & KEY_DIST_ID != 0 {
            let mut irk = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut irk);
            self.send(&SmpPdu::IdentityInformation(irk)).await?;
            self.send(&SmpPdu::IdentityAddressInformation(IdentityAddress {
                address_type: address_type_wire(self.local.1),
                address: self.local.0,
            }))
            .await?;
        }
        if our_dist & KEY_DIST_SIGN != 0 {
            let mut csrk = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut csrk);
            self.send(&SmpPdu::SigningInformation(csrk)).await?;
        }

        let mut keys = DistributedKeys::default();
        if secure_connections {
            keys.ltk = Some(LongTermKeyMaterial { value: ltk, ediv: 0, rand: 0 });
        }

        let expects = their_dist & (KEY_DIST_ENC | KEY_DIST_ID | KEY_DIST_SIGN);
        let mut pending_ediv = None;
        let mut remaining = count_bits(if secure_connections { their_dist & !KEY_DIST_ENC } else { expects });
        while remaining > 0 {
            match self.recv().await? {
                SmpPdu::EncryptionInformation(value) => {
                    pending_ediv = Some(value);
                }
                SmpPdu::MasterIdentification { ediv, rand } => {
                    if let Some(value) = pending_ediv.take() {
                        keys.ltk = Some(LongTermKeyMaterial { value, ediv, rand });
                    }
                    remaining -= 1;
                }
                SmpPdu::IdentityInformation(irk) => {
                    keys.irk = Some(irk);
                }
                SmpPdu::IdentityAddressInformation(_) => {
                    remaining -= 1;
                }
                SmpPdu::SigningInformation(csrk) => {
                    keys.csrk = Some(csrk);
                    remaining -= 1;
                }
                SmpPdu::PairingFailed(reason) => return Err(SmpError::Failed(reason)),
                _ => {}
            }
        }
        Ok(keys)
    }

    async fn notify_listeners_passkey_expected(&self) {
        for l in self.listeners.snapshot().iter() {
            l.passkey_expected().await;
        }
    }

    async fn notify_listeners_passkey(&self, value: u32) {
        PairingState::set(&self.state, PairingState::PasskeyNotify);
        for l in self.listeners.snapshot().iter() {
            l.passkey_notify(value).await;
        }
    }

    async fn notify_listeners_numeric_compare(&self, value: u32) {
        for l in self.listeners.snapshot().iter() {
            l.numeric_compare_expected(value).await;
        }
    }
}

fn pairing_mode_for(method: PairingMethod) -> PairingMode {
    match method {
        PairingMethod::JustWorks => PairingMode::JustWorks,
        PairingMethod::PasskeyEntry => PairingMode::PasskeyEntry,
        PairingMethod::NumericComparison => PairingMode::NumericCompare,
        PairingMethod::OutOfBand => PairingMode::Oob,
    }
}

fn address_type_wire(t: AddressType) -> u8 {
    match t {
        AddressType::Public => 0x00,
        _ => 0x01,
    }
}

fn peer_address_field(addr: Address, addr_type: AddressType) -> [u8; 7] {
    let mut out = [0u8; 7];
    out[0] = address_type_wire(addr_type);
    out[1..7].copy_from_slice(&addr.to_hci_bytes());
    out
}

fn fixed7(bytes: &[u8]) -> [u8; 7] {
    let mut out = [0u8; 7];
    let n = bytes.len().min(7);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Zeroes the bytes beyond the negotiated encryption key size, per Core
/// Vol 3 Part H §2.3.4: the shorter of the two sides' advertised maximums
/// governs brute-force resistance of the resulting key.
fn truncate_key(key: [u8; 16], size: u8) -> [u8; 16] {
    let mut out = key;
    for byte in out.iter_mut().skip(size as usize) {
        *byte = 0;
    }
    out
}

fn count_bits(v: u8) -> u32 {
    v.count_ones()
}

fn expect_confirm(pdu: SmpPdu) -> Result<[u8; 16], SmpError> {
    match pdu {
        SmpPdu::PairingConfirm(v) => Ok(v),
        SmpPdu::PairingFailed(reason) => Err(SmpError::Failed(reason)),
        _ => Err(SmpError::InvalidState("expected PairingConfirm")),
    }
}

fn expect_random(pdu: SmpPdu) -> Result<[u8; 16], SmpError> {
    match pdu {
        SmpPdu::PairingRandom(v) => Ok(v),
        SmpPdu::PairingFailed(reason) => Err(SmpError::Failed(reason)),
        _ => Err(SmpError::InvalidState("expected PairingRandom")),
    }
}

fn expect_dhkey_check(pdu: SmpPdu) -> Result<[u8; 16], SmpError> {
    match pdu {
        SmpPdu::PairingDhKeyCheck(v) => Ok(v),
        SmpPdu::PairingFailed(reason) => Err(SmpError::Failed(reason)),
        _ => Err(SmpError::InvalidState("expected PairingDhKeyCheck")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_req_bits_reflect_params() {
        let params = PairingParams {
            mitm_required: true,
            secure_connections_supported: true,
            ..Default::default()
        };
        let req = params.auth_req();
        assert_eq!(req & AUTH_REQ_MITM, AUTH_REQ_MITM);
        assert_eq!(req & AUTH_REQ_SC, AUTH_REQ_SC);
    }

    #[test]
    fn peer_address_field_prepends_type_byte() {
        let addr: Address = "1A:2B:3C:4D:5E:6F".parse().unwrap();
        let field = peer_address_field(addr, AddressType::RandomStatic);
        assert_eq!(field[0], 0x01);
        assert_eq!(&field[1..7], &addr.to_hci_bytes());
    }

    #[test]
    fn count_bits_matches_popcount() {
        assert_eq!(count_bits(KEY_DIST_ENC | KEY_DIST_ID), 2);
    }
}
