//! SMP cryptographic primitives: IO-capability driven pairing method
//! selection (Core Vol 3 Part H §2.3), LE Secure Connections key derivation
//! (ECDH P-256 plus the f4/f5/f6/g2 functions, §2.2), and LE Legacy Pairing
//! key derivation (c1/s1, §2.2.3/2.2.4).

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use p256::ecdh::{EphemeralSecret, SharedSecret};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::PublicKey;
use rand::rngs::OsRng;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum IoCapability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl IoCapability {
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::DisplayOnly,
            0x01 => Self::DisplayYesNo,
            0x02 => Self::KeyboardOnly,
            0x03 => Self::NoInputNoOutput,
            0x04 => Self::KeyboardDisplay,
            _ => return None,
        })
    }

    pub fn as_wire(self) -> u8 {
        match self {
            Self::DisplayOnly => 0x00,
            Self::DisplayYesNo => 0x01,
            Self::KeyboardOnly => 0x02,
            Self::NoInputNoOutput => 0x03,
            Self::KeyboardDisplay => 0x04,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PairingMethod {
    JustWorks,
    PasskeyEntry,
    NumericComparison,
    OutOfBand,
}

/// Selects the pairing association model per Core Vol 3 Part H, Table 2.7
/// (LE Legacy) / Table 2.8 (LE Secure Connections) IO capability mapping.
/// `initiator_mitm`/`responder_mitm` come from each side's `auth_req` bit 2.
pub fn select_pairing_method(
    local_oob: bool,
    remote_oob: bool,
    initiator_mitm: bool,
    responder_mitm: bool,
    secure_connections: bool,
    local_io: IoCapability,
    remote_io: IoCapability,
) -> PairingMethod {
    if local_oob || remote_oob {
        return PairingMethod::OutOfBand;
    }
    if !initiator_mitm && !responder_mitm {
        return PairingMethod::JustWorks;
    }

    use IoCapability::*;
    let method = match (local_io, remote_io) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => PairingMethod::JustWorks,
        (DisplayOnly, DisplayOnly) => PairingMethod::JustWorks,
        (DisplayOnly, DisplayYesNo) | (DisplayYesNo, DisplayOnly) => PairingMethod::JustWorks,
        (DisplayYesNo, DisplayYesNo) if secure_connections => PairingMethod::NumericComparison,
        (DisplayYesNo, DisplayYesNo) => PairingMethod::JustWorks,
        (KeyboardOnly, KeyboardOnly) => PairingMethod::PasskeyEntry,
        (KeyboardOnly, _) | (_, KeyboardOnly) => PairingMethod::PasskeyEntry,
        (KeyboardDisplay, KeyboardDisplay) if secure_connections => PairingMethod::NumericComparison,
        (KeyboardDisplay, _) | (_, KeyboardDisplay) => PairingMethod::PasskeyEntry,
        _ => PairingMethod::JustWorks,
    };
    method
}

pub struct EcdhKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EcdhKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// The uncompressed public key coordinates as carried by
    /// `SmpPdu::PairingPublicKey`.
    pub fn public_coordinates(&self) -> ([u8; 32], [u8; 32]) {
        let point = self.public.to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(point.x().expect("uncompressed point has x"));
        y.copy_from_slice(point.y().expect("uncompressed point has y"));
        (x, y)
    }

    pub fn diffie_hellman(&self, peer_x: [u8; 32], peer_y: [u8; 32]) -> Option<[u8; 32]> {
        let peer = decode_public_key(peer_x, peer_y)?;
        let shared: SharedSecret = self.secret.diffie_hellman(&peer);
        let mut dhkey = [0u8; 32];
        dhkey.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Some(dhkey)
    }
}

fn decode_public_key(x: [u8; 32], y: [u8; 32]) -> Option<PublicKey> {
    let point = p256::EncodedPoint::from_affine_coordinates(&x.into(), &y.into(), false);
    PublicKey::from_encoded_point(&point).into()
}

fn aes_cmac(key: &[u8; 16], messages: &[&[u8]]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new_from_slice(key).expect("16-byte key");
    for m in messages {
        mac.update(m);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// f4(U, V, X, Z) = AES-CMAC_X(U || V || Z), Core Vol 3 Part H §2.2.6.
pub fn f4(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], z: u8) -> [u8; 16] {
    aes_cmac(x, &[u, v, &[z]])
}

/// f5 key derivation: first computes `T = AES-CMAC_salt(W)`, then derives
/// MacKey and LTK as `AES-CMAC_T(counter || "btle" || N1 || N2 || A1 || A2 ||
/// length)`, Core Vol 3 Part H §2.2.7.
pub fn f5(w: &[u8; 32], n1: &[u8; 16], n2: &[u8; 16], a1: &[u8; 7], a2: &[u8; 7]) -> ([u8; 16], [u8; 16]) {
    const SALT: [u8; 16] = [
        0x6C, 0x88, 0x83, 0x91, 0xAA, 0xF5, 0xA5, 0x38, 0x60, 0x37, 0x0B, 0xDB, 0x5A, 0x60, 0x83, 0xBE,
    ];
    const KEY_ID: [u8; 4] = *b"btle";
    let t = aes_cmac(&SALT, &[w]);
    let length: [u8; 2] = 0x0100u16.to_le_bytes();

    let mac_key = aes_cmac(&t, &[&[0x00], &KEY_ID, n1, n2, a1, a2, &length]);
    let ltk = aes_cmac(&t, &[&[0x01], &KEY_ID, n1, n2, a1, a2, &length]);
    (mac_key, ltk)
}

/// f6(W, N1, N2, R, IOcap, A1, A2) = AES-CMAC_W(N1||N2||R||IOcap||A1||A2),
/// Core Vol 3 Part H §2.2.8.
pub fn f6(w: &[u8; 16], n1: &[u8; 16], n2: &[u8; 16], r: &[u8; 16], io_cap: &[u8; 3], a1: &[u8; 7], a2: &[u8; 7]) -> [u8; 16] {
    aes_cmac(w, &[n1, n2, r, io_cap, a1, a2])
}

/// g2(U, V, X, Y) = AES-CMAC_X(U || V || Y) mod 2^32, the numeric-comparison
/// check displayed to the user modulo 1,000,000. `X`/`Y` are the
/// initiator's/responder's nonces (`X` keys the CMAC). Core Vol 3 Part H
/// §2.2.9.
pub fn g2(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], y: &[u8; 16]) -> u32 {
    let mac = aes_cmac(x, &[u, v, y]);
    u32::from_be_bytes([mac[12], mac[13], mac[14], mac[15]]) % 1_000_000
}

fn aes128_encrypt(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}

fn xor16(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// LE Legacy Pairing confirm value, Core Vol 3 Part H §2.2.3.
#[allow(clippy::too_many_arguments)]
pub fn c1(
    k: &[u8; 16],
    r: &[u8; 16],
    pres: &[u8; 7],
    preq: &[u8; 7],
    initiator_addr_type: u8,
    initiator_addr: &[u8; 6],
    responder_addr_type: u8,
    responder_addr: &[u8; 6],
) -> [u8; 16] {
    let mut p1 = [0u8; 16];
    p1[0..7].copy_from_slice(pres);
    p1[7..14].copy_from_slice(preq);
    p1[14] = responder_addr_type;
    p1[15] = initiator_addr_type;

    let mut p2 = [0u8; 16];
    p2[4..10].copy_from_slice(initiator_addr);
    p2[10..16].copy_from_slice(responder_addr);

    let step1 = xor16(r, &p1);
    let enc1 = aes128_encrypt(k, &step1);
    let step2 = xor16(&enc1, &p2);
    aes128_encrypt(k, &step2)
}

/// LE Legacy Pairing STK derivation, Core Vol 3 Part H §2.2.4.
pub fn s1(k: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..8].copy_from_slice(&r1[0..8]);
    block[8..16].copy_from_slice(&r2[0..8]);
    aes128_encrypt(k, &block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn justworks_chosen_without_mitm_request() {
        let method = select_pairing_method(
            false,
            false,
            false,
            false,
            true,
            IoCapability::DisplayYesNo,
            IoCapability::DisplayYesNo,
        );
        assert_eq!(method, PairingMethod::JustWorks);
    }

    #[test]
    fn numeric_comparison_chosen_for_sc_display_yes_no_pair() {
        let method = select_pairing_method(
            false,
            false,
            true,
            true,
            true,
            IoCapability::DisplayYesNo,
            IoCapability::DisplayYesNo,
        );
        assert_eq!(method, PairingMethod::NumericComparison);
    }

    #[test]
    fn ecdh_round_trips_shared_secret_between_two_parties() {
        let a = EcdhKeyPair::generate();
        let b = EcdhKeyPair::generate();
        let (ax, ay) = a.public_coordinates();
        let (bx, by) = b.public_coordinates();
        let shared_a = a.diffie_hellman(bx, by).unwrap();
        let shared_b = b.diffie_hellman(ax, ay).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn c1_is_deterministic_for_same_inputs() {
        let k = [0u8; 16];
        let r = [1u8; 16];
        let pres = [0u8; 7];
        let preq = [0u8; 7];
        let ia = [0u8; 6];
        let ra = [0u8; 6];
        let first = c1(&k, &r, &pres, &preq, 0, &ia, 0, &ra);
        let second = c1(&k, &r, &pres, &preq, 0, &ia, 0, &ra);
        assert_eq!(first, second);
    }
}
