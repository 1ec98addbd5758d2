//! The Mesh Cryptographic Toolbox
//!
//! The security-toolbox functions of the Mesh Profile Specification v1.0 | Section 3.8.2,
//! plus the cypher constructions they stand on. The parent module's network context is the
//! intended caller; nothing here knows about PDUs or sessions.
//!
//! # The Algorithms
//! The terse names ([`s1`], [`k2`], [`k4`]) are the specification's own; they all chain
//! [`aes_cmac`] ([RFC 4493](https://datatracker.ietf.org/doc/rfc4493)) over fixed label
//! strings and key material. Payload protection is the manual AES-CCM construction of
//! [RFC 3610](https://datatracker.ietf.org/doc/rfc3610) with a length field width of two
//! octets, a 13 byte nonce, no associated data, and a MIC of either four or eight bytes.
//! The network header masking is the ECB-based obfuscation of Mesh Profile v1.0 |
//! Section 3.8.7.3.
//!
//! Keys arrive as 16 byte big-endian slices; internally every block travels as a big-endian
//! `u128` word, which keeps the chaining XORs one-liners.

use core::fmt;

/// The number of bytes in the CCM nonce
pub const NONCE_LEN: usize = 13;

/// CCM length-field width (the `L` parameter of RFC 3610)
const CCM_LENGTH_WIDTH: u8 = 2;

/// Errors returned by the CCM and obfuscation routines when their preconditions are violated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The MIC length was not four or eight bytes
    InvalidMicLength(usize),
    /// The payload cannot be represented with a two byte length field
    PayloadTooLarge(usize),
    /// The ciphertext was shorter than the MIC it is supposed to carry
    CiphertextTooShort(usize),
    /// The message integrity check failed on decryption
    MicMismatch,
    /// Obfuscation requires at least seven bytes of encrypted payload
    ObfuscationInputTooShort(usize),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CryptoError::InvalidMicLength(len) => write!(f, "Invalid MIC length of {} bytes, must be 4 or 8", len),
            CryptoError::PayloadTooLarge(len) => write!(f, "Payload of {} bytes is too large for a 2 byte length field", len),
            CryptoError::CiphertextTooShort(len) => write!(f, "Ciphertext of {} bytes is shorter than its MIC", len),
            CryptoError::MicMismatch => write!(f, "Message integrity check failed"),
            CryptoError::ObfuscationInputTooShort(len) => write!(f, "Obfuscation requires 7 bytes of encrypted payload, got {}", len),
        }
    }
}

impl std::error::Error for CryptoError {}

/// AES-128 on a single block
///
/// The one cipher primitive everything else in this module is built from: CMAC chains it,
/// CCM runs it in counter mode, and the privacy obfuscation uses a single invocation. It is
/// synchronous and bounded, so it is safe to call from the timer dispatch task.
pub fn aes_ecb(key: u128, block: u128) -> u128 {
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncrypt, KeyInit};

    let mut buffer = GenericArray::from(block.to_be_bytes());

    aes::Aes128::new(&GenericArray::from(key.to_be_bytes())).encrypt_block(&mut buffer);

    <u128>::from_be_bytes(buffer.into())
}

/// Doubling step of the CMAC subkey schedule: multiplication by x in GF(2^128)
fn cmac_double(word: u128) -> u128 {
    const REDUCTION_POLY: u128 = 0x87;

    (word << 1) ^ if word >> 127 == 1 { REDUCTION_POLY } else { 0 }
}

/// Left-align up to 16 message bytes into a big-endian block word
fn load_block(bytes: &[u8]) -> u128 {
    if bytes.is_empty() {
        return 0;
    }

    bytes
        .iter()
        .fold(0u128, |word, byte| (word << 8) | <u128>::from(*byte))
        << (128 - 8 * bytes.len() as u32)
}

/// Pad a partial final block: a single one bit straight after the data, zeros to the end
fn pad_block(bytes: &[u8]) -> u128 {
    load_block(bytes) | 1 << (127 - 8 * bytes.len() as u32)
}

/// AES-CMAC ([RFC 4493](https://datatracker.ietf.org/doc/rfc4493))
///
/// The authentication code the derivation functions below chain into salts, identifiers and
/// keys. Every block except the last is absorbed plainly; the last is patched with the first
/// subkey when it is complete and with the second over the padding when it is not.
pub fn aes_cmac(key: u128, message: &[u8]) -> u128 {
    // index of the final block, which always exists (an empty message has an empty one)
    let last_start = message.len().saturating_sub(1) / 16 * 16;

    let chained = message[..last_start]
        .chunks(16)
        .fold(0u128, |state, block| aes_ecb(key, state ^ load_block(block)));

    let last = &message[last_start..];

    let subkey = cmac_double(aes_ecb(key, 0));

    let closing = if last.len() == 16 {
        load_block(last) ^ subkey
    } else {
        pad_block(last) ^ cmac_double(subkey)
    };

    aes_ecb(key, chained ^ closing)
}

/// Mesh salt generation function *s1*
///
/// The CMAC of the input under an all-zero key. Used to turn the short ASCII labels of the
/// derivation functions ("smk2", "smk4") into salts.
pub fn s1(m: &[u8]) -> u128 {
    aes_cmac(0, m)
}

/// Network key derivation function *k2* (master security credentials)
///
/// Derives the 7-bit NID, the EncryptionKey and the PrivacyKey from a network key `n` and the
/// provisioning-data string `p` (always `{0x00}` for the master credentials used here).
///
/// See Mesh Profile Specification v1.0 | Section 3.8.2.6
pub fn k2(n: &[u8; 16], p: &[u8]) -> (u8, [u8; 16], [u8; 16]) {
    let salt = s1(b"smk2");

    let t = aes_cmac(salt, n);

    let mut m1 = Vec::with_capacity(p.len() + 1);
    m1.extend_from_slice(p);
    m1.push(0x01);

    let t1 = aes_cmac(t, &m1);

    let mut m2 = Vec::with_capacity(16 + p.len() + 1);
    m2.extend_from_slice(&t1.to_be_bytes());
    m2.extend_from_slice(p);
    m2.push(0x02);

    let t2 = aes_cmac(t, &m2);

    let mut m3 = Vec::with_capacity(16 + p.len() + 1);
    m3.extend_from_slice(&t2.to_be_bytes());
    m3.extend_from_slice(p);
    m3.push(0x03);

    let t3 = aes_cmac(t, &m3);

    ((t1 as u8) & 0x7F, t2.to_be_bytes(), t3.to_be_bytes())
}

/// Application key derivation function *k4*
///
/// Derives the 6-bit AID carried in the lower transport header from an application key.
///
/// See Mesh Profile Specification v1.0 | Section 3.8.2.8
pub fn k4(k: &[u8; 16]) -> u8 {
    let salt = s1(b"smk4");

    let t = aes_cmac(salt, k);

    (aes_cmac(t, b"id6\x01") as u8) & 0x3F
}

/// The `B_0` block of the CBC-MAC pass
fn ccm_b0(nonce: &[u8; NONCE_LEN], payload_len: usize, mic_len: usize) -> u128 {
    let mut b0 = [0u8; 16];

    // Adata = 0, M' = (M - 2) / 2, L' = L - 1
    b0[0] = (((mic_len as u8 - 2) / 2) << 3) | (CCM_LENGTH_WIDTH - 1);
    b0[1..14].copy_from_slice(nonce);
    b0[14..16].copy_from_slice(&(payload_len as u16).to_be_bytes());

    <u128>::from_be_bytes(b0)
}

/// The `A_i` counter block of the CTR pass
fn ccm_counter_block(nonce: &[u8; NONCE_LEN], counter: u16) -> u128 {
    let mut a = [0u8; 16];

    a[0] = CCM_LENGTH_WIDTH - 1;
    a[1..14].copy_from_slice(nonce);
    a[14..16].copy_from_slice(&counter.to_be_bytes());

    <u128>::from_be_bytes(a)
}

fn ccm_cbc_mac(key: u128, nonce: &[u8; NONCE_LEN], payload: &[u8], mic_len: usize) -> u128 {
    let mut x = aes_ecb(key, ccm_b0(nonce, payload.len(), mic_len));

    for chunk in payload.chunks(16) {
        let mut block = [0u8; 16];

        block[..chunk.len()].copy_from_slice(chunk);

        x = aes_ecb(key, x ^ <u128>::from_be_bytes(block));
    }

    x
}

fn ccm_ctr_xor(key: u128, nonce: &[u8; NONCE_LEN], data: &[u8], out: &mut Vec<u8>) {
    for (i, chunk) in data.chunks(16).enumerate() {
        let keystream = aes_ecb(key, ccm_counter_block(nonce, (i + 1) as u16)).to_be_bytes();

        out.extend(chunk.iter().zip(keystream.iter()).map(|(d, k)| d ^ k));
    }
}

fn check_ccm_parameters(payload_len: usize, mic_len: usize) -> Result<(), CryptoError> {
    if mic_len != 4 && mic_len != 8 {
        return Err(CryptoError::InvalidMicLength(mic_len));
    }

    if payload_len > usize::from(u16::max_value()) {
        return Err(CryptoError::PayloadTooLarge(payload_len));
    }

    Ok(())
}

/// AES-CCM authenticated encryption
///
/// The manual [RFC 3610](https://datatracker.ietf.org/doc/rfc3610) construction with a two
/// byte length field, a 13 byte nonce, and no associated data. `mic_len` is four bytes for
/// access and network payloads and eight bytes for control (proxy configuration) payloads.
///
/// Returns `ciphertext || MIC`.
pub fn ccm_encrypt(
    key: &[u8; 16],
    nonce: &[u8; NONCE_LEN],
    payload: &[u8],
    mic_len: usize,
) -> Result<Vec<u8>, CryptoError> {
    check_ccm_parameters(payload.len(), mic_len)?;

    let k = <u128>::from_be_bytes(*key);

    let x = ccm_cbc_mac(k, nonce, payload, mic_len);

    let mut out = Vec::with_capacity(payload.len() + mic_len);

    ccm_ctr_xor(k, nonce, payload, &mut out);

    let s0 = aes_ecb(k, ccm_counter_block(nonce, 0));

    out.extend_from_slice(&(x ^ s0).to_be_bytes()[..mic_len]);

    Ok(out)
}

/// AES-CCM authenticated decryption
///
/// The inverse of [`ccm_encrypt`]. The input is `ciphertext || MIC`; the MIC is recomputed
/// over the recovered plain text and compared before the plain text is returned.
pub fn ccm_decrypt(
    key: &[u8; 16],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    mic_len: usize,
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < mic_len {
        return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
    }

    let payload_len = ciphertext.len() - mic_len;

    check_ccm_parameters(payload_len, mic_len)?;

    let k = <u128>::from_be_bytes(*key);

    let mut plain = Vec::with_capacity(payload_len);

    ccm_ctr_xor(k, nonce, &ciphertext[..payload_len], &mut plain);

    let x = ccm_cbc_mac(k, nonce, &plain, mic_len);

    let s0 = aes_ecb(k, ccm_counter_block(nonce, 0));

    let mic = &(x ^ s0).to_be_bytes()[..mic_len];

    if mic != &ciphertext[payload_len..] {
        return Err(CryptoError::MicMismatch);
    }

    Ok(plain)
}

/// Privacy obfuscation of the network header
///
/// Masks the CTL/TTL byte, the sequence number and the source address of a network PDU with
/// the privacy-encryption-control block so that passive observers cannot track the
/// originator.
///
/// `PECB = e(PrivacyKey, 0^40 || IV Index || EncryptedPayload[0..7])`, and the returned
/// header is `(CTL|TTL, SEQ[2], SEQ[1], SEQ[0], SRC[1], SRC[0]) XOR PECB[0..6]`. The same
/// function deobfuscates, since the mask is a plain XOR.
///
/// See Mesh Profile Specification v1.0 | Section 3.8.7.3
pub fn obfuscate(
    ctl_ttl: u8,
    seq: u32,
    src: u16,
    enc_payload: &[u8],
    privacy_key: &[u8; 16],
    iv_index: u32,
) -> Result<[u8; 6], CryptoError> {
    if enc_payload.len() < 7 {
        return Err(CryptoError::ObfuscationInputTooShort(enc_payload.len()));
    }

    let mut privacy_plain = [0u8; 16];

    privacy_plain[5..9].copy_from_slice(&iv_index.to_be_bytes());
    privacy_plain[9..16].copy_from_slice(&enc_payload[..7]);

    let pecb = aes_ecb(
        <u128>::from_be_bytes(*privacy_key),
        <u128>::from_be_bytes(privacy_plain),
    )
    .to_be_bytes();

    let header = [
        ctl_ttl,
        (seq >> 16) as u8,
        (seq >> 8) as u8,
        seq as u8,
        (src >> 8) as u8,
        src as u8,
    ];

    let mut obfuscated = [0u8; 6];

    for (out, (h, p)) in obfuscated.iter_mut().zip(header.iter().zip(pecb.iter())) {
        *out = h ^ p;
    }

    Ok(obfuscated)
}
