//! Mesh network layer
//!
//! The [`NetworkContext`] holds the per-session security material (network key derivatives,
//! application key identifier, IV index, source address and the 24-bit sequence counter) and
//! assembles complete proxy PDUs out of access messages.
//!
//! A context is created once per client session from the keys delivered over the command
//! channel. After construction the only mutation it permits is the sequence increment that
//! accompanies every origination; re-keying means building a new context, which also resets
//! the sequence counter.

pub mod toolbox;

use core::fmt;

pub use toolbox::CryptoError;

/// First sequence number handed out by a fresh context.
///
/// Starting above zero keeps previously provisioned peers from dropping our first messages
/// into their replay window after a bridge restart.
pub const SEQ_INITIAL: u32 = 0x01_0000;

/// Largest representable 24-bit sequence number.
pub const SEQ_MAX: u32 = 0xFF_FFFF;

/// Proxy PDU type byte for a complete network PDU
pub const PROXY_PDU_NETWORK: u8 = 0x00;

/// Proxy PDU type byte for a complete proxy configuration PDU
pub const PROXY_PDU_CONFIG: u8 = 0x02;

/// TTL used for every access message origination
const DEFAULT_TTL: u8 = 7;

/// Lower transport header bit: application key flag (AKF) with SEG = 0
const LOWER_TRANSPORT_AKF: u8 = 0x40;

/// MIC length for access and unsegmented-access network payloads
const ACCESS_MIC_LEN: usize = 4;

/// MIC length for control (proxy configuration) payloads
const CONTROL_MIC_LEN: usize = 8;

/// Proxy filter configuration: Set Filter Type, blacklist (accept everything not listed)
const FILTER_SETUP_PAYLOAD: [u8; 2] = [0x00, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshError {
    /// The 24-bit sequence counter is exhausted; no further messages may be originated until
    /// the context is re-created
    SequenceExhausted,
    /// A cryptographic precondition was violated
    Crypto(CryptoError),
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MeshError::SequenceExhausted => write!(f, "Sequence counter exhausted, re-initialisation required"),
            MeshError::Crypto(ref e) => write!(f, "Crypto error: {}", e),
        }
    }
}

impl std::error::Error for MeshError {}

impl From<CryptoError> for MeshError {
    fn from(e: CryptoError) -> Self {
        MeshError::Crypto(e)
    }
}

/// The per-session mesh security context
///
/// Created from the provisioned network key, application key, IV index and the bridge's own
/// unicast source address. The k2 and k4 derivations run once, at construction.
pub struct NetworkContext {
    iv_index: u32,
    src: u16,
    app_key: [u8; 16],
    nid: u8,
    aid: u8,
    encryption_key: [u8; 16],
    privacy_key: [u8; 16],
    seq: u32,
}

impl NetworkContext {
    /// Derive a fresh context
    ///
    /// Runs k2 over the network key with the master-credentials string `{0x00}` and k4 over
    /// the application key. The sequence counter starts at [`SEQ_INITIAL`].
    pub fn new(net_key: [u8; 16], app_key: [u8; 16], iv_index: u32, src: u16) -> Self {
        let (nid, encryption_key, privacy_key) = toolbox::k2(&net_key, &[0x00]);

        let aid = toolbox::k4(&app_key);

        log::debug!(
            "mesh context derived: nid={:#04x} aid={:#04x} iv_index={:#010x} src={:#06x}",
            nid,
            aid,
            iv_index,
            src
        );

        NetworkContext {
            iv_index,
            src,
            app_key,
            nid,
            aid,
            encryption_key,
            privacy_key,
            seq: SEQ_INITIAL,
        }
    }

    pub fn nid(&self) -> u8 {
        self.nid
    }

    pub fn aid(&self) -> u8 {
        self.aid
    }

    pub fn src(&self) -> u16 {
        self.src
    }

    /// The sequence number of the most recent origination
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Claim the next sequence number
    ///
    /// The counter increments *before* use, so the value returned here is the one carried in
    /// the nonces of the PDU being assembled. Once the counter would pass [`SEQ_MAX`] every
    /// further claim fails; the caller must treat that as fatal and stop originating.
    fn next_seq(&mut self) -> Result<u32, MeshError> {
        if self.seq >= SEQ_MAX {
            return Err(MeshError::SequenceExhausted);
        }

        self.seq += 1;

        Ok(self.seq)
    }

    /// Application nonce: `0x01 || 0x00 || SEQ || SRC || DST || IV Index`, big endian
    fn application_nonce(&self, seq: u32, dst: u16) -> [u8; toolbox::NONCE_LEN] {
        let mut nonce = [0u8; toolbox::NONCE_LEN];

        nonce[0] = 0x01;
        nonce[2] = (seq >> 16) as u8;
        nonce[3] = (seq >> 8) as u8;
        nonce[4] = seq as u8;
        nonce[5..7].copy_from_slice(&self.src.to_be_bytes());
        nonce[7..9].copy_from_slice(&dst.to_be_bytes());
        nonce[9..13].copy_from_slice(&self.iv_index.to_be_bytes());

        nonce
    }

    /// Network nonce: `0x00 || (CTL << 7) | TTL || SEQ || SRC || 0x0000 || IV Index`, big endian
    fn network_nonce(&self, ctl_ttl: u8, seq: u32) -> [u8; toolbox::NONCE_LEN] {
        let mut nonce = [0u8; toolbox::NONCE_LEN];

        nonce[1] = ctl_ttl;
        nonce[2] = (seq >> 16) as u8;
        nonce[3] = (seq >> 8) as u8;
        nonce[4] = seq as u8;
        nonce[5..7].copy_from_slice(&self.src.to_be_bytes());
        nonce[9..13].copy_from_slice(&self.iv_index.to_be_bytes());

        nonce
    }

    /// Encrypt, obfuscate and frame one network PDU
    fn assemble(
        &mut self,
        pdu_type: u8,
        ctl_ttl: u8,
        dst: u16,
        transport_pdu: &[u8],
        net_mic_len: usize,
    ) -> Result<Vec<u8>, MeshError> {
        let seq = match self.next_seq() {
            Ok(seq) => seq,
            Err(e) => {
                log::error!("mesh sequence counter exhausted, refusing to originate");
                return Err(e);
            }
        };

        let mut dst_transport = Vec::with_capacity(2 + transport_pdu.len());

        dst_transport.extend_from_slice(&dst.to_be_bytes());
        dst_transport.extend_from_slice(transport_pdu);

        let enc_net = toolbox::ccm_encrypt(
            &self.encryption_key,
            &self.network_nonce(ctl_ttl, seq),
            &dst_transport,
            net_mic_len,
        )?;

        let obf_header = toolbox::obfuscate(ctl_ttl, seq, self.src, &enc_net, &self.privacy_key, self.iv_index)?;

        let mut pdu = Vec::with_capacity(2 + obf_header.len() + enc_net.len());

        pdu.push(pdu_type);
        pdu.push((((self.iv_index & 1) as u8) << 7) | self.nid);
        pdu.extend_from_slice(&obf_header);
        pdu.extend_from_slice(&enc_net);

        Ok(pdu)
    }

    /// Build a standard proxy PDU carrying one unsegmented access message
    ///
    /// The access message is sealed with the application key (4 byte MIC), prefixed with the
    /// lower transport header (`SEG = 0`, `AKF = 1`, AID), sealed again at the network layer
    /// and obfuscated. Each call claims one sequence number; both CCM passes use it.
    pub fn create_standard_pdu(&mut self, access_msg: &[u8], dst: u16) -> Result<Vec<u8>, MeshError> {
        // Peek the sequence the assembly below will claim, the access encryption must use
        // the same number.
        let seq = self.seq.checked_add(1).filter(|s| *s <= SEQ_MAX).ok_or(MeshError::SequenceExhausted)?;

        let enc_access = toolbox::ccm_encrypt(
            &self.app_key,
            &self.application_nonce(seq, dst),
            access_msg,
            ACCESS_MIC_LEN,
        )?;

        let mut transport = Vec::with_capacity(1 + enc_access.len());

        transport.push(LOWER_TRANSPORT_AKF | self.aid);
        transport.extend_from_slice(&enc_access);

        self.assemble(PROXY_PDU_NETWORK, DEFAULT_TTL, dst, &transport, ACCESS_MIC_LEN)
    }

    /// Build the proxy filter configuration PDU
    ///
    /// Sent once, as the first write after GATT discovery. Control message: `CTL = 1`,
    /// `TTL = 0`, destination is the unassigned address, payload selects the blacklist
    /// filter so every destination is accepted, MIC widens to eight bytes.
    pub fn create_proxy_filter_setup(&mut self) -> Result<Vec<u8>, MeshError> {
        self.assemble(PROXY_PDU_CONFIG, 0x80, 0x0000, &FILTER_SETUP_PAYLOAD, CONTROL_MIC_LEN)
    }
}

impl fmt::Debug for NetworkContext {
    // keys deliberately omitted
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NetworkContext")
            .field("nid", &self.nid)
            .field("aid", &self.aid)
            .field("iv_index", &self.iv_index)
            .field("src", &self.src)
            .field("seq", &self.seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TELINK_NET_KEY: [u8; 16] = [
        0x7D, 0xD7, 0x36, 0x4C, 0xD8, 0x42, 0xAD, 0x18,
        0xC1, 0x7C, 0x74, 0x65, 0x6C, 0x69, 0x6E, 0x6B,
    ];

    const TELINK_APP_KEY: [u8; 16] = [
        0x63, 0x96, 0x47, 0x71, 0x73, 0x4F, 0xBD, 0x76,
        0xE3, 0xB4, 0x74, 0x65, 0x6C, 0x69, 0x6E, 0x6B,
    ];

    fn test_context() -> NetworkContext {
        NetworkContext::new(TELINK_NET_KEY, TELINK_APP_KEY, 0x1234_5678, 0x0001)
    }

    #[test]
    fn derivations_match_known_values() {
        let ctx = test_context();

        assert_eq!(0x70, ctx.nid());
        assert_eq!(0x37, ctx.aid());
        assert_eq!(SEQ_INITIAL, ctx.seq());
    }

    #[test]
    fn application_nonce_layout() {
        let ctx = test_context();

        let nonce = ctx.application_nonce(0x01_0001, 0xC000);

        assert_eq!(
            [0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0xC0, 0x00, 0x12, 0x34, 0x56, 0x78],
            nonce
        );
    }

    #[test]
    fn network_nonce_layout() {
        let ctx = test_context();

        let nonce = ctx.network_nonce(0x07, 0x01_0001);

        assert_eq!(
            [0x00, 0x07, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78],
            nonce
        );

        // control framing sets the CTL bit and zeroes the TTL
        assert_eq!(0x80, ctx.network_nonce(0x80, 1)[1]);
    }

    #[test]
    fn standard_pdu_framing() {
        let mut ctx = test_context();

        let access = [0x26, 0xA5, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];

        let pdu = ctx.create_standard_pdu(&access, 0xC000).unwrap();

        assert_eq!(PROXY_PDU_NETWORK, pdu[0]);

        // IVI bit (IV index is even) plus the 7-bit NID
        assert_eq!(0x70, pdu[1]);

        // type/ivi-nid + obfuscated header + enc(dst + transport + enc access + app mic) + net mic
        assert_eq!(2 + 6 + 2 + 1 + access.len() + 4 + 4, pdu.len());

        assert_eq!(0x01_0001, ctx.seq());
    }

    #[test]
    fn standard_pdu_decrypts_back_to_the_access_message() {
        let mut ctx = test_context();

        let access = [0x26, 0x55, 0xAA, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];

        let pdu = ctx.create_standard_pdu(&access, 0x0002).unwrap();

        let seq = ctx.seq();

        // network layer
        let enc_net = &pdu[8..];

        let net_plain = toolbox::ccm_decrypt(
            &ctx.encryption_key,
            &ctx.network_nonce(0x07, seq),
            enc_net,
            4,
        )
        .unwrap();

        assert_eq!(&[0x00, 0x02], &net_plain[..2]);
        assert_eq!(LOWER_TRANSPORT_AKF | ctx.aid(), net_plain[2]);

        // the obfuscated header unmasks to CTL|TTL, SEQ and SRC
        let clear = toolbox::obfuscate(0, 0, 0, enc_net, &ctx.privacy_key, 0x1234_5678).unwrap();

        let header: Vec<u8> = pdu[2..8].iter().zip(clear.iter()).map(|(o, m)| o ^ m).collect();

        assert_eq!(vec![0x07, 0x01, 0x00, 0x01, 0x00, 0x02], header);

        // application layer
        let app_plain = toolbox::ccm_decrypt(
            &ctx.app_key,
            &ctx.application_nonce(seq, 0x0002),
            &net_plain[3..],
            4,
        )
        .unwrap();

        assert_eq!(access.to_vec(), app_plain);
    }

    #[test]
    fn filter_setup_framing() {
        let mut ctx = test_context();

        let pdu = ctx.create_proxy_filter_setup().unwrap();

        assert_eq!(PROXY_PDU_CONFIG, pdu[0]);
        assert_eq!(0x70, pdu[1]);

        // 2 header bytes + 6 obfuscated + enc(dst 2 + payload 2) + 8 byte mic
        assert_eq!(2 + 6 + 4 + 8, pdu.len());

        let plain = toolbox::ccm_decrypt(
            &ctx.encryption_key,
            &ctx.network_nonce(0x80, ctx.seq()),
            &pdu[8..],
            8,
        )
        .unwrap();

        assert_eq!(vec![0x00, 0x00, 0x00, 0x01], plain);
    }

    #[test]
    fn sequence_is_strictly_monotonic() {
        let mut ctx = test_context();

        let access = [0x26; 11];

        let mut last = ctx.seq();

        for _ in 0..5 {
            ctx.create_standard_pdu(&access, 0x0002).unwrap();

            assert!(ctx.seq() > last);

            last = ctx.seq();
        }
    }

    #[test]
    fn sequence_exhaustion_is_fatal_and_sticky() {
        let mut ctx = test_context();

        ctx.seq = SEQ_MAX;

        assert_eq!(
            Err(MeshError::SequenceExhausted),
            ctx.create_standard_pdu(&[0x26; 11], 0x0002)
        );

        assert_eq!(
            Err(MeshError::SequenceExhausted),
            ctx.create_proxy_filter_setup()
        );

        // re-deriving the context is the only recovery
        assert_eq!(SEQ_INITIAL, test_context().seq());
    }
}
