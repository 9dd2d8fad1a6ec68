use std::{fmt, str::FromStr};

use byteorder::{BigEndian, WriteBytesExt};
use rand::{RngCore, rngs::StdRng};
use xsalsa20poly1305::{
    Nonce, Tag, XSalsa20Poly1305,
    aead::{AeadInPlace, KeyInit},
};

use crate::common::errors::{LinkError, LinkResult};

pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_VERSION_BYTE: u8 = 0x80;
pub const RTP_OPUS_PAYLOAD_TYPE: u8 = 0x78;

const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const UDP_PACKET_BUF_CAPACITY: usize = 1460;

/// Transport encryption modes this client can speak, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    /// Nonce is the RTP header, zero-extended.
    XSalsa20Poly1305,
    /// Random nonce, appended to the packet.
    XSalsa20Poly1305Suffix,
}

impl EncryptionMode {
    pub const SUPPORTED: [EncryptionMode; 2] =
        [Self::XSalsa20Poly1305, Self::XSalsa20Poly1305Suffix];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::XSalsa20Poly1305 => "xsalsa20_poly1305",
            Self::XSalsa20Poly1305Suffix => "xsalsa20_poly1305_suffix",
        }
    }

    /// First mode of ours the remote also offers.
    pub fn negotiate<S: AsRef<str>>(offered: &[S]) -> LinkResult<Self> {
        Self::SUPPORTED
            .into_iter()
            .find(|mode| offered.iter().any(|o| o.as_ref() == mode.as_str()))
            .ok_or_else(|| {
                LinkError::configuration(format!(
                    "no supported encryption mode among {:?}",
                    offered.iter().map(AsRef::as_ref).collect::<Vec<_>>()
                ))
            })
    }
}

impl FromStr for EncryptionMode {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::SUPPORTED
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| LinkError::configuration(format!("unsupported encryption mode '{}'", s)))
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds one RTP packet: header, payload, then optional encryption.
///
/// The buffer is reused between packets; call [`reset`](Self::reset) to start over.
pub struct RtpPacketGenerator {
    buf: Vec<u8>,
    header_len: usize,
}

impl Default for RtpPacketGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpPacketGenerator {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(UDP_PACKET_BUF_CAPACITY),
            header_len: 0,
        }
    }

    pub fn reset(&mut self) -> &mut Self {
        self.buf.clear();
        self.header_len = 0;
        self
    }

    pub fn create_header(&mut self, sequence: u16, timestamp: u32, ssrc: u32) -> &mut Self {
        self.reset();
        self.buf.push(RTP_VERSION_BYTE);
        self.buf.push(RTP_OPUS_PAYLOAD_TYPE);
        // writes into a Vec cannot fail
        let _ = self.buf.write_u16::<BigEndian>(sequence);
        let _ = self.buf.write_u32::<BigEndian>(timestamp);
        let _ = self.buf.write_u32::<BigEndian>(ssrc);
        self.header_len = RTP_HEADER_LEN;
        self
    }

    pub fn add_payload(&mut self, payload: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(payload);
        self
    }

    /// Encrypts everything after the header in place.
    ///
    /// Layout afterwards is `header | tag | ciphertext`, followed by the
    /// 24-byte nonce in suffix mode. `rng` is only drawn from in suffix mode.
    pub fn encrypt_payload(
        &mut self,
        mode: EncryptionMode,
        key: &[u8],
        rng: &mut StdRng,
    ) -> LinkResult<&mut Self> {
        let cipher = XSalsa20Poly1305::new_from_slice(key).map_err(|_| {
            LinkError::configuration(format!("secret key must be 32 bytes, got {}", key.len()))
        })?;

        let mut nonce = [0u8; NONCE_LEN];
        match mode {
            EncryptionMode::XSalsa20Poly1305 => {
                nonce[..self.header_len].copy_from_slice(&self.buf[..self.header_len]);
            }
            EncryptionMode::XSalsa20Poly1305Suffix => rng.fill_bytes(&mut nonce),
        }

        let tag = cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut self.buf[self.header_len..],
            )
            .map_err(|e| LinkError::protocol(format!("XSalsa20 encryption error: {e:?}")))?;

        let at = self.header_len;
        let body_len = self.buf.len() - at;
        self.buf.resize(self.buf.len() + TAG_LEN, 0);
        self.buf.copy_within(at..at + body_len, at + TAG_LEN);
        self.buf[at..at + TAG_LEN].copy_from_slice(&tag);
        if mode == EncryptionMode::XSalsa20Poly1305Suffix {
            self.buf.extend_from_slice(&nonce);
        }
        Ok(self)
    }

    pub fn finalize(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Reverses [`RtpPacketGenerator::encrypt_payload`], returning the opus payload.
pub fn decrypt_packet(mode: EncryptionMode, key: &[u8], packet: &[u8]) -> LinkResult<Vec<u8>> {
    let min_len = RTP_HEADER_LEN
        + TAG_LEN
        + match mode {
            EncryptionMode::XSalsa20Poly1305 => 0,
            EncryptionMode::XSalsa20Poly1305Suffix => NONCE_LEN,
        };
    if packet.len() < min_len {
        return Err(LinkError::protocol(format!("packet too short: {} bytes", packet.len())));
    }
    let cipher = XSalsa20Poly1305::new_from_slice(key)
        .map_err(|_| LinkError::configuration("secret key must be 32 bytes"))?;

    let (body, nonce) = match mode {
        EncryptionMode::XSalsa20Poly1305 => {
            let mut nonce = [0u8; NONCE_LEN];
            nonce[..RTP_HEADER_LEN].copy_from_slice(&packet[..RTP_HEADER_LEN]);
            (&packet[RTP_HEADER_LEN..], nonce)
        }
        EncryptionMode::XSalsa20Poly1305Suffix => {
            let split = packet.len() - NONCE_LEN;
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&packet[split..]);
            (&packet[RTP_HEADER_LEN..split], nonce)
        }
    };

    let (tag, ciphertext) = body.split_at(TAG_LEN);
    let mut plain = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut plain, Tag::from_slice(tag))
        .map_err(|_| LinkError::protocol("packet failed authentication"))?;
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_header_layout() {
        let mut rtp = RtpPacketGenerator::new();
        rtp.create_header(1, 256, 0xFFFF_FFFF);
        assert_eq!(
            rtp.finalize(),
            &[128, 120, 0, 1, 0, 0, 1, 0, 255, 255, 255, 255]
        );
    }

    #[test]
    fn test_payload_without_header() {
        let mut rtp = RtpPacketGenerator::new();
        rtp.add_payload(&[5, 5, 5]);
        assert_eq!(rtp.finalize(), &[5, 5, 5]);
    }

    #[test]
    fn test_header_nonce_encryption_vector() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut rtp = RtpPacketGenerator::new();
        rtp.create_header(0, 0, 0)
            .add_payload(&[5, 5, 5])
            .encrypt_payload(EncryptionMode::XSalsa20Poly1305, &[0u8; 32], &mut rng)
            .unwrap();
        assert_eq!(
            rtp.finalize(),
            &[
                128, 120, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 19, 218, 101, 174, 20, 173, 201, 65, 165,
                148, 208, 30, 36, 161, 97, 115, 8, 58, 93
            ]
        );
    }

    #[test]
    fn test_suffix_nonce_is_appended_and_decrypts() {
        let key = [7u8; 32];
        let mut rng = StdRng::seed_from_u64(42);
        let mut rtp = RtpPacketGenerator::new();
        rtp.create_header(9, 960, 1234)
            .add_payload(b"opus")
            .encrypt_payload(EncryptionMode::XSalsa20Poly1305Suffix, &key, &mut rng)
            .unwrap();
        let packet = rtp.finalize().to_vec();
        assert_eq!(packet.len(), RTP_HEADER_LEN + TAG_LEN + 4 + NONCE_LEN);
        assert_eq!(
            decrypt_packet(EncryptionMode::XSalsa20Poly1305Suffix, &key, &packet).unwrap(),
            b"opus"
        );

        // fresh nonce per packet
        rtp.create_header(9, 960, 1234)
            .add_payload(b"opus")
            .encrypt_payload(EncryptionMode::XSalsa20Poly1305Suffix, &key, &mut rng)
            .unwrap();
        assert_ne!(rtp.finalize(), packet.as_slice());
    }

    #[test]
    fn test_bad_key_is_a_configuration_error() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut rtp = RtpPacketGenerator::new();
        let err = rtp
            .create_header(0, 0, 0)
            .encrypt_payload(EncryptionMode::XSalsa20Poly1305, &[0u8; 16], &mut rng)
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[test]
    fn test_mode_parsing_and_negotiation() {
        assert_eq!(
            "xsalsa20_poly1305_suffix".parse::<EncryptionMode>().unwrap(),
            EncryptionMode::XSalsa20Poly1305Suffix
        );
        assert!(matches!(
            "aead_aes256_gcm_rtpsize".parse::<EncryptionMode>(),
            Err(LinkError::Configuration(_))
        ));

        let offered = ["aead_aes256_gcm_rtpsize", "xsalsa20_poly1305_suffix", "xsalsa20_poly1305"];
        assert_eq!(
            EncryptionMode::negotiate(&offered).unwrap(),
            EncryptionMode::XSalsa20Poly1305
        );
        assert_eq!(
            EncryptionMode::negotiate(&["xsalsa20_poly1305_suffix"]).unwrap(),
            EncryptionMode::XSalsa20Poly1305Suffix
        );
        assert!(EncryptionMode::negotiate(&["aead_aes256_gcm_rtpsize"])
            .unwrap_err()
            .is_fatal());
    }
}
