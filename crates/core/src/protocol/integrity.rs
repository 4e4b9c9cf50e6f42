//! Integrity tags over unpadded message content.
//!
//! Datum payloads are tagged with HMAC-SHA256 truncated to 16 bytes; relay
//! envelopes that only ever exist inside a tunnel use an MD5 digest.

use super::frame::CHECKSUM_SIZE;
use hmac::digest::Key;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const DATUM_MAC_LABEL: &[u8] = b"onionmesh/datum/v1";

/// The label zero-padded to the SHA-256 block size, as HMAC pads short keys
const DATUM_MAC_KEY: [u8; 64] = pad_block(DATUM_MAC_LABEL);

const fn pad_block(label: &[u8]) -> [u8; 64] {
    let mut block = [0u8; 64];
    let mut i = 0;
    while i < label.len() {
        block[i] = label[i];
        i += 1;
    }
    block
}

fn datum_mac() -> HmacSha256 {
    <HmacSha256 as Mac>::new(&Key::<HmacSha256>::from(DATUM_MAC_KEY))
}

/// Truncated HMAC-SHA256 over the given content
pub fn datum_checksum(content: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut mac = datum_mac();
    mac.update(content);
    let tag = mac.finalize().into_bytes();

    let mut checksum = [0u8; CHECKSUM_SIZE];
    checksum.copy_from_slice(&tag[..CHECKSUM_SIZE]);
    checksum
}

/// Constant-time verification of a truncated Datum tag
pub fn verify_datum_checksum(content: &[u8], checksum: &[u8; CHECKSUM_SIZE]) -> bool {
    let mut mac = datum_mac();
    mac.update(content);
    mac.verify_truncated_left(checksum).is_ok()
}

/// MD5 digest of a relay envelope body
pub fn relay_digest(body: &[u8]) -> [u8; 16] {
    md5::compute(body).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datum_checksum_detects_mutation() {
        let content = b"tunnel payload";
        let checksum = datum_checksum(content);

        assert!(verify_datum_checksum(content, &checksum));
        assert!(!verify_datum_checksum(b"tunnel paylaod", &checksum));
    }

    #[test]
    fn test_padded_key_matches_label_key() {
        let mut by_label = <HmacSha256 as Mac>::new_from_slice(DATUM_MAC_LABEL).unwrap();
        by_label.update(b"content");
        let tag = by_label.finalize().into_bytes();

        assert_eq!(datum_checksum(b"content")[..], tag[..CHECKSUM_SIZE]);
    }

    #[test]
    fn test_relay_digest_known_vector() {
        assert_eq!(
            hex::encode(relay_digest(b"")),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }
}
