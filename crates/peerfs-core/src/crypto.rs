//! Cryptographic helpers
//!
//! - HMAC-SHA256 tags binding the shared password to a DTLS fingerprint
//! - SHA-1 content keys for the thumbnail cache
//! - random room suffixes and pairing PINs from the OS RNG

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Characters used in redirect room suffixes.
const ROOM_SUFFIX_CHARS: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Length of a redirect room suffix.
pub const ROOM_SUFFIX_LEN: usize = 10;

/// Compute the authentication tag sent on the control channel:
/// `HMAC-SHA256(password, fingerprint)`.
pub fn auth_hmac(password: &str, fingerprint: &str) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(password.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(fingerprint.as_bytes());
    mac.finalize().into_bytes().into()
}

/// Verify a received tag in constant time.
pub fn verify_auth_hmac(password: &str, fingerprint: &str, tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(password.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(fingerprint.as_bytes());
    mac.verify_slice(tag).is_ok()
}

/// Random suffix appended to redirect room ids.
pub fn random_room_suffix(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes).expect("RNG failed - system entropy source unavailable");
    bytes
        .iter()
        .map(|b| ROOM_SUFFIX_CHARS[(*b as usize) % ROOM_SUFFIX_CHARS.len()] as char)
        .collect()
}

/// Six-decimal-digit pairing PIN, zero-padded.
pub fn pairing_pin() -> String {
    let mut bytes = [0u8; 4];
    getrandom::getrandom(&mut bytes).expect("RNG failed - system entropy source unavailable");
    format!("{:06}", u32::from_le_bytes(bytes) % 1_000_000)
}

/// Content key for a thumbnail source path: lowercase hex SHA-1.
pub fn thumbnail_cache_key(src: &str) -> String {
    hex::encode(Sha1::digest(src.as_bytes()))
}
