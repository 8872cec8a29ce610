//! Authenticated IPSC flavor: a 10-byte truncated HMAC-SHA1 over the
//! packet body, keyed with the per-peer 20-byte key.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const DIGEST_LEN: usize = 10;
pub const KEY_LEN: usize = 20;

/// Append the truncated digest to a serialized packet
pub fn sign(payload: &[u8], key: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(payload.len() + DIGEST_LEN);
    out.extend_from_slice(payload);
    out.extend_from_slice(&digest[..DIGEST_LEN]);
    out
}

/// Verify and strip the trailing digest. Returns the bare packet body,
/// or None when the packet is too short or the digest does not match.
pub fn verify<'a>(data: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    if data.len() <= DIGEST_LEN {
        return None;
    }
    let (payload, digest) = data.split_at(data.len() - DIGEST_LEN);

    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    // Constant-time comparison of the truncation
    let mut diff = 0u8;
    for (a, b) in digest.iter().zip(expected[..DIGEST_LEN].iter()) {
        diff |= a ^ b;
    }
    if diff != 0 {
        return None;
    }
    Some(payload)
}
