//! Content hashing for drift fingerprints and derived image names

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

/// SHA-256 of `data`, base64url encoded without padding
pub fn sha256_b64(data: &[u8]) -> String {
    let hash = digest(&SHA256, data);
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// SHA-256 of `data`, lowercase hex encoded
pub fn sha256_hex(data: &[u8]) -> String {
    digest(&SHA256, data)
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Fingerprint of a set of `key=value` pairs, independent of input order
pub fn fingerprint_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut lines: Vec<String> = pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    lines.sort();
    sha256_b64(lines.join("\n").as_bytes())
}
