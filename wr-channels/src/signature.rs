use sha1::{Digest, Sha1};

/// Hex SHA-1 over the lexicographically sorted concatenation of token, timestamp and nonce.
pub fn compute_signature(token: &str, timestamp: &str, nonce: &str) -> String {
    let mut parts = [token, timestamp, nonce];
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn verify_signature(token: &str, timestamp: &str, nonce: &str, signature: &str) -> bool {
    compute_signature(token, timestamp, nonce).eq_ignore_ascii_case(signature.trim())
}
