// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - INVITE MINTER
//
// Invite codes are derived, never stored: HMAC-SHA256 keyed by the server
// secret over "fingerprint:nonce:seed", truncated to 12 bytes and rendered
// as URL-safe base64 behind a fixed prefix. Rotating the secret makes every
// previously-minted code unreproducible.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Fixed prefix of every minted code.
pub const INVITE_PREFIX: &str = "HASHPASS-";

/// MAC truncation: 12 bytes → 16 base64 chars.
pub const INVITE_TAG_BYTES: usize = 12;

/// The 256-bit key invite codes are derived from.
///
/// Generated at startup unless the operator supplies one. Kept in a
/// `Zeroizing` buffer so the bytes are wiped on drop and on regeneration.
pub struct ServerSecret {
    key: Zeroizing<[u8; 32]>,
}

impl ServerSecret {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut *key);
        ServerSecret { key }
    }

    /// Parse an operator-preset secret (exactly 64 hex chars).
    pub fn from_hex(hex_str: &str) -> Result<Self, String> {
        let raw = hex::decode(hex_str.trim())
            .map_err(|e| format!("server secret is not hex: {}", e))?;
        if raw.len() != 32 {
            return Err(format!(
                "server secret must be 32 bytes (64 hex chars), got {} bytes",
                raw.len()
            ));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&raw);
        Ok(ServerSecret { key })
    }

    /// Replace the key with fresh random bytes, invalidating all prior codes.
    pub fn regenerate(&mut self) {
        rand::thread_rng().fill_bytes(&mut *self.key);
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Short non-secret identifier for logs (first 4 hex chars of the key's
    /// own HMAC over a fixed label, so the key itself never leaks).
    pub fn key_id(&self) -> String {
        let mut mac = match HmacSha256::new_from_slice(&*self.key) {
            Ok(m) => m,
            Err(_) => return "????".to_string(),
        };
        mac.update(b"hashpass-key-id");
        let tag = mac.finalize().into_bytes();
        hex::encode(&tag[..2])
    }
}

impl std::fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSecret")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

/// Mint the invite code for a winning submission.
/// Deterministic in (secret, fingerprint, nonce, seed).
pub fn mint_invite_code(
    secret: &ServerSecret,
    fingerprint: &str,
    nonce: u64,
    seed: &str,
) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("HMAC key error: {}", e))?;
    mac.update(format!("{}:{}:{}", fingerprint, nonce, seed).as_bytes());
    let tag = mac.finalize().into_bytes();
    Ok(format!(
        "{}{}",
        INVITE_PREFIX,
        URL_SAFE_NO_PAD.encode(&tag[..INVITE_TAG_BYTES])
    ))
}

/// Constant-time code comparison for later redemption checks.
pub fn codes_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).unwrap_u8() == 1
}
