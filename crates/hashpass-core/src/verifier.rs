// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - HASH VERIFIER
//
// Recomputes the memory-hard puzzle hash from a submission and checks it
// against the wire contract:
//
//   H = Argon2d(password = decimal ASCII of nonce,
//               salt     = seed ‖ fingerprint ‖ trace blob,
//               time=t, memory=m KiB, parallelism=p, hashLen=32)
//
// A submission is valid iff H equals the submitted hash byte-for-byte AND
// H has at least `difficulty` leading zero bits. Client and server must
// agree on this construction bit-for-bit.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Argon2 cost parameters advertised to clients and used for verification.
/// Defaults are deliberately heavy (64 MiB) — each verification call costs
/// real memory, which is why verification runs on a bounded worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowParams {
    /// Iterations (Argon2 time cost).
    pub time_cost: u32,
    /// Memory cost in KiB.
    pub memory_cost_kib: u32,
    /// Lanes (Argon2 parallelism).
    pub parallelism: u32,
}

impl PowParams {
    /// Production default: t=1, m=64 MiB, p=1.
    pub const DEFAULT: Self = PowParams {
        time_cost: 1,
        memory_cost_kib: 65_536,
        parallelism: 1,
    };

    /// Validate against the argon2 crate's own parameter limits.
    /// Memory must cover at least 8 KiB per lane.
    pub fn validate(&self) -> Result<(), String> {
        if self.time_cost == 0 {
            return Err("time_cost must be >= 1".to_string());
        }
        if self.parallelism == 0 {
            return Err("parallelism must be >= 1".to_string());
        }
        if self.memory_cost_kib < 8 * self.parallelism {
            return Err(format!(
                "memory_cost_kib must be >= {} (8 KiB per lane)",
                8 * self.parallelism
            ));
        }
        Ok(())
    }
}

impl Default for PowParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Outcome of recomputing and checking a single submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Bytes match and the zero-bit count meets the difficulty.
    Valid { zero_bits: u32 },
    /// Recomputed hash differs from the submitted hash.
    HashMismatch,
    /// Bytes match but the hash does not meet the difficulty.
    BelowDifficulty { zero_bits: u32 },
}

impl VerifyOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyOutcome::Valid { .. })
    }
}

/// Compute the puzzle hash for a submission.
///
/// The salt is the raw byte concatenation seed ‖ fingerprint ‖ trace — no
/// separators, no encoding. The nonce is hashed as its decimal ASCII string.
pub fn compute_pow_hash(
    nonce: u64,
    seed: &str,
    fingerprint: &str,
    trace: &str,
    params: &PowParams,
) -> Result<[u8; 32], String> {
    let a2_params = Params::new(
        params.memory_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| format!("Invalid Argon2 params: {}", e))?;

    let argon2 = Argon2::new(Algorithm::Argon2d, Version::V0x13, a2_params);

    let mut salt = Vec::with_capacity(seed.len() + fingerprint.len() + trace.len());
    salt.extend_from_slice(seed.as_bytes());
    salt.extend_from_slice(fingerprint.as_bytes());
    salt.extend_from_slice(trace.as_bytes());

    let password = nonce.to_string();
    let mut out = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), &salt, &mut out)
        .map_err(|e| format!("Argon2 hashing error: {}", e))?;
    Ok(out)
}

/// Recompute the hash for a submission and compare against the expected
/// 64-char hex hash under the given difficulty.
///
/// Returns Err only for malformed input or Argon2 parameter errors; a wrong
/// hash is a regular `VerifyOutcome`, not an error.
pub fn verify_submission(
    nonce: u64,
    seed: &str,
    fingerprint: &str,
    trace: &str,
    expected_hash_hex: &str,
    difficulty: u32,
    params: &PowParams,
) -> Result<VerifyOutcome, String> {
    if expected_hash_hex.len() != crate::HASH_HEX_LEN {
        return Err(format!(
            "hash must be {} hex chars, got {}",
            crate::HASH_HEX_LEN,
            expected_hash_hex.len()
        ));
    }
    let expected = hex::decode(expected_hash_hex).map_err(|e| format!("hash is not hex: {}", e))?;

    let computed = compute_pow_hash(nonce, seed, fingerprint, trace, params)?;

    // Constant-time byte comparison — the submitted hash is attacker-supplied.
    if computed.as_slice().ct_eq(expected.as_slice()).unwrap_u8() != 1 {
        return Ok(VerifyOutcome::HashMismatch);
    }

    let zero_bits = leading_zero_bits(&computed);
    if zero_bits < difficulty {
        return Ok(VerifyOutcome::BelowDifficulty { zero_bits });
    }
    Ok(VerifyOutcome::Valid { zero_bits })
}

/// Grind nonces from a random offset until one clears `difficulty`,
/// checking the cancel flag every 64 attempts.
///
/// This is the client's loop, not the server's — the server only verifies.
/// It exists for load tools and tests that need honest proofs, and runs in
/// the caller's thread. Returns None if cancelled.
pub fn mine(
    seed: &str,
    fingerprint: &str,
    trace: &str,
    difficulty: u32,
    params: &PowParams,
    cancel: &std::sync::atomic::AtomicBool,
) -> Result<Option<(u64, [u8; 32])>, String> {
    use rand::Rng;
    let start: u64 = rand::thread_rng().gen();
    let mut nonce = start;
    loop {
        if nonce.wrapping_sub(start) & 0x3F == 0
            && cancel.load(std::sync::atomic::Ordering::Relaxed)
        {
            return Ok(None);
        }
        let hash = compute_pow_hash(nonce, seed, fingerprint, trace, params)?;
        if leading_zero_bits(&hash) >= difficulty {
            return Ok(Some((nonce, hash)));
        }
        nonce = nonce.wrapping_add(1);
        // Full u64 space exhausted (astronomically unlikely)
        if nonce == start {
            return Ok(None);
        }
    }
}

/// Count leading zero bits of a byte string viewed as a big-endian integer.
pub fn leading_zero_bits(bytes: &[u8]) -> u32 {
    let mut zero_bits = 0u32;
    for byte in bytes {
        if *byte == 0 {
            zero_bits += 8;
        } else {
            zero_bits += byte.leading_zeros();
            break;
        }
    }
    zero_bits
}

/// Extract the client IP claimed by an edge trace blob.
///
/// The blob is opaque text with one mandatory `ip=<literal-IP>` line.
/// Comparison against the connection's real IP is exact string equality.
pub fn parse_trace_ip(blob: &str) -> Option<&str> {
    blob.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("ip="))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tiny Argon2 costs so tests run in microseconds, not tens of ms.
    fn test_params() -> PowParams {
        PowParams {
            time_cost: 1,
            memory_cost_kib: 64,
            parallelism: 1,
        }
    }

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&[0x00, 0x00, 0xFF]), 16);
        assert_eq!(leading_zero_bits(&[0x00, 0x01, 0xFF]), 15);
        assert_eq!(leading_zero_bits(&[0x0F, 0xFF]), 4);
        assert_eq!(leading_zero_bits(&[0xFF]), 0);
        assert_eq!(leading_zero_bits(&[0x00, 0x00, 0x00, 0x00]), 32);
        assert_eq!(leading_zero_bits(&[]), 0);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let p = test_params();
        let h1 = compute_pow_hash(12345, "aabb", "fp-1", "ip=1.2.3.4\n", &p).unwrap();
        let h2 = compute_pow_hash(12345, "aabb", "fp-1", "ip=1.2.3.4\n", &p).unwrap();
        assert_eq!(h1, h2, "Same inputs must produce same hash");
    }

    #[test]
    fn test_hash_differs_by_each_input() {
        let p = test_params();
        let base = compute_pow_hash(1, "seed", "fp", "trace", &p).unwrap();
        assert_ne!(base, compute_pow_hash(2, "seed", "fp", "trace", &p).unwrap());
        assert_ne!(base, compute_pow_hash(1, "s33d", "fp", "trace", &p).unwrap());
        assert_ne!(base, compute_pow_hash(1, "seed", "fq", "trace", &p).unwrap());
        assert_ne!(base, compute_pow_hash(1, "seed", "fp", "trac3", &p).unwrap());
    }

    #[test]
    fn test_salt_concatenation_has_no_separator() {
        // seed="ab", fp="cd" and seed="abc", fp="d" concatenate to the same
        // salt bytes — the wire contract is raw concatenation.
        let p = test_params();
        let h1 = compute_pow_hash(7, "ab", "cd", "x", &p).unwrap();
        let h2 = compute_pow_hash(7, "abc", "d", "x", &p).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_verify_round_trip() {
        let p = test_params();
        let hash = compute_pow_hash(42, "seed", "fp", "ip=9.9.9.9", &p).unwrap();
        let hex = hex::encode(hash);

        let outcome = verify_submission(42, "seed", "fp", "ip=9.9.9.9", &hex, 0, &p).unwrap();
        assert!(outcome.is_valid(), "honest submission must verify: {:?}", outcome);
    }

    #[test]
    fn test_verify_rejects_tampered_hash() {
        let p = test_params();
        let hash = compute_pow_hash(42, "seed", "fp", "t", &p).unwrap();
        let mut hex = hex::encode(hash);
        // Flip one nibble
        let flipped = if hex.ends_with('0') { '1' } else { '0' };
        hex.pop();
        hex.push(flipped);

        let outcome = verify_submission(42, "seed", "fp", "t", &hex, 0, &p).unwrap();
        assert_eq!(outcome, VerifyOutcome::HashMismatch);
    }

    #[test]
    fn test_verify_rejects_insufficient_difficulty() {
        let p = test_params();
        // Grind a nonce whose hash has at least 4 leading zero bits, then
        // demand more bits than it has.
        let mut nonce = 0u64;
        let (nonce, hash) = loop {
            let h = compute_pow_hash(nonce, "seed", "fp", "t", &p).unwrap();
            if leading_zero_bits(&h) >= 4 {
                break (nonce, h);
            }
            nonce += 1;
        };
        let bits = leading_zero_bits(&hash);
        let hex = hex::encode(hash);

        let ok = verify_submission(nonce, "seed", "fp", "t", &hex, bits, &p).unwrap();
        assert!(ok.is_valid());

        let too_hard = verify_submission(nonce, "seed", "fp", "t", &hex, bits + 1, &p).unwrap();
        assert_eq!(too_hard, VerifyOutcome::BelowDifficulty { zero_bits: bits });
    }

    #[test]
    fn test_verify_rejects_malformed_hash_hex() {
        let p = test_params();
        assert!(verify_submission(1, "s", "f", "t", "abcd", 0, &p).is_err());
        assert!(verify_submission(1, "s", "f", "t", &"zz".repeat(32), 0, &p).is_err());
    }

    #[test]
    fn test_params_validation() {
        assert!(PowParams::DEFAULT.validate().is_ok());
        assert!(PowParams { time_cost: 0, memory_cost_kib: 64, parallelism: 1 }
            .validate()
            .is_err());
        assert!(PowParams { time_cost: 1, memory_cost_kib: 64, parallelism: 0 }
            .validate()
            .is_err());
        assert!(PowParams { time_cost: 1, memory_cost_kib: 16, parallelism: 4 }
            .validate()
            .is_err());
    }

    #[test]
    fn test_mine_finds_verifiable_nonce() {
        let p = test_params();
        let cancel = std::sync::atomic::AtomicBool::new(false);
        let (nonce, hash) = mine("seed", "fp", "ip=1.2.3.4", 4, &p, &cancel)
            .unwrap()
            .expect("difficulty 4 should be found quickly");
        assert!(leading_zero_bits(&hash) >= 4);

        let outcome =
            verify_submission(nonce, "seed", "fp", "ip=1.2.3.4", &hex::encode(hash), 4, &p)
                .unwrap();
        assert!(outcome.is_valid(), "mined nonce must verify");
    }

    #[test]
    fn test_mine_cancellation() {
        let p = test_params();
        let cancel = std::sync::atomic::AtomicBool::new(true); // pre-cancelled
        let result = mine("seed", "fp", "t", 255, &p, &cancel).unwrap();
        assert!(result.is_none(), "cancelled mine must return None");
    }

    #[test]
    fn test_parse_trace_ip() {
        let blob = "fl=123abc\nh=example.com\nip=203.0.113.7\nts=1700000000.123\nuag=Mozilla/5.0\n";
        assert_eq!(parse_trace_ip(blob), Some("203.0.113.7"));

        assert_eq!(parse_trace_ip("ip=::1"), Some("::1"));
        assert_eq!(parse_trace_ip("ts=1\nuag=x"), None);
        assert_eq!(parse_trace_ip("ip="), None);
        assert_eq!(parse_trace_ip(""), None);
        // First ip= line wins
        assert_eq!(parse_trace_ip("ip=1.1.1.1\nip=2.2.2.2"), Some("1.1.1.1"));
    }
}
