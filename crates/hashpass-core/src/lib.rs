// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - CORE MODULE
//
// Puzzle primitives for the invite-code race: memory-hard hash verification,
// invite-code minting, the puzzle state machine with its difficulty
// controller and mining-time clock, and the IP-bound session registry.
// No I/O lives here — everything is testable without a socket.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod clock;
pub mod invite;
pub mod puzzle;
pub mod session;
pub mod verifier;

pub use clock::MiningClock;
pub use invite::{codes_match, mint_invite_code, ServerSecret};
pub use puzzle::{
    DifficultyAdjustment, DifficultyBounds, PuzzleConfig, PuzzleSnapshot, PuzzleState,
    TargetWindow,
};
pub use session::{SessionError, SessionRegistry};
pub use verifier::{
    compute_pow_hash, leading_zero_bits, mine, parse_trace_ip, verify_submission, PowParams,
    VerifyOutcome,
};

/// Puzzle seed length: 128 random bits rendered as lowercase hex.
pub const SEED_HEX_LEN: usize = 32;

/// Expected hash length on the wire: 32 bytes, 64 lowercase hex chars.
pub const HASH_HEX_LEN: usize = 64;

/// Current UNIX time in whole seconds.
pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current UNIX time in milliseconds (client-facing timestamps).
pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
