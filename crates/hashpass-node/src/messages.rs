// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - REALTIME WIRE MESSAGES
//
// Tagged JSON variants for the bidirectional channel. Inbound messages with
// an unknown `type` fail to deserialize and are dropped by the hub.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::{Deserialize, Serialize};

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Liveness probe; answered with PONG.
    Ping,
    /// This channel started grinding nonces.
    MiningStart,
    /// This channel stopped grinding.
    MiningStop,
    /// Periodic self-reported hash rate in H/s.
    Hashrate { rate: f64 },
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Outbound {
    /// First in-band message after a successful human-challenge handshake.
    #[serde(rename = "SESSION_TOKEN")]
    SessionToken { token: String },

    #[serde(rename = "PONG")]
    Pong { online: usize },

    /// A new round started: fresh seed, possibly new difficulty.
    #[serde(rename = "PUZZLE_RESET")]
    PuzzleReset {
        seed: String,
        difficulty: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        solve_time: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        average_solve_time: Option<f64>,
        puzzle_start_time: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_timeout: Option<bool>,
    },

    #[serde(rename = "NETWORK_HASHRATE")]
    NetworkHashrate {
        total_hashrate: f64,
        active_miners: usize,
        timestamp: u64,
    },

    /// Best-effort consolation code after a round timed out.
    #[serde(rename = "TIMEOUT_INVITE_CODE")]
    TimeoutInviteCode { invite_code: String },

    /// Admin channels only: periodic state snapshot.
    #[serde(rename = "STATUS_UPDATE")]
    StatusUpdate { status: serde_json::Value },
}

impl Outbound {
    /// Build a PUZZLE_RESET from a puzzle snapshot.
    pub fn puzzle_reset(
        snap: &hashpass_core::PuzzleSnapshot,
        solve_time: Option<f64>,
        is_timeout: bool,
    ) -> Self {
        Outbound::PuzzleReset {
            seed: snap.seed.clone(),
            difficulty: snap.difficulty,
            solve_time,
            average_solve_time: snap.average_solve_time,
            puzzle_start_time: snap.puzzle_start_time,
            is_timeout: if is_timeout { Some(true) } else { None },
        }
    }
}
