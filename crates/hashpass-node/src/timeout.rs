// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - TIMEOUT WATCHER
//
// One task watching the puzzle's mining-time age. When a round outlives the
// target-window maximum with no winner, the watcher lowers the difficulty,
// rotates the seed, and broadcasts the reset (with is_timeout so dashboards
// can tell it apart from a win). The winner path aborts and respawns this
// task on every rotation, so a fresh round always gets a fresh watch.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::messages::Outbound;
use crate::state::{safe_lock, AppState};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Watch cadence; timeout precision is ±1s, which is plenty against a
/// 30–120s window.
const WATCH_PERIOD: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct TimeoutWatcher {
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TimeoutWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the running watch (if any) and start one for the current round.
    pub fn restart(&self, state: AppState) {
        let mut slot = safe_lock(&self.handle);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        *slot = Some(tokio::spawn(watch_loop(state)));
    }

    pub fn stop(&self) {
        if let Some(handle) = safe_lock(&self.handle).take() {
            handle.abort();
        }
    }
}

async fn watch_loop(state: AppState) {
    let mut interval = tokio::time::interval(WATCH_PERIOD);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;

        let expired = {
            let puzzle = state.puzzle.lock().await;
            puzzle.clock.elapsed().as_secs_f64() > puzzle.window().max_secs as f64
        };
        if expired {
            timeout_reset(&state).await;
        }
    }
}

/// The timeout path's critical section: decrease, rotate, broadcast —
/// mirror of the winner path, under the same lock.
async fn timeout_reset(state: &AppState) {
    let consolation = {
        let mut puzzle = state.puzzle.lock().await;

        // Re-check under the lock: a winner may have rotated in between.
        if puzzle.clock.elapsed().as_secs_f64() <= puzzle.window().max_secs as f64 {
            return;
        }

        let adjustment = puzzle.timeout_decrease();
        puzzle.rotate_seed();
        let snapshot = puzzle.snapshot();

        state.metrics.timeouts_total.inc();
        state.metrics.puzzle_rotations_total.inc();
        state
            .metrics
            .current_difficulty
            .set(puzzle.difficulty() as i64);

        println!("⏰ {}", adjustment.reason);
        state.applog.line(&adjustment.reason);

        let candidate = state.best.take();
        // Enqueue the reset before releasing the lock; socket writes happen
        // on the per-channel writer tasks.
        state
            .hub
            .broadcast(&Outbound::puzzle_reset(&snapshot, None, true));
        candidate
    };

    // Best-effort consolation code, only when the operator enabled it.
    if !state.config.timeout_consolation {
        return;
    }
    let Some(candidate) = consolation else {
        return;
    };
    let minted = {
        let secret = safe_lock(&state.secret);
        hashpass_core::mint_invite_code(
            &secret,
            &candidate.fingerprint,
            candidate.nonce,
            &candidate.seed,
        )
    };
    match minted {
        Ok(invite_code) => {
            let delivered = state
                .hub
                .find_by_token(&candidate.session_token)
                .map(|channel| {
                    state
                        .hub
                        .send_to(channel.id, &Outbound::TimeoutInviteCode { invite_code })
                })
                .unwrap_or(false);
            if delivered {
                println!(
                    "🎗️  consolation code delivered ({} zero bits)",
                    candidate.zero_bits
                );
            }
        }
        Err(e) => eprintln!("⚠️  consolation mint failed: {}", e),
    }
}
