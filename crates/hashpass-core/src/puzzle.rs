// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - PUZZLE STATE & DIFFICULTY CONTROLLER
//
// The single global puzzle every client races on: current seed, difficulty,
// Argon2 parameters, and the mining-time clock. All mutation is serialized
// through one lock owned by the node; this module only provides the state
// machine and keeps its invariants:
//
//   1. The seed rotates atomically with every winner event or timeout.
//   2. Difficulty always stays within [min, max].
//   3. Any parameter change rotates the seed exactly once.
//   4. Solve times are measured on the mining-time clock, never wall clock.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::clock::MiningClock;
use crate::verifier::PowParams;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ─────────────────────────────────────────────────────────────────
// CONSTANTS
// ─────────────────────────────────────────────────────────────────

/// Maximum difficulty step per adjustment, up or down.
/// ±4 bits per solve = ±16× expected work.
pub const MAX_ADJUSTMENT_BITS: i64 = 4;

/// Minimum difficulty drop applied by the timeout path.
/// A stuck puzzle must get meaningfully easier, not 1 bit at a time.
pub const TIMEOUT_MIN_DECREASE: u32 = 2;

/// Solve-time history retained for the reported average.
pub const SOLVE_HISTORY_LEN: usize = 50;

// ─────────────────────────────────────────────────────────────────
// CONFIGURATION TYPES
// ─────────────────────────────────────────────────────────────────

/// Inclusive difficulty clamp, in leading zero bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyBounds {
    pub min: u32,
    pub max: u32,
}

impl DifficultyBounds {
    pub fn validate(&self) -> Result<(), String> {
        if self.min == 0 {
            return Err("difficulty min must be >= 1".to_string());
        }
        if self.max > 256 {
            return Err("difficulty max must be <= 256".to_string());
        }
        if self.min > self.max {
            return Err(format!(
                "difficulty min {} must be <= max {}",
                self.min, self.max
            ));
        }
        Ok(())
    }

    pub fn clamp(&self, d: i64) -> u32 {
        d.clamp(self.min as i64, self.max as i64) as u32
    }
}

/// Target solve-time window in seconds. Solves inside the window leave the
/// difficulty alone; solves outside step it toward the midpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetWindow {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl TargetWindow {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_secs == 0 {
            return Err("target window min must be >= 1s".to_string());
        }
        if self.min_secs >= self.max_secs {
            return Err(format!(
                "target window min {}s must be < max {}s",
                self.min_secs, self.max_secs
            ));
        }
        Ok(())
    }

    pub fn mid(&self) -> f64 {
        (self.min_secs + self.max_secs) as f64 / 2.0
    }

    pub fn contains(&self, secs: f64) -> bool {
        secs >= self.min_secs as f64 && secs <= self.max_secs as f64
    }
}

/// Startup configuration for the puzzle.
#[derive(Debug, Clone)]
pub struct PuzzleConfig {
    pub difficulty: u32,
    pub bounds: DifficultyBounds,
    pub window: TargetWindow,
    pub pow: PowParams,
    pub worker_count: u32,
    pub max_nonce_speed: Option<u64>,
}

impl PuzzleConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.bounds.validate()?;
        self.window.validate()?;
        self.pow.validate()?;
        if self.difficulty < self.bounds.min || self.difficulty > self.bounds.max {
            return Err(format!(
                "initial difficulty {} outside bounds [{}, {}]",
                self.difficulty, self.bounds.min, self.bounds.max
            ));
        }
        if self.worker_count == 0 {
            return Err("worker_count must be >= 1".to_string());
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// ADJUSTMENT RESULT
// ─────────────────────────────────────────────────────────────────

/// Outcome of one difficulty-controller decision, kept for the audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifficultyAdjustment {
    pub old_difficulty: u32,
    pub new_difficulty: u32,
    /// Signed step actually applied (after clamping).
    pub step: i64,
    /// Short operator-readable explanation.
    pub reason: String,
}

/// Client-facing view of the current puzzle (`/api/puzzle` response body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuzzleSnapshot {
    pub seed: String,
    pub difficulty: u32,
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
    pub worker_count: u32,
    /// Wall-clock epoch ms when this puzzle round started.
    pub puzzle_start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_solve_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_solve_time: Option<f64>,
}

// ─────────────────────────────────────────────────────────────────
// PUZZLE STATE
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PuzzleState {
    seed: String,
    difficulty: u32,
    pow: PowParams,
    worker_count: u32,
    bounds: DifficultyBounds,
    window: TargetWindow,
    pub clock: MiningClock,
    started_at_ms: u64,
    last_solve_secs: Option<f64>,
    solve_history: VecDeque<f64>,
    max_nonce_speed: Option<u64>,
    rotations: u64,
}

impl PuzzleState {
    pub fn new(config: PuzzleConfig) -> Result<Self, String> {
        config.validate()?;
        Ok(PuzzleState {
            seed: Self::random_seed(),
            difficulty: config.difficulty,
            pow: config.pow,
            worker_count: config.worker_count,
            bounds: config.bounds,
            window: config.window,
            clock: MiningClock::new(),
            started_at_ms: crate::unix_now_ms(),
            last_solve_secs: None,
            solve_history: VecDeque::with_capacity(SOLVE_HISTORY_LEN),
            max_nonce_speed: config.max_nonce_speed,
            rotations: 0,
        })
    }

    /// 128 random bits as 32 lowercase hex chars.
    fn random_seed() -> String {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        hex::encode(raw)
    }

    // ── Read accessors ──────────────────────────────────────────────

    pub fn seed(&self) -> &str {
        &self.seed
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn pow(&self) -> &PowParams {
        &self.pow
    }

    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn bounds(&self) -> DifficultyBounds {
        self.bounds
    }

    pub fn window(&self) -> TargetWindow {
        self.window
    }

    pub fn max_nonce_speed(&self) -> Option<u64> {
        self.max_nonce_speed
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    pub fn last_solve_secs(&self) -> Option<f64> {
        self.last_solve_secs
    }

    /// Straight mean over the retained solve history.
    pub fn average_solve_secs(&self) -> Option<f64> {
        if self.solve_history.is_empty() {
            return None;
        }
        Some(self.solve_history.iter().sum::<f64>() / self.solve_history.len() as f64)
    }

    pub fn snapshot(&self) -> PuzzleSnapshot {
        PuzzleSnapshot {
            seed: self.seed.clone(),
            difficulty: self.difficulty,
            memory_cost: self.pow.memory_cost_kib,
            time_cost: self.pow.time_cost,
            parallelism: self.pow.parallelism,
            worker_count: self.worker_count,
            puzzle_start_time: self.started_at_ms,
            last_solve_time: self.last_solve_secs,
            average_solve_time: self.average_solve_secs(),
        }
    }

    // ── Mutation (all serialized through the node's puzzle lock) ────

    /// Begin a new round: fresh seed, mining clock back to zero.
    /// Every in-flight submission against the old seed becomes stale.
    pub fn rotate_seed(&mut self) {
        self.seed = Self::random_seed();
        self.clock.reset();
        self.started_at_ms = crate::unix_now_ms();
        self.rotations += 1;
    }

    fn record_solve(&mut self, secs: f64) {
        self.last_solve_secs = Some(secs);
        if self.solve_history.len() == SOLVE_HISTORY_LEN {
            self.solve_history.pop_front();
        }
        self.solve_history.push_back(secs);
    }

    /// Raw controller step for a measured solve time:
    /// clamp(⌊log₂(mid / T)⌋, −4, +4), zero inside the target window.
    fn step_for(&self, solve_secs: f64) -> i64 {
        if self.window.contains(solve_secs) {
            return 0;
        }
        let t = solve_secs.max(0.001);
        let raw = (self.window.mid() / t).log2().floor() as i64;
        raw.clamp(-MAX_ADJUSTMENT_BITS, MAX_ADJUSTMENT_BITS)
    }

    /// Winner-path adjustment: record the solve, step toward the window
    /// midpoint, clamp to bounds. Does NOT rotate the seed — the caller
    /// rotates as the next step of the critical section.
    pub fn adjust_difficulty(&mut self, solve_secs: f64) -> DifficultyAdjustment {
        self.record_solve(solve_secs);
        let old = self.difficulty;
        let step = self.step_for(solve_secs);
        let new = self.bounds.clamp(old as i64 + step);
        self.difficulty = new;
        let applied = new as i64 - old as i64;

        let reason = if step == 0 {
            format!(
                "solved in {:.1}s, within target [{}s, {}s]; difficulty unchanged at {}",
                solve_secs, self.window.min_secs, self.window.max_secs, new
            )
        } else if step > 0 {
            format!(
                "solved in {:.1}s, faster than target {}s: difficulty {} -> {} (step +{})",
                solve_secs, self.window.min_secs, old, new, applied
            )
        } else {
            format!(
                "solved in {:.1}s, slower than target {}s: difficulty {} -> {} (step {})",
                solve_secs, self.window.max_secs, old, new, applied
            )
        };

        DifficultyAdjustment {
            old_difficulty: old,
            new_difficulty: new,
            step: applied,
            reason,
        }
    }

    /// Timeout-path adjustment: no winner within the window maximum, drop
    /// difficulty by at least 2 bits (more when the controller step says so)
    /// and record why. The caller rotates the seed.
    pub fn timeout_decrease(&mut self) -> DifficultyAdjustment {
        // The watcher fires past the window maximum; clamp so a forced or
        // early call never reads as a too-fast solve.
        let age_secs = self
            .clock
            .elapsed()
            .as_secs_f64()
            .max(self.window.max_secs as f64);
        let old = self.difficulty;
        let step = self.step_for(age_secs);
        let decrease = (step.unsigned_abs() as u32).max(TIMEOUT_MIN_DECREASE);
        let new = self.bounds.clamp(old as i64 - decrease as i64);
        self.difficulty = new;

        DifficultyAdjustment {
            old_difficulty: old,
            new_difficulty: new,
            step: new as i64 - old as i64,
            reason: format!(
                "timeout after {:.0}s mining-time with no winner: difficulty {} -> {}",
                age_secs, old, new
            ),
        }
    }

    // ── Parameter updates (each rotates the seed exactly once) ──────

    /// Update the current difficulty and/or its bounds.
    pub fn set_difficulty(
        &mut self,
        difficulty: Option<u32>,
        min: Option<u32>,
        max: Option<u32>,
    ) -> Result<(), String> {
        let bounds = DifficultyBounds {
            min: min.unwrap_or(self.bounds.min),
            max: max.unwrap_or(self.bounds.max),
        };
        bounds.validate()?;
        let difficulty = difficulty.unwrap_or(self.difficulty);
        if difficulty < bounds.min || difficulty > bounds.max {
            return Err(format!(
                "difficulty {} outside bounds [{}, {}]",
                difficulty, bounds.min, bounds.max
            ));
        }
        self.bounds = bounds;
        self.difficulty = difficulty;
        self.rotate_seed();
        Ok(())
    }

    pub fn set_target_window(&mut self, min_secs: u64, max_secs: u64) -> Result<(), String> {
        let window = TargetWindow { min_secs, max_secs };
        window.validate()?;
        self.window = window;
        self.rotate_seed();
        Ok(())
    }

    pub fn set_pow_params(&mut self, pow: PowParams) -> Result<(), String> {
        pow.validate()?;
        self.pow = pow;
        self.rotate_seed();
        Ok(())
    }

    pub fn set_worker_count(&mut self, worker_count: u32) -> Result<(), String> {
        if worker_count == 0 {
            return Err("worker_count must be >= 1".to_string());
        }
        self.worker_count = worker_count;
        self.rotate_seed();
        Ok(())
    }

    pub fn set_max_nonce_speed(&mut self, max_nonce_speed: Option<u64>) {
        self.max_nonce_speed = max_nonce_speed;
        self.rotate_seed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PuzzleConfig {
        PuzzleConfig {
            difficulty: 10,
            bounds: DifficultyBounds { min: 4, max: 24 },
            window: TargetWindow {
                min_secs: 30,
                max_secs: 120,
            },
            pow: PowParams {
                time_cost: 1,
                memory_cost_kib: 64,
                parallelism: 1,
            },
            worker_count: 4,
            max_nonce_speed: None,
        }
    }

    #[test]
    fn test_new_seed_is_32_hex_chars() {
        let puzzle = PuzzleState::new(test_config()).unwrap();
        assert_eq!(puzzle.seed().len(), crate::SEED_HEX_LEN);
        assert!(puzzle.seed().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_rotate_changes_seed_and_resets_clock() {
        let mut puzzle = PuzzleState::new(test_config()).unwrap();
        puzzle.clock.miner_started();
        std::thread::sleep(std::time::Duration::from_millis(15));

        let old_seed = puzzle.seed().to_string();
        puzzle.rotate_seed();

        assert_ne!(puzzle.seed(), old_seed);
        assert_eq!(puzzle.rotations(), 1);
        assert!(
            puzzle.clock.elapsed() < std::time::Duration::from_millis(10),
            "rotation must reset the mining clock"
        );
        assert!(puzzle.clock.is_active(), "active miners keep mining after rotation");
    }

    #[test]
    fn test_fast_solve_steps_up_by_four() {
        // Tmin=30, Tmax=120, mid=75. Solve in 3s: log2(75/3)=4.64 → step +4.
        let mut puzzle = PuzzleState::new(test_config()).unwrap();
        let adj = puzzle.adjust_difficulty(3.0);
        assert_eq!(adj.old_difficulty, 10);
        assert_eq!(adj.new_difficulty, 14);
        assert_eq!(puzzle.difficulty(), 14);
    }

    #[test]
    fn test_slow_solve_steps_down() {
        let mut puzzle = PuzzleState::new(test_config()).unwrap();
        // 300s: log2(75/300) = -2 exactly → step -2.
        let adj = puzzle.adjust_difficulty(300.0);
        assert_eq!(adj.new_difficulty, 8);
    }

    #[test]
    fn test_window_boundaries_leave_difficulty_unchanged() {
        let mut puzzle = PuzzleState::new(test_config()).unwrap();
        assert_eq!(puzzle.adjust_difficulty(30.0).new_difficulty, 10);
        assert_eq!(puzzle.adjust_difficulty(120.0).new_difficulty, 10);
        assert_eq!(puzzle.adjust_difficulty(75.0).new_difficulty, 10);
    }

    #[test]
    fn test_step_magnitude_never_exceeds_four() {
        let mut puzzle = PuzzleState::new(test_config()).unwrap();
        // Absurdly fast solve would want a huge step; must clamp at +4.
        let adj = puzzle.adjust_difficulty(0.001);
        assert_eq!(adj.new_difficulty - adj.old_difficulty, 4);

        // Absurdly slow solve clamps at -4.
        let mut puzzle = PuzzleState::new(test_config()).unwrap();
        let adj = puzzle.adjust_difficulty(1_000_000.0);
        assert_eq!(adj.old_difficulty - adj.new_difficulty, 4);
    }

    #[test]
    fn test_difficulty_clamped_at_bounds() {
        let mut config = test_config();
        config.difficulty = 23;
        let mut puzzle = PuzzleState::new(config).unwrap();
        let adj = puzzle.adjust_difficulty(1.0); // wants +4, max is 24
        assert_eq!(adj.new_difficulty, 24);

        let mut config = test_config();
        config.difficulty = 5;
        let mut puzzle = PuzzleState::new(config).unwrap();
        let adj = puzzle.adjust_difficulty(10_000.0); // wants -4, min is 4
        assert_eq!(adj.new_difficulty, 4);
    }

    #[test]
    fn test_timeout_decrease_drops_at_least_two() {
        let mut config = test_config();
        config.difficulty = 14;
        let mut puzzle = PuzzleState::new(config).unwrap();
        // Just past the 120s window: controller step is -1, timeout floor is 2.
        let adj = puzzle.timeout_decrease();
        assert_eq!(adj.old_difficulty, 14);
        assert_eq!(adj.new_difficulty, 12);
        assert!(adj.reason.contains("timeout"));
    }

    #[test]
    fn test_timeout_decrease_respects_min_bound() {
        let mut config = test_config();
        config.difficulty = 5;
        let mut puzzle = PuzzleState::new(config).unwrap();
        let adj = puzzle.timeout_decrease();
        assert_eq!(adj.new_difficulty, 4, "must clamp at the minimum");
    }

    #[test]
    fn test_each_param_change_rotates_exactly_once() {
        let mut puzzle = PuzzleState::new(test_config()).unwrap();

        let before = puzzle.seed().to_string();
        puzzle.set_difficulty(Some(12), None, None).unwrap();
        assert_ne!(puzzle.seed(), before);
        assert_eq!(puzzle.rotations(), 1);

        puzzle.set_target_window(20, 90).unwrap();
        assert_eq!(puzzle.rotations(), 2);

        puzzle
            .set_pow_params(PowParams {
                time_cost: 2,
                memory_cost_kib: 128,
                parallelism: 1,
            })
            .unwrap();
        assert_eq!(puzzle.rotations(), 3);

        puzzle.set_worker_count(8).unwrap();
        assert_eq!(puzzle.rotations(), 4);

        puzzle.set_max_nonce_speed(Some(500_000));
        assert_eq!(puzzle.rotations(), 5);
    }

    #[test]
    fn test_invalid_param_change_does_not_rotate() {
        let mut puzzle = PuzzleState::new(test_config()).unwrap();
        assert!(puzzle.set_difficulty(Some(99), None, None).is_err());
        assert!(puzzle.set_target_window(100, 50).is_err());
        assert!(puzzle.set_worker_count(0).is_err());
        assert_eq!(puzzle.rotations(), 0, "failed updates must not rotate");
    }

    #[test]
    fn test_average_is_straight_mean() {
        let mut puzzle = PuzzleState::new(test_config()).unwrap();
        assert_eq!(puzzle.average_solve_secs(), None);

        puzzle.adjust_difficulty(40.0);
        puzzle.adjust_difficulty(60.0);
        puzzle.adjust_difficulty(80.0);

        assert_eq!(puzzle.last_solve_secs(), Some(80.0));
        let avg = puzzle.average_solve_secs().unwrap();
        assert!((avg - 60.0).abs() < 1e-9, "mean of 40/60/80 is 60, got {}", avg);
    }

    #[test]
    fn test_solve_history_is_bounded() {
        let mut puzzle = PuzzleState::new(test_config()).unwrap();
        for _ in 0..(SOLVE_HISTORY_LEN + 25) {
            puzzle.adjust_difficulty(75.0);
        }
        // History capped: the mean stays finite and well-defined.
        assert!((puzzle.average_solve_secs().unwrap() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_fields() {
        let puzzle = PuzzleState::new(test_config()).unwrap();
        let snap = puzzle.snapshot();
        assert_eq!(snap.seed, puzzle.seed());
        assert_eq!(snap.difficulty, 10);
        assert_eq!(snap.memory_cost, 64);
        assert_eq!(snap.time_cost, 1);
        assert_eq!(snap.parallelism, 1);
        assert_eq!(snap.worker_count, 4);
        assert!(snap.puzzle_start_time > 0);
        assert!(snap.last_solve_time.is_none());
        assert!(snap.average_solve_time.is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = test_config();
        config.difficulty = 30; // above max
        assert!(PuzzleState::new(config).is_err());

        let mut config = test_config();
        config.window = TargetWindow { min_secs: 120, max_secs: 30 };
        assert!(PuzzleState::new(config).is_err());

        let mut config = test_config();
        config.worker_count = 0;
        assert!(PuzzleState::new(config).is_err());
    }
}
