// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - MINING-TIME CLOCK
//
// The authoritative clock for difficulty and timeout decisions. It advances
// only while at least one registered miner is actively mining: the 0→1
// transition resumes it, the 1→0 transition pauses it. A puzzle's effective
// age is this accumulated duration, never wall-clock age.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct MiningClock {
    /// Time accumulated across completed active runs.
    accumulated: Duration,
    /// Start of the current active run, None while paused.
    active_since: Option<Instant>,
    /// Number of channels currently flagged as mining.
    active_miners: u32,
}

impl MiningClock {
    pub fn new() -> Self {
        MiningClock {
            accumulated: Duration::ZERO,
            active_since: None,
            active_miners: 0,
        }
    }

    /// Register one more active miner. Returns true on the 0→1 transition
    /// that resumed the clock.
    pub fn miner_started(&mut self) -> bool {
        self.active_miners += 1;
        if self.active_miners == 1 {
            self.active_since = Some(Instant::now());
            true
        } else {
            false
        }
    }

    /// Deregister one active miner. Returns true on the 1→0 transition that
    /// paused the clock. Saturates at zero — a stray stop is a no-op.
    pub fn miner_stopped(&mut self) -> bool {
        if self.active_miners == 0 {
            return false;
        }
        self.active_miners -= 1;
        if self.active_miners == 0 {
            if let Some(since) = self.active_since.take() {
                self.accumulated += since.elapsed();
            }
            true
        } else {
            false
        }
    }

    /// Accumulated mining time, including the current run if active.
    pub fn elapsed(&self) -> Duration {
        match self.active_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    pub fn active_miners(&self) -> u32 {
        self.active_miners
    }

    /// Start accounting for a new puzzle: accumulation drops to zero.
    /// Miners that are still active keep the clock running from now.
    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        if self.active_since.is_some() {
            self.active_since = Some(Instant::now());
        }
    }
}

impl Default for MiningClock {
    fn default() -> Self {
        Self::new()
    }
}
