// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - APPLICATION STATE
//
// One explicit value constructed at startup and passed by handle to every
// route and background task — no module-level singletons. The puzzle sits
// behind a tokio Mutex because the verify path deliberately holds the lock
// across the off-thread hash await (that serialization is the single-winner
// guarantee). Everything else uses its own fine-grained protection.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::applog::AppLog;
use crate::audit::AuditLog;
use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::hashrate::HashrateBoard;
use crate::hub::Hub;
use crate::limits::{ConnLimiter, RateLimiter};
use crate::messages::Outbound;
use crate::metrics::NodeMetrics;
use crate::pool::VerifyPool;
use crate::timeout::TimeoutWatcher;
use crate::turnstile::TurnstileVerifier;
use crate::webhook::WinNotifier;
use hashpass_core::{PuzzleState, ServerSecret, SessionRegistry};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Recover from poisoned mutex instead of panicking
pub fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The best verified-but-losing submission of the current round, kept for
/// the optional timeout consolation code. Replaced only by a strictly
/// greater zero-bit count, so ties keep the earliest submitter.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub session_token: String,
    pub fingerprint: String,
    pub nonce: u64,
    pub seed: String,
    pub zero_bits: u32,
}

#[derive(Clone, Default)]
pub struct BestCandidate {
    inner: Arc<Mutex<Option<Candidate>>>,
}

impl BestCandidate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, candidate: Candidate) {
        let mut slot = safe_lock(&self.inner);
        let better = match slot.as_ref() {
            Some(current) => candidate.zero_bits > current.zero_bits,
            None => true,
        };
        if better {
            *slot = Some(candidate);
        }
    }

    pub fn take(&self) -> Option<Candidate> {
        safe_lock(&self.inner).take()
    }

    pub fn clear(&self) {
        *safe_lock(&self.inner) = None;
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub puzzle: Arc<tokio::sync::Mutex<PuzzleState>>,
    pub secret: Arc<Mutex<ServerSecret>>,
    pub sessions: SessionRegistry,
    pub hub: Hub,
    pub hashrates: HashrateBoard,
    pub blacklist: Blacklist,
    pub pool: VerifyPool,
    pub metrics: Arc<NodeMetrics>,
    pub audit: AuditLog,
    pub webhook: WinNotifier,
    pub turnstile: TurnstileVerifier,
    pub rate_limiter: RateLimiter,
    pub conn_limiter: ConnLimiter,
    pub watcher: TimeoutWatcher,
    pub applog: AppLog,
    pub best: BestCandidate,
    pub started_at: Instant,
}

impl AppState {
    pub fn init(config: Config) -> Result<Self, String> {
        let puzzle = PuzzleState::new(config.puzzle.clone())?;

        let secret = match config.server_secret_hex.as_deref() {
            Some(hex_str) => ServerSecret::from_hex(hex_str)?,
            None => ServerSecret::generate(),
        };

        let metrics = NodeMetrics::new().map_err(|e| format!("metrics init failed: {}", e))?;
        metrics.current_difficulty.set(puzzle.difficulty() as i64);

        // cores − 1 bounds peak verification memory to (cores−1) × m KiB.
        let workers = num_cpus::get().saturating_sub(1).max(1);
        let pool = VerifyPool::start(workers)?;
        let webhook_failures = metrics.webhook_failures_total.clone();

        let state = AppState {
            puzzle: Arc::new(tokio::sync::Mutex::new(puzzle)),
            secret: Arc::new(Mutex::new(secret)),
            sessions: SessionRegistry::new(),
            hub: Hub::new(),
            hashrates: HashrateBoard::new(),
            blacklist: Blacklist::load(&config.data_dir),
            pool,
            metrics,
            audit: AuditLog::start(config.data_dir.clone()),
            webhook: WinNotifier::new(
                config.webhook_url.clone(),
                config.webhook_token.clone(),
                webhook_failures,
            ),
            turnstile: TurnstileVerifier::new(
                config.turnstile_site_key.clone(),
                config.turnstile_secret.clone(),
                config.turnstile_test_mode,
            ),
            rate_limiter: RateLimiter::new(config.rate_limit_rps),
            conn_limiter: ConnLimiter::new(config.max_conn_per_ip),
            watcher: TimeoutWatcher::new(),
            applog: AppLog::new(&config.data_dir),
            best: BestCandidate::new(),
            started_at: Instant::now(),
            config: Arc::new(config),
        };
        state.metrics.banned_ips.set(state.blacklist.len() as i64);
        Ok(state)
    }

    /// Rotate the seed outside the winner path (admin reset, parameter
    /// change, timeout handled separately). Broadcasts the reset, clears
    /// the consolation slot and restarts the timeout watcher.
    pub async fn rotate_and_announce(&self, why: &str) {
        let snapshot = {
            let mut puzzle = self.puzzle.lock().await;
            puzzle.rotate_seed();
            let snapshot = puzzle.snapshot();
            self.metrics.puzzle_rotations_total.inc();
            self.metrics
                .current_difficulty
                .set(puzzle.difficulty() as i64);
            // Broadcast before the lock is released so no /api/puzzle
            // response can carry the new seed ahead of the reset message.
            self.hub
                .broadcast(&Outbound::puzzle_reset(&snapshot, None, false));
            snapshot
        };
        self.best.clear();
        self.watcher.restart(self.clone());
        self.applog
            .line(&format!("seed rotated ({}): {}…", why, &snapshot.seed[..8]));
    }

    /// Ban an IP: close its channels, revoke its sessions, persist the ban.
    pub async fn ban_ip(&self, ip: IpAddr) -> bool {
        let removed = self.hub.remove_by_ip(ip);
        {
            let mut puzzle = self.puzzle.lock().await;
            for channel in &removed {
                self.hashrates.remove(channel.id);
                if channel.mining.swap(false, Ordering::SeqCst) {
                    puzzle.clock.miner_stopped();
                }
            }
        }
        let revoked = self.sessions.revoke_by_ip(ip);
        let inserted = self.blacklist.ban(ip);
        self.metrics.banned_ips.set(self.blacklist.len() as i64);
        self.metrics
            .connections_active
            .set(self.hub.online() as i64);
        self.metrics.miners_active.set(self.hub.mining_count() as i64);
        self.applog.line(&format!(
            "banned {} ({} channels closed, {} sessions revoked)",
            ip,
            removed.len(),
            revoked
        ));
        inserted
    }

    /// Close every channel and clear every session (admin kick-all).
    pub async fn kick_all(&self) -> (usize, usize) {
        let removed = self.hub.clear();
        {
            let mut puzzle = self.puzzle.lock().await;
            for channel in &removed {
                self.hashrates.remove(channel.id);
                if channel.mining.swap(false, Ordering::SeqCst) {
                    puzzle.clock.miner_stopped();
                }
            }
        }
        let cleared = self.sessions.clear_all();
        self.metrics.connections_active.set(0);
        self.metrics.miners_active.set(0);
        self.metrics.sessions_active.set(0);
        self.applog.line(&format!(
            "kick-all: {} channels closed, {} sessions cleared",
            removed.len(),
            cleared
        ));
        (removed.len(), cleared)
    }

    /// Full operator snapshot (admin state endpoint and STATUS_UPDATE).
    pub async fn admin_status(&self) -> serde_json::Value {
        let (snapshot, bounds, window, mining_secs, active_miners, rotations, max_nonce_speed) = {
            let puzzle = self.puzzle.lock().await;
            (
                puzzle.snapshot(),
                puzzle.bounds(),
                puzzle.window(),
                puzzle.clock.elapsed().as_secs_f64(),
                puzzle.clock.active_miners(),
                puzzle.rotations(),
                puzzle.max_nonce_speed(),
            )
        };
        let network = self.hashrates.prune_and_total();

        serde_json::json!({
            "puzzle": {
                "seed": snapshot.seed,
                "difficulty": snapshot.difficulty,
                "difficulty_min": bounds.min,
                "difficulty_max": bounds.max,
                "target_window_secs": [window.min_secs, window.max_secs],
                "memory_cost": snapshot.memory_cost,
                "time_cost": snapshot.time_cost,
                "parallelism": snapshot.parallelism,
                "worker_count": snapshot.worker_count,
                "max_nonce_speed": max_nonce_speed,
                "puzzle_start_time": snapshot.puzzle_start_time,
                "mining_time_secs": mining_secs,
                "last_solve_time": snapshot.last_solve_time,
                "average_solve_time": snapshot.average_solve_time,
                "rotations": rotations,
            },
            "connections": {
                "online": self.hub.online(),
                "mining": self.hub.mining_count(),
                "clock_active_miners": active_miners,
            },
            "sessions": {
                "total": self.sessions.count(),
                "connected": self.sessions.connected_count(),
            },
            "network_hashrate": {
                "total": network.total,
                "reporting_miners": network.miners,
                "overspeed": self.hashrates.overspeed(),
            },
            "blacklist": self.blacklist.list(),
            "verify_workers": self.pool.workers(),
            "consolation_enabled": self.config.timeout_consolation,
            "uptime_secs": self.started_at.elapsed().as_secs(),
        })
    }
}
