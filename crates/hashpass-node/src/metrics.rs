// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - METRICS MODULE
//
// Prometheus-compatible metrics for production monitoring.
// Exposed as text via the /metrics endpoint.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub struct NodeMetrics {
    registry: Registry,

    // Verify path
    pub verify_attempts_total: IntCounter,
    pub invites_minted_total: IntCounter,
    pub stale_submissions_total: IntCounter,
    pub invalid_proofs_total: IntCounter,
    pub identity_failures_total: IntCounter,
    pub pool_unavailable_total: IntCounter,
    pub solve_time_seconds: Histogram,
    pub verify_duration_seconds: Histogram,

    // Puzzle
    pub current_difficulty: IntGauge,
    pub puzzle_rotations_total: IntCounter,
    pub timeouts_total: IntCounter,

    // Realtime channels
    pub ws_connections_total: IntCounter,
    pub ws_rejections_total: IntCounter,
    pub connections_active: IntGauge,
    pub miners_active: IntGauge,
    pub network_hashrate: Gauge,

    // Sessions & abuse
    pub sessions_active: IntGauge,
    pub rate_limit_rejections_total: IntCounter,
    pub banned_ips: IntGauge,

    // External collaborators
    pub webhook_failures_total: IntCounter,
    pub challenge_checks_total: IntCounter,
}

impl NodeMetrics {
    pub fn new() -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        macro_rules! counter {
            ($name:expr, $help:expr) => {{
                let c = IntCounter::with_opts(Opts::new($name, $help))?;
                registry.register(Box::new(c.clone()))?;
                c
            }};
        }
        macro_rules! int_gauge {
            ($name:expr, $help:expr) => {{
                let g = IntGauge::with_opts(Opts::new($name, $help))?;
                registry.register(Box::new(g.clone()))?;
                g
            }};
        }

        let verify_attempts_total = counter!(
            "hashpass_verify_attempts_total",
            "Verification requests received"
        );
        let invites_minted_total =
            counter!("hashpass_invites_minted_total", "Invite codes minted");
        let stale_submissions_total = counter!(
            "hashpass_stale_submissions_total",
            "Submissions rejected for carrying a stale seed"
        );
        let invalid_proofs_total = counter!(
            "hashpass_invalid_proofs_total",
            "Submissions with a wrong or insufficient hash"
        );
        let identity_failures_total = counter!(
            "hashpass_identity_failures_total",
            "Submissions rejected on session/IP/trace binding"
        );
        let pool_unavailable_total = counter!(
            "hashpass_pool_unavailable_total",
            "Verifications refused because the worker pool was down"
        );

        let solve_time_seconds = Histogram::with_opts(
            HistogramOpts::new("hashpass_solve_time_seconds", "Winning solve times")
                .buckets(vec![5.0, 15.0, 30.0, 60.0, 90.0, 120.0, 180.0, 300.0, 600.0]),
        )?;
        registry.register(Box::new(solve_time_seconds.clone()))?;

        let verify_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "hashpass_verify_duration_seconds",
                "Wall time of the verification critical section",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )?;
        registry.register(Box::new(verify_duration_seconds.clone()))?;

        let current_difficulty =
            int_gauge!("hashpass_current_difficulty", "Leading zero bits required");
        let puzzle_rotations_total =
            counter!("hashpass_puzzle_rotations_total", "Seed rotations");
        let timeouts_total = counter!(
            "hashpass_timeouts_total",
            "Rounds ended by the timeout watcher"
        );

        let ws_connections_total = counter!(
            "hashpass_ws_connections_total",
            "Realtime channels accepted"
        );
        let ws_rejections_total = counter!(
            "hashpass_ws_rejections_total",
            "Realtime channels rejected at handshake"
        );
        let connections_active =
            int_gauge!("hashpass_connections_active", "Open realtime channels");
        let miners_active = int_gauge!("hashpass_miners_active", "Channels currently mining");

        let network_hashrate = Gauge::with_opts(Opts::new(
            "hashpass_network_hashrate",
            "Aggregated self-reported hash rate (H/s)",
        ))?;
        registry.register(Box::new(network_hashrate.clone()))?;

        let sessions_active = int_gauge!("hashpass_sessions_active", "Live session tokens");
        let rate_limit_rejections_total = counter!(
            "hashpass_rate_limit_rejections_total",
            "HTTP requests rejected by the rate limiter"
        );
        let banned_ips = int_gauge!("hashpass_banned_ips", "Blacklisted IPs");

        let webhook_failures_total = counter!(
            "hashpass_webhook_failures_total",
            "Win webhook deliveries that exhausted retries"
        );
        let challenge_checks_total = counter!(
            "hashpass_challenge_checks_total",
            "Human-challenge verifications performed"
        );

        Ok(Arc::new(NodeMetrics {
            registry,
            verify_attempts_total,
            invites_minted_total,
            stale_submissions_total,
            invalid_proofs_total,
            identity_failures_total,
            pool_unavailable_total,
            solve_time_seconds,
            verify_duration_seconds,
            current_difficulty,
            puzzle_rotations_total,
            timeouts_total,
            ws_connections_total,
            ws_rejections_total,
            connections_active,
            miners_active,
            network_hashrate,
            sessions_active,
            rate_limit_rejections_total,
            banned_ips,
            webhook_failures_total,
            challenge_checks_total,
        }))
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| format!("metrics encode failed: {}", e))?;
        String::from_utf8(buffer).map_err(|e| format!("metrics not UTF-8: {}", e))
    }
}
