// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - NETWORK HASHRATE AGGREGATOR
//
// Per-channel self-reported hash rates with staleness. Eventually consistent
// by design: the periodic tick sums a slightly stale snapshot, which is
// fine — the number is informational, never a security input.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Reports older than this are treated as absent.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

/// Aggregation/broadcast cadence.
pub const TICK_PERIOD: Duration = Duration::from_secs(3);

/// Recover from poisoned mutex instead of panicking
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
struct RateEntry {
    rate: f64,
    reported_at: Instant,
    ip: IpAddr,
    overspeed: bool,
}

/// Aggregated view for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRate {
    pub total: f64,
    pub miners: usize,
}

/// Admin-facing overspeed report.
#[derive(Debug, Clone, Serialize)]
pub struct OverspeedReport {
    pub ip: String,
    pub rate: f64,
}

#[derive(Clone)]
pub struct HashrateBoard {
    inner: Arc<Mutex<HashMap<u64, RateEntry>>>,
}

impl HashrateBoard {
    pub fn new() -> Self {
        HashrateBoard {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a channel's self-reported rate with a fresh timestamp.
    /// Reports above the operator ceiling are flagged (admin-visible) but
    /// never invalidate the channel's work. Returns the overspeed flag.
    pub fn report(&self, channel_id: u64, ip: IpAddr, rate: f64, ceiling: Option<u64>) -> bool {
        // Negative or non-finite reports are garbage; clamp to zero.
        let rate = if rate.is_finite() { rate.max(0.0) } else { 0.0 };
        let overspeed = ceiling.map(|max| rate > max as f64).unwrap_or(false);

        safe_lock(&self.inner).insert(
            channel_id,
            RateEntry {
                rate,
                reported_at: Instant::now(),
                ip,
                overspeed,
            },
        );
        overspeed
    }

    pub fn remove(&self, channel_id: u64) {
        safe_lock(&self.inner).remove(&channel_id);
    }

    /// Drop stale entries, then sum the rest. One call per tick.
    pub fn prune_and_total(&self) -> NetworkRate {
        let mut entries = safe_lock(&self.inner);
        entries.retain(|_, e| e.reported_at.elapsed() < STALE_AFTER);

        let total = entries.values().map(|e| e.rate).sum();
        NetworkRate {
            total,
            miners: entries.len(),
        }
    }

    /// Channels currently flagged above the nonce-speed ceiling.
    pub fn overspeed(&self) -> Vec<OverspeedReport> {
        safe_lock(&self.inner)
            .values()
            .filter(|e| e.overspeed)
            .map(|e| OverspeedReport {
                ip: e.ip.to_string(),
                rate: e.rate,
            })
            .collect()
    }
}

impl Default for HashrateBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_total_sums_fresh_entries() {
        let board = HashrateBoard::new();
        board.report(1, ip(1), 1000.0, None);
        board.report(2, ip(2), 2500.0, None);

        let rate = board.prune_and_total();
        assert_eq!(rate.total, 3500.0);
        assert_eq!(rate.miners, 2);
    }

    #[test]
    fn test_rereport_replaces_entry() {
        let board = HashrateBoard::new();
        board.report(1, ip(1), 1000.0, None);
        board.report(1, ip(1), 1500.0, None);

        let rate = board.prune_and_total();
        assert_eq!(rate.total, 1500.0);
        assert_eq!(rate.miners, 1);
    }

    #[test]
    fn test_remove_clears_channel() {
        let board = HashrateBoard::new();
        board.report(1, ip(1), 1000.0, None);
        board.remove(1);
        assert_eq!(board.prune_and_total().miners, 0);
    }

    #[test]
    fn test_garbage_rates_clamped() {
        let board = HashrateBoard::new();
        board.report(1, ip(1), -50.0, None);
        board.report(2, ip(2), f64::NAN, None);
        board.report(3, ip(3), f64::INFINITY, None);

        let rate = board.prune_and_total();
        assert_eq!(rate.total, 0.0);
        assert_eq!(rate.miners, 3);
    }

    #[test]
    fn test_overspeed_flagged_but_counted() {
        let board = HashrateBoard::new();
        assert!(!board.report(1, ip(1), 900.0, Some(1000)));
        assert!(board.report(2, ip(2), 1200.0, Some(1000)));
        assert!(!board.report(3, ip(3), 99_999.0, None), "no ceiling, no flag");

        let overspeed = board.overspeed();
        assert_eq!(overspeed.len(), 1);
        assert_eq!(overspeed[0].ip, "10.0.0.2");

        // Overspeed reports still count toward the network total.
        let rate = board.prune_and_total();
        assert_eq!(rate.miners, 3);
    }
}
