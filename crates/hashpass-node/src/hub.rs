// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - CONNECTION HUB
//
// The set of live realtime channels and everything that happens on them:
// handshake (one-shot challenge token or reconnecting session token),
// per-channel message routing, and non-blocking broadcast. Every channel
// owns a bounded outbound queue; a queue that fills up marks a consumer too
// slow to keep, and that channel is closed instead of back-pressuring the
// hub. Policy failures close with 1008.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::messages::{Inbound, Outbound};
use crate::state::AppState;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

/// Outbound queue depth per channel. Sized for bursts of broadcasts, small
/// enough that a stalled consumer is detected within seconds.
const OUTBOUND_QUEUE: usize = 64;

/// Policy-violation close code (RFC 6455).
const CLOSE_POLICY: u16 = 1008;

/// Recover from poisoned mutex instead of panicking
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Immutable channel identity plus its mining flag. The outbound sender
/// lives in the hub's map, NOT here — removing the map entry is what closes
/// the channel.
pub struct Channel {
    pub id: u64,
    pub ip: IpAddr,
    /// Session token for client channels, empty for admin channels.
    pub session_token: String,
    pub connected_at_secs: u64,
    pub mining: AtomicBool,
    pub admin: bool,
}

struct ChannelEntry {
    info: Arc<Channel>,
    tx: mpsc::Sender<String>,
}

/// Admin-facing miner listing row.
#[derive(Debug, Clone, Serialize)]
pub struct MinerInfo {
    pub channel_id: u64,
    pub ip: String,
    pub connected_at: u64,
    pub mining: bool,
}

#[derive(Clone)]
pub struct Hub {
    channels: Arc<Mutex<HashMap<u64, ChannelEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    pub fn new() -> Self {
        Hub {
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn register(
        &self,
        ip: IpAddr,
        session_token: String,
        admin: bool,
    ) -> (Arc<Channel>, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let info = Arc::new(Channel {
            id,
            ip,
            session_token,
            connected_at_secs: hashpass_core::unix_now_secs(),
            mining: AtomicBool::new(false),
            admin,
        });
        safe_lock(&self.channels).insert(
            id,
            ChannelEntry {
                info: Arc::clone(&info),
                tx,
            },
        );
        (info, rx)
    }

    /// Drop a channel's entry. Its writer task sees the queue close and
    /// shuts the socket down.
    pub fn remove(&self, id: u64) -> Option<Arc<Channel>> {
        safe_lock(&self.channels).remove(&id).map(|e| e.info)
    }

    /// Remove every channel from `ip`; returns them for cleanup.
    pub fn remove_by_ip(&self, ip: IpAddr) -> Vec<Arc<Channel>> {
        let mut channels = safe_lock(&self.channels);
        let ids: Vec<u64> = channels
            .values()
            .filter(|e| e.info.ip == ip)
            .map(|e| e.info.id)
            .collect();
        ids.iter()
            .filter_map(|id| channels.remove(id).map(|e| e.info))
            .collect()
    }

    /// Remove every channel (admin kick-all); returns them for cleanup.
    pub fn clear(&self) -> Vec<Arc<Channel>> {
        safe_lock(&self.channels)
            .drain()
            .map(|(_, e)| e.info)
            .collect()
    }

    /// Queue a message for one channel. False when the channel is gone or
    /// its queue is full (in which case it gets closed).
    pub fn send_to(&self, id: u64, message: &Outbound) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("⚠️  outbound serialize failed: {}", e);
                return false;
            }
        };
        let sent = {
            let channels = safe_lock(&self.channels);
            match channels.get(&id) {
                Some(entry) => entry.tx.try_send(text).is_ok(),
                None => return false,
            }
        };
        if !sent {
            self.remove(id);
        }
        sent
    }

    /// Non-blocking fan-out to all client channels. Channels whose queues
    /// are full or closed are dropped from the set. Returns delivered count.
    ///
    /// Safe to call while the puzzle lock is held: enqueueing never blocks;
    /// actual socket writes happen on per-channel writer tasks.
    pub fn broadcast(&self, message: &Outbound) -> usize {
        self.broadcast_filtered(message, |info| !info.admin)
    }

    /// Fan-out to admin channels only (STATUS_UPDATE).
    pub fn broadcast_admin(&self, message: &Outbound) -> usize {
        self.broadcast_filtered(message, |info| info.admin)
    }

    fn broadcast_filtered(&self, message: &Outbound, keep: impl Fn(&Channel) -> bool) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("⚠️  broadcast serialize failed: {}", e);
                return 0;
            }
        };

        // Snapshot-and-iterate: the map mutates concurrently with traversal.
        let targets: Vec<(u64, mpsc::Sender<String>)> = {
            let channels = safe_lock(&self.channels);
            channels
                .values()
                .filter(|e| keep(&e.info))
                .map(|e| (e.info.id, e.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut slow: Vec<u64> = Vec::new();
        for (id, tx) in targets {
            if tx.try_send(text.clone()).is_ok() {
                delivered += 1;
            } else {
                slow.push(id);
            }
        }
        for id in slow {
            println!("🐌 closing slow realtime channel {}", id);
            self.remove(id);
        }
        delivered
    }

    /// Open client channels (admin channels excluded).
    pub fn online(&self) -> usize {
        safe_lock(&self.channels)
            .values()
            .filter(|e| !e.info.admin)
            .count()
    }

    pub fn mining_count(&self) -> usize {
        safe_lock(&self.channels)
            .values()
            .filter(|e| e.info.mining.load(Ordering::Relaxed))
            .count()
    }

    pub fn find_by_token(&self, session_token: &str) -> Option<Arc<Channel>> {
        safe_lock(&self.channels)
            .values()
            .find(|e| !e.info.admin && e.info.session_token == session_token)
            .map(|e| Arc::clone(&e.info))
    }

    pub fn miners(&self) -> Vec<MinerInfo> {
        safe_lock(&self.channels)
            .values()
            .filter(|e| !e.info.admin)
            .map(|e| MinerInfo {
                channel_id: e.info.id,
                ip: e.info.ip.to_string(),
                connected_at: e.info.connected_at_secs,
                mining: e.info.mining.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// HANDSHAKE & PER-CHANNEL TASKS
// ─────────────────────────────────────────────────────────────────

/// Browser-class User-Agent gate. Headless/script clients are not welcome
/// on the realtime surface.
pub fn ua_allowed(ua: Option<&str>) -> bool {
    match ua {
        Some(ua) => ua.starts_with("Mozilla/") || ua.contains("Opera"),
        None => false,
    }
}

async fn close_with_policy(socket: WebSocket, reason: &str) {
    let (mut tx, _rx) = socket.split();
    let _ = tx
        .send(Message::close_with(CLOSE_POLICY, reason.to_string()))
        .await;
    let _ = tx.close().await;
}

enum TokenResolution {
    /// Valid session token presented: reconnect.
    Resumed(String),
    /// One-shot challenge token verified: fresh session issued.
    Issued(String),
}

async fn resolve_token(
    state: &AppState,
    token: &str,
    ip: IpAddr,
) -> Result<TokenResolution, String> {
    use hashpass_core::SessionError;

    match state.sessions.validate(token, ip) {
        Ok(()) => {
            state.sessions.mark_connected(token);
            return Ok(TokenResolution::Resumed(token.to_string()));
        }
        Err(SessionError::IpMismatch) => {
            return Err("session bound to a different IP".to_string());
        }
        Err(SessionError::Unknown) | Err(SessionError::Expired) => {
            // Not a live session — fall through to the challenge provider.
        }
    }

    state.metrics.challenge_checks_total.inc();
    match state.turnstile.verify(token, ip).await {
        Ok(true) => Ok(TokenResolution::Issued(state.sessions.issue(ip))),
        Ok(false) => Err("challenge verification failed".to_string()),
        // Provider unreachable: fail closed.
        Err(e) => {
            eprintln!("⚠️  challenge provider error: {}", e);
            Err("challenge verification unavailable".to_string())
        }
    }
}

/// Full lifecycle of one client channel, from policy gate to cleanup.
pub async fn client_channel(
    socket: WebSocket,
    token: String,
    ua: Option<String>,
    ip: IpAddr,
    state: AppState,
) {
    if state.blacklist.contains(ip) {
        state.metrics.ws_rejections_total.inc();
        close_with_policy(socket, "banned").await;
        return;
    }
    if !ua_allowed(ua.as_deref()) {
        state.metrics.ws_rejections_total.inc();
        close_with_policy(socket, "client not allowed").await;
        return;
    }
    if !state.conn_limiter.try_acquire(ip) {
        state.metrics.ws_rejections_total.inc();
        close_with_policy(socket, "connection limit exceeded").await;
        return;
    }

    let resolution = match resolve_token(&state, &token, ip).await {
        Ok(resolution) => resolution,
        Err(reason) => {
            state.metrics.ws_rejections_total.inc();
            state.conn_limiter.release(ip);
            close_with_policy(socket, &reason).await;
            return;
        }
    };
    let (session_token, issued) = match resolution {
        TokenResolution::Resumed(token) => (token, false),
        TokenResolution::Issued(token) => (token, true),
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (channel, mut rx) = state.hub.register(ip, session_token.clone(), false);

    // Writer task: drains the bounded queue into the socket. Ends when the
    // hub drops this channel's entry or the socket errors.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::text(text)).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::close()).await;
        let _ = ws_tx.close().await;
    });

    state.metrics.ws_connections_total.inc();
    state.metrics.connections_active.set(state.hub.online() as i64);
    println!(
        "🔌 channel {} open from {} ({})",
        channel.id,
        ip,
        if issued { "new session" } else { "reconnect" }
    );

    // First in-band messages: the session token (new sessions only), then
    // the current puzzle so the client can start mining immediately.
    if issued {
        state.hub.send_to(
            channel.id,
            &Outbound::SessionToken {
                token: session_token.clone(),
            },
        );
    }
    let snapshot = state.puzzle.lock().await.snapshot();
    state
        .hub
        .send_to(channel.id, &Outbound::puzzle_reset(&snapshot, None, false));

    while let Some(incoming) = ws_rx.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(_) => break,
        };
        if message.is_close() {
            break;
        }
        let Ok(text) = message.to_str() else {
            continue; // binary frames are not part of the protocol
        };
        match serde_json::from_str::<Inbound>(text) {
            Ok(inbound) => handle_inbound(&state, &channel, inbound).await,
            Err(e) => {
                println!("❓ channel {}: unknown message dropped ({})", channel.id, e);
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    state.hub.remove(channel.id);
    state.hashrates.remove(channel.id);
    if channel.mining.swap(false, Ordering::SeqCst) {
        // Disconnect of a mining channel counts as mining_stop.
        state.puzzle.lock().await.clock.miner_stopped();
    }
    state.sessions.mark_disconnected(&session_token);
    state.conn_limiter.release(ip);
    state.metrics.connections_active.set(state.hub.online() as i64);
    state.metrics.miners_active.set(state.hub.mining_count() as i64);
    println!("🔌 channel {} closed ({})", channel.id, ip);
    let _ = writer.await;
}

async fn handle_inbound(state: &AppState, channel: &Arc<Channel>, inbound: Inbound) {
    match inbound {
        Inbound::Ping => {
            state.hub.send_to(
                channel.id,
                &Outbound::Pong {
                    online: state.hub.online(),
                },
            );
        }
        Inbound::MiningStart => {
            // Flag flip and clock transition happen under the puzzle lock
            // so concurrent verify/rotation paths never double-count.
            let mut puzzle = state.puzzle.lock().await;
            if !channel.mining.swap(true, Ordering::SeqCst) {
                puzzle.clock.miner_started();
            }
            drop(puzzle);
            state.metrics.miners_active.set(state.hub.mining_count() as i64);
        }
        Inbound::MiningStop => {
            let mut puzzle = state.puzzle.lock().await;
            if channel.mining.swap(false, Ordering::SeqCst) {
                puzzle.clock.miner_stopped();
            }
            drop(puzzle);
            state.metrics.miners_active.set(state.hub.mining_count() as i64);
        }
        Inbound::Hashrate { rate } => {
            let ceiling = state.puzzle.lock().await.max_nonce_speed();
            let overspeed = state.hashrates.report(channel.id, channel.ip, rate, ceiling);
            if overspeed {
                println!(
                    "🚨 channel {} ({}) reporting over the nonce-speed ceiling: {:.0} H/s",
                    channel.id, channel.ip, rate
                );
            }
        }
    }
}

/// Lifecycle of one admin channel: bearer-equivalent token in the query
/// string, STATUS_UPDATE pushed by the periodic task in main.
pub async fn admin_channel(socket: WebSocket, token: String, ip: IpAddr, state: AppState) {
    use subtle::ConstantTimeEq;

    let expected = state.config.admin_token.as_bytes();
    let authorized = token.len() == expected.len()
        && token.as_bytes().ct_eq(expected).unwrap_u8() == 1;
    if !authorized {
        state.metrics.ws_rejections_total.inc();
        close_with_policy(socket, "unauthorized").await;
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (channel, mut rx) = state.hub.register(ip, String::new(), true);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::text(text)).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::close()).await;
        let _ = ws_tx.close().await;
    });

    println!("🛠️  admin channel {} open from {}", channel.id, ip);
    let status = state.admin_status().await;
    state
        .hub
        .send_to(channel.id, &Outbound::StatusUpdate { status });

    // Admin channels are receive-mostly; inbound traffic is drained and
    // ignored until the peer closes.
    while let Some(incoming) = ws_rx.next().await {
        match incoming {
            Ok(message) if message.is_close() => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    state.hub.remove(channel.id);
    println!("🛠️  admin channel {} closed", channel.id);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_register_and_counts() {
        let hub = Hub::new();
        let (a, _rx_a) = hub.register(ip(1), "tok-a".to_string(), false);
        let (_b, _rx_b) = hub.register(ip(2), "tok-b".to_string(), false);
        let (_admin, _rx_admin) = hub.register(ip(3), String::new(), true);

        assert_eq!(hub.online(), 2, "admin channels do not count as online");
        assert_eq!(hub.mining_count(), 0);

        a.mining.store(true, Ordering::SeqCst);
        assert_eq!(hub.mining_count(), 1);
    }

    #[test]
    fn test_find_by_token() {
        let hub = Hub::new();
        let (a, _rx) = hub.register(ip(1), "tok-a".to_string(), false);
        assert_eq!(hub.find_by_token("tok-a").map(|c| c.id), Some(a.id));
        assert!(hub.find_by_token("missing").is_none());
    }

    #[tokio::test]
    async fn test_send_to_delivers_serialized_json() {
        let hub = Hub::new();
        let (channel, mut rx) = hub.register(ip(1), "tok".to_string(), false);

        assert!(hub.send_to(channel.id, &Outbound::Pong { online: 7 }));
        let text = rx.recv().await.unwrap();
        assert!(text.contains(r#""type":"PONG""#));
        assert!(text.contains(r#""online":7"#));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_clients_not_admins() {
        let hub = Hub::new();
        let (_a, mut rx_a) = hub.register(ip(1), "a".to_string(), false);
        let (_b, mut rx_b) = hub.register(ip(2), "b".to_string(), false);
        let (_admin, mut rx_admin) = hub.register(ip(3), String::new(), true);

        let delivered = hub.broadcast(&Outbound::Pong { online: 2 });
        assert_eq!(delivered, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
        assert!(
            rx_admin.try_recv().is_err(),
            "client broadcast must skip admin channels"
        );
    }

    #[tokio::test]
    async fn test_slow_channel_is_closed_not_awaited() {
        let hub = Hub::new();
        let (slow, _rx_kept_full) = hub.register(ip(1), "slow".to_string(), false);
        let (_ok, mut rx_ok) = hub.register(ip(2), "ok".to_string(), false);

        // Fill the slow channel's queue to capacity.
        for _ in 0..OUTBOUND_QUEUE {
            assert!(hub.send_to(slow.id, &Outbound::Pong { online: 0 }));
        }

        let delivered = hub.broadcast(&Outbound::Pong { online: 1 });
        assert_eq!(delivered, 1, "only the healthy channel receives");
        assert!(
            hub.find_by_token("slow").is_none(),
            "slow channel must be dropped from the set"
        );
        assert!(rx_ok.recv().await.is_some());
    }

    #[test]
    fn test_remove_by_ip() {
        let hub = Hub::new();
        let (_a1, _r1) = hub.register(ip(1), "a1".to_string(), false);
        let (_a2, _r2) = hub.register(ip(1), "a2".to_string(), false);
        let (_b, _r3) = hub.register(ip(2), "b".to_string(), false);

        let removed = hub.remove_by_ip(ip(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(hub.online(), 1);
    }

    #[test]
    fn test_ua_allowed() {
        assert!(ua_allowed(Some(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36"
        )));
        assert!(ua_allowed(Some("Mozilla/5.0 (Windows NT 10.0; rv:121.0) Firefox/121.0")));
        assert!(!ua_allowed(Some("curl/8.4.0")));
        assert!(!ua_allowed(Some("python-requests/2.31")));
        assert!(!ua_allowed(None));
    }
}
