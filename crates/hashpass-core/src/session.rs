// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - SESSION REGISTRY
//
// Opaque session tokens bound to one client IP. A token is issued on the
// first realtime handshake after human-challenge verification, handed back
// in-band, and stays valid across reconnects from the SAME IP within a
// 5-minute disconnect grace. Lookup is constant-time with respect to the
// token value.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

/// Disconnected sessions are deleted after this grace window.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(300);

/// Background sweeper cadence.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Token entropy: 256 bits, rendered as 64 hex chars.
pub const TOKEN_BYTES: usize = 32;

/// Recover from poisoned mutex instead of panicking
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
struct Session {
    ip: IpAddr,
    created_at_secs: u64,
    connected: bool,
    disconnected_at: Option<Instant>,
    last_seen: Instant,
}

/// Why a presented token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// No such token.
    Unknown,
    /// Token exists but is bound to a different IP.
    IpMismatch,
    /// Token exists but its disconnect grace has lapsed.
    Expired,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Unknown => write!(f, "unknown session token"),
            SessionError::IpMismatch => write!(f, "session bound to a different IP"),
            SessionError::Expired => write!(f, "session expired"),
        }
    }
}

/// Admin-facing view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// First 8 chars only — the full token never leaves the registry.
    pub token_prefix: String,
    pub ip: String,
    pub created_at: u64,
    pub connected: bool,
    pub idle_secs: u64,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, Session>>>,
    grace: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_grace(DISCONNECT_GRACE)
    }

    /// Custom grace window (tests shrink it to milliseconds).
    pub fn with_grace(grace: Duration) -> Self {
        SessionRegistry {
            inner: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    /// Issue a fresh token bound to `ip`, marked connected.
    pub fn issue(&self, ip: IpAddr) -> String {
        let mut raw = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);

        let now = Instant::now();
        safe_lock(&self.inner).insert(
            token.clone(),
            Session {
                ip,
                created_at_secs: crate::unix_now_secs(),
                connected: true,
                disconnected_at: None,
                last_seen: now,
            },
        );
        token
    }

    /// Validate a presented token against the presenter's IP.
    ///
    /// The token scan is constant-time in the token value: every stored key
    /// is compared with `ct_eq`, and the loop never exits early.
    pub fn validate(&self, token: &str, ip: IpAddr) -> Result<(), SessionError> {
        let mut sessions = safe_lock(&self.inner);

        let mut matched: Option<String> = None;
        for key in sessions.keys() {
            let hit = key.len() == token.len()
                && key.as_bytes().ct_eq(token.as_bytes()).unwrap_u8() == 1;
            if hit {
                matched = Some(key.clone());
            }
        }

        let key = matched.ok_or(SessionError::Unknown)?;
        // Scope the entry lookup so the map borrow ends before removal.
        let (bound_ip, expired) = {
            let session = sessions.get(&key).ok_or(SessionError::Unknown)?;
            let expired = !session.connected
                && session
                    .disconnected_at
                    .map(|at| at.elapsed() > self.grace)
                    .unwrap_or(false);
            (session.ip, expired)
        };

        if bound_ip != ip {
            return Err(SessionError::IpMismatch);
        }
        if expired {
            sessions.remove(&key);
            return Err(SessionError::Expired);
        }

        if let Some(session) = sessions.get_mut(&key) {
            session.last_seen = Instant::now();
        }
        Ok(())
    }

    /// Mark a token's session connected again (reconnect within grace).
    pub fn mark_connected(&self, token: &str) -> bool {
        let mut sessions = safe_lock(&self.inner);
        match sessions.get_mut(token) {
            Some(session) => {
                session.connected = true;
                session.disconnected_at = None;
                session.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Mark a token's session disconnected, starting the grace clock.
    pub fn mark_disconnected(&self, token: &str) -> bool {
        let mut sessions = safe_lock(&self.inner);
        match sessions.get_mut(token) {
            Some(session) => {
                session.connected = false;
                session.disconnected_at = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        safe_lock(&self.inner).remove(token).is_some()
    }

    /// Delete every session bound to `ip`. Returns how many were removed.
    pub fn revoke_by_ip(&self, ip: IpAddr) -> usize {
        let mut sessions = safe_lock(&self.inner);
        let before = sessions.len();
        sessions.retain(|_, s| s.ip != ip);
        before - sessions.len()
    }

    pub fn clear_all(&self) -> usize {
        let mut sessions = safe_lock(&self.inner);
        let n = sessions.len();
        sessions.clear();
        n
    }

    /// Delete disconnected sessions whose grace has lapsed.
    /// Called by the background sweeper every SWEEP_PERIOD.
    pub fn sweep(&self) -> usize {
        let mut sessions = safe_lock(&self.inner);
        let before = sessions.len();
        let grace = self.grace;
        sessions.retain(|_, s| {
            s.connected
                || s.disconnected_at
                    .map(|at| at.elapsed() <= grace)
                    .unwrap_or(true)
        });
        before - sessions.len()
    }

    pub fn count(&self) -> usize {
        safe_lock(&self.inner).len()
    }

    pub fn connected_count(&self) -> usize {
        safe_lock(&self.inner).values().filter(|s| s.connected).count()
    }

    /// Admin listing with truncated tokens.
    pub fn list(&self) -> Vec<SessionInfo> {
        safe_lock(&self.inner)
            .iter()
            .map(|(token, s)| SessionInfo {
                token_prefix: token.chars().take(8).collect(),
                ip: s.ip.to_string(),
                created_at: s.created_at_secs,
                connected: s.connected,
                idle_secs: s.last_seen.elapsed().as_secs(),
            })
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
