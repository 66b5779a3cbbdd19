// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - ADMIN PLANE
//
// Bearer-authenticated operator surface: introspection (state, miners,
// sessions, audit-log queries), parameter updates (each rotates the seed
// and broadcasts the reset), and enforcement actions (force reset,
// kick-all, ban/unban, clear sessions, server-secret rotation). The admin
// realtime channel gets a STATUS_UPDATE snapshot every 2 s from the
// periodic task in main.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::limits::filters::client_ip;
use crate::messages::Outbound;
use crate::state::{safe_lock, AppState};
use crate::{api_json, with_state};
use hashpass_core::verifier::PowParams;
use hashpass_core::{PuzzleState, ServerSecret};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use subtle::ConstantTimeEq;
use warp::Filter;

/// STATUS_UPDATE cadence for admin channels.
pub const STATUS_PERIOD_SECS: u64 = 2;

/// Rejection for a missing or wrong bearer token; mapped to 401 by the
/// global rejection handler.
#[derive(Debug)]
pub struct AdminUnauthorized;
impl warp::reject::Reject for AdminUnauthorized {}

/// Constant-time bearer check against the configured admin token.
fn authed(
    state: AppState,
) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_state(state))
        .and_then(|header: Option<String>, state: AppState| async move {
            let authorized = header
                .as_deref()
                .and_then(|h| h.strip_prefix("Bearer "))
                .map(|token| {
                    let expected = state.config.admin_token.as_bytes();
                    token.len() == expected.len()
                        && token.as_bytes().ct_eq(expected).unwrap_u8() == 1
                })
                .unwrap_or(false);
            if authorized {
                Ok(())
            } else {
                Err(warp::reject::custom(AdminUnauthorized))
            }
        })
        .untuple_one()
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    page: usize,
    #[serde(default = "default_per_page")]
    per_page: usize,
    search: Option<String>,
}

fn default_per_page() -> usize {
    20
}

#[derive(Debug, Deserialize)]
struct DifficultyUpdate {
    difficulty: Option<u32>,
    min: Option<u32>,
    max: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WindowUpdate {
    min_secs: u64,
    max_secs: u64,
}

#[derive(Debug, Deserialize)]
struct Argon2Update {
    time_cost: u32,
    memory_cost_kib: u32,
    parallelism: u32,
}

#[derive(Debug, Deserialize)]
struct WorkersUpdate {
    worker_count: u32,
}

#[derive(Debug, Deserialize)]
struct NonceSpeedUpdate {
    max_nonce_speed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IpBody {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct SecretBody {
    /// 64 hex chars to set, absent to regenerate randomly.
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: String,
}

/// Apply one puzzle parameter update under the lock. The setters rotate the
/// seed themselves; on success the reset is broadcast before the lock drops,
/// then the watcher restarts for the new round.
async fn apply_update(
    state: &AppState,
    what: &str,
    update: impl FnOnce(&mut PuzzleState) -> Result<(), String>,
) -> serde_json::Value {
    let result = {
        let mut puzzle = state.puzzle.lock().await;
        match update(&mut puzzle) {
            Ok(()) => {
                let snapshot = puzzle.snapshot();
                state.metrics.puzzle_rotations_total.inc();
                state
                    .metrics
                    .current_difficulty
                    .set(puzzle.difficulty() as i64);
                state
                    .hub
                    .broadcast(&Outbound::puzzle_reset(&snapshot, None, false));
                Ok(snapshot)
            }
            Err(e) => Err(e),
        }
    };

    match result {
        Ok(snapshot) => {
            state.best.clear();
            state.watcher.restart(state.clone());
            state
                .applog
                .line(&format!("admin updated {} (seed rotated)", what));
            json!({
                "status": "ok",
                "updated": what,
                "seed": snapshot.seed,
                "difficulty": snapshot.difficulty,
            })
        }
        Err(e) => json!({"status": "error", "code": 400, "msg": e}),
    }
}

pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let state_route = warp::path!("api" / "admin" / "state")
        .and(warp::get())
        .and(authed(state.clone()))
        .and(with_state(state.clone()))
        .and_then(|state: AppState| async move {
            Ok::<_, warp::Rejection>(api_json(state.admin_status().await))
        });

    let miners_route = warp::path!("api" / "admin" / "miners")
        .and(warp::get())
        .and(authed(state.clone()))
        .and(with_state(state.clone()))
        .and_then(|state: AppState| async move {
            Ok::<_, warp::Rejection>(api_json(json!({
                "miners": state.hub.miners(),
                "network": {
                    "total": state.hashrates.prune_and_total().total,
                    "overspeed": state.hashrates.overspeed(),
                },
            })))
        });

    let sessions_route = warp::path!("api" / "admin" / "sessions")
        .and(warp::get())
        .and(authed(state.clone()))
        .and(with_state(state.clone()))
        .and_then(|state: AppState| async move {
            Ok::<_, warp::Rejection>(api_json(json!({"sessions": state.sessions.list()})))
        });

    let logs_route = warp::path!("api" / "admin" / "logs")
        .and(warp::get())
        .and(authed(state.clone()))
        .and(warp::query::<LogsQuery>())
        .and(with_state(state.clone()))
        .and_then(|query: LogsQuery, state: AppState| async move {
            let dir = state.audit.dir().to_path_buf();
            let result = tokio::task::spawn_blocking(move || {
                crate::audit::query(&dir, query.page, query.per_page, query.search.as_deref())
            })
            .await;
            let body = match result {
                Ok(Ok(page)) => json!({
                    "status": "ok",
                    "total": page.total,
                    "page": page.page,
                    "per_page": page.per_page,
                    "records": page.records,
                }),
                Ok(Err(e)) => json!({"status": "error", "code": 500, "msg": e}),
                Err(e) => json!({"status": "error", "code": 500, "msg": e.to_string()}),
            };
            Ok::<_, warp::Rejection>(api_json(body))
        });

    let difficulty_route = warp::path!("api" / "admin" / "difficulty")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(warp::body::json::<DifficultyUpdate>())
        .and(with_state(state.clone()))
        .and_then(|body: DifficultyUpdate, state: AppState| async move {
            let reply = apply_update(&state, "difficulty", |p| {
                p.set_difficulty(body.difficulty, body.min, body.max)
            })
            .await;
            Ok::<_, warp::Rejection>(api_json(reply))
        });

    let window_route = warp::path!("api" / "admin" / "window")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(warp::body::json::<WindowUpdate>())
        .and(with_state(state.clone()))
        .and_then(|body: WindowUpdate, state: AppState| async move {
            let reply = apply_update(&state, "target window", |p| {
                p.set_target_window(body.min_secs, body.max_secs)
            })
            .await;
            Ok::<_, warp::Rejection>(api_json(reply))
        });

    let argon2_route = warp::path!("api" / "admin" / "argon2")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(warp::body::json::<Argon2Update>())
        .and(with_state(state.clone()))
        .and_then(|body: Argon2Update, state: AppState| async move {
            let reply = apply_update(&state, "argon2 params", |p| {
                p.set_pow_params(PowParams {
                    time_cost: body.time_cost,
                    memory_cost_kib: body.memory_cost_kib,
                    parallelism: body.parallelism,
                })
            })
            .await;
            Ok::<_, warp::Rejection>(api_json(reply))
        });

    let workers_route = warp::path!("api" / "admin" / "workers")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(warp::body::json::<WorkersUpdate>())
        .and(with_state(state.clone()))
        .and_then(|body: WorkersUpdate, state: AppState| async move {
            let reply = apply_update(&state, "worker count", |p| {
                p.set_worker_count(body.worker_count)
            })
            .await;
            Ok::<_, warp::Rejection>(api_json(reply))
        });

    let nonce_speed_route = warp::path!("api" / "admin" / "max-nonce-speed")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(warp::body::json::<NonceSpeedUpdate>())
        .and(with_state(state.clone()))
        .and_then(|body: NonceSpeedUpdate, state: AppState| async move {
            let reply = apply_update(&state, "max nonce speed", |p| {
                p.set_max_nonce_speed(body.max_nonce_speed);
                Ok(())
            })
            .await;
            Ok::<_, warp::Rejection>(api_json(reply))
        });

    let reset_route = warp::path!("api" / "admin" / "reset")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(with_state(state.clone()))
        .and_then(|state: AppState| async move {
            state.rotate_and_announce("admin force reset").await;
            let seed = state.puzzle.lock().await.seed().to_string();
            Ok::<_, warp::Rejection>(api_json(json!({"status": "ok", "seed": seed})))
        });

    let kick_all_route = warp::path!("api" / "admin" / "kick-all")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(with_state(state.clone()))
        .and_then(|state: AppState| async move {
            let (channels, sessions) = state.kick_all().await;
            Ok::<_, warp::Rejection>(api_json(json!({
                "status": "ok",
                "channels_closed": channels,
                "sessions_cleared": sessions,
            })))
        });

    let ban_route = warp::path!("api" / "admin" / "ban")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(warp::body::json::<IpBody>())
        .and(with_state(state.clone()))
        .and_then(|body: IpBody, state: AppState| async move {
            let reply = match body.ip.parse::<IpAddr>() {
                Ok(ip) => {
                    let inserted = state.ban_ip(ip).await;
                    json!({"status": "ok", "banned": ip.to_string(), "already_banned": !inserted})
                }
                Err(_) => json!({"status": "error", "code": 400, "msg": "invalid IP"}),
            };
            Ok::<_, warp::Rejection>(api_json(reply))
        });

    let unban_route = warp::path!("api" / "admin" / "unban")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(warp::body::json::<IpBody>())
        .and(with_state(state.clone()))
        .and_then(|body: IpBody, state: AppState| async move {
            let reply = match body.ip.parse::<IpAddr>() {
                Ok(ip) => {
                    let removed = state.blacklist.unban(ip);
                    state.metrics.banned_ips.set(state.blacklist.len() as i64);
                    json!({"status": "ok", "unbanned": removed})
                }
                Err(_) => json!({"status": "error", "code": 400, "msg": "invalid IP"}),
            };
            Ok::<_, warp::Rejection>(api_json(reply))
        });

    let clear_sessions_route = warp::path!("api" / "admin" / "clear-sessions")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(with_state(state.clone()))
        .and_then(|state: AppState| async move {
            let cleared = state.sessions.clear_all();
            state.metrics.sessions_active.set(0);
            Ok::<_, warp::Rejection>(api_json(json!({"status": "ok", "cleared": cleared})))
        });

    let secret_route = warp::path!("api" / "admin" / "secret")
        .and(warp::post())
        .and(authed(state.clone()))
        .and(warp::body::json::<SecretBody>())
        .and(with_state(state.clone()))
        .and_then(|body: SecretBody, state: AppState| async move {
            let reply = match body.secret {
                Some(hex_str) => match ServerSecret::from_hex(&hex_str) {
                    Ok(new_secret) => {
                        *safe_lock(&state.secret) = new_secret;
                        state.applog.line("server secret replaced by operator");
                        json!({"status": "ok", "secret": "set"})
                    }
                    Err(e) => json!({"status": "error", "code": 400, "msg": e}),
                },
                None => {
                    safe_lock(&state.secret).regenerate();
                    state.applog.line("server secret regenerated");
                    json!({"status": "ok", "secret": "regenerated"})
                }
            };
            Ok::<_, warp::Rejection>(api_json(reply))
        });

    // Admin realtime channel; token travels in the query string because
    // browsers cannot set headers on websocket upgrades.
    let ws_route = warp::path!("api" / "admin" / "ws")
        .and(warp::query::<TokenQuery>())
        .and(client_ip())
        .and(with_state(state))
        .and(warp::ws())
        .map(
            |query: TokenQuery, ip: IpAddr, state: AppState, ws: warp::ws::Ws| {
                ws.on_upgrade(move |socket| {
                    crate::hub::admin_channel(socket, query.token, ip, state)
                })
            },
        );

    state_route
        .or(miners_route)
        .or(sessions_route)
        .or(logs_route)
        .or(difficulty_route)
        .or(window_route)
        .or(argon2_route)
        .or(workers_route)
        .or(nonce_speed_route)
        .or(reset_route)
        .or(kick_all_route)
        .or(ban_route)
        .or(unban_route)
        .or(clear_sessions_route)
        .or(secret_route)
        .or(ws_route)
}
