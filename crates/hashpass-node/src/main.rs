// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - INVITE-CODE PUZZLE NODE
//
// Main entry point for the hashpass-node binary. Runs the whole service:
// REST API, realtime channels, the atomic verify path, difficulty control,
// timeout watcher, hashrate aggregation, admin plane, and audit logging.
// Single process by design — the puzzle's atomicity lives in this
// process's memory and nowhere else.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#![recursion_limit = "256"]

use hashpass_core::verifier::{parse_trace_ip, VerifyOutcome};
use hashpass_core::SessionError;
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use warp::Filter;

mod admin;
mod applog;
mod audit;
mod blacklist;
mod config;
mod hashrate;
mod hub;
mod limits;
mod messages;
mod metrics;
mod pool;
mod state;
mod timeout;
mod turnstile;
mod webhook;

use audit::AuditRecord;
use config::Config;
use limits::filters::client_ip;
use messages::Outbound;
use pool::{PoolError, VerifyJob};
use state::{safe_lock, AppState, Candidate};

/// Create a JSON API reply with automatic HTTP status code based on body
/// content: `"code": N` in the body selects N, a `"status": "error"` body
/// without a code gets 400, everything else 200.
pub(crate) fn api_json(body: serde_json::Value) -> warp::reply::WithStatus<warp::reply::Json> {
    let code = body
        .get("code")
        .and_then(|c| c.as_u64())
        .map(|c| c as u16)
        .unwrap_or_else(|| {
            if body.get("status").and_then(|s| s.as_str()) == Some("error") {
                400
            } else {
                200
            }
        });
    let status = warp::http::StatusCode::from_u16(code)
        .unwrap_or(warp::http::StatusCode::INTERNAL_SERVER_ERROR);
    warp::reply::with_status(warp::reply::json(&body), status)
}

pub(crate) fn with_state(
    state: AppState,
) -> impl Filter<Extract = (AppState,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

// ─────────────────────────────────────────────────────────────────
// REQUEST BODIES
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VerifyBody {
    #[serde(rename = "visitorId")]
    visitor_id: String,
    nonce: u64,
    #[serde(rename = "submittedSeed")]
    submitted_seed: String,
    #[serde(rename = "traceData")]
    trace_data: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: String,
}

// ─────────────────────────────────────────────────────────────────
// PUBLIC HANDLERS
// ─────────────────────────────────────────────────────────────────

/// Session-token gate shared by /api/puzzle and /api/verify.
/// Unknown/expired → 401; bound to another IP → 403.
fn check_session(
    state: &AppState,
    token: Option<&str>,
    ip: IpAddr,
) -> Result<String, serde_json::Value> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Err(json!({
            "status": "error", "code": 401, "msg": "missing session token"
        }));
    };
    match state.sessions.validate(token, ip) {
        Ok(()) => Ok(token.to_string()),
        Err(SessionError::IpMismatch) => {
            state.metrics.identity_failures_total.inc();
            Err(json!({
                "status": "error", "code": 403, "msg": "identity mismatch"
            }))
        }
        Err(SessionError::Unknown) | Err(SessionError::Expired) => {
            state.metrics.identity_failures_total.inc();
            Err(json!({
                "status": "error", "code": 401, "msg": "session expired or unknown"
            }))
        }
    }
}

async fn handle_puzzle(
    token: Option<String>,
    ip: IpAddr,
    state: AppState,
) -> Result<impl warp::Reply, warp::Rejection> {
    if let Err(body) = check_session(&state, token.as_deref(), ip) {
        return Ok(api_json(body));
    }
    let snapshot = state.puzzle.lock().await.snapshot();
    Ok(api_json(
        serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({"status": "error", "code": 500})),
    ))
}

/// The verify path. Preconditions run without the puzzle lock; the critical
/// section holds it from the seed re-check through the reset broadcast, with
/// hash verification dispatched off-thread while the lock is held. Failure
/// paths release the lock without mutating puzzle state.
async fn handle_verify(
    body: VerifyBody,
    token: Option<String>,
    ip: IpAddr,
    state: AppState,
) -> Result<impl warp::Reply, warp::Rejection> {
    state.metrics.verify_attempts_total.inc();

    // ── Preconditions (no lock) ─────────────────────────────────────
    let session_token = match check_session(&state, token.as_deref(), ip) {
        Ok(token) => token,
        Err(body) => return Ok(api_json(body)),
    };

    if state.blacklist.contains(ip) {
        state.metrics.identity_failures_total.inc();
        return Ok(api_json(json!({
            "status": "error", "code": 403, "msg": "access denied"
        })));
    }

    // The edge trace blob must agree with the connection's real IP,
    // exact string equality.
    match parse_trace_ip(&body.trace_data) {
        Some(trace_ip) if trace_ip == ip.to_string() => {}
        _ => {
            state.metrics.identity_failures_total.inc();
            return Ok(api_json(json!({
                "status": "error", "code": 403, "msg": "identity mismatch"
            })));
        }
    }

    // Fast stale check: reject outdated work without burning a hash.
    {
        let puzzle = state.puzzle.lock().await;
        if puzzle.seed() != body.submitted_seed {
            state.metrics.stale_submissions_total.inc();
            let current = puzzle.seed().to_string();
            return Ok(api_json(json!({
                "status": "error", "code": 409, "msg": "stale puzzle",
                "current_seed": current
            })));
        }
    }

    // ── Atomic critical section ─────────────────────────────────────
    let section_start = std::time::Instant::now();
    let mut puzzle = state.puzzle.lock().await;

    // (1) Double-checked seed equality: someone may have won since the
    // fast check above.
    if puzzle.seed() != body.submitted_seed {
        state.metrics.stale_submissions_total.inc();
        let current = puzzle.seed().to_string();
        return Ok(api_json(json!({
            "status": "error", "code": 409, "msg": "stale puzzle",
            "current_seed": current
        })));
    }

    // (2) Solve time from mining-time accounting, never wall clock.
    let solve_secs = puzzle.clock.elapsed().as_secs_f64();

    // (3) Off-thread hash verification — the lock stays held; this
    // serialization is what guarantees at most one winner per seed.
    let job = VerifyJob {
        nonce: body.nonce,
        seed: body.submitted_seed.clone(),
        fingerprint: body.visitor_id.clone(),
        trace: body.trace_data.clone(),
        expected_hash_hex: body.hash.clone(),
        difficulty: puzzle.difficulty(),
        params: *puzzle.pow(),
    };
    let outcome = match state.pool.verify(job).await {
        Ok(outcome) => outcome,
        Err(PoolError::Unavailable) => {
            state.metrics.pool_unavailable_total.inc();
            return Ok(api_json(json!({
                "status": "error", "code": 503, "msg": "verification unavailable"
            })));
        }
        Err(PoolError::Invalid(msg)) => {
            state.metrics.invalid_proofs_total.inc();
            return Ok(api_json(json!({
                "status": "error", "code": 400, "msg": msg
            })));
        }
    };

    let zero_bits = match outcome {
        VerifyOutcome::Valid { zero_bits } => zero_bits,
        VerifyOutcome::HashMismatch => {
            state.metrics.invalid_proofs_total.inc();
            return Ok(api_json(json!({
                "status": "error", "code": 400, "msg": "invalid proof"
            })));
        }
        VerifyOutcome::BelowDifficulty { zero_bits } => {
            // Honest work that missed the bar: remember it for the
            // consolation path, then reject.
            state.best.offer(Candidate {
                session_token,
                fingerprint: body.visitor_id,
                nonce: body.nonce,
                seed: body.submitted_seed,
                zero_bits,
            });
            state.metrics.invalid_proofs_total.inc();
            return Ok(api_json(json!({
                "status": "error", "code": 400, "msg": "insufficient difficulty"
            })));
        }
    };

    // (4) Mint the invite code.
    let invite_code = {
        let secret = safe_lock(&state.secret);
        match hashpass_core::mint_invite_code(
            &secret,
            &body.visitor_id,
            body.nonce,
            &body.submitted_seed,
        ) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("❌ invite mint failed: {}", e);
                return Ok(api_json(json!({
                    "status": "error", "code": 500, "msg": "mint failed"
                })));
            }
        }
    };

    // (5) Difficulty adjustment, (6) seed rotation.
    let adjustment = puzzle.adjust_difficulty(solve_secs);
    let old_difficulty = adjustment.old_difficulty;
    puzzle.rotate_seed();
    let snapshot = puzzle.snapshot();

    state.metrics.invites_minted_total.inc();
    state.metrics.puzzle_rotations_total.inc();
    state.metrics.solve_time_seconds.observe(solve_secs);
    state
        .metrics
        .current_difficulty
        .set(puzzle.difficulty() as i64);

    // (7) Broadcast the reset before the lock is released, so no
    // subsequent /api/puzzle response can outrun it.
    state
        .hub
        .broadcast(&Outbound::puzzle_reset(&snapshot, Some(solve_secs), false));

    // (8) Fresh watcher for the fresh round.
    state.best.clear();
    state.watcher.restart(state.clone());

    drop(puzzle);
    state
        .metrics
        .verify_duration_seconds
        .observe(section_start.elapsed().as_secs_f64());

    println!(
        "🏆 winner from {} after {:.1}s ({} zero bits): {}",
        ip, solve_secs, zero_bits, adjustment.reason
    );
    state.applog.line(&format!(
        "invite minted for {} ({} zero bits, {:.1}s): {}",
        ip, zero_bits, solve_secs, adjustment.reason
    ));

    // (9) Audit + webhook, both outside the lock, both fire-and-forget.
    state.audit.append(AuditRecord {
        timestamp: AuditRecord::now_timestamp(),
        invite_code: invite_code.clone(),
        fingerprint: body.visitor_id.clone(),
        nonce: body.nonce,
        hash: body.hash.clone(),
        seed: body.submitted_seed.clone(),
        real_ip: ip.to_string(),
        trace: body.trace_data.clone(),
        difficulty: old_difficulty,
        solve_time_secs: solve_secs,
        new_difficulty: adjustment.new_difficulty,
        adjustment_reason: adjustment.reason.clone(),
    });
    state.webhook.notify(json!({
        "event": "invite_minted",
        "invite_code": invite_code,
        "fingerprint": body.visitor_id,
        "ip": ip.to_string(),
        "difficulty": old_difficulty,
        "solve_time_secs": solve_secs,
    }));

    Ok(api_json(json!({ "invite_code": invite_code })))
}

/// Mock edge trace blob for local development, shaped like the production
/// edge's /cdn-cgi/trace output.
fn dev_trace(ip: IpAddr) -> String {
    format!(
        "fl=0dev\nh=localhost\nip={}\nts={}.000\nvisit_scheme=https\n\
         uag=Mozilla/5.0\ncolo=DEV\nhttp=http/2\nloc=XX\ntls=TLSv1.3\n\
         sni=plaintext\nwarp=off\ngateway=off\n",
        ip,
        hashpass_core::unix_now_secs()
    )
}

// ─────────────────────────────────────────────────────────────────
// REJECTION HANDLER
// ─────────────────────────────────────────────────────────────────

async fn handle_rejection(
    err: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    if let Some(limits::filters::RateLimitExceeded { ip }) = err.find() {
        let json = warp::reply::json(&json!({
            "status": "error",
            "code": 429,
            "msg": "Rate limit exceeded. Please slow down your requests.",
            "ip": ip.to_string()
        }));
        Ok(warp::reply::with_status(
            json,
            warp::http::StatusCode::TOO_MANY_REQUESTS,
        ))
    } else if err.find::<admin::AdminUnauthorized>().is_some() {
        let json = warp::reply::json(&json!({
            "status": "error",
            "code": 401,
            "msg": "admin authorization required"
        }));
        Ok(warp::reply::with_status(
            json,
            warp::http::StatusCode::UNAUTHORIZED,
        ))
    } else if err.is_not_found() {
        let json = warp::reply::json(&json!({
            "status": "error",
            "code": 404,
            "msg": "Endpoint not found"
        }));
        Ok(warp::reply::with_status(
            json,
            warp::http::StatusCode::NOT_FOUND,
        ))
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        let json = warp::reply::json(&json!({
            "status": "error",
            "code": 400,
            "msg": format!("Invalid request body: {}", e)
        }));
        Ok(warp::reply::with_status(
            json,
            warp::http::StatusCode::BAD_REQUEST,
        ))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        let json = warp::reply::json(&json!({
            "status": "error",
            "code": 405,
            "msg": "Method not allowed"
        }));
        Ok(warp::reply::with_status(
            json,
            warp::http::StatusCode::METHOD_NOT_ALLOWED,
        ))
    } else {
        eprintln!("⚠️  unhandled rejection: {:?}", err);
        let json = warp::reply::json(&json!({
            "status": "error",
            "code": 500,
            "msg": "Internal server error"
        }));
        Ok(warp::reply::with_status(
            json,
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────
// BACKGROUND TASKS
// ─────────────────────────────────────────────────────────────────

fn spawn_background_tasks(state: &AppState) {
    // Session sweeper: delete disconnected tokens past their grace.
    let sweeper_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(hashpass_core::session::SWEEP_PERIOD);
        loop {
            interval.tick().await;
            let swept = sweeper_state.sessions.sweep();
            if swept > 0 {
                println!("🧹 swept {} expired sessions", swept);
            }
            sweeper_state
                .metrics
                .sessions_active
                .set(sweeper_state.sessions.count() as i64);
        }
    });

    // Hashrate aggregator: prune stale reports, broadcast the total.
    let aggregator_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(hashrate::TICK_PERIOD);
        loop {
            interval.tick().await;
            let network = aggregator_state.hashrates.prune_and_total();
            aggregator_state
                .metrics
                .network_hashrate
                .set(network.total);
            aggregator_state
                .metrics
                .miners_active
                .set(aggregator_state.hub.mining_count() as i64);
            aggregator_state.hub.broadcast(&Outbound::NetworkHashrate {
                total_hashrate: network.total,
                active_miners: network.miners,
                timestamp: hashpass_core::unix_now_secs(),
            });
        }
    });

    // Admin status pusher.
    let status_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(admin::STATUS_PERIOD_SECS));
        loop {
            interval.tick().await;
            let status = status_state.admin_status().await;
            status_state
                .hub
                .broadcast_admin(&Outbound::StatusUpdate { status });
        }
    });
}

// ─────────────────────────────────────────────────────────────────
// MAIN
// ─────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    println!("🧩 HashPass — invite-code puzzle node");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    let port = config.port;
    let bind_all = config.bind_all;

    let state = match AppState::init(config) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("❌ Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    {
        let puzzle = state.puzzle.lock().await;
        println!(
            "🎲 puzzle ready: seed {}…, difficulty {} [{}-{}], argon2 t={} m={}KiB p={}, {} verify workers",
            &puzzle.seed()[..8],
            puzzle.difficulty(),
            puzzle.bounds().min,
            puzzle.bounds().max,
            puzzle.pow().time_cost,
            puzzle.pow().memory_cost_kib,
            puzzle.pow().parallelism,
            state.pool.workers(),
        );
        println!(
            "🔑 invite key id {}, consolation codes {}",
            safe_lock(&state.secret).key_id(),
            if state.config.timeout_consolation { "on" } else { "off" },
        );
        if state.config.turnstile_test_mode {
            println!("🧪 challenge provider in TEST MODE — any non-empty token passes");
        }
    }

    spawn_background_tasks(&state);
    state.watcher.restart(state.clone());

    // ── Routes ──────────────────────────────────────────────────────

    let ws_route = warp::path!("api" / "ws")
        .and(warp::query::<WsQuery>())
        .and(warp::header::optional::<String>("user-agent"))
        .and(client_ip())
        .and(with_state(state.clone()))
        .and(warp::ws())
        .map(
            |query: WsQuery, ua: Option<String>, ip: IpAddr, state: AppState, ws: warp::ws::Ws| {
                ws.on_upgrade(move |socket| hub::client_channel(socket, query.token, ua, ip, state))
            },
        );

    let puzzle_route = warp::path!("api" / "puzzle")
        .and(warp::post())
        .and(warp::header::optional::<String>("x-session-token"))
        .and(client_ip())
        .and(with_state(state.clone()))
        .and_then(handle_puzzle);

    let verify_route = warp::path!("api" / "verify")
        .and(warp::post())
        .and(warp::body::content_length_limit(64 * 1024))
        .and(warp::body::json::<VerifyBody>())
        .and(warp::header::optional::<String>("x-session-token"))
        .and(client_ip())
        .and(with_state(state.clone()))
        .and_then(handle_verify);

    let turnstile_route = warp::path!("api" / "turnstile" / "config")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: AppState| {
            api_json(json!({
                "site_key": state.turnstile.site_key(),
                "test_mode": state.turnstile.test_mode(),
            }))
        });

    let health_route = warp::path!("api" / "health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(|state: AppState| async move {
            let seed_prefix = state.puzzle.lock().await.seed()[..8].to_string();
            Ok::<_, warp::Rejection>(api_json(json!({
                "status": "ok",
                "current_seed": seed_prefix,
            })))
        });

    let dev_trace_route = warp::path!("api" / "dev" / "trace")
        .and(warp::get())
        .and(client_ip())
        .map(|ip: IpAddr| {
            warp::reply::with_header(dev_trace(ip), "Content-Type", "text/plain; charset=utf-8")
        });

    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: AppState| match state.metrics.render() {
            Ok(output) => warp::reply::with_header(
                output,
                "Content-Type",
                "text/plain; version=0.0.4; charset=utf-8",
            ),
            Err(e) => warp::reply::with_header(
                format!("# metrics error: {}", e),
                "Content-Type",
                "text/plain; charset=utf-8",
            ),
        });

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec![
            "Content-Type",
            "Authorization",
            "X-Session-Token",
            "Accept",
        ])
        .allow_methods(vec!["GET", "POST"]);

    let routes = limits::filters::rate_limit(
        state.rate_limiter.clone(),
        state.metrics.rate_limit_rejections_total.clone(),
    )
    .and(
        ws_route
            .or(puzzle_route)
            .or(verify_route)
            .or(turnstile_route)
            .or(health_route)
            .or(dev_trace_route)
            .or(metrics_route)
            .or(admin::routes(state.clone())),
    )
    .recover(handle_rejection)
    .with(cors);

    // Bind to localhost unless the operator opted into external exposure.
    let bind_addr: [u8; 4] = if bind_all { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
    println!(
        "🌍 API server running at http://{}:{}",
        if bind_all { "0.0.0.0" } else { "127.0.0.1" },
        port
    );
    {
        use std::io::Write;
        let _ = std::io::stdout().flush();
    }

    warp::serve(routes).run((bind_addr, port)).await;
}
