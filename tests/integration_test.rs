// ========================================
// INTEGRATION TESTS FOR HASHPASS
// ========================================
//
// Test Scenarios:
// 1. Concurrent Winners (single-winner guarantee)
// 2. Full Client Round-Trip (grind → verify → mint)
// 3. Identity Binding (trace blob vs. real IP)
// 4. Difficulty Controller End-to-End
// 5. Timeout Decrease
// 6. Session Reconnect Within/After Grace
// 7. Mining-Time Accounting Across Stop/Start
//
// Usage:
//   cargo test --test integration_test -- --nocapture
//
// ========================================

use hashpass_core::puzzle::{DifficultyBounds, PuzzleConfig, PuzzleState, TargetWindow};
use hashpass_core::verifier::{
    compute_pow_hash, mine, parse_trace_ip, verify_submission, PowParams, VerifyOutcome,
};
use hashpass_core::{mint_invite_code, ServerSecret, SessionError, SessionRegistry};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Tiny Argon2 costs so grinding in tests stays in the milliseconds.
fn fast_params() -> PowParams {
    PowParams {
        time_cost: 1,
        memory_cost_kib: 64,
        parallelism: 1,
    }
}

fn test_puzzle(difficulty: u32) -> PuzzleState {
    PuzzleState::new(PuzzleConfig {
        difficulty,
        bounds: DifficultyBounds { min: 4, max: 24 },
        window: TargetWindow {
            min_secs: 30,
            max_secs: 120,
        },
        pow: fast_params(),
        worker_count: 4,
        max_nonce_speed: None,
    })
    .expect("valid test puzzle")
}

/// Grind a nonce whose hash clears `difficulty` bits — the client's loop.
fn grind(seed: &str, fingerprint: &str, trace: &str, difficulty: u32) -> (u64, String) {
    let cancel = std::sync::atomic::AtomicBool::new(false);
    let (nonce, hash) = mine(seed, fingerprint, trace, difficulty, &fast_params(), &cancel)
        .expect("argon2 params are valid")
        .expect("not cancelled");
    (nonce, hex::encode(hash))
}

// ========================================
// TEST 1: CONCURRENT WINNERS
// ========================================
#[tokio::test]
async fn test_concurrent_winners_single_success() {
    println!("\n🧪 TEST 1: Concurrent winners — at most one success per seed");

    // Low difficulty so both clients find proofs quickly.
    let difficulty = 2;
    let puzzle = Arc::new(Mutex::new(test_puzzle(difficulty)));
    let seed = puzzle.lock().await.seed().to_string();

    // Both clients grind valid proofs for the SAME seed.
    let proof_a = grind(&seed, "client-a", "ip=10.0.0.1", difficulty);
    let proof_b = grind(&seed, "client-b", "ip=10.0.0.2", difficulty);

    // The verify path's critical section, as the node runs it: re-check the
    // seed under the lock, verify, rotate on success.
    async fn submit(
        puzzle: &Arc<Mutex<PuzzleState>>,
        submitted_seed: &str,
        fingerprint: &str,
        trace: &str,
        nonce: u64,
        hash_hex: &str,
    ) -> Result<(), &'static str> {
        let mut puzzle = puzzle.lock().await;
        if puzzle.seed() != submitted_seed {
            return Err("stale");
        }
        let outcome = verify_submission(
            nonce,
            submitted_seed,
            fingerprint,
            trace,
            hash_hex,
            puzzle.difficulty(),
            puzzle.pow(),
        )
        .expect("well-formed submission");
        if !outcome.is_valid() {
            return Err("invalid");
        }
        puzzle.adjust_difficulty(3.0);
        puzzle.rotate_seed();
        Ok(())
    }

    let first = submit(&puzzle, &seed, "client-a", "ip=10.0.0.1", proof_a.0, &proof_a.1).await;
    let second = submit(&puzzle, &seed, "client-b", "ip=10.0.0.2", proof_b.0, &proof_b.1).await;

    assert!(first.is_ok(), "first submission wins");
    assert_eq!(second, Err("stale"), "second valid proof must see a stale seed");

    let post_seed = puzzle.lock().await.seed().to_string();
    assert_ne!(post_seed, seed, "the winning path must rotate the seed");
    println!("✅ one winner, one stale rejection, seed rotated");
}

// ========================================
// TEST 2: FULL CLIENT ROUND-TRIP
// ========================================
#[tokio::test]
async fn test_client_round_trip_grind_verify_mint() {
    println!("\n🧪 TEST 2: Client round-trip — grind, verify, mint");

    let difficulty = 3;
    let mut puzzle = test_puzzle(difficulty);
    let seed = puzzle.seed().to_string();
    let fingerprint = "fp-e2e";
    let trace = "fl=1\nip=203.0.113.9\nts=1700000000\n";

    let (nonce, hash_hex) = grind(&seed, fingerprint, trace, difficulty);

    // A client computing with the advertised params is always accepted
    // while the seed is live.
    let outcome = verify_submission(
        nonce,
        &seed,
        fingerprint,
        trace,
        &hash_hex,
        puzzle.difficulty(),
        puzzle.pow(),
    )
    .unwrap();
    assert!(matches!(outcome, VerifyOutcome::Valid { zero_bits } if zero_bits >= difficulty));

    // Mint is deterministic; regenerating the secret breaks reproducibility.
    let mut secret = ServerSecret::generate();
    let code = mint_invite_code(&secret, fingerprint, nonce, &seed).unwrap();
    let code_again = mint_invite_code(&secret, fingerprint, nonce, &seed).unwrap();
    assert_eq!(code, code_again);
    assert!(code.starts_with("HASHPASS-"));

    secret.regenerate();
    let code_after = mint_invite_code(&secret, fingerprint, nonce, &seed).unwrap();
    assert_ne!(code, code_after, "secret rotation must invalidate prior codes");

    puzzle.rotate_seed();
    assert_ne!(puzzle.seed(), seed);
    println!("✅ round-trip accepted, code {} minted", code);
}

// ========================================
// TEST 3: IDENTITY BINDING
// ========================================
#[tokio::test]
async fn test_identity_binding_trace_mismatch() {
    println!("\n🧪 TEST 3: Identity binding — trace IP must equal real IP");

    let real_ip: IpAddr = "10.1.2.3".parse().unwrap();
    let honest = "colo=XYZ\nip=10.1.2.3\nts=1\n";
    let forged = "colo=XYZ\nip=10.9.9.9\nts=1\n";
    let missing = "colo=XYZ\nts=1\n";

    let real = real_ip.to_string();
    assert_eq!(parse_trace_ip(honest), Some(real.as_str()));
    assert_ne!(parse_trace_ip(forged), Some(real.as_str()));
    assert_eq!(parse_trace_ip(missing), None);

    // The forged blob also produces a different hash — the trace is part of
    // the salt, so identity is bound cryptographically, not just by the
    // precondition check.
    let h_honest = compute_pow_hash(7, "seed", "fp", honest, &fast_params()).unwrap();
    let h_forged = compute_pow_hash(7, "seed", "fp", forged, &fast_params()).unwrap();
    assert_ne!(h_honest, h_forged);
    println!("✅ forged trace rejected at both layers");
}

// ========================================
// TEST 4: DIFFICULTY CONTROLLER END-TO-END
// ========================================
#[tokio::test]
async fn test_difficulty_controller_sequence() {
    println!("\n🧪 TEST 4: Difficulty controller across a round sequence");

    let mut puzzle = test_puzzle(10);

    // 3s blitz solve: mid=75, log2(75/3)=4.64 → +4.
    let adj = puzzle.adjust_difficulty(3.0);
    assert_eq!(adj.new_difficulty, 14);

    // In-window solve: unchanged.
    let adj = puzzle.adjust_difficulty(60.0);
    assert_eq!(adj.new_difficulty, 14);

    // Window edges: unchanged.
    assert_eq!(puzzle.adjust_difficulty(30.0).new_difficulty, 14);
    assert_eq!(puzzle.adjust_difficulty(120.0).new_difficulty, 14);

    // Very slow solve: eases off, clamped to -4 per step.
    let adj = puzzle.adjust_difficulty(4000.0);
    assert_eq!(adj.new_difficulty, 10);

    // Average is a straight mean of the recorded history.
    let avg = puzzle.average_solve_secs().unwrap();
    let expected = (3.0 + 60.0 + 30.0 + 120.0 + 4000.0) / 5.0;
    assert!((avg - expected).abs() < 1e-9, "avg {} != {}", avg, expected);
    println!("✅ controller follows the target-window curve");
}

// ========================================
// TEST 5: TIMEOUT DECREASE
// ========================================
#[tokio::test]
async fn test_timeout_decrease_and_reset() {
    println!("\n🧪 TEST 5: Timeout — decrease difficulty, rotate seed");

    let mut puzzle = test_puzzle(14);
    let seed_before = puzzle.seed().to_string();

    // Watcher fires just past the window max: controller step is -1 there,
    // so the floor of 2 applies.
    let adj = puzzle.timeout_decrease();
    assert_eq!(adj.old_difficulty, 14);
    assert_eq!(adj.new_difficulty, 12);
    assert!(adj.reason.contains("timeout"));

    puzzle.rotate_seed();
    assert_ne!(puzzle.seed(), seed_before);
    assert_eq!(
        puzzle.clock.elapsed(),
        Duration::ZERO,
        "new round starts with zero mining-time"
    );
    println!("✅ 14 → 12 with a fresh seed");
}

// ========================================
// TEST 6: SESSION RECONNECT
// ========================================
#[tokio::test]
async fn test_session_reconnect_grace_window() {
    println!("\n🧪 TEST 6: Session reconnect inside and outside the grace");

    let ip_a = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
    let ip_b = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2));

    // 80ms grace standing in for the production 5 minutes.
    let sessions = SessionRegistry::with_grace(Duration::from_millis(80));
    let token = sessions.issue(ip_a);

    sessions.mark_disconnected(&token);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Within grace, same IP: welcome back.
    assert!(sessions.validate(&token, ip_a).is_ok());
    assert!(sessions.mark_connected(&token));

    // Same token from another IP: policy violation.
    assert_eq!(sessions.validate(&token, ip_b), Err(SessionError::IpMismatch));

    // Past grace after disconnecting again: gone.
    sessions.mark_disconnected(&token);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(sessions.validate(&token, ip_a), Err(SessionError::Expired));
    println!("✅ grace window enforced, IP binding enforced");
}

// ========================================
// TEST 7: MINING-TIME ACCOUNTING
// ========================================
#[tokio::test]
async fn test_mining_time_survives_stop_start() {
    println!("\n🧪 TEST 7: Mining-time accounting across stop/start");

    let mut puzzle = test_puzzle(10);

    puzzle.clock.miner_started();
    tokio::time::sleep(Duration::from_millis(30)).await;
    puzzle.clock.miner_stopped();
    let after_first = puzzle.clock.elapsed();
    assert!(after_first >= Duration::from_millis(20));

    // Paused: wall clock advances, mining-time does not.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(puzzle.clock.elapsed(), after_first);

    // Second miner session adds on top.
    puzzle.clock.miner_started();
    tokio::time::sleep(Duration::from_millis(30)).await;
    puzzle.clock.miner_stopped();
    assert!(
        puzzle.clock.elapsed() >= after_first + Duration::from_millis(20),
        "accumulated time must carry across stop/start"
    );

    // Overlapping miners only count once.
    puzzle.clock.miner_started();
    puzzle.clock.miner_started();
    puzzle.clock.miner_stopped();
    assert!(puzzle.clock.is_active(), "one of two miners remains");
    puzzle.clock.miner_stopped();
    assert!(!puzzle.clock.is_active());
    println!("✅ monotonic, pause/resume exact");
}
