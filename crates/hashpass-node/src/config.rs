// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - STARTUP CONFIGURATION
//
// All configuration is environment-variable based and consumed exactly once
// at startup into an explicit Config value passed by handle to every
// component. Malformed or out-of-range values abort startup with a clear
// error instead of limping along with defaults.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use hashpass_core::puzzle::{DifficultyBounds, PuzzleConfig, TargetWindow};
use hashpass_core::verifier::PowParams;
use rand::RngCore;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_all: bool,
    pub admin_token: String,
    pub puzzle: PuzzleConfig,
    pub turnstile_site_key: String,
    pub turnstile_secret: String,
    pub turnstile_test_mode: bool,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    /// Operator-preset server secret (64 hex chars); random when unset.
    pub server_secret_hex: Option<String>,
    pub timeout_consolation: bool,
    pub max_conn_per_ip: u32,
    pub rate_limit_rps: u32,
    /// Directory for verify.json, blacklist.json and the app log.
    pub data_dir: PathBuf,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| format!("{}={:?} is invalid: {}", key, raw, e)),
        _ => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_flag(key: &str) -> bool {
    // "1" specifically, so FOO=0 never accidentally enables anything
    std::env::var(key).unwrap_or_default() == "1"
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let puzzle = PuzzleConfig {
            difficulty: env_parse("HASHPASS_DIFFICULTY", 12u32)?,
            bounds: DifficultyBounds {
                min: env_parse("HASHPASS_DIFFICULTY_MIN", 8u32)?,
                max: env_parse("HASHPASS_DIFFICULTY_MAX", 24u32)?,
            },
            window: TargetWindow {
                min_secs: env_parse("HASHPASS_TARGET_MIN_SECS", 30u64)?,
                max_secs: env_parse("HASHPASS_TARGET_MAX_SECS", 120u64)?,
            },
            pow: PowParams {
                time_cost: env_parse("HASHPASS_ARGON2_TIME", PowParams::DEFAULT.time_cost)?,
                memory_cost_kib: env_parse(
                    "HASHPASS_ARGON2_MEMORY_KIB",
                    PowParams::DEFAULT.memory_cost_kib,
                )?,
                parallelism: env_parse(
                    "HASHPASS_ARGON2_PARALLELISM",
                    PowParams::DEFAULT.parallelism,
                )?,
            },
            worker_count: env_parse("HASHPASS_WORKER_COUNT", 4u32)?,
            max_nonce_speed: match env_opt("HASHPASS_MAX_NONCE_SPEED") {
                Some(raw) => Some(
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| format!("HASHPASS_MAX_NONCE_SPEED={:?} is invalid: {}", raw, e))?,
                ),
                None => None,
            },
        };
        puzzle.validate()?;

        let admin_token = match env_opt("HASHPASS_ADMIN_TOKEN") {
            Some(token) => token,
            None => {
                let token = Self::random_admin_token();
                eprintln!(
                    "⚠️  HASHPASS_ADMIN_TOKEN not set — generated ephemeral admin token: {}",
                    token
                );
                token
            }
        };

        if let Some(secret) = env_opt("HASHPASS_SERVER_SECRET") {
            // Fail fast on a malformed preset instead of at first mint.
            hashpass_core::ServerSecret::from_hex(&secret)
                .map_err(|e| format!("HASHPASS_SERVER_SECRET is invalid: {}", e))?;
        }

        Ok(Config {
            port: env_parse("HASHPASS_PORT", 8080u16)?,
            bind_all: env_flag("HASHPASS_BIND_ALL"),
            admin_token,
            puzzle,
            turnstile_site_key: env_string("HASHPASS_TURNSTILE_SITE_KEY", "1x00000000000000000000AA"),
            turnstile_secret: env_string("HASHPASS_TURNSTILE_SECRET", ""),
            turnstile_test_mode: env_flag("HASHPASS_TURNSTILE_TEST_MODE"),
            webhook_url: env_opt("HASHPASS_WEBHOOK_URL"),
            webhook_token: env_opt("HASHPASS_WEBHOOK_TOKEN"),
            server_secret_hex: env_opt("HASHPASS_SERVER_SECRET"),
            timeout_consolation: env_flag("HASHPASS_TIMEOUT_CONSOLATION"),
            max_conn_per_ip: env_parse("HASHPASS_MAX_CONN_PER_IP", 4u32)?,
            rate_limit_rps: env_parse("HASHPASS_RATE_LIMIT_RPS", 30u32)?,
            data_dir: PathBuf::from(env_string("HASHPASS_DATA_DIR", ".")),
        })
    }

    fn random_admin_token() -> String {
        let mut raw = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut raw);
        hex::encode(raw)
    }
}
