/// Human-challenge verification (Cloudflare Turnstile).
///
/// The provider is an opaque token verifier behind one POST endpoint. Two
/// behaviors matter here:
///
///   1. Verification FAILS CLOSED: a provider outage rejects the handshake
///      rather than letting unverified clients in.
///   2. `test_mode` is a production feature, not a test shortcut — it turns
///      this into the fake implementation used by local development and the
///      integration tests, accepting any non-empty token.
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

const SITEVERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

#[derive(Debug, Deserialize)]
struct SiteverifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

#[derive(Clone)]
pub struct TurnstileVerifier {
    site_key: String,
    secret: String,
    test_mode: bool,
    client: reqwest::Client,
}

impl TurnstileVerifier {
    pub fn new(site_key: String, secret: String, test_mode: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        TurnstileVerifier {
            site_key,
            secret,
            test_mode,
            client,
        }
    }

    pub fn site_key(&self) -> &str {
        &self.site_key
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    /// Check a one-shot challenge token. Err means the provider was
    /// unreachable or returned garbage — callers must treat that as a
    /// rejection.
    pub async fn verify(&self, token: &str, ip: IpAddr) -> Result<bool, String> {
        if token.is_empty() {
            return Ok(false);
        }
        if self.test_mode {
            return Ok(true);
        }

        let response = self
            .client
            .post(SITEVERIFY_URL)
            .form(&[
                ("secret", self.secret.as_str()),
                ("response", token),
                ("remoteip", &ip.to_string()),
            ])
            .send()
            .await
            .map_err(|e| format!("challenge provider unreachable: {}", e))?;

        let body: SiteverifyResponse = response
            .json()
            .await
            .map_err(|e| format!("challenge provider returned invalid JSON: {}", e))?;

        if !body.success && !body.error_codes.is_empty() {
            println!("🔒 challenge rejected: {}", body.error_codes.join(", "));
        }
        Ok(body.success)
    }
}
