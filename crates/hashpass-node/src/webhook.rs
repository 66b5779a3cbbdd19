/// Optional win-notification webhook.
///
/// Strictly fire-and-forget: the winner already has their code by the time
/// this runs, so webhook trouble must never surface to the user. Each
/// attempt gets a 5 s timeout; failures retry with exponential backoff
/// (1 s, 2 s, 4 s) and the final failure logs a single warning.
use prometheus::IntCounter;
use std::time::Duration;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_SECS: [u64; 3] = [1, 2, 4];

#[derive(Clone)]
pub struct WinNotifier {
    url: Option<String>,
    bearer: Option<String>,
    client: reqwest::Client,
    failures: IntCounter,
}

impl WinNotifier {
    pub fn new(url: Option<String>, bearer: Option<String>, failures: IntCounter) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .unwrap_or_default();
        WinNotifier {
            url,
            bearer,
            client,
            failures,
        }
    }

    pub fn configured(&self) -> bool {
        self.url.is_some()
    }

    /// Dispatch `payload` in the background; returns immediately.
    pub fn notify(&self, payload: serde_json::Value) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();
        let bearer = self.bearer.clone();
        let failures = self.failures.clone();

        tokio::spawn(async move {
            let attempts = BACKOFF_SECS.len() + 1;
            for attempt in 0..attempts {
                if attempt > 0 {
                    tokio::time::sleep(Duration::from_secs(BACKOFF_SECS[attempt - 1])).await;
                }

                let mut request = client.post(&url).json(&payload);
                if let Some(ref token) = bearer {
                    request = request.bearer_auth(token);
                }

                match request.send().await {
                    Ok(response) if response.status().is_success() => return,
                    Ok(response) if attempt + 1 == attempts => {
                        failures.inc();
                        eprintln!(
                            "⚠️  win webhook failed after {} attempts: HTTP {}",
                            attempts,
                            response.status()
                        );
                    }
                    Err(e) if attempt + 1 == attempts => {
                        failures.inc();
                        eprintln!("⚠️  win webhook failed after {} attempts: {}", attempts, e);
                    }
                    _ => {} // retry
                }
            }
        });
    }
}
