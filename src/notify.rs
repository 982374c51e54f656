//! Best-effort Pushover notifications. Failures are the caller's to log;
//! nothing here ever blocks the pipeline.

use std::time::Duration;

const PUSHOVER_API: &str = "https://api.pushover.net/1/messages.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
    Emergency,
}

impl Priority {
    fn as_pushover(self) -> i8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 1,
            Priority::Emergency => 2,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    app_token: String,
    user_key: String,
    enabled: bool,
    http: reqwest::Client,
}

impl Notifier {
    /// Disabled when either credential is missing.
    pub fn new(app_token: String, user_key: String) -> Self {
        let enabled = !app_token.is_empty() && !user_key.is_empty();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            app_token,
            user_key,
            enabled,
            http,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn send(&self, title: &str, message: &str, priority: Priority) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        let mut form = vec![
            ("token", self.app_token.clone()),
            ("user", self.user_key.clone()),
            ("title", title.to_string()),
            ("message", message.to_string()),
            ("priority", priority.as_pushover().to_string()),
        ];
        if priority == Priority::Emergency {
            form.push(("retry", "60".to_string()));
            form.push(("expire", "3600".to_string()));
        }

        let response = self
            .http
            .post(PUSHOVER_API)
            .form(&form)
            .send()
            .await
            .map_err(|e| format!("pushover request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("pushover returned status {}", response.status()));
        }
        Ok(())
    }

    pub async fn notify_key_recovered(
        &self,
        address: &str,
        chain_name: &str,
        tx_count: usize,
    ) -> Result<(), String> {
        let message = format!(
            "Address: {}\nChain: {}\nTransactions: {}",
            shorten_address(address),
            chain_name,
            tx_count
        );
        self.send("Private Key Recovered", &message, Priority::High)
            .await
    }

    pub async fn notify_collision(
        &self,
        r_value: &str,
        address: &str,
        chain_id: u64,
        is_same_key: bool,
    ) -> Result<(), String> {
        let (title, message) = if is_same_key {
            (
                "Same-Key Nonce Reuse Detected",
                format!(
                    "Address: {}\nChain ID: {}\nR-value: {}",
                    shorten_address(address),
                    chain_id,
                    shorten_hash(r_value)
                ),
            )
        } else {
            (
                "Cross-Key R-Value Collision",
                format!(
                    "Chain ID: {}\nR-value: {}",
                    chain_id,
                    shorten_hash(r_value)
                ),
            )
        };
        self.send(title, &message, Priority::Normal).await
    }

    pub async fn send_test(&self) -> Result<(), String> {
        self.send(
            "ECDSA Scanner",
            "Test notification from the nonce-reuse monitor",
            Priority::Normal,
        )
        .await
    }
}

fn shorten_address(addr: &str) -> String {
    let addr = addr.to_lowercase();
    if addr.len() > 14 {
        format!("{}...{}", &addr[..8], &addr[addr.len() - 6..])
    } else {
        addr
    }
}

fn shorten_hash(hash: &str) -> String {
    if hash.len() > 18 {
        format!("{}...", &hash[..18])
    } else {
        hash.to_string()
    }
}
