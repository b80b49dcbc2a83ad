use serde_json::json;

use crate::models::{Position, Signal, TradeIntent};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Telegram operator alerts. Failures are logged but never block the pipeline.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
    base_url: String,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            chat_id,
            base_url: TELEGRAM_API.into(),
        }
    }

    /// Send a Telegram message. Failures are logged as warnings.
    pub async fn send(&self, message: &str) {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);

        let body = json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "Markdown",
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    tracing::warn!(
                        status = %resp.status(),
                        "Telegram sendMessage returned non-2xx"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send Telegram notification");
            }
        }
    }
}

/// Send on a background task when a notifier is configured.
pub fn dispatch(notifier: &Option<std::sync::Arc<Notifier>>, message: String) {
    if let Some(n) = notifier {
        let n = n.clone();
        tokio::spawn(async move { n.send(&message).await });
    }
}

fn short(s: &str) -> String {
    s.chars().take(16).collect()
}

pub fn format_integrity_rejection(source_identity: &str, external_event_id: &str, reason: &str) -> String {
    format!(
        "*Integrity Rejection*\nSource: `{}`\nEvent: `{}`\nReason: {}",
        source_identity,
        short(external_event_id),
        reason,
    )
}

pub fn format_unroutable(signal: &Signal, intent: &TradeIntent) -> String {
    format!(
        "*Unroutable Signal*\nToken: {} {}\nDeployment: `{}`\nReason: {}",
        signal.token_symbol,
        signal.side,
        intent.deployment_id,
        intent
            .rationale
            .as_ref()
            .and_then(|r| r.note.as_deref())
            .unwrap_or("no venue available"),
    )
}

pub fn format_ambiguous(intent: &TradeIntent) -> String {
    format!(
        "*Ambiguous Execution*\nIntent: `{}`\nVenue: {}\nTx: `{}`\nNeeds reconciliation.",
        intent.id,
        intent.venue.map(|v| v.as_str()).unwrap_or("?"),
        intent.tx_ref.as_deref().unwrap_or("none"),
    )
}

pub fn format_position_closed(position: &Position) -> String {
    format!(
        "*Position Closed*\n{} {} on {}\nEntry: {} Exit: {}\nPnL: ${}",
        position.side,
        position.token_symbol,
        position.venue,
        position.entry_price,
        position.exit_price.map(|p| p.to_string()).unwrap_or_default(),
        position.pnl.map(|p| p.round_dp(2).to_string()).unwrap_or_default(),
    )
}
