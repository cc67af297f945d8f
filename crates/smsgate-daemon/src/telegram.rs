//! Telegram message sink
//!
//! The pipeline only knows the [`MessageSink`] trait: deliver one rendered
//! text to one destination, or say why not. Retrying is the caller's job; the
//! Telegram Bot API tolerates a duplicate send on retry, so the sink makes no
//! attempt at exactly-once delivery.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

// ----------------------------------------------------------------------------
// Sink Boundary
// ----------------------------------------------------------------------------

/// Failure of a single delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("API answered HTTP {0} with an undecodable body")]
    Status(reqwest::StatusCode),

    #[error("API rejected the message: {description}")]
    Api { description: String },
}

/// One-shot delivery of a rendered message to a destination chat.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SinkError>;
}

// ----------------------------------------------------------------------------
// Telegram Bot API Client
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    description: Option<String>,
}

/// [`MessageSink`] backed by the Telegram Bot API `sendMessage` method.
pub struct TelegramSink {
    client: reqwest::Client,
    send_url: String,
    timeout: Duration,
}

impl TelegramSink {
    /// Build a sink for one bot token with a per-call timeout.
    pub fn new(token: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            send_url: format!("{TELEGRAM_API_BASE}/bot{token}/sendMessage"),
            timeout,
        }
    }
}

#[async_trait]
impl MessageSink for TelegramSink {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SinkError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        let exchange = async {
            let response = self.client.post(&self.send_url).json(&body).send().await?;
            let status = response.status();
            let reply = response.json::<ApiReply>().await;
            Ok::<_, reqwest::Error>((status, reply))
        };
        let (status, reply) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| SinkError::Timeout(self.timeout))??;

        let reply = match reply {
            Ok(reply) => reply,
            // The API reports its own errors as JSON bodies with a
            // description, but a proxy or gateway in front of it can answer
            // with an HTML error page; there the status is the real signal.
            Err(_) if !status.is_success() => return Err(SinkError::Status(status)),
            Err(err) => return Err(SinkError::Http(err)),
        };

        if !reply.ok {
            return Err(SinkError::Api {
                description: reply
                    .description
                    .unwrap_or_else(|| "no description given".to_string()),
            });
        }
        debug!(chat_id, "message delivered to Telegram");
        Ok(())
    }
}
