//! Webhook relay for chat lines and payments.
//!
//! Posts embed-style JSON to a chat-platform webhook. Delivery failures are
//! logged and dropped; the connection never waits on the relay.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tether_core::Notifier;
use tether_core::chat::format_number_short;
use tracing::{debug, warn};

const CHAT_COLOR: u32 = 0x00_FF_00;
const PAYMENT_COLOR: u32 = 0xFF_D7_00;
const STATUS_COLOR: u32 = 0x72_89_DA;

#[derive(Debug, Serialize)]
struct WebhookPayload {
    embeds: Vec<Embed>,
}

#[derive(Debug, Serialize)]
struct Embed {
    author: EmbedAuthor,
    description: String,
    color: u32,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct EmbedAuthor {
    name: String,
}

/// Relays notifications to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a relay posting to `url`.
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, author: &str, description: String, color: u32) -> anyhow::Result<()> {
        let payload = WebhookPayload {
            embeds: vec![Embed {
                author: EmbedAuthor {
                    name: author.to_string(),
                },
                description,
                color,
                timestamp: Utc::now().to_rfc3339(),
            }],
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("webhook request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("webhook returned {status}: {body}");
        }
        debug!(author, "Relayed to webhook");
        Ok(())
    }

    async fn relay(&self, author: &str, description: String, color: u32) {
        if let Err(e) = self.post(author, description, color).await {
            warn!(error = %e, "Relay failed");
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn on_chat_line(&self, text: &str) {
        self.relay("Game Chat", text.to_string(), CHAT_COLOR).await;
    }

    async fn on_payment_detected(&self, sender: &str, amount: f64) {
        let text = format!("**{sender}** paid **${}**", format_number_short(amount));
        self.relay("Payment", text, PAYMENT_COLOR).await;
    }

    async fn on_server_confirmed(&self) {
        self.relay("Status", "Connected to the target server".into(), STATUS_COLOR)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server_accepting(expect: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(204))
            .expect(expect)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn chat_line_is_posted_as_embed() {
        let server = server_accepting(1).await;
        let relay = WebhookNotifier::new(format!("{}/hook", server.uri())).unwrap();

        relay.on_chat_line("hello world").await;

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let embed = &body["embeds"][0];
        assert_eq!(embed["description"], "hello world");
        assert_eq!(embed["author"]["name"], "Game Chat");
        assert_eq!(embed["color"], CHAT_COLOR);
        assert!(embed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn payment_amount_is_shortened() {
        let server = server_accepting(1).await;
        let relay = WebhookNotifier::new(format!("{}/hook", server.uri())).unwrap();

        relay.on_payment_detected("Steve", 1_500.0).await;

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["embeds"][0]["description"], "**Steve** paid **$1.50k**");
        assert_eq!(body["embeds"][0]["author"]["name"], "Payment");
    }

    #[tokio::test]
    async fn rejected_post_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let relay = WebhookNotifier::new(server.uri()).unwrap();

        let err = relay
            .post("Status", "x".into(), STATUS_COLOR)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("slow down"));
    }

    #[tokio::test]
    async fn state_changes_are_not_relayed() {
        let server = server_accepting(0).await;
        let relay = WebhookNotifier::new(format!("{}/hook", server.uri())).unwrap();

        relay
            .on_connection_state_changed(tether_core::ConnectionState::Online)
            .await;
    }
}
