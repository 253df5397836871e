//! Failure alert delivery via Microsoft Graph sendMail.
//!
//! The orchestrator fires exactly one alert per exhausted refresh run. The
//! sink is a trait so tests can count alert calls without touching Graph;
//! the production mailer logs-and-skips when Outlook credentials are absent.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::core::config::OutlookConfig;

#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn send(&self, subject: &str, body: &str);
}

/// Graph client-credentials mailer.
pub struct AlertMailer {
    client: reqwest::Client,
    config: OutlookConfig,
    /// Address the alert is delivered to; defaults to the sender mailbox.
    recipient: String,
}

#[derive(Deserialize)]
struct GraphTokenResponse {
    access_token: Option<String>,
}

impl AlertMailer {
    pub fn new(client: reqwest::Client, config: OutlookConfig) -> Self {
        let recipient = config.sender_email.clone();
        Self {
            client,
            config,
            recipient,
        }
    }

    async fn acquire_graph_token(&self) -> Option<String> {
        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.config.tenant_id
        );
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", "https://graph.microsoft.com/.default"),
            ("grant_type", "client_credentials"),
        ];
        let resp: GraphTokenResponse = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        resp.access_token
    }
}

#[async_trait]
impl AlertSink for AlertMailer {
    async fn send(&self, subject: &str, body: &str) {
        if !self.config.is_configured() {
            warn!("alerts: Outlook not configured, skipping alert: {}", subject);
            return;
        }

        let Some(token) = self.acquire_graph_token().await else {
            warn!("alerts: failed to acquire Graph token, alert not sent");
            return;
        };

        let url = format!(
            "https://graph.microsoft.com/v1.0/users/{}/sendMail",
            self.config.sender_email
        );
        let payload = json!({
            "message": {
                "subject": subject,
                "body": { "contentType": "Text", "content": body },
                "toRecipients": [
                    { "emailAddress": { "address": self.recipient } }
                ]
            },
            "saveToSentItems": false
        });

        match self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!("alerts: sent alert email: {}", subject)
            }
            Ok(resp) => warn!("alerts: Graph sendMail returned {}", resp.status()),
            Err(e) => warn!("alerts: failed to send alert email: {}", e),
        }
    }
}
