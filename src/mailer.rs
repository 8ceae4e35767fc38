//! Email transports.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::dispatch::{DeliveryError, EmailMessage, Mailer};

/// Logs instead of sending. Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), DeliveryError> {
        info!(to = %message.to, subject = %message.subject, link = %message.link, "email (log transport)");
        Ok(())
    }
}

/// POSTs each message as JSON to a transactional-mail webhook.
pub struct WebhookMailer {
    client: reqwest::Client,
    url: String,
}

impl WebhookMailer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(&message)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected(format!("webhook returned {status}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> EmailMessage {
        EmailMessage {
            to: "casey@example.com".into(),
            subject: "s".into(),
            body: "b".into(),
            link: "https://pets.example/dashboard".into(),
        }
    }

    #[tokio::test]
    async fn log_mailer_always_succeeds() {
        assert!(LogMailer.send(message()).await.is_ok());
    }

    #[tokio::test]
    async fn webhook_unreachable_is_transport_error() {
        let mailer = WebhookMailer::new("http://127.0.0.1:9/mail", Duration::from_millis(500)).unwrap();
        assert!(matches!(
            mailer.send(message()).await,
            Err(DeliveryError::Transport(_))
        ));
    }
}
