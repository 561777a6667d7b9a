//! Verification-code email dispatch

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const COURIER_SEND_URL: &str = "https://api.courier.com/send";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Mail request failed: {0}")]
    Network(String),
    #[error("Mail provider returned HTTP {0}")]
    Status(u16),
}

/// Outbound mail seam
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_verification_code(
        &self,
        email: &str,
        user_name: &str,
        code: u32,
        expiration_minutes: u32,
    ) -> Result<(), MailError>;
}

#[async_trait]
impl<T: Mailer + ?Sized> Mailer for Arc<T> {
    async fn send_verification_code(
        &self,
        email: &str,
        user_name: &str,
        code: u32,
        expiration_minutes: u32,
    ) -> Result<(), MailError> {
        (**self)
            .send_verification_code(email, user_name, code, expiration_minutes)
            .await
    }
}

/// Sends codes through the Courier template API
pub struct CourierMailer {
    client: Client,
    api_key: String,
    template_id: String,
}

impl CourierMailer {
    pub fn new(api_key: String, template_id: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            template_id,
        }
    }
}

#[async_trait]
impl Mailer for CourierMailer {
    async fn send_verification_code(
        &self,
        email: &str,
        user_name: &str,
        code: u32,
        expiration_minutes: u32,
    ) -> Result<(), MailError> {
        let body = json!({
            "message": {
                "to": { "email": email },
                "template": self.template_id,
                "data": {
                    "otpCode": code.to_string(),
                    "expirationMinutes": expiration_minutes.to_string(),
                    "userName": user_name,
                },
                "routing": {
                    "method": "single",
                    "channels": ["email"],
                },
            }
        });

        let response = self
            .client
            .post(COURIER_SEND_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| MailError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Status(status.as_u16()));
        }

        tracing::info!(email = %email, "Verification code dispatched");
        Ok(())
    }
}

/// Fallback used when no mail provider is configured. Logs the code so
/// local setups can still complete the flow.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_verification_code(
        &self,
        email: &str,
        _user_name: &str,
        code: u32,
        expiration_minutes: u32,
    ) -> Result<(), MailError> {
        tracing::warn!(
            email = %email,
            code,
            expiration_minutes,
            "No mail provider configured; logging verification code"
        );
        Ok(())
    }
}
