//! Resend HTTP API transport.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::config::TransportConfig;
use crate::error::DeliveryError;
use crate::transport::{Deliverer, OutboundEmail};

const PROVIDER: &str = "resend";

pub struct ResendDeliverer {
    config: TransportConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<SendAttachment<'a>>,
}

#[derive(Debug, Serialize)]
struct SendAttachment<'a> {
    filename: &'a str,
    content: String,
    content_type: &'a str,
}

impl ResendDeliverer {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn request<'a>(&'a self, email: &'a OutboundEmail) -> SendRequest<'a> {
        SendRequest {
            from: email.from.as_deref().unwrap_or(&self.config.from_address),
            to: &email.to,
            subject: &email.subject,
            html: email.html.as_deref(),
            text: email.text.as_deref(),
            reply_to: email.reply_to.as_deref(),
            attachments: email
                .attachments
                .iter()
                .map(|a| SendAttachment {
                    filename: &a.filename,
                    content: BASE64.encode(&a.content),
                    content_type: &a.content_type,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Deliverer<OutboundEmail> for ResendDeliverer {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn deliver(&self, email: &OutboundEmail) -> Result<(), DeliveryError> {
        email.validate()?;

        let resp = self
            .client
            .post(&self.config.resend_endpoint)
            .bearer_auth(self.config.resend_api_key.expose_secret())
            .json(&self.request(email))
            .send()
            .await
            .map_err(|e| DeliveryError::RequestFailed {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!(to = ?email.to, subject = %email.subject, "Email sent via Resend");
            return Ok(());
        }

        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();

        Err(classify_failure(status, retry_after, body))
    }
}

fn classify_failure(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> DeliveryError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        DeliveryError::RateLimited {
            provider: PROVIDER.into(),
            retry_after,
        }
    } else if status.is_client_error() {
        DeliveryError::Rejected {
            provider: PROVIDER.into(),
            reason: format!("{status}: {body}"),
        }
    } else {
        DeliveryError::RequestFailed {
            provider: PROVIDER.into(),
            reason: format!("{status}: {body}"),
        }
    }
}
