//! Delivery transports.
//!
//! The dispatch queue only knows the [`Deliverer`] trait. Concrete email
//! transports live here and are selected once, from configuration, by
//! [`build_deliverer`].

pub mod resend;
pub mod smtp;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;
use crate::error::{ConfigError, DeliveryError};

pub use resend::ResendDeliverer;
pub use smtp::SmtpDeliverer;

/// Sends one payload. Supplied by the collaborator that owns the transport.
#[async_trait]
pub trait Deliverer<P>: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &str;

    /// Attempt delivery. Any `Err` is treated as retryable by the queue.
    async fn deliver(&self, payload: &P) -> Result<(), DeliveryError>;
}

/// A fully constructed outbound email. Content is built by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: Vec<String>,
    /// Overrides the configured default sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<EmailAttachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl OutboundEmail {
    pub fn new(to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            to: vec![to.into()],
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_attachment(mut self, attachment: EmailAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Reject messages no transport could send.
    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.to.is_empty() {
            return Err(DeliveryError::InvalidMessage("no recipients".into()));
        }
        if self.html.is_none() && self.text.is_none() {
            return Err(DeliveryError::InvalidMessage("empty body".into()));
        }
        Ok(())
    }
}

/// Outbound email provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryProvider {
    Resend,
    Smtp,
}

impl FromStr for DeliveryProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resend" => Ok(Self::Resend),
            "smtp" => Ok(Self::Smtp),
            other => Err(ConfigError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for DeliveryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resend => write!(f, "resend"),
            Self::Smtp => write!(f, "smtp"),
        }
    }
}

/// Build the configured email transport.
pub fn build_deliverer(
    config: &TransportConfig,
) -> Result<Arc<dyn Deliverer<OutboundEmail>>, ConfigError> {
    let provider: DeliveryProvider = config.provider.parse()?;
    tracing::info!(%provider, "Email transport selected");
    Ok(match provider {
        DeliveryProvider::Resend => Arc::new(ResendDeliverer::new(config.clone())),
        DeliveryProvider::Smtp => Arc::new(SmtpDeliverer::new(config.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse() {
        assert_eq!("Resend".parse::<DeliveryProvider>().unwrap(), DeliveryProvider::Resend);
        assert_eq!("smtp".parse::<DeliveryProvider>().unwrap(), DeliveryProvider::Smtp);
        let err = "sendgrid".parse::<DeliveryProvider>().unwrap_err();
        assert!(err.to_string().contains("Unsupported provider"));
    }

    #[test]
    fn unknown_provider_fails_to_build() {
        let config = TransportConfig {
            provider: "pigeon".into(),
            ..Default::default()
        };
        assert!(matches!(
            build_deliverer(&config),
            Err(ConfigError::UnsupportedProvider(p)) if p == "pigeon"
        ));
    }

    #[test]
    fn known_providers_build() {
        for provider in ["smtp", "resend"] {
            let config = TransportConfig {
                provider: provider.into(),
                ..Default::default()
            };
            let deliverer = build_deliverer(&config).unwrap();
            assert_eq!(deliverer.name(), provider);
        }
    }

    #[test]
    fn validate_requires_recipient_and_body() {
        assert!(OutboundEmail::new("a@example.com", "Hi").validate().is_err());
        assert!(
            OutboundEmail::new("a@example.com", "Hi")
                .with_text("body")
                .validate()
                .is_ok()
        );
        let no_recipients = OutboundEmail {
            text: Some("body".into()),
            ..Default::default()
        };
        assert!(no_recipients.validate().is_err());
    }
}
