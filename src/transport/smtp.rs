//! SMTP transport via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::TransportConfig;
use crate::error::DeliveryError;
use crate::transport::{Deliverer, OutboundEmail};

const PROVIDER: &str = "smtp";

pub struct SmtpDeliverer {
    config: TransportConfig,
}

impl SmtpDeliverer {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    fn send_blocking(config: &TransportConfig, message: &Message) -> Result<(), DeliveryError> {
        let creds = Credentials::new(
            config.smtp_username.clone(),
            config.smtp_password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| failed(format!("SMTP relay error: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        let response = transport
            .send(message)
            .map_err(|e| failed(format!("SMTP send failed: {e}")))?;

        if response.is_positive() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                provider: PROVIDER.into(),
                reason: format!("SMTP response code {}", response.code()),
            })
        }
    }
}

#[async_trait]
impl Deliverer<OutboundEmail> for SmtpDeliverer {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn deliver(&self, email: &OutboundEmail) -> Result<(), DeliveryError> {
        let message = build_message(email, &self.config.from_address)?;
        let config = self.config.clone();

        // lettre's SmtpTransport is blocking.
        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &message))
            .await
            .map_err(|e| failed(format!("SMTP task panicked: {e}")))??;

        tracing::debug!(to = ?email.to, subject = %email.subject, "Email sent via SMTP");
        Ok(())
    }
}

fn failed(reason: String) -> DeliveryError {
    DeliveryError::RequestFailed {
        provider: PROVIDER.into(),
        reason,
    }
}

fn mailbox(addr: &str, role: &str) -> Result<Mailbox, DeliveryError> {
    addr.parse()
        .map_err(|e| DeliveryError::InvalidMessage(format!("Invalid {role} address {addr:?}: {e}")))
}

/// Turn an [`OutboundEmail`] into a MIME message.
pub fn build_message(email: &OutboundEmail, default_from: &str) -> Result<Message, DeliveryError> {
    email.validate()?;

    let from = email.from.as_deref().unwrap_or(default_from);
    let mut builder = Message::builder()
        .from(mailbox(from, "from")?)
        .subject(email.subject.clone());
    for to in &email.to {
        builder = builder.to(mailbox(to, "to")?);
    }
    if let Some(reply_to) = &email.reply_to {
        builder = builder.reply_to(mailbox(reply_to, "reply-to")?);
    }

    let body = match (&email.text, &email.html) {
        (Some(text), Some(html)) => MultiPart::alternative_plain_html(text.clone(), html.clone()),
        (Some(text), None) => MultiPart::mixed().singlepart(SinglePart::plain(text.clone())),
        (None, Some(html)) => MultiPart::mixed().singlepart(SinglePart::html(html.clone())),
        (None, None) => return Err(DeliveryError::InvalidMessage("empty body".into())),
    };

    let body = email.attachments.iter().try_fold(
        MultiPart::mixed().multipart(body),
        |parts, attachment| {
            let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                DeliveryError::InvalidMessage(format!(
                    "Invalid content type for {}: {e}",
                    attachment.filename
                ))
            })?;
            Ok::<_, DeliveryError>(parts.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), content_type),
            ))
        },
    )?;

    builder
        .multipart(body)
        .map_err(|e| DeliveryError::InvalidMessage(format!("Failed to build email: {e}")))
}
