//! relaycore-mailer — a `Sender` adapter backed by a pooled SMTP transport.
//!
//! Provider client implementations are out of scope for the dispatch engine
//! itself (spec.md §4.7 only specifies the interface and the error-text
//! contract the classifier depends on); this crate supplies the one ESP
//! binding every deployment needs regardless of which hosted providers it
//! also talks to. SES/Postmark/Mailgun/Mailjet/SparkPost credentials route
//! through their own HTTP clients elsewhere and are not implemented here.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use relaycore_core::{ProviderKind, SendEmailProviderRequest, SendError, Sender};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailerError {
    #[error("failed to build SMTP transport: {0}")]
    Transport(String),
}

/// The shape `EmailProvider::credentials` must have for `ProviderKind::Smtp`.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpCredentials {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_port() -> u16 {
    587
}

fn default_pool_size() -> u32 {
    10
}

/// SMTP-backed `Sender`. Transports are pooled by `lettre` internally and
/// cached per integration here so repeated sends reuse the same connection
/// pool instead of renegotiating TLS on every message.
#[derive(Default)]
pub struct SmtpSender {
    transports: Mutex<HashMap<String, AsyncSmtpTransport<Tokio1Executor>>>,
}

impl SmtpSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_transport(creds: &SmtpCredentials) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailerError> {
        let pool_config = PoolConfig::new().max_size(creds.pool_size);
        let builder = match (&creds.username, &creds.password) {
            (Some(user), Some(pass)) => AsyncSmtpTransport::<Tokio1Executor>::relay(&creds.host)
                .map_err(|e| MailerError::Transport(e.to_string()))?
                .port(creds.port)
                .credentials(Credentials::new(user.clone(), pass.clone())),
            _ => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&creds.host).port(creds.port),
        };
        Ok(builder.pool_config(pool_config).build())
    }

    fn transport_for(
        &self,
        integration_id: &str,
        creds: &SmtpCredentials,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailerError> {
        // The cache map is only ever mutated by plain insert/get calls, so a
        // poisoned lock still holds a perfectly usable map.
        let mut transports: MutexGuard<'_, HashMap<String, AsyncSmtpTransport<Tokio1Executor>>> = self
            .transports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(t) = transports.get(integration_id) {
            return Ok(t.clone());
        }
        let transport = Self::build_transport(creds)?;
        transports.insert(integration_id.to_string(), transport.clone());
        Ok(transport)
    }
}

fn parse_mailbox(raw: &str) -> Result<Mailbox, SendError> {
    raw.parse()
        .map_err(|e| SendError(format!("invalid address {raw:?}: {e}")))
}

#[async_trait]
impl Sender for SmtpSender {
    async fn send(&self, request: SendEmailProviderRequest) -> Result<(), SendError> {
        if request.provider.kind != ProviderKind::Smtp {
            return Err(SendError(format!(
                "SmtpSender only delivers ProviderKind::Smtp, got {:?}",
                request.provider.kind
            )));
        }

        let creds: SmtpCredentials = serde_json::from_value(request.provider.credentials.clone())
            .map_err(|e| SendError(format!("invalid SMTP credentials for integration {}: {e}", request.integration_id)))?;

        let transport = self
            .transport_for(&request.integration_id, &creds)
            .map_err(|e| SendError(e.to_string()))?;

        let from: Mailbox = parse_mailbox(&format!("{} <{}>", request.from_name, request.from_address))?;
        let to = parse_mailbox(&request.to)?;

        let mut builder = Message::builder().from(from).to(to).subject(request.subject.clone());

        if let Some(options) = &request.email_options {
            for cc in &options.cc {
                builder = builder.cc(parse_mailbox(cc)?);
            }
            for bcc in &options.bcc {
                builder = builder.bcc(parse_mailbox(bcc)?);
            }
            if let Some(reply_to) = &options.reply_to {
                builder = builder.reply_to(parse_mailbox(reply_to)?);
            }
        }

        let email = builder
            .multipart(MultiPart::alternative().singlepart(
                SinglePart::builder().header(ContentType::TEXT_HTML).body(request.html_content.clone()),
            ))
            .map_err(|e| SendError(format!("failed to build message: {e}")))?;

        transport
            .send(email)
            .await
            .map_err(|e| SendError(e.to_string()))?;

        tracing::info!(
            integration_id = %request.integration_id,
            message_id = %request.message_id,
            "email sent via SMTP"
        );
        Ok(())
    }
}
