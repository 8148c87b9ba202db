//! SMTP transport via lettre.
//!
//! lettre's `SmtpTransport` is blocking; each send runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{Message, SmtpTransport, Transport as _};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use super::oauth::TokenSource;
use super::profile::{Security, SmtpAuth, TransportProfile};
use crate::error::TransportError;
use crate::pipeline::dispatcher::{DeliveryReceipt, OutboundMessage, Transport};

/// Sends mail through one transport profile.
pub struct SmtpMailer {
    profile: Arc<TransportProfile>,
    tokens: Option<TokenSource>,
    /// Built once for password and anonymous auth; XOAUTH2 rebuilds per token.
    static_transport: Option<SmtpTransport>,
}

impl SmtpMailer {
    pub fn new(profile: Arc<TransportProfile>) -> Result<Self, TransportError> {
        let tokens = match &profile.auth {
            SmtpAuth::OAuth2 {
                client_id,
                client_secret,
                refresh_token,
                token_url,
                ..
            } => Some(TokenSource::new(
                token_url.clone(),
                client_id.clone(),
                client_secret.clone(),
                refresh_token.clone(),
            )),
            _ => None,
        };

        let static_transport = match &profile.auth {
            SmtpAuth::None => Some(build_transport(&profile, None)?),
            SmtpAuth::Password { username, password } => Some(build_transport(
                &profile,
                Some((
                    Credentials::new(username.clone(), password.expose_secret().to_string()),
                    Mechanism::Plain,
                )),
            )?),
            SmtpAuth::OAuth2 { .. } => None,
        };

        info!(
            profile = %profile.id,
            host = %profile.host,
            port = profile.port,
            "SMTP transport configured"
        );

        Ok(Self {
            profile,
            tokens,
            static_transport,
        })
    }

    async fn transport(&self) -> Result<SmtpTransport, TransportError> {
        if let Some(t) = &self.static_transport {
            return Ok(t.clone());
        }
        match (&self.profile.auth, &self.tokens) {
            (SmtpAuth::OAuth2 { username, .. }, Some(tokens)) => {
                let token = tokens.access_token().await?;
                build_transport(
                    &self.profile,
                    Some((
                        Credentials::new(username.clone(), token.expose_secret().to_string()),
                        Mechanism::Xoauth2,
                    )),
                )
            }
            _ => Err(TransportError::auth("no credentials configured")),
        }
    }

    fn build_message(&self, message: &OutboundMessage) -> Result<Message, TransportError> {
        let from_address = self
            .profile
            .from_address
            .parse()
            .map_err(|e| TransportError::validation(format!("invalid from address: {e}")))?;
        let to_address = message
            .to
            .trim()
            .parse()
            .map_err(|e| TransportError::validation(format!("invalid recipient address: {e}")))?;

        let mut builder = Message::builder()
            .from(Mailbox::new(self.profile.from_name.clone(), from_address))
            .to(Mailbox::new(message.to_name.clone(), to_address))
            .subject(message.subject.clone())
            .message_id(Some(format!("<{}>", message.message_id)))
            .date_now();

        if let Some(reply_to) = &self.profile.reply_to {
            let reply_to = reply_to
                .parse()
                .map_err(|e| TransportError::validation(format!("invalid reply-to: {e}")))?;
            builder = builder.reply_to(Mailbox::new(None, reply_to));
        }

        for (name, value) in &message.headers {
            let name = HeaderName::new_from_ascii(name.clone())
                .map_err(|e| TransportError::validation(format!("invalid header {name}: {e}")))?;
            builder = builder.raw_header(HeaderValue::new(name, value.clone()));
        }

        let alternative =
            MultiPart::alternative_plain_html(message.text_body.clone(), message.html_body.clone());

        let body = if message.attachments.is_empty() {
            alternative
        } else {
            let mut mixed = MultiPart::mixed().multipart(alternative);
            for attachment in &message.attachments {
                let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                    TransportError::validation(format!(
                        "invalid content type for {}: {e}",
                        attachment.filename
                    ))
                })?;
                mixed = mixed.singlepart(
                    MimeAttachment::new(attachment.filename.clone())
                        .body(attachment.data.clone(), content_type),
                );
            }
            mixed
        };

        builder
            .multipart(body)
            .map_err(|e| TransportError::validation(format!("failed to build message: {e}")))
    }
}

fn build_transport(
    profile: &TransportProfile,
    credentials: Option<(Credentials, Mechanism)>,
) -> Result<SmtpTransport, TransportError> {
    let mut builder = match profile.security {
        Security::Tls => SmtpTransport::relay(&profile.host)
            .map_err(|e| TransportError::network(format!("SMTP relay error: {e}")))?,
        Security::Starttls => SmtpTransport::starttls_relay(&profile.host)
            .map_err(|e| TransportError::network(format!("SMTP relay error: {e}")))?,
        Security::Plain => SmtpTransport::builder_dangerous(&profile.host),
    }
    .port(profile.port)
    .timeout(Some(Duration::from_secs(profile.timeout_secs)));

    if let Some((credentials, mechanism)) = credentials {
        builder = builder
            .credentials(credentials)
            .authentication(vec![mechanism]);
    }
    Ok(builder.build())
}

/// Map a lettre SMTP error onto the pipeline's error classes.
pub fn classify(error: &lettre::transport::smtp::Error) -> TransportError {
    let message = error.to_string();

    if let Some(code) = error.status() {
        let code = code.to_string();
        if matches!(code.as_str(), "530" | "534" | "535") {
            return TransportError::auth(message);
        }
    }
    if error.is_permanent() {
        return TransportError::permanent(message);
    }
    if error.is_transient() {
        return TransportError::transient(message);
    }
    if error.is_timeout() || error.is_tls() {
        return TransportError::network(message);
    }
    if error.is_client() {
        return TransportError::validation(message);
    }
    // Connection and I/O failures.
    TransportError::network(message)
}

#[async_trait]
impl Transport for SmtpMailer {
    fn name(&self) -> &str {
        &self.profile.id
    }

    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, TransportError> {
        let email = self.build_message(message)?;
        let transport = self.transport().await?;

        let result = tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| TransportError::network(format!("send task failed: {e}")))?;

        match result {
            Ok(response) => {
                debug!(
                    profile = %self.profile.id,
                    code = %response.code(),
                    "SMTP server accepted message"
                );
                Ok(DeliveryReceipt {
                    provider_message_id: message.message_id.clone(),
                    accepted_at: Utc::now(),
                })
            }
            Err(e) => {
                let err = classify(&e);
                if err.class.is_campaign_fatal()
                    && let Some(tokens) = &self.tokens
                {
                    tokens.invalidate().await;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::campaigns::Attachment;
    use crate::error::ErrorClass;
    use crate::pipeline::dispatcher::test_message;

    fn profile() -> Arc<TransportProfile> {
        Arc::new(TransportProfile {
            id: "test".into(),
            name: "Test".into(),
            host: "127.0.0.1".into(),
            // Nothing listens on port 9.
            port: 9,
            security: Security::Plain,
            auth: SmtpAuth::None,
            from_address: "sales@leadai.test".into(),
            from_name: Some("LeadAI Sales".into()),
            reply_to: Some("replies@leadai.test".into()),
            rate_limit: None,
            daily_cap: None,
            unsubscribe_footer: None,
            track_opens: true,
            track_clicks: true,
            timeout_secs: 2,
        })
    }

    #[test]
    fn builds_multipart_message_with_headers_and_attachment() {
        let mailer = SmtpMailer::new(profile()).unwrap();
        let mut msg = test_message("alice@example.com");
        msg.to_name = Some("Alice".into());
        msg.headers = BTreeMap::from([("X-Campaign".to_string(), "spring".to_string())]);
        msg.attachments = vec![Attachment {
            filename: "deck.pdf".into(),
            content_type: "application/pdf".into(),
            data: b"%PDF-1.4".to_vec(),
        }];

        let email = mailer.build_message(&msg).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("X-Campaign: spring"));
        assert!(raw.contains("Reply-To: replies@leadai.test"));
        assert!(raw.contains(&format!("Message-ID: <{}>", msg.message_id)));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("deck.pdf"));
    }

    #[test]
    fn invalid_header_name_is_validation() {
        let mailer = SmtpMailer::new(profile()).unwrap();
        let mut msg = test_message("alice@example.com");
        msg.headers = BTreeMap::from([("Bad Header".to_string(), "x".to_string())]);
        let err = mailer.build_message(&msg).unwrap_err();
        assert_eq!(err.class, ErrorClass::Validation);
    }

    #[tokio::test]
    async fn connection_refused_is_network() {
        let mailer = SmtpMailer::new(profile()).unwrap();
        let err = mailer.send(&test_message("alice@example.com")).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Network);
    }
}
