//! SMTP realization of the session contract, built on `mail-send`.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use mail_send::smtp::AssertReply;
use mail_send::{SmtpClient, SmtpClientBuilder};
use smtp_proto::Severity;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use super::{Envelope, Session, SessionFactory};
use crate::config::{ConnectConfig, Encryption};
use crate::error::Error;
use crate::secret;

/// Pause between failed dial attempts.
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One authenticated SMTP connection, generic over the transport so the
/// same code drives implicit-TLS and STARTTLS streams.
pub struct SmtpSession<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> {
    client: SmtpClient<T>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> SmtpSession<T> {
    pub fn new(client: SmtpClient<T>) -> Self {
        SmtpSession { client }
    }

    /// The underlying `mail-send` client, for callers that need commands
    /// this crate does not wrap.
    pub fn client(&mut self) -> &mut SmtpClient<T> {
        &mut self.client
    }

    /// Runs the MAIL FROM / RCPT TO / DATA conversation for one envelope.
    ///
    /// With `collect_rejected`, refused recipients are gathered and delivery
    /// proceeds for the remainder; otherwise the first refusal aborts the
    /// transaction.
    async fn transmit(
        &mut self,
        envelope: &Envelope,
        collect_rejected: bool,
    ) -> Result<Vec<String>, Error> {
        self.client
            .cmd(format!("MAIL FROM:<{}>\r\n", envelope.sender).as_bytes())
            .await
            .and_then(|reply| reply.assert_positive_completion())?;

        let mut rejected = Vec::new();
        for recipient in &envelope.recipients {
            let reply = self
                .client
                .cmd(format!("RCPT TO:<{}>\r\n", recipient).as_bytes())
                .await?;
            if matches!(reply.severity(), Severity::PositiveCompletion) {
                continue;
            }
            if !collect_rejected {
                return Err(Error::Rejected {
                    code: reply.code(),
                    reason: reply.to_string(),
                });
            }
            rejected.push(recipient.clone());
        }

        if rejected.len() == envelope.recipients.len() {
            // Nothing left to deliver to; reset the transaction so the
            // session stays reusable.
            let _ = self.client.cmd(b"RSET\r\n").await;
            return Err(Error::NoValidRecipients);
        }

        self.client.data(&envelope.body).await?;
        Ok(rejected)
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Session for SmtpSession<T> {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), Error> {
        self.transmit(envelope, false).await.map(|_| ())
    }

    async fn send_group(&mut self, envelope: &Envelope) -> Result<Vec<String>, Error> {
        self.transmit(envelope, true).await
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        let SmtpSession { client } = *self;
        let _ = client.quit().await;
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// Dials and authenticates SMTP sessions for one credential tuple.
pub struct SmtpSessionFactory {
    host: String,
    port: u16,
    username: String,
    /// Already revealed; the factory is the only holder of the plaintext.
    password: String,
    implicit_tls: bool,
    allow_invalid_certs: bool,
    attempts: u32,
}

impl SmtpSessionFactory {
    /// Adapts the shared connect config to SMTP, surfacing bad values as
    /// configuration errors before any dial happens.
    pub fn from_config(config: &ConnectConfig) -> Result<Self, Error> {
        let port: u16 = config
            .port
            .trim()
            .parse()
            .map_err(|_| Error::InvalidPort(config.port.clone()))?;
        Ok(SmtpSessionFactory {
            host: config.host.clone(),
            port,
            username: config.username.clone(),
            password: secret::reveal(&config.password)?,
            implicit_tls: matches!(config.encryption, Encryption::Tls),
            allow_invalid_certs: !config.verify_certs,
            attempts: config.send_retry_num.max(1),
        })
    }

    fn builder(&self) -> SmtpClientBuilder<String> {
        let builder = SmtpClientBuilder::new(self.host.clone(), self.port)
            .implicit_tls(self.implicit_tls)
            .credentials((self.username.clone(), self.password.clone()));
        if self.allow_invalid_certs {
            builder.allow_invalid_certs()
        } else {
            builder
        }
    }
}

#[async_trait]
impl SessionFactory for SmtpSessionFactory {
    async fn create(&self) -> Result<Box<dyn Session>, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.builder().connect().await {
                Ok(client) => return Ok(Box::new(SmtpSession::new(client))),
                Err(err) => {
                    warn!(
                        host = %self.host,
                        port = self.port,
                        username = %self.username,
                        attempt,
                        error = %err,
                        "smtp dial failed"
                    );
                    if attempt >= self.attempts {
                        return Err(Error::Dial {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    tokio::time::sleep(DIAL_RETRY_DELAY).await;
                }
            }
        }
    }
}
