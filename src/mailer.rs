//! The send client: message assembly plus the bounded retry loop over the
//! pool. Stateless apart from the configured identity; one `Mailer` per
//! account, many concurrent sends per `Mailer`.

use std::collections::HashMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use mail_send::mail_builder::headers::address::Address;
use mail_send::mail_builder::MessageBuilder;
use tokio::time::sleep;
use tracing::warn;

use crate::config::Account;
use crate::error::Error;
use crate::pool::manager::PoolManager;
use crate::pool::Pool;
use crate::session::Envelope;

/// A single outbound message before assembly.
#[derive(Debug, Clone, Default)]
pub struct Mail {
    /// Overrides the account's configured sender when the address is
    /// non-empty.
    pub sender: Option<Mailbox>,
    pub subject: String,
    pub html_body: String,
    /// Attachment file name as shown to the recipient, mapped to the file
    /// on disk.
    pub attachments: HashMap<String, Utf8PathBuf>,
    /// Files embedded inline, addressable from the HTML body by file name.
    pub inline: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    pub address: String,
    pub name: String,
}

pub struct Mailer {
    account: Account,
    pool: Pool,
    send_retry_num: u32,
    send_try_interval: Duration,
}

impl Mailer {
    /// Resolves the account's pool up front so a dead credential tuple
    /// fails at construction instead of on the first send.
    pub async fn new(
        account: Account,
        manager: &PoolManager,
        send_retry_num: u32,
        send_try_interval: Duration,
    ) -> Result<Self, Error> {
        let connect = account.connect_config(send_retry_num);
        let pool = manager.get_pool(&connect).await?;
        Ok(Mailer {
            account,
            pool,
            send_retry_num: send_retry_num.max(1),
            send_try_interval,
        })
    }

    #[cfg(test)]
    fn with_pool(
        account: Account,
        pool: Pool,
        send_retry_num: u32,
        send_try_interval: Duration,
    ) -> Self {
        Mailer {
            account,
            pool,
            send_retry_num: send_retry_num.max(1),
            send_try_interval,
        }
    }

    /// Sends one message to a single recipient.
    pub async fn send(&self, mail: &Mail, to: &str) -> Result<(), Error> {
        let envelope = self.assemble(mail, &[to.to_string()], &[], &[]).await?;
        let mut last_err = None;

        for attempt in 1..=self.send_retry_num {
            let mut session = match self.pool.acquire().await {
                Ok(session) => session,
                Err(err) => {
                    warn!(attempt, error = %err, "could not acquire a session");
                    last_err = Some(err);
                    sleep(self.send_try_interval).await;
                    continue;
                }
            };
            match session.send(&envelope).await {
                Ok(()) => {
                    self.pool.release(session).await;
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "send failed, discarding session");
                    let _ = self.pool.discard(session).await;
                    last_err = Some(err);
                    sleep(self.send_try_interval).await;
                }
            }
        }

        Err(last_err.unwrap_or(Error::PoolClosed))
    }

    /// Sends one message to a recipient group, reporting the recipients
    /// the server refused. The refused list is data, not an error, and is
    /// not re-attempted.
    pub async fn send_group(
        &self,
        mail: &Mail,
        to: &[String],
        cc: &[String],
        bcc: &[String],
    ) -> Result<Vec<String>, Error> {
        let envelope = self.assemble(mail, to, cc, bcc).await?;
        let mut last_err = None;

        for attempt in 1..=self.send_retry_num {
            let mut session = match self.pool.acquire().await {
                Ok(session) => session,
                Err(err) => {
                    warn!(attempt, error = %err, "could not acquire a session");
                    last_err = Some(err);
                    sleep(self.send_try_interval).await;
                    continue;
                }
            };
            match session.send_group(&envelope).await {
                Ok(rejected) => {
                    if !rejected.is_empty() {
                        warn!(?rejected, "server refused some recipients");
                    }
                    self.pool.release(session).await;
                    return Ok(rejected);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "group send failed, discarding session");
                    let _ = self.pool.discard(session).await;
                    last_err = Some(err);
                    sleep(self.send_try_interval).await;
                }
            }
        }

        Err(last_err.unwrap_or(Error::PoolClosed))
    }

    /// Builds the MIME message and the envelope the transport needs.
    async fn assemble(
        &self,
        mail: &Mail,
        to: &[String],
        cc: &[String],
        bcc: &[String],
    ) -> Result<Envelope, Error> {
        let from = self.resolve_sender(mail);

        let mut builder = MessageBuilder::new()
            .from(Address::new_address(
                Some(from.name.clone()),
                from.address.clone(),
            ))
            .to(address_list(to))
            .subject(mail.subject.clone())
            .html_body(mail.html_body.clone());
        if !cc.is_empty() {
            builder = builder.cc(address_list(cc));
        }
        if !bcc.is_empty() {
            builder = builder.bcc(address_list(bcc));
        }

        for (file_name, path) in &mail.attachments {
            let contents = tokio::fs::read(path).await.map_err(|source| Error::Attachment {
                path: path.clone(),
                source,
            })?;
            builder = builder.attachment("application/octet-stream", file_name.clone(), contents);
        }
        for path in &mail.inline {
            let contents = tokio::fs::read(path).await.map_err(|source| Error::Attachment {
                path: path.clone(),
                source,
            })?;
            let content_id = path.file_name().unwrap_or(path.as_str()).to_string();
            builder = builder.inline("application/octet-stream", content_id, contents);
        }

        let body = builder.write_to_vec().map_err(Error::Assemble)?;

        let mut recipients = Vec::with_capacity(to.len() + cc.len() + bcc.len());
        for recipient in to.iter().chain(cc).chain(bcc) {
            if !recipients.contains(recipient) {
                recipients.push(recipient.clone());
            }
        }

        Ok(Envelope {
            sender: from.address,
            recipients,
            body,
        })
    }

    /// A sender supplied with the request wins over the account's
    /// configured one; either way the display name falls back to the bare
    /// address.
    fn resolve_sender(&self, mail: &Mail) -> Mailbox {
        if let Some(sender) = mail.sender.as_ref().filter(|s| !s.address.is_empty()) {
            let name = if sender.name.is_empty() {
                sender.address.clone()
            } else {
                sender.name.clone()
            };
            return Mailbox {
                address: sender.address.clone(),
                name,
            };
        }
        let name = if self.account.sender_name.is_empty() {
            self.account.sender_address.clone()
        } else {
            self.account.sender_name.clone()
        };
        Mailbox {
            address: self.account.sender_address.clone(),
            name,
        }
    }
}

fn address_list(addresses: &[String]) -> Address<'static> {
    Address::new_list(
        addresses
            .iter()
            .map(|address| Address::new_address(None::<String>, address.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::config::{Encryption, PoolConfig};
    use crate::session::testing::{ScriptedFactory, ScriptedState};

    fn account() -> Account {
        Account {
            host: "smtp.example.com".into(),
            port: "587".into(),
            username: "postmaster@example.com".into(),
            password: crate::secret::conceal("app-password"),
            encryption: Encryption::StartTls,
            sender_address: "noreply@example.com".into(),
            sender_name: "Example Notifications".into(),
            verify_certs: true,
        }
    }

    fn scripted_mailer(retry_num: u32) -> (Mailer, Arc<ScriptedState>, Pool) {
        let state = Arc::new(ScriptedState::default());
        let config = PoolConfig {
            initial_cap: 0,
            max_cap: 4,
            max_idle: 4,
            idle_timeout: Duration::from_secs(60),
            ping: None,
        };
        let pool = Pool::new(config, Arc::new(ScriptedFactory::new(Arc::clone(&state))));
        let mailer = Mailer::with_pool(account(), pool.clone(), retry_num, Duration::ZERO);
        (mailer, state, pool)
    }

    async fn init_pool(pool: &Pool) {
        pool.init().await.unwrap();
    }

    fn mail() -> Mail {
        Mail {
            subject: "Quarterly report".into(),
            html_body: "<p>Attached.</p>".into(),
            ..Mail::default()
        }
    }

    #[tokio::test]
    async fn send_reuses_the_session_on_success() {
        let (mailer, state, pool) = scripted_mailer(3);
        init_pool(&pool).await;

        mailer.send(&mail(), "a@example.com").await.unwrap();
        mailer.send(&mail(), "a@example.com").await.unwrap();

        assert_eq!(state.created.load(Ordering::SeqCst), 1);
        assert_eq!(state.sent.load(Ordering::SeqCst), 2);
        assert_eq!(pool.opened(), 1);
    }

    #[tokio::test]
    async fn send_retries_with_a_fresh_session_after_a_broken_one() {
        let (mailer, state, pool) = scripted_mailer(3);
        init_pool(&pool).await;
        state.fail_next_sends.store(1, Ordering::SeqCst);

        mailer.send(&mail(), "a@example.com").await.unwrap();

        // First session failed and was discarded; the retry dialed again.
        assert_eq!(state.created.load(Ordering::SeqCst), 2);
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);
        assert_eq!(state.sent.load(Ordering::SeqCst), 1);
        assert_eq!(pool.opened(), 1);
    }

    #[tokio::test]
    async fn send_surfaces_the_last_error_when_retries_run_out() {
        let (mailer, state, pool) = scripted_mailer(2);
        init_pool(&pool).await;
        state.fail_next_sends.store(10, Ordering::SeqCst);

        let err = mailer.send(&mail(), "a@example.com").await.unwrap_err();
        assert!(matches!(err, Error::Rejected { code: 451, .. }));
        assert_eq!(state.created.load(Ordering::SeqCst), 2);
        assert_eq!(state.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.opened(), 0);
    }

    #[tokio::test]
    async fn group_send_reports_refused_recipients_as_data() {
        let (mailer, state, pool) = scripted_mailer(3);
        init_pool(&pool).await;
        state.rejected.lock().unwrap().push("b@bad.example".into());

        let rejected = mailer
            .send_group(
                &mail(),
                &["a@ok.example".into(), "b@bad.example".into()],
                &[],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(rejected, vec!["b@bad.example".to_string()]);
        assert_eq!(state.sent.load(Ordering::SeqCst), 1);
        assert_eq!(pool.opened(), 1);
    }

    #[tokio::test]
    async fn assemble_aggregates_and_deduplicates_recipients() {
        let (mailer, _state, _pool) = scripted_mailer(1);
        let envelope = mailer
            .assemble(
                &mail(),
                &["a@example.com".into(), "b@example.com".into()],
                &["c@example.com".into(), "a@example.com".into()],
                &["d@example.com".into()],
            )
            .await
            .unwrap();

        assert_eq!(
            envelope.recipients,
            vec![
                "a@example.com".to_string(),
                "b@example.com".to_string(),
                "c@example.com".to_string(),
                "d@example.com".to_string(),
            ]
        );
        assert_eq!(envelope.sender, "noreply@example.com");
        let body = String::from_utf8_lossy(&envelope.body);
        assert!(body.contains("Quarterly report"));
    }

    #[tokio::test]
    async fn assemble_fails_cleanly_on_a_missing_attachment() {
        let (mailer, _state, _pool) = scripted_mailer(1);
        let mut mail = mail();
        mail.attachments.insert(
            "report.pdf".into(),
            Utf8PathBuf::from("/nonexistent/report.pdf"),
        );

        let err = mailer
            .assemble(&mail, &["a@example.com".into()], &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Attachment { .. }));
    }

    #[test]
    fn request_sender_wins_over_the_account() {
        let (mailer, _state, _pool) = scripted_mailer(1);
        let mut mail = mail();
        mail.sender = Some(Mailbox {
            address: "alerts@example.com".into(),
            name: String::new(),
        });

        let from = mailer.resolve_sender(&mail);
        assert_eq!(from.address, "alerts@example.com");
        // Display name falls back to the bare address.
        assert_eq!(from.name, "alerts@example.com");
    }

    #[test]
    fn empty_request_sender_falls_back_to_the_account() {
        let (mailer, _state, _pool) = scripted_mailer(1);
        let mut mail = mail();
        mail.sender = Some(Mailbox {
            address: String::new(),
            name: "ignored".into(),
        });

        let from = mailer.resolve_sender(&mail);
        assert_eq!(from.address, "noreply@example.com");
        assert_eq!(from.name, "Example Notifications");
    }

    #[test]
    fn account_without_display_name_uses_its_address() {
        let (_, _state, pool) = scripted_mailer(1);
        let mut account = account();
        account.sender_name = String::new();
        let mailer = Mailer::with_pool(account, pool, 1, Duration::ZERO);

        let from = mailer.resolve_sender(&mail());
        assert_eq!(from.address, "noreply@example.com");
        assert_eq!(from.name, "noreply@example.com");
    }
}
