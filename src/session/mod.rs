//! Protocol-polymorphic session abstraction the pool hands out.
//!
//! A [`Session`] is one open, authenticated connection to a mail platform.
//! The pool never inspects what travels over it; senders push assembled
//! [`Envelope`]s through whichever protocol implementation backs the trait.

use std::any::Any;

use async_trait::async_trait;

use crate::error::Error;

pub mod smtp;

/// An assembled, protocol-neutral outbound message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Envelope sender address (SMTP MAIL FROM).
    pub sender: String,
    /// Every address the transport must deliver to: To, Cc and Bcc.
    pub recipients: Vec<String>,
    /// Raw RFC 5322 message bytes produced by the MIME builder.
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Session: Send {
    /// Transmits one assembled message over the authenticated transport.
    /// Any error means the session may be broken and must be discarded.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), Error>;

    /// Like [`Session::send`], but reports the recipients the server
    /// refused instead of failing the whole transmission. Protocols without
    /// per-recipient reporting deliver normally and report nothing.
    async fn send_group(&mut self, envelope: &Envelope) -> Result<Vec<String>, Error> {
        self.send(envelope).await?;
        Ok(Vec::new())
    }

    /// Shuts the transport down. Consuming the session guarantees it is
    /// never closed twice or reused afterwards.
    async fn close(self: Box<Self>) -> Result<(), Error>;

    /// Escape hatch to the protocol-specific client for advanced
    /// operations, also used by [`crate::config::PoolConfig::ping`].
    fn as_any(&mut self) -> &mut dyn Any;
}

/// Opens fresh sessions for one credential tuple. One factory backs one
/// pool; the manager builds it from the [`crate::config::ConnectConfig`]
/// through the protocol's registered adapter.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Session>, Error>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted session doubles shared by the pool, manager and mailer
    //! tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    pub(crate) struct ScriptedState {
        pub created: AtomicUsize,
        pub closed: AtomicUsize,
        pub sent: AtomicUsize,
        /// When set, `create` fails instead of producing a session.
        pub fail_dials: AtomicBool,
        /// Number of upcoming send calls that should fail.
        pub fail_next_sends: AtomicUsize,
        /// When set, newly created sessions report as unhealthy to pings.
        pub next_unhealthy: AtomicBool,
        /// Recipients `send_group` reports as refused.
        pub rejected: Mutex<Vec<String>>,
    }

    pub(crate) struct ScriptedSession {
        pub state: Arc<ScriptedState>,
        pub healthy: bool,
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn send(&mut self, _envelope: &Envelope) -> Result<(), Error> {
            if self.state.fail_next_sends.load(Ordering::SeqCst) > 0 {
                self.state.fail_next_sends.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Rejected {
                    code: 451,
                    reason: "requested action aborted".into(),
                });
            }
            self.state.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_group(&mut self, envelope: &Envelope) -> Result<Vec<String>, Error> {
            self.send(envelope).await?;
            Ok(self.state.rejected.lock().unwrap().clone())
        }

        async fn close(self: Box<Self>) -> Result<(), Error> {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&mut self) -> &mut dyn Any {
            self
        }
    }

    pub(crate) struct ScriptedFactory {
        state: Arc<ScriptedState>,
    }

    impl ScriptedFactory {
        pub fn new(state: Arc<ScriptedState>) -> Self {
            ScriptedFactory { state }
        }
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn create(&self) -> Result<Box<dyn Session>, Error> {
            if self.state.fail_dials.load(Ordering::SeqCst) {
                return Err(Error::Rejected {
                    code: 421,
                    reason: "service not available".into(),
                });
            }
            self.state.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSession {
                state: Arc::clone(&self.state),
                healthy: !self.state.next_unhealthy.load(Ordering::SeqCst),
            }))
        }
    }
}
