//! Pooled outbound SMTP dispatch.
//!
//! Opening an authenticated SMTP session costs a TCP handshake, a TLS
//! handshake and an AUTH exchange; this crate amortizes that across many
//! concurrent sends by caching live sessions per credential tuple. The
//! [`PoolManager`] keeps one bounded [`Pool`] per mail platform and
//! account, and the [`Mailer`] drives assemble/acquire/send/release with
//! bounded retries on top of it.

pub mod config;
pub mod error;
pub mod mailer;
pub mod pool;
pub mod secret;
pub mod session;

pub use config::{Account, Cfg, ConnectConfig, Encryption, PoolConfig, Protocol};
pub use error::Error;
pub use mailer::{Mail, Mailbox, Mailer};
pub use pool::manager::PoolManager;
pub use pool::Pool;
pub use session::{Envelope, Session, SessionFactory};
