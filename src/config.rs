use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, File};
use miette::{IntoDiagnostic, Result};
use serde::Deserialize;

use crate::error::Error;

/// Liveness probe applied to a session's raw handle before it is handed out.
/// Protocols that cannot cheaply probe (SMTP included) leave this unset.
pub type PingFn = Arc<dyn Fn(&mut dyn Any) -> bool + Send + Sync>;

/// Mail protocols the manager knows how to open sessions for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Smtp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Smtp => f.write_str("smtp"),
        }
    }
}

/// How the transport to the send server is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    /// TLS from the first byte (SMTPS, typically port 465).
    Tls,
    /// Plaintext connect upgraded via STARTTLS (typically port 587).
    #[default]
    StartTls,
}

/// Sizing and expiry knobs for every pool the manager creates.
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of warm sessions the pool grows to after init.
    pub initial_cap: u32,
    /// Ceiling on concurrently live sessions, idle and caller-held combined.
    pub max_cap: u32,
    /// Capacity of the idle buffer. Must be at least `max_cap` so a release
    /// can never block.
    pub max_idle: u32,
    /// A session unused for longer than this is closed instead of reused.
    pub idle_timeout: Duration,
    pub ping: Option<PingFn>,
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("initial_cap", &self.initial_cap)
            .field("max_cap", &self.max_cap)
            .field("max_idle", &self.max_idle)
            .field("idle_timeout", &self.idle_timeout)
            .field("ping", &self.ping.is_some())
            .finish()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_cap: 1,
            max_cap: 4,
            max_idle: 4,
            idle_timeout: Duration::from_secs(60),
            ping: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_cap == 0 {
            return Err(Error::InvalidPoolConfig("max_cap must be at least 1".into()));
        }
        if self.initial_cap > self.max_cap {
            return Err(Error::InvalidPoolConfig(format!(
                "initial_cap {} exceeds max_cap {}",
                self.initial_cap, self.max_cap
            )));
        }
        if self.max_idle < self.max_cap {
            return Err(Error::InvalidPoolConfig(format!(
                "max_idle {} is smaller than max_cap {}",
                self.max_idle, self.max_cap
            )));
        }
        Ok(())
    }
}

/// Everything needed to open authenticated sessions against one mail
/// platform. Also the identity under which the manager caches the pool.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub host: String,
    /// Kept as received; parsed by the protocol adapter so a bad value
    /// surfaces as a configuration error, not a dial error.
    pub port: String,
    pub username: String,
    /// At-rest encoded; revealed only by the session factory.
    pub password: String,
    pub encryption: Encryption,
    pub protocol: Protocol,
    /// Server certificate validation. Leave on outside of test setups.
    pub verify_certs: bool,
    /// Bound on dial attempts per session creation.
    pub send_retry_num: u32,
}

impl ConnectConfig {
    pub(crate) fn pool_key(&self) -> PoolKey {
        PoolKey {
            host: self.host.clone(),
            port: self.port.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            protocol: self.protocol,
        }
    }
}

/// The credential tuple identifying a pool. The password is part of the key
/// so a rotation yields a fresh pool instead of reusing sessions
/// authenticated with the old secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    host: String,
    port: String,
    username: String,
    password: String,
    protocol: Protocol,
}

/// A configured send identity: the server to relay through plus the
/// default sender mailbox.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub host: String,
    pub port: String,
    pub username: String,
    /// At-rest encoded, see [`crate::secret`].
    pub password: String,
    #[serde(default)]
    pub encryption: Encryption,
    pub sender_address: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default = "default_verify_certs")]
    pub verify_certs: bool,
}

fn default_verify_certs() -> bool {
    true
}

impl Account {
    /// Connection identity handed to the pool manager.
    pub fn connect_config(&self, send_retry_num: u32) -> ConnectConfig {
        ConnectConfig {
            host: self.host.clone(),
            port: self.port.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            encryption: self.encryption,
            protocol: Protocol::Smtp,
            verify_certs: self.verify_certs,
            send_retry_num,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Cfg {
    #[serde(default)]
    pub pool: CfgPool,
    pub account: Account,
    #[serde(default)]
    pub send: CfgSend,
    #[serde(default)]
    pub log: CfgLog,
}

#[derive(Debug, Default, Deserialize)]
pub struct CfgPool {
    pub initial_cap: Option<u32>,
    pub max_cap: Option<u32>,
    pub max_idle: Option<u32>,
    pub idle_timeout_secs: Option<u64>,
}

impl CfgPool {
    pub fn pool_config(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        let max_cap = self.max_cap.unwrap_or(defaults.max_cap);
        PoolConfig {
            initial_cap: self.initial_cap.unwrap_or(defaults.initial_cap),
            max_cap,
            max_idle: self.max_idle.unwrap_or(max_cap),
            idle_timeout: self
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            ping: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CfgSend {
    pub retry_num: Option<u32>,
    pub try_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CfgLog {
    pub level: String,
    pub format: String,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Cfg {
    pub fn load(cfg_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(cfg_path))
            .build()
            .into_diagnostic()?;

        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;

        Ok(cfg)
    }
}
