use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("unknown mail protocol: {0}")]
    #[diagnostic(code(mailpool::unknown_protocol))]
    UnknownProtocol(String),

    #[error("invalid SMTP port: {0:?}")]
    #[diagnostic(code(mailpool::invalid_port))]
    InvalidPort(String),

    #[error("invalid pool configuration: {0}")]
    #[diagnostic(code(mailpool::invalid_pool_config))]
    InvalidPoolConfig(String),

    #[error("connection pool is closed")]
    #[diagnostic(code(mailpool::pool_closed))]
    PoolClosed,

    #[error("dial failed after {attempts} attempts")]
    #[diagnostic(code(mailpool::dial))]
    Dial {
        attempts: u32,
        #[source]
        source: mail_send::Error,
    },

    #[error("smtp conversation failed")]
    #[diagnostic(code(mailpool::smtp))]
    Smtp(#[from] mail_send::Error),

    #[error("server rejected command with {code}: {reason}")]
    Rejected { code: u16, reason: String },

    #[error("server refused every recipient")]
    #[diagnostic(code(mailpool::no_valid_recipients))]
    NoValidRecipients,

    #[error("failed to read attachment {path}")]
    #[diagnostic(code(mailpool::attachment))]
    Attachment {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to assemble message")]
    Assemble(#[source] std::io::Error),

    #[error("failed to decode stored credential: {0}")]
    #[diagnostic(code(mailpool::secret))]
    Secret(String),
}
