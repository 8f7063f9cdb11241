use std::time::Duration;

use clap::Parser;
use miette::{Context, IntoDiagnostic, Result};
use tokio::io::AsyncReadExt;
use tracing::{info, warn, Level};

use mailpool::{Cfg, Mail, Mailer, PoolManager};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Recipient address (repeatable)
    #[arg(short, long, required = true)]
    to: Vec<String>,

    /// Cc address (repeatable)
    #[arg(long)]
    cc: Vec<String>,

    /// Bcc address (repeatable)
    #[arg(long)]
    bcc: Vec<String>,

    /// Message subject
    #[arg(short, long)]
    subject: String,

    /// HTML body; read from stdin when omitted
    #[arg(short, long)]
    body: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Cfg::load(&args.config).wrap_err("error loading configuration")?;

    let level: Level = cfg
        .log
        .level
        .parse()
        .into_diagnostic()
        .wrap_err("error parsing log level")?;

    let ts = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_line_number(false)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MAILPOOL_LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mailpool=info")),
        );

    if cfg.log.format == "json" {
        ts.json().init();
    } else {
        ts.init();
    }

    let body = match args.body {
        Some(body) => body,
        None => {
            let mut body = String::new();
            tokio::io::stdin()
                .read_to_string(&mut body)
                .await
                .into_diagnostic()
                .wrap_err("error reading message body from stdin")?;
            body
        }
    };

    let retry_num = cfg.send.retry_num.unwrap_or(3);
    let try_interval = Duration::from_millis(cfg.send.try_interval_ms.unwrap_or(500));

    let manager = PoolManager::new(cfg.pool.pool_config())?;
    let mailer = Mailer::new(cfg.account.clone(), &manager, retry_num, try_interval).await?;

    let mail = Mail {
        subject: args.subject,
        html_body: body,
        ..Mail::default()
    };

    let rejected = mailer.send_group(&mail, &args.to, &args.cc, &args.bcc).await?;
    if rejected.is_empty() {
        info!("message delivered");
    } else {
        warn!(?rejected, "message delivered, but some recipients were refused");
    }

    manager.close_all().await;
    Ok(())
}
