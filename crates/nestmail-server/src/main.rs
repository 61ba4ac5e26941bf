//! Nestmail - mail server entry point

use anyhow::Result;
use nestmail_common::config::Config;
use nestmail_core::{MailRelay, OwnerResolver, SmtpServer};
use nestmail_storage::{db::DatabasePool, DbMailStore, MailStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_logging(&config.logging.level);

    info!("Starting nestmail server...");

    let db_pool = DatabasePool::new(&config.database).await?;
    info!("Database connection established");

    let store: Arc<dyn MailStore> = Arc::new(DbMailStore::new(db_pool.clone()));
    let resolver = Arc::new(OwnerResolver::new(store.clone()));

    let mail_host = config.server.mail_host();

    // Provisioning is driven through the management boundary; the
    // listener itself only needs the store and resolver. Surface the
    // credential state at startup either way.
    if config.dns.is_configured() {
        info!("DNS provider credentials configured");
    } else {
        info!("DNS credentials not configured, mailbox provisioning unavailable");
    }

    let relay = if config.relay.enabled {
        info!("Outbound relay enabled");
        Some(Arc::new(MailRelay::new(
            config.server.domain.clone(),
            config.server.domain.clone(),
            &config.relay,
        )))
    } else {
        None
    };

    let smtp_server = Arc::new(SmtpServer::new(
        config.smtp.clone(),
        mail_host,
        config.server.domain.clone(),
        store,
        resolver,
        relay,
    ));

    info!(
        "Starting SMTP server on {}:{} (SMTP) and {}:{} (Submission)",
        config.smtp.host, config.smtp.port, config.smtp.host, config.smtp.submission_port
    );

    let mut smtp_handle = {
        let smtp_server = smtp_server.clone();
        tokio::spawn(async move { smtp_server.run_dual_port().await })
    };

    info!("Nestmail server started successfully");

    // A listener that dies is fatal; otherwise run until interrupted
    tokio::select! {
        result = &mut smtp_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    tracing::error!("SMTP server error: {}", e);
                    Err(e)
                }
                Err(e) => Err(e.into()),
            };
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    smtp_handle.abort();

    info!("Nestmail server shutdown complete");

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},nestmail=debug", level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
