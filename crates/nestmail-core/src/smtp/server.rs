//! SMTP listener

use crate::relay::MailRelay;
use crate::resolver::OwnerResolver;
use crate::smtp::SmtpHandler;
use anyhow::{Context, Result};
use nestmail_common::config::SmtpConfig;
use nestmail_storage::MailStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// SMTP service type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmtpServiceType {
    /// Port 25 - inbound mail reception
    Smtp,
    /// Port 587 - mail submission
    Submission,
}

impl std::fmt::Display for SmtpServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtpServiceType::Smtp => write!(f, "SMTP"),
            SmtpServiceType::Submission => write!(f, "Submission"),
        }
    }
}

/// SMTP server accepting inbound sessions on both service ports
pub struct SmtpServer {
    config: SmtpConfig,
    mail_host: String,
    local_domain: String,
    store: Arc<dyn MailStore>,
    resolver: Arc<OwnerResolver>,
    relay: Option<Arc<MailRelay>>,
}

impl SmtpServer {
    pub fn new(
        config: SmtpConfig,
        mail_host: String,
        local_domain: String,
        store: Arc<dyn MailStore>,
        resolver: Arc<OwnerResolver>,
        relay: Option<Arc<MailRelay>>,
    ) -> Self {
        Self {
            config,
            mail_host,
            local_domain,
            store,
            resolver,
            relay,
        }
    }

    /// Run both SMTP (port 25) and Submission (port 587) listeners
    pub async fn run_dual_port(self: Arc<Self>) -> Result<()> {
        let smtp_server = self.clone();
        let submission_server = self.clone();

        let smtp_handle =
            tokio::spawn(async move { smtp_server.run_service(SmtpServiceType::Smtp).await });

        let submission_handle = tokio::spawn(async move {
            submission_server
                .run_service(SmtpServiceType::Submission)
                .await
        });

        // Neither listener returns unless its bind or accept loop
        // fails, and a dead listener must take the process down.
        tokio::select! {
            result = smtp_handle => match result {
                Ok(Ok(())) => {
                    info!("SMTP service stopped");
                    Ok(())
                }
                Ok(Err(e)) => Err(e.context("SMTP service failed")),
                Err(e) => Err(anyhow::anyhow!("SMTP task panicked: {}", e)),
            },
            result = submission_handle => match result {
                Ok(Ok(())) => {
                    info!("Submission service stopped");
                    Ok(())
                }
                Ok(Err(e)) => Err(e.context("Submission service failed")),
                Err(e) => Err(anyhow::anyhow!("Submission task panicked: {}", e)),
            },
        }
    }

    /// Run a single listener. A bind failure is fatal; per-connection
    /// errors are logged and the loop keeps accepting.
    pub async fn run_service(&self, service_type: SmtpServiceType) -> Result<()> {
        let port = match service_type {
            SmtpServiceType::Smtp => self.config.port,
            SmtpServiceType::Submission => self.config.submission_port,
        };

        let addr = format!("{}:{}", self.config.host, port);
        let listener = TcpListener::bind(&addr).await?;

        info!("{} server listening on {}", service_type, addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("{}: accepted connection from {}", service_type, peer_addr);

                    let handler = SmtpHandler::new(
                        self.mail_host.clone(),
                        self.local_domain.clone(),
                        self.store.clone(),
                        self.resolver.clone(),
                        self.relay.clone(),
                        peer_addr.to_string(),
                    );

                    let service_name = service_type.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(stream).await {
                            error!("{} session error from {}: {}", service_name, peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("{}: Failed to accept connection: {}", service_type, e);
                }
            }
        }
    }
}
