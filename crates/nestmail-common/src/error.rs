//! Error types for nestmail

use thiserror::Error;

/// Main error type for nestmail
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DNS provider error: {0}")]
    DnsProvider(String),

    #[error("Failed to generate a unique subdomain after {0} attempts")]
    SubdomainExhausted(u32),

    #[error("Mailbox quota exceeded: {0} of {1} domains in use")]
    QuotaExceeded(i64, i64),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for nestmail
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    // Session and relay code propagate transport errors with `?`
    #[test]
    fn test_io_error_converts() {
        fn read() -> Result<()> {
            Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
            Ok(())
        }
        assert!(matches!(read(), Err(Error::Io(_))));
    }
}
