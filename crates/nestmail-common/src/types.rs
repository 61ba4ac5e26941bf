//! Common types for nestmail

use serde::{Deserialize, Serialize};

/// Identifier of the tenant that owns a mailbox and its messages.
pub type OwnerId = i64;

/// Owner id recorded for messages whose recipient was never provisioned.
/// Such mail is still persisted, just without tenant attribution.
pub const UNASSIGNED_OWNER: OwnerId = 0;

/// Email address split into local part and domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.splitn(2, '@').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            Some(Self::new(parts[0], parts[1]))
        } else {
            None
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Smtp("Invalid email address".to_string()))
    }
}

/// Message envelope collected over one SMTP transaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender (MAIL FROM)
    pub from: Option<String>,

    /// Recipients (RCPT TO), in arrival order
    pub to: Vec<String>,

    /// HELO/EHLO hostname
    pub helo: Option<String>,
}

impl Envelope {
    /// Drop any in-progress sender and recipients
    pub fn reset(&mut self) {
        self.from = None;
        self.to.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
    }

    #[test]
    fn test_envelope_reset() {
        let mut envelope = Envelope {
            from: Some("a@b.test".to_string()),
            to: vec!["c@d.test".to_string()],
            helo: Some("client.test".to_string()),
        };
        envelope.reset();
        assert!(envelope.from.is_none());
        assert!(envelope.to.is_empty());
        // HELO identity survives a transaction reset
        assert!(envelope.helo.is_some());
    }
}
