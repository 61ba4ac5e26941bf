//! Database models

use chrono::{DateTime, Utc};
use nestmail_common::types::OwnerId;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Provisioned mailbox domain.
///
/// One row per live mailbox identity: the generated subdomain, the DNS
/// record backing it, and the address it receives mail for. `full_domain`
/// and `address` are unique at the schema level.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct MailDomain {
    pub id: i64,
    pub owner_id: OwnerId,
    pub subdomain: String,
    pub full_domain: String,
    pub record_id: String,
    pub address: String,
    pub origin: String,
    pub created_at: DateTime<Utc>,
}

/// Received mail
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Mail {
    pub id: i64,
    pub owner_id: OwnerId,
    pub mail_from: String,
    /// Recipient list, stored as a JSON array
    pub mail_to: String,
    pub subject: String,
    pub body: String,
    pub raw_data: String,
    pub received_at: DateTime<Utc>,
}

impl Mail {
    /// Decode the recipient list
    pub fn recipients(&self) -> Vec<String> {
        serde_json::from_str(&self.mail_to).unwrap_or_default()
    }
}
