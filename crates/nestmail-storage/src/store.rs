//! Mail/domain store trait and its SQLite implementation

use crate::db::DatabasePool;
use crate::models::{Mail, MailDomain};
use async_trait::async_trait;
use chrono::Utc;
use nestmail_common::types::OwnerId;
use nestmail_common::{Error, Result};
use tracing::debug;

/// Persistent store for received mail and provisioned mailbox domains.
///
/// Address lookups are exact-match and case-sensitive; the schema's
/// uniqueness constraints depend on the stored form.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Append a received message
    async fn save_mail(
        &self,
        owner: OwnerId,
        from: &str,
        to: &[String],
        subject: &str,
        body: &str,
        raw: &str,
    ) -> Result<()>;

    /// Look up the mailbox domain owning an address
    async fn find_domain_by_address(&self, address: &str) -> Result<Option<MailDomain>>;

    /// Persist a provisioned mailbox domain. `origin` records where the
    /// provisioning request came from, e.g. a client IP.
    async fn create_domain(
        &self,
        owner: OwnerId,
        subdomain: &str,
        full_domain: &str,
        record_id: &str,
        address: &str,
        origin: &str,
    ) -> Result<MailDomain>;

    /// Fetch one mailbox domain by owner and id
    async fn get_domain(&self, owner: OwnerId, id: i64) -> Result<Option<MailDomain>>;

    /// Delete a mailbox domain row
    async fn delete_domain(&self, owner: OwnerId, id: i64) -> Result<()>;

    /// List an owner's mailbox domains
    async fn list_domains(&self, owner: OwnerId) -> Result<Vec<MailDomain>>;

    /// Count an owner's live mailbox domains
    async fn count_domains(&self, owner: OwnerId) -> Result<i64>;

    /// Count mailbox domains provisioned from one origin
    async fn count_domains_by_origin(&self, origin: &str) -> Result<i64>;

    /// List an owner's received mail, newest first
    async fn list_mails(&self, owner: OwnerId, limit: i64, offset: i64) -> Result<Vec<Mail>>;

    /// Fetch one message by owner and id
    async fn get_mail(&self, owner: OwnerId, id: i64) -> Result<Option<Mail>>;

    /// Count an owner's received mail
    async fn count_mails(&self, owner: OwnerId) -> Result<i64>;
}

/// SQLite-backed mail store
pub struct DbMailStore {
    pool: DatabasePool,
}

impl DbMailStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MailStore for DbMailStore {
    async fn save_mail(
        &self,
        owner: OwnerId,
        from: &str,
        to: &[String],
        subject: &str,
        body: &str,
        raw: &str,
    ) -> Result<()> {
        let to_json = serde_json::to_string(to)
            .map_err(|e| Error::Internal(format!("Failed to encode recipients: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO mails (owner_id, mail_from, mail_to, subject, body, raw_data, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(owner)
        .bind(from)
        .bind(&to_json)
        .bind(subject)
        .bind(body)
        .bind(raw)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to insert mail: {}", e)))?;

        debug!(owner, from, "Mail persisted");
        Ok(())
    }

    async fn find_domain_by_address(&self, address: &str) -> Result<Option<MailDomain>> {
        sqlx::query_as::<_, MailDomain>("SELECT * FROM mail_domains WHERE address = ?")
            .bind(address)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn create_domain(
        &self,
        owner: OwnerId,
        subdomain: &str,
        full_domain: &str,
        record_id: &str,
        address: &str,
        origin: &str,
    ) -> Result<MailDomain> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO mail_domains (owner_id, subdomain, full_domain, record_id, address, origin, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(owner)
        .bind(subdomain)
        .bind(full_domain)
        .bind(record_id)
        .bind(address)
        .bind(origin)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(format!("Failed to insert mail domain: {}", e)))?;

        Ok(MailDomain {
            id: result.last_insert_rowid(),
            owner_id: owner,
            subdomain: subdomain.to_string(),
            full_domain: full_domain.to_string(),
            record_id: record_id.to_string(),
            address: address.to_string(),
            origin: origin.to_string(),
            created_at: now,
        })
    }

    async fn get_domain(&self, owner: OwnerId, id: i64) -> Result<Option<MailDomain>> {
        sqlx::query_as::<_, MailDomain>(
            "SELECT * FROM mail_domains WHERE owner_id = ? AND id = ?",
        )
        .bind(owner)
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn delete_domain(&self, owner: OwnerId, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM mail_domains WHERE owner_id = ? AND id = ?")
            .bind(owner)
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("mail domain {}", id)));
        }
        Ok(())
    }

    async fn list_domains(&self, owner: OwnerId) -> Result<Vec<MailDomain>> {
        sqlx::query_as::<_, MailDomain>(
            "SELECT * FROM mail_domains WHERE owner_id = ? ORDER BY created_at DESC",
        )
        .bind(owner)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn count_domains(&self, owner: OwnerId) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM mail_domains WHERE owner_id = ?")
                .bind(owner)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }

    async fn count_domains_by_origin(&self, origin: &str) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM mail_domains WHERE origin = ?")
                .bind(origin)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }

    async fn list_mails(&self, owner: OwnerId, limit: i64, offset: i64) -> Result<Vec<Mail>> {
        let limit = if limit <= 0 { 20 } else { limit };
        sqlx::query_as::<_, Mail>(
            r#"
            SELECT * FROM mails
            WHERE owner_id = ?
            ORDER BY received_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(owner)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_mail(&self, owner: OwnerId, id: i64) -> Result<Option<Mail>> {
        sqlx::query_as::<_, Mail>("SELECT * FROM mails WHERE owner_id = ? AND id = ?")
            .bind(owner)
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn count_mails(&self, owner: OwnerId) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mails WHERE owner_id = ?")
            .bind(owner)
            .fetch_one(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }
}
