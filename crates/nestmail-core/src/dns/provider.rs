//! DNS provider abstraction

use async_trait::async_trait;
use nestmail_common::Result;

/// Authoritative DNS operations needed for mailbox provisioning.
///
/// Implementations return the provider-assigned record id on create so
/// that the record can be removed later without a lookup.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create an MX record for `subdomain` pointing at `target`
    async fn create_mx_record(
        &self,
        subdomain: &str,
        target: &str,
        priority: u16,
        ttl: u32,
    ) -> Result<String>;

    /// Delete a record by its provider-assigned id
    async fn delete_record(&self, record_id: &str) -> Result<()>;
}
