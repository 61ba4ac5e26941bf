//! Mailbox domain provisioning
//!
//! Each mailbox gets a randomly generated subdomain under the apex
//! domain with an MX record pointing back at this service. The
//! provisioner owns creation and deletion of mail_domains rows and
//! their paired DNS records.

use crate::dns::DnsProvider;
use nestmail_common::config::{DnsConfig, ProvisionConfig};
use nestmail_common::types::OwnerId;
use nestmail_common::{Error, Result};
use nestmail_storage::{MailDomain, MailStore};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SUBDOMAIN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUBDOMAIN_LEN: usize = 8;
const MAX_GENERATION_ATTEMPTS: u32 = 100;

/// Provisions and tears down mailbox domains.
///
/// The registry maps subdomain to provider record id. It is consulted
/// during generation to avoid handing out a subdomain twice, and the
/// lock is held across the whole generate/create/persist sequence so
/// concurrent create calls cannot race on the same name.
pub struct Provisioner {
    store: Arc<dyn MailStore>,
    provider: Arc<dyn DnsProvider>,
    apex_domain: String,
    mail_host: String,
    mx_priority: u16,
    record_ttl: u32,
    max_domains: i64,
    registry: Mutex<HashMap<String, String>>,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn MailStore>,
        provider: Arc<dyn DnsProvider>,
        apex_domain: String,
        mail_host: String,
        dns: &DnsConfig,
        provision: &ProvisionConfig,
    ) -> Self {
        Self {
            store,
            provider,
            apex_domain,
            mail_host,
            mx_priority: dns.mx_priority,
            record_ttl: dns.record_ttl,
            max_domains: provision.max_domains,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Provision a mailbox domain for `address`. `origin` identifies
    /// the requesting client, typically its IP, and is stored with the
    /// row so per-origin counts survive restarts.
    ///
    /// Idempotent: an address that already has a domain gets the
    /// existing row back without touching the provider.
    pub async fn create(&self, owner: OwnerId, address: &str, origin: &str) -> Result<MailDomain> {
        if let Some(existing) = self.store.find_domain_by_address(address).await? {
            return Ok(existing);
        }

        let used = self.store.count_domains(owner).await?;
        if used >= self.max_domains {
            return Err(Error::QuotaExceeded(used, self.max_domains));
        }

        let mut registry = self.registry.lock().await;

        let subdomain = generate_unique(
            &mut rand::thread_rng(),
            &registry,
            SUBDOMAIN_CHARSET,
            SUBDOMAIN_LEN,
        )?;
        let full_domain = format!("{}.{}", subdomain, self.apex_domain);

        let record_id = self
            .provider
            .create_mx_record(&subdomain, &self.mail_host, self.mx_priority, self.record_ttl)
            .await?;

        let domain = match self
            .store
            .create_domain(owner, &subdomain, &full_domain, &record_id, address, origin)
            .await
        {
            Ok(domain) => domain,
            Err(e) => {
                // Persist failed after the record was created; take the
                // record back down so it does not orphan. Best effort.
                warn!(subdomain, record_id, "Persist failed, removing DNS record");
                if let Err(cleanup_err) = self.provider.delete_record(&record_id).await {
                    warn!(record_id, error = %cleanup_err, "Compensating DNS delete failed");
                }
                return Err(e);
            }
        };

        registry.insert(subdomain.clone(), record_id);

        info!(owner, address, full_domain, "Mailbox domain provisioned");
        Ok(domain)
    }

    /// Delete a mailbox domain.
    ///
    /// The row goes first; the DNS record follows best-effort so a
    /// provider outage cannot leave a row the tenant can never remove.
    pub async fn delete(&self, owner: OwnerId, id: i64) -> Result<()> {
        let Some(domain) = self.store.get_domain(owner, id).await? else {
            return Err(Error::NotFound(format!("mail domain {}", id)));
        };

        self.store.delete_domain(owner, id).await?;

        let mut registry = self.registry.lock().await;
        registry.remove(&domain.subdomain);

        if let Err(e) = self.provider.delete_record(&domain.record_id).await {
            warn!(
                subdomain = %domain.subdomain,
                record_id = %domain.record_id,
                error = %e,
                "Failed to delete DNS record"
            );
        }

        info!(owner, full_domain = %domain.full_domain, "Mailbox domain deleted");
        Ok(())
    }

    /// List an owner's mailbox domains
    pub async fn list(&self, owner: OwnerId) -> Result<Vec<MailDomain>> {
        self.store.list_domains(owner).await
    }

    /// Count mailbox domains provisioned from one origin
    pub async fn count_for_origin(&self, origin: &str) -> Result<i64> {
        self.store.count_domains_by_origin(origin).await
    }
}

fn generate_candidate<R: Rng>(rng: &mut R, charset: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

/// Generate a subdomain absent from `registry`, giving up after a
/// bounded number of attempts.
fn generate_unique<R: Rng>(
    rng: &mut R,
    registry: &HashMap<String, String>,
    charset: &[u8],
    len: usize,
) -> Result<String> {
    for _ in 0..MAX_GENERATION_ATTEMPTS {
        let candidate = generate_candidate(rng, charset, len);
        if !registry.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::SubdomainExhausted(MAX_GENERATION_ATTEMPTS))
}
