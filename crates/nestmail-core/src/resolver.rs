//! Recipient-to-owner resolution

use nestmail_common::types::{OwnerId, UNASSIGNED_OWNER};
use nestmail_storage::MailStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Maps an arriving message's primary recipient to the owning tenant.
///
/// Lookup is exact-match and case-sensitive against the provisioned
/// address index. A miss (or a store failure) resolves to the unassigned
/// owner so inbound mail to unknown addresses is never dropped here.
pub struct OwnerResolver {
    store: Arc<dyn MailStore>,
}

impl OwnerResolver {
    pub fn new(store: Arc<dyn MailStore>) -> Self {
        Self { store }
    }

    /// Resolve the owner of a message from its recipient list.
    ///
    /// Only the first recipient participates in attribution.
    pub async fn resolve(&self, recipients: &[String]) -> OwnerId {
        let Some(address) = recipients.first() else {
            return UNASSIGNED_OWNER;
        };

        match self.store.find_domain_by_address(address).await {
            Ok(Some(domain)) => {
                debug!(address = %address, owner = domain.owner_id, "Recipient resolved");
                domain.owner_id
            }
            Ok(None) => {
                debug!(address = %address, "Recipient not provisioned, attributing to unassigned owner");
                UNASSIGNED_OWNER
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Owner lookup failed, attributing to unassigned owner");
                UNASSIGNED_OWNER
            }
        }
    }
}
