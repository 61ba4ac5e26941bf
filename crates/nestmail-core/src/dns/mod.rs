//! DNS provider integration and mailbox domain provisioning

mod dnspod;
mod provider;
mod provision;

pub use dnspod::DnsPodProvider;
pub use provider::DnsProvider;
pub use provision::Provisioner;
