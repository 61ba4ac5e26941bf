//! Nestmail Core - inbound SMTP, owner resolution, provisioning, relay
//!
//! This crate provides the core service functionality for nestmail:
//! the inbound SMTP session engine, recipient-to-owner resolution,
//! mailbox/DNS provisioning, and the best-effort outbound relay.

pub mod dns;
pub mod relay;
pub mod resolver;
pub mod smtp;

pub use dns::{DnsPodProvider, DnsProvider, Provisioner};
pub use relay::MailRelay;
pub use resolver::OwnerResolver;
pub use smtp::{SmtpHandler, SmtpServer};
