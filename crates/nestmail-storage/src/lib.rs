//! Nestmail Storage - SQLite-backed mail and domain store
//!
//! This crate provides the persistent store for received mail and
//! provisioned mailbox domains, behind the [`MailStore`] trait.

pub mod db;
pub mod models;
pub mod store;

pub use db::DatabasePool;
pub use models::{Mail, MailDomain};
pub use store::{DbMailStore, MailStore};
