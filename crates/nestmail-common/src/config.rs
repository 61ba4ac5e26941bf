//! Configuration for nestmail

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server identity configuration
    pub server: ServerConfig,

    /// SMTP listener configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// DNS provider configuration
    #[serde(default)]
    pub dns: DnsConfig,

    /// Mailbox provisioning configuration
    #[serde(default)]
    pub provision: ProvisionConfig,

    /// Outbound relay configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Apex domain under which mailbox subdomains are generated
    pub domain: String,

    /// Hostname of this service's inbound mail exchanger,
    /// used as the MX target and the SMTP banner.
    /// Defaults to `mail.<domain>` when empty.
    #[serde(default)]
    pub mail_host: String,

    /// Public IP of this host (informational, kept for provider setup)
    #[serde(default)]
    pub public_ip: String,
}

impl ServerConfig {
    /// Resolved inbound mail host
    pub fn mail_host(&self) -> String {
        if self.mail_host.is_empty() {
            format!("mail.{}", self.domain)
        } else {
            self.mail_host.clone()
        }
    }
}

/// SMTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Bind host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// SMTP port (inbound)
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Submission port
    #[serde(default = "default_submission_port")]
    pub submission_port: u16,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            submission_port: default_submission_port(),
        }
    }
}

fn default_smtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_submission_port() -> u16 {
    587
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Maximum pool connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./nestmail.db")
}

fn default_max_connections() -> u32 {
    5
}

/// DNS provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Provider API credentials (DNSPod login token pair)
    #[serde(default)]
    pub secret_id: String,

    #[serde(default)]
    pub secret_key: String,

    /// Provider API base URL
    #[serde(default = "default_dns_api_url")]
    pub api_url: String,

    /// TTL applied to created records, seconds
    #[serde(default = "default_record_ttl")]
    pub record_ttl: u32,

    /// Preference value applied to created MX records
    #[serde(default = "default_mx_priority")]
    pub mx_priority: u16,

    /// Provider request timeout in seconds
    #[serde(default = "default_dns_timeout")]
    pub timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            secret_id: String::new(),
            secret_key: String::new(),
            api_url: default_dns_api_url(),
            record_ttl: default_record_ttl(),
            mx_priority: default_mx_priority(),
            timeout_secs: default_dns_timeout(),
        }
    }
}

impl DnsConfig {
    /// True when both credentials are present
    pub fn is_configured(&self) -> bool {
        !self.secret_id.is_empty() && !self.secret_key.is_empty()
    }
}

fn default_dns_api_url() -> String {
    "https://dnsapi.cn".to_string()
}

fn default_record_ttl() -> u32 {
    600
}

fn default_mx_priority() -> u16 {
    10
}

fn default_dns_timeout() -> u64 {
    10
}

/// Mailbox provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Maximum live mailbox domains per owner
    #[serde(default = "default_max_domains")]
    pub max_domains: i64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            max_domains: default_max_domains(),
        }
    }
}

fn default_max_domains() -> i64 {
    5
}

/// Outbound relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Enable best-effort relay of messages for non-local recipients
    #[serde(default)]
    pub enabled: bool,

    /// Full-handshake connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Port probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            connect_timeout_secs: default_connect_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./nestmail.toml"),
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/nestmail/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}
