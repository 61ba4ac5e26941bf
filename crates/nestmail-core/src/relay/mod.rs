//! Best-effort outbound relay
//!
//! One synchronous delivery attempt per call: resolve the recipient
//! domain's MX hosts, walk host/port candidates in preference order,
//! stop at the first full command sequence that succeeds. There is no
//! queue and no retry; a failed relay is reported to the caller and
//! dropped.

mod client;

use client::{SmtpClient, SmtpReply};
use nestmail_common::config::RelayConfig;
use nestmail_common::types::EmailAddress;
use nestmail_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const SUBMISSION_PORT: u16 = 587;

/// Providers known to accept inbound mail only on port 25. Everything
/// else also gets the submission port as a second candidate.
const PORT_25_ONLY_PROVIDERS: &[&str] = &[
    "gmail", "google", "outlook", "hotmail", "yahoo", "qq", "163", "126",
];

/// A delivery host with the ports worth trying on it
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HostCandidate {
    pub host: String,
    pub ports: Vec<u16>,
}

/// Outbound mail relay
pub struct MailRelay {
    local_domain: String,
    ehlo_host: String,
    connect_timeout: Duration,
    probe_timeout: Duration,
}

impl MailRelay {
    pub fn new(local_domain: String, ehlo_host: String, config: &RelayConfig) -> Self {
        Self {
            local_domain,
            ehlo_host,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }

    /// Attempt delivery of `raw` to `to` once
    pub async fn deliver(&self, from: &str, to: &str, raw: &str) -> Result<()> {
        let domain = recipient_domain(to)
            .ok_or_else(|| Error::Relay(format!("Invalid recipient address: {}", to)))?;

        if domain.eq_ignore_ascii_case(&self.local_domain) {
            return Err(Error::Relay(format!(
                "Refusing to relay to local domain: {}",
                to
            )));
        }

        let hosts = self.resolve_hosts(&domain).await;
        let candidates: Vec<HostCandidate> = hosts
            .into_iter()
            .map(|host| HostCandidate {
                ports: candidate_ports(&host),
                host,
            })
            .collect();

        self.deliver_to_candidates(&candidates, from, to, raw).await
    }

    /// MX hosts for `domain` in ascending preference order; ties keep
    /// resolver order. A failed lookup falls back to the domain itself.
    async fn resolve_hosts(&self, domain: &str) -> Vec<String> {
        use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
        use trust_dns_resolver::TokioAsyncResolver;

        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        match resolver.mx_lookup(domain).await {
            Ok(mx) => {
                let records: Vec<(u16, String)> = mx
                    .iter()
                    .map(|r| (r.preference(), r.exchange().to_string()))
                    .collect();
                let hosts = order_hosts(records);
                if hosts.is_empty() {
                    warn!(domain, "Empty MX response, trying domain directly");
                    vec![domain.to_string()]
                } else {
                    hosts
                }
            }
            Err(e) => {
                warn!(domain, error = %e, "MX lookup failed, trying domain directly");
                vec![domain.to_string()]
            }
        }
    }

    /// Walk the candidate list: probe each host's ports, then run the
    /// full protocol on the ports that accepted a connection. First
    /// success wins; otherwise the most recent error is returned.
    pub(crate) async fn deliver_to_candidates(
        &self,
        candidates: &[HostCandidate],
        from: &str,
        to: &str,
        raw: &str,
    ) -> Result<()> {
        let mut last_err = Error::Relay(format!("No delivery candidates for {}", to));

        for candidate in candidates {
            let mut open_ports = Vec::new();
            for &port in &candidate.ports {
                if self.probe(&candidate.host, port).await {
                    open_ports.push(port);
                } else {
                    debug!(host = %candidate.host, port, "Port closed, skipping");
                }
            }

            if open_ports.is_empty() {
                last_err = Error::Relay(format!("No open ports on {}", candidate.host));
                continue;
            }

            for port in open_ports {
                match self.attempt(&candidate.host, port, from, to, raw).await {
                    Ok(()) => {
                        info!(host = %candidate.host, port, to, "Relayed message");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(host = %candidate.host, port, error = %e, "Delivery attempt failed");
                        last_err = e;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Cheap connect check so closed ports do not eat a full handshake
    /// timeout each.
    async fn probe(&self, host: &str, port: u16) -> bool {
        matches!(
            timeout(self.probe_timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    async fn attempt(&self, host: &str, port: u16, from: &str, to: &str, raw: &str) -> Result<()> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Relay(format!("Connect timed out: {}:{}", host, port)))?
            .map_err(|e| Error::Relay(format!("Connect failed: {}:{}: {}", host, port, e)))?;

        let mut client = SmtpClient::new(stream, &self.ehlo_host);
        check(client.read_greeting().await?)?;

        let ehlo = client.ehlo().await?;
        if !ehlo.is_positive() {
            check(client.helo().await?)?;
        }

        // Opportunistic STARTTLS on the submission port; co-located
        // hosts never offer a usable certificate so they stay clear.
        if port == SUBMISSION_PORT && !is_local_host(host) {
            let reply = client.starttls().await?;
            if reply.code == 220 {
                let tls_stream = upgrade(client.into_inner(), host).await?;
                let mut client = SmtpClient::new(tls_stream, &self.ehlo_host);
                check(client.ehlo().await?)?;
                return finish(&mut client, from, to, raw).await;
            }
            debug!(host, "STARTTLS declined, continuing unencrypted");
        }

        finish(&mut client, from, to, raw).await
    }
}

async fn finish<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut SmtpClient<S>,
    from: &str,
    to: &str,
    raw: &str,
) -> Result<()> {
    check(client.mail_from(from).await?)?;
    check(client.rcpt_to(to).await?)?;
    check(client.data(raw).await?)?;
    let _ = client.quit().await;
    Ok(())
}

fn check(reply: SmtpReply) -> Result<()> {
    if reply.is_positive() {
        Ok(())
    } else {
        Err(Error::Relay(format!(
            "Rejected: {} {}",
            reply.code,
            reply.lines.join(" ")
        )))
    }
}

/// TLS upgrade with certificate checks disabled; remote MX hosts
/// routinely present self-signed certificates and opportunistic
/// encryption is still preferable to none.
async fn upgrade(
    stream: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::ClientConfig;
    use tokio_rustls::TlsConnector;

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Relay(format!("Invalid TLS server name {}: {}", host, e)))?;

    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Relay(format!("TLS handshake with {} failed: {}", host, e)))
}

#[derive(Debug)]
struct AcceptAnyCert;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &tokio_rustls::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        use tokio_rustls::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn recipient_domain(address: &str) -> Option<String> {
    EmailAddress::parse(address).map(|a| a.domain.to_ascii_lowercase())
}

/// Sort MX records by ascending preference. The sort is stable so
/// equal-preference records keep resolver order. Trailing dots on
/// exchange names are stripped.
fn order_hosts(mut records: Vec<(u16, String)>) -> Vec<String> {
    records.sort_by_key(|(pref, _)| *pref);
    records
        .into_iter()
        .map(|(_, host)| host.trim_end_matches('.').to_string())
        .collect()
}

fn candidate_ports(host: &str) -> Vec<u16> {
    let host = host.to_ascii_lowercase();
    if PORT_25_ONLY_PROVIDERS.iter().any(|p| host.contains(p)) {
        vec![25]
    } else {
        vec![25, SUBMISSION_PORT]
    }
}

fn is_local_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost"
        || host == "127.0.0.1"
        || host.starts_with("mail.")
        || host.ends_with(".local")
        || host.ends_with(".lan")
}
