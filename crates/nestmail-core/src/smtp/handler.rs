//! SMTP session handler

use crate::relay::MailRelay;
use crate::resolver::OwnerResolver;
use nestmail_common::types::Envelope;
use nestmail_common::Result;
use nestmail_storage::MailStore;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

/// SMTP session state
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    /// Banner sent, HELO/EHLO not yet received
    Greeting,
    Ready,
    HaveSender,
    HaveRecipients,
}

/// Per-connection SMTP session handler.
///
/// Generic over the transport so sessions can be driven through an
/// in-memory duplex stream in tests.
pub struct SmtpHandler {
    mail_host: String,
    local_domain: String,
    store: Arc<dyn MailStore>,
    resolver: Arc<OwnerResolver>,
    relay: Option<Arc<MailRelay>>,
    peer: String,
}

impl SmtpHandler {
    pub fn new(
        mail_host: String,
        local_domain: String,
        store: Arc<dyn MailStore>,
        resolver: Arc<OwnerResolver>,
        relay: Option<Arc<MailRelay>>,
        peer: String,
    ) -> Self {
        Self {
            mail_host,
            local_domain,
            store,
            resolver,
            relay,
            peer,
        }
    }

    /// Drive an SMTP session to completion
    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(self, stream: S) -> Result<()> {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let mut state = SessionState::Greeting;
        let mut envelope = Envelope::default();

        self.send_response(&mut writer, 220, &format!("{} SMTP Service Ready", self.mail_host))
            .await?;

        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                debug!(peer = %self.peer, "Client disconnected");
                break;
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            debug!(peer = %self.peer, command = %line, "SMTP command");

            let (command, args) = parse_command(line);

            match command.to_uppercase().as_str() {
                "HELO" | "EHLO" => {
                    envelope.reset();
                    envelope.helo = Some(args.to_string());
                    state = SessionState::Ready;
                    self.send_response(&mut writer, 250, &format!("{} Hello", self.mail_host))
                        .await?;
                }

                "MAIL" => {
                    if state != SessionState::Ready {
                        self.send_response(&mut writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if let Some(addr) = parse_mail_from(args) {
                        envelope.from = Some(addr);
                        state = SessionState::HaveSender;
                        self.send_response(&mut writer, 250, "OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "Syntax error").await?;
                    }
                }

                "RCPT" => {
                    if state != SessionState::HaveSender && state != SessionState::HaveRecipients {
                        self.send_response(&mut writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if let Some(addr) = parse_rcpt_to(args) {
                        envelope.to.push(addr);
                        state = SessionState::HaveRecipients;
                        self.send_response(&mut writer, 250, "OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "Syntax error").await?;
                    }
                }

                "DATA" => {
                    if state != SessionState::HaveRecipients {
                        self.send_response(&mut writer, 503, "Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    self.send_response(&mut writer, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    let data = self.read_data(&mut reader).await?;

                    match self.process_message(&envelope, &data).await {
                        Ok(()) => {
                            self.send_response(&mut writer, 250, "OK: Message accepted for delivery")
                                .await?;
                        }
                        Err(reply) => {
                            self.send_response(&mut writer, 550, reply).await?;
                        }
                    }

                    envelope.reset();
                    state = SessionState::Ready;
                }

                "RSET" => {
                    envelope.reset();
                    state = SessionState::Ready;
                    self.send_response(&mut writer, 250, "OK").await?;
                }

                "NOOP" => {
                    self.send_response(&mut writer, 250, "OK").await?;
                }

                "QUIT" => {
                    self.send_response(&mut writer, 221, "Bye").await?;
                    break;
                }

                _ => {
                    self.send_response(&mut writer, 500, "Command not recognized")
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Read message data until a line holding a single `.`.
    ///
    /// Lines arrive through a buffered reader, so a transport read that
    /// returns a fragment (or several lines at once) never splits or
    /// merges protocol lines; the terminator is matched against whole
    /// accumulated lines only.
    async fn read_data<R: AsyncRead + Unpin>(
        &self,
        reader: &mut BufReader<R>,
    ) -> Result<String> {
        let mut data = String::new();
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                return Err(nestmail_common::Error::Smtp(
                    "Connection closed during DATA".to_string(),
                ));
            }

            if line.trim_end_matches(['\r', '\n']) == "." {
                break;
            }

            // Keep original line endings; raw bytes are persisted as received
            data.push_str(&line);
        }

        Ok(data)
    }

    /// Parse, attribute, and persist a completed message.
    ///
    /// Returns the rejection reply text on failure.
    async fn process_message(
        &self,
        envelope: &Envelope,
        data: &str,
    ) -> std::result::Result<(), &'static str> {
        let parsed = if data.is_empty() {
            None
        } else {
            mail_parser::MessageParser::default().parse(data.as_bytes())
        };
        let Some(parsed) = parsed else {
            warn!(peer = %self.peer, "Failed to parse message");
            return Err("Failed to parse message");
        };

        let subject = parsed.subject().unwrap_or("").to_string();
        let body = parsed.body_text(0).map(|s| s.to_string()).unwrap_or_default();

        let sender = envelope.from.clone().unwrap_or_default();
        let owner = self.resolver.resolve(&envelope.to).await;

        if let Err(e) = self
            .store
            .save_mail(owner, &sender, &envelope.to, &subject, &body, data)
            .await
        {
            warn!(peer = %self.peer, error = %e, "Failed to persist message");
            return Err("Failed to process message");
        }

        info!(
            peer = %self.peer,
            owner,
            from = %sender,
            recipients = envelope.to.len(),
            subject = %subject,
            "Message accepted"
        );

        // Best-effort relay for recipients outside our own domain. The
        // sender has already been acknowledged, so outcomes are only logged.
        if let Some(relay) = &self.relay {
            for recipient in &envelope.to {
                if self.is_local_recipient(recipient) {
                    continue;
                }
                let relay = relay.clone();
                let from = sender.clone();
                let to = recipient.clone();
                let raw = data.to_string();
                tokio::spawn(async move {
                    if let Err(e) = relay.deliver(&from, &to, &raw).await {
                        warn!(recipient = %to, error = %e, "Relay failed");
                    }
                });
            }
        }

        Ok(())
    }

    /// True when the recipient's domain is the apex or one of its subdomains
    fn is_local_recipient(&self, address: &str) -> bool {
        match address.rsplit_once('@') {
            Some((_, domain)) => {
                let domain = domain.to_lowercase();
                let apex = self.local_domain.to_lowercase();
                domain == apex || domain.ends_with(&format!(".{}", apex))
            }
            None => true,
        }
    }

    /// Send an SMTP response
    async fn send_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!(peer = %self.peer, reply = %response.trim_end(), "SMTP reply");
        Ok(())
    }
}

/// Parse an SMTP command line into verb and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((verb, args)) => (verb, args.trim()),
        None => (line, ""),
    }
}

/// Parse `MAIL FROM:<address>` arguments
fn parse_mail_from(args: &str) -> Option<String> {
    let args = args.trim();
    if args.len() >= 5 && args[..5].eq_ignore_ascii_case("FROM:") {
        Some(extract_address(&args[5..]))
    } else {
        None
    }
}

/// Parse `RCPT TO:<address>` arguments
fn parse_rcpt_to(args: &str) -> Option<String> {
    let args = args.trim();
    if args.len() >= 3 && args[..3].eq_ignore_ascii_case("TO:") {
        Some(extract_address(&args[3..]))
    } else {
        None
    }
}

/// Strip surrounding whitespace and angle brackets from an address
fn extract_address(s: &str) -> String {
    s.trim().trim_matches(|c| c == '<' || c == '>').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nestmail_common::types::OwnerId;
    use nestmail_common::Error;
    use nestmail_storage::{Mail, MailDomain, MailStore};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[derive(Debug, Clone, PartialEq)]
    struct SavedMail {
        owner: OwnerId,
        from: String,
        to: Vec<String>,
        subject: String,
        body: String,
        raw: String,
    }

    /// In-memory store double recording persist calls
    struct RecordingStore {
        owners: HashMap<String, OwnerId>,
        saved: Mutex<Vec<SavedMail>>,
        fail_save: bool,
    }

    impl RecordingStore {
        fn new(owners: &[(&str, OwnerId)]) -> Self {
            Self {
                owners: owners
                    .iter()
                    .map(|(a, o)| (a.to_string(), *o))
                    .collect(),
                saved: Mutex::new(Vec::new()),
                fail_save: false,
            }
        }

        fn failing() -> Self {
            Self {
                owners: HashMap::new(),
                saved: Mutex::new(Vec::new()),
                fail_save: true,
            }
        }

        fn saved(&self) -> Vec<SavedMail> {
            self.saved.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailStore for RecordingStore {
        async fn save_mail(
            &self,
            owner: OwnerId,
            from: &str,
            to: &[String],
            subject: &str,
            body: &str,
            raw: &str,
        ) -> nestmail_common::Result<()> {
            if self.fail_save {
                return Err(Error::Database("injected failure".to_string()));
            }
            self.saved.lock().unwrap().push(SavedMail {
                owner,
                from: from.to_string(),
                to: to.to_vec(),
                subject: subject.to_string(),
                body: body.to_string(),
                raw: raw.to_string(),
            });
            Ok(())
        }

        async fn find_domain_by_address(
            &self,
            address: &str,
        ) -> nestmail_common::Result<Option<MailDomain>> {
            Ok(self.owners.get(address).map(|owner| MailDomain {
                id: 1,
                owner_id: *owner,
                subdomain: "sub".to_string(),
                full_domain: "sub.apex.test".to_string(),
                record_id: "rec".to_string(),
                address: address.to_string(),
                origin: String::new(),
                created_at: chrono::Utc::now(),
            }))
        }

        async fn create_domain(
            &self,
            _owner: OwnerId,
            _subdomain: &str,
            _full_domain: &str,
            _record_id: &str,
            _address: &str,
            _origin: &str,
        ) -> nestmail_common::Result<MailDomain> {
            unimplemented!()
        }

        async fn get_domain(
            &self,
            _owner: OwnerId,
            _id: i64,
        ) -> nestmail_common::Result<Option<MailDomain>> {
            Ok(None)
        }

        async fn delete_domain(&self, _owner: OwnerId, _id: i64) -> nestmail_common::Result<()> {
            Ok(())
        }

        async fn list_domains(&self, _owner: OwnerId) -> nestmail_common::Result<Vec<MailDomain>> {
            Ok(Vec::new())
        }

        async fn count_domains(&self, _owner: OwnerId) -> nestmail_common::Result<i64> {
            Ok(0)
        }

        async fn count_domains_by_origin(&self, _origin: &str) -> nestmail_common::Result<i64> {
            Ok(0)
        }

        async fn list_mails(
            &self,
            _owner: OwnerId,
            _limit: i64,
            _offset: i64,
        ) -> nestmail_common::Result<Vec<Mail>> {
            Ok(Vec::new())
        }

        async fn get_mail(&self, _owner: OwnerId, _id: i64) -> nestmail_common::Result<Option<Mail>> {
            Ok(None)
        }

        async fn count_mails(&self, _owner: OwnerId) -> nestmail_common::Result<i64> {
            Ok(0)
        }
    }

    fn handler(store: Arc<RecordingStore>) -> SmtpHandler {
        let resolver = Arc::new(OwnerResolver::new(store.clone() as Arc<dyn MailStore>));
        SmtpHandler::new(
            "mail.apex.test".to_string(),
            "apex.test".to_string(),
            store,
            resolver,
            None,
            "test-peer".to_string(),
        )
    }

    /// Run a full session, writing `input` to the handler either all at
    /// once or one byte per write, and collect the reply lines.
    async fn run_session(store: Arc<RecordingStore>, input: &str, byte_at_a_time: bool) -> Vec<String> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let handler = handler(store);
        let session = tokio::spawn(async move { handler.handle(server).await });

        if byte_at_a_time {
            for byte in input.as_bytes() {
                client.write_all(std::slice::from_ref(byte)).await.unwrap();
            }
        } else {
            client.write_all(input.as_bytes()).await.unwrap();
        }
        client.flush().await.unwrap();

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        session.await.unwrap().unwrap();

        output.lines().map(|l| l.to_string()).collect()
    }

    fn codes(replies: &[String]) -> Vec<u16> {
        replies.iter().map(|l| l[..3].parse().unwrap()).collect()
    }

    const FULL_TRANSACTION: &str = "HELO client.test\r\n\
        MAIL FROM:<a@external.test>\r\n\
        RCPT TO:<alice@tenant1.apex.test>\r\n\
        RCPT TO:<bob@tenant1.apex.test>\r\n\
        DATA\r\n\
        Subject: greetings\r\n\
        \r\n\
        hello there\r\n\
        .\r\n\
        QUIT\r\n";

    #[tokio::test]
    async fn test_full_transaction_persists_once() {
        let store = Arc::new(RecordingStore::new(&[("alice@tenant1.apex.test", 7)]));
        let replies = run_session(store.clone(), FULL_TRANSACTION, false).await;

        assert_eq!(codes(&replies), vec![220, 250, 250, 250, 250, 354, 250, 221]);

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].owner, 7);
        assert_eq!(saved[0].from, "a@external.test");
        assert_eq!(
            saved[0].to,
            vec![
                "alice@tenant1.apex.test".to_string(),
                "bob@tenant1.apex.test".to_string()
            ]
        );
        assert_eq!(saved[0].subject, "greetings");
        assert_eq!(saved[0].body.trim_end(), "hello there");
        assert!(saved[0].raw.contains("Subject: greetings"));
        assert!(!saved[0].raw.contains("\r\n.\r\n"));
    }

    #[tokio::test]
    async fn test_fragmented_delivery_matches_single_read() {
        let store_whole = Arc::new(RecordingStore::new(&[("alice@tenant1.apex.test", 7)]));
        let store_bytes = Arc::new(RecordingStore::new(&[("alice@tenant1.apex.test", 7)]));

        let whole = run_session(store_whole.clone(), FULL_TRANSACTION, false).await;
        let bytes = run_session(store_bytes.clone(), FULL_TRANSACTION, true).await;

        assert_eq!(whole, bytes);
        assert_eq!(store_whole.saved(), store_bytes.saved());
    }

    #[tokio::test]
    async fn test_unprovisioned_recipient_still_persisted() {
        let store = Arc::new(RecordingStore::new(&[]));
        let input = "HELO c\r\n\
            MAIL FROM:<a@external.test>\r\n\
            RCPT TO:<unknown@apex.test>\r\n\
            DATA\r\n\
            Subject: x\r\n\
            \r\n\
            y\r\n\
            .\r\n\
            QUIT\r\n";
        let replies = run_session(store.clone(), input, false).await;
        assert_eq!(*codes(&replies).last().unwrap(), 221);

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].owner, 0);
    }

    #[tokio::test]
    async fn test_rcpt_before_mail_rejected() {
        let store = Arc::new(RecordingStore::new(&[]));
        let input = "HELO c\r\n\
            RCPT TO:<x@y.test>\r\n\
            QUIT\r\n";
        let replies = run_session(store.clone(), input, false).await;
        assert_eq!(codes(&replies), vec![220, 250, 503, 221]);
        assert!(store.saved().is_empty());
    }

    #[tokio::test]
    async fn test_mail_before_helo_rejected() {
        let store = Arc::new(RecordingStore::new(&[]));
        let input = "MAIL FROM:<a@b.test>\r\nQUIT\r\n";
        let replies = run_session(store, input, false).await;
        assert_eq!(codes(&replies), vec![220, 503, 221]);
    }

    #[tokio::test]
    async fn test_rset_clears_transaction() {
        let store = Arc::new(RecordingStore::new(&[]));
        let input = "HELO c\r\n\
            MAIL FROM:<a@b.test>\r\n\
            RCPT TO:<x@apex.test>\r\n\
            RSET\r\n\
            DATA\r\n\
            QUIT\r\n";
        let replies = run_session(store, input, false).await;
        // DATA after RSET is out of sequence again
        assert_eq!(codes(&replies), vec![220, 250, 250, 250, 250, 503, 221]);
    }

    #[tokio::test]
    async fn test_unrecognized_command() {
        let store = Arc::new(RecordingStore::new(&[]));
        let input = "HELO c\r\nBOGUS\r\nNOOP\r\nQUIT\r\n";
        let replies = run_session(store, input, false).await;
        assert_eq!(codes(&replies), vec![220, 250, 500, 250, 221]);
    }

    #[tokio::test]
    async fn test_malformed_mail_syntax() {
        let store = Arc::new(RecordingStore::new(&[]));
        let input = "HELO c\r\nMAIL SENDER:<a@b.test>\r\nQUIT\r\n";
        let replies = run_session(store, input, false).await;
        assert_eq!(codes(&replies), vec![220, 250, 501, 221]);
    }

    #[tokio::test]
    async fn test_persist_failure_rejects_message() {
        let store = Arc::new(RecordingStore::failing());
        let input = "HELO c\r\n\
            MAIL FROM:<a@b.test>\r\n\
            RCPT TO:<x@apex.test>\r\n\
            DATA\r\n\
            Subject: x\r\n\
            \r\n\
            y\r\n\
            .\r\n\
            NOOP\r\n\
            QUIT\r\n";
        let replies = run_session(store, input, false).await;
        // 550 on the message, but the session stays usable
        assert_eq!(codes(&replies), vec![220, 250, 250, 250, 354, 550, 250, 221]);
    }

    #[tokio::test]
    async fn test_unparsable_message_rejected() {
        let store = Arc::new(RecordingStore::new(&[]));
        let input = "HELO c\r\n\
            MAIL FROM:<a@b.test>\r\n\
            RCPT TO:<x@apex.test>\r\n\
            DATA\r\n\
            .\r\n\
            QUIT\r\n";
        let replies = run_session(store.clone(), input, false).await;
        assert_eq!(codes(&replies), vec![220, 250, 250, 250, 354, 550, 221]);
        assert!(store.saved().is_empty());
    }

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            parse_mail_from("FROM:<user@example.com>"),
            Some("user@example.com".to_string())
        );
        assert_eq!(
            parse_mail_from("from: <user@example.com> "),
            Some("user@example.com".to_string())
        );
        assert_eq!(parse_mail_from("SENDER:<u@e.com>"), None);
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse_rcpt_to("TO:<user@example.com>"),
            Some("user@example.com".to_string())
        );
        assert_eq!(parse_rcpt_to("to: user@example.com"), Some("user@example.com".to_string()));
        assert_eq!(parse_rcpt_to("<user@example.com>"), None);
    }
}
