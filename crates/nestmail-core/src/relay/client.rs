//! Minimal outbound SMTP client

use nestmail_common::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// A parsed SMTP reply, possibly multiline
#[derive(Debug)]
pub(crate) struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    pub fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }
}

/// Client side of one outbound SMTP conversation.
///
/// Generic over the transport so the same command sequence runs before
/// and after a STARTTLS upgrade.
pub(crate) struct SmtpClient<S: AsyncRead + AsyncWrite + Unpin> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
    ehlo_host: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpClient<S> {
    pub fn new(stream: S, ehlo_host: &str) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            ehlo_host: ehlo_host.to_string(),
        }
    }

    /// Read one reply, following continuation lines ("250-...") until
    /// the final space-separated line.
    pub async fn read_reply(&mut self) -> Result<SmtpReply> {
        let mut lines = Vec::new();
        let mut code: u16 = 0;

        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Relay(format!("Read failed: {}", e)))?;
            if n == 0 {
                return Err(Error::Relay("Connection closed".to_string()));
            }

            // Remote input; byte 3 may not be a char boundary
            let Some(code_str) = line.get(..3) else {
                return Err(Error::Relay(format!("Invalid reply: {:?}", line)));
            };
            let reply_code: u16 = code_str
                .parse()
                .map_err(|_| Error::Relay(format!("Invalid reply: {:?}", line)))?;

            if code == 0 {
                code = reply_code;
            } else if code != reply_code {
                return Err(Error::Relay(format!(
                    "Inconsistent reply codes: {} vs {}",
                    code, reply_code
                )));
            }

            let separator = line.as_bytes().get(3).copied().unwrap_or(b' ');
            lines.push(line.get(4..).unwrap_or("").trim_end().to_string());

            if separator == b' ' {
                break;
            }
        }

        Ok(SmtpReply { code, lines })
    }

    pub async fn command(&mut self, cmd: &str) -> Result<SmtpReply> {
        self.writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await
            .map_err(|e| Error::Relay(format!("Write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Relay(format!("Write failed: {}", e)))?;
        self.read_reply().await
    }

    pub async fn read_greeting(&mut self) -> Result<SmtpReply> {
        self.read_reply().await
    }

    pub async fn ehlo(&mut self) -> Result<SmtpReply> {
        let host = self.ehlo_host.clone();
        self.command(&format!("EHLO {}", host)).await
    }

    pub async fn helo(&mut self) -> Result<SmtpReply> {
        let host = self.ehlo_host.clone();
        self.command(&format!("HELO {}", host)).await
    }

    pub async fn mail_from(&mut self, address: &str) -> Result<SmtpReply> {
        self.command(&format!("MAIL FROM:<{}>", address)).await
    }

    pub async fn rcpt_to(&mut self, address: &str) -> Result<SmtpReply> {
        self.command(&format!("RCPT TO:<{}>", address)).await
    }

    /// Send DATA, then the body with dot-stuffing, then the terminator
    pub async fn data(&mut self, body: &str) -> Result<SmtpReply> {
        let reply = self.command("DATA").await?;
        if !(reply.code >= 300 && reply.code < 400) {
            return Err(Error::Relay(format!(
                "DATA rejected: {} {}",
                reply.code,
                reply.lines.join(" ")
            )));
        }

        for line in body.lines() {
            if line.starts_with('.') {
                self.writer
                    .write_all(format!(".{}\r\n", line).as_bytes())
                    .await
                    .map_err(|e| Error::Relay(format!("Write failed: {}", e)))?;
            } else {
                self.writer
                    .write_all(format!("{}\r\n", line).as_bytes())
                    .await
                    .map_err(|e| Error::Relay(format!("Write failed: {}", e)))?;
            }
        }

        self.writer
            .write_all(b".\r\n")
            .await
            .map_err(|e| Error::Relay(format!("Write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Relay(format!("Write failed: {}", e)))?;

        self.read_reply().await
    }

    pub async fn starttls(&mut self) -> Result<SmtpReply> {
        self.command("STARTTLS").await
    }

    pub async fn quit(&mut self) -> Result<SmtpReply> {
        self.command("QUIT").await
    }

    /// Recover the underlying stream for a TLS upgrade. Any buffered
    /// input is dropped; the server is silent after its STARTTLS reply.
    pub fn into_inner(self) -> S {
        self.reader.into_inner().unsplit(self.writer)
    }
}
