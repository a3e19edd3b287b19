//! SMTP submission client: plain, implicit TLS and STARTTLS sessions.

use base64::{Engine, engine::general_purpose::STANDARD};
use herald_common::{incoming, outgoing};
use tokio::net::TcpStream;

use super::{
    connection::Connection,
    error::{ClientError, Result},
    response::Response,
};

/// Size of a single socket read.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of an unparsed reply before the session is abandoned (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// An SMTP client for a single submission session.
///
/// Every command method checks the reply code and turns a refusal into
/// [`ClientError::SmtpError`], so a session reads as a straight line of `?`.
pub struct SmtpClient {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    server_domain: String,
    accept_invalid_certs: bool,
    capabilities: Vec<String>,
}

impl SmtpClient {
    fn with_connection(connection: Connection, server_domain: String) -> Self {
        Self {
            connection: Some(connection),
            buffer: Vec::with_capacity(BUFFER_SIZE),
            server_domain,
            accept_invalid_certs: false,
            capabilities: Vec::new(),
        }
    }

    /// Opens a plain TCP connection to `addr`.
    ///
    /// `server_domain` is the name checked against the certificate if the
    /// session is later upgraded with STARTTLS.
    pub async fn connect(addr: &str, server_domain: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::with_connection(
            Connection::Plain(stream),
            server_domain.into(),
        ))
    }

    /// Opens a connection to `addr` and performs the TLS handshake before
    /// any SMTP traffic (implicit TLS, as on port 465).
    pub async fn connect_tls(
        addr: &str,
        server_domain: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let server_domain = server_domain.into();
        let stream = TcpStream::connect(addr).await?;
        let connection = Connection::Plain(stream)
            .into_tls(&server_domain, accept_invalid_certs)
            .await?;

        Ok(Self::with_connection(connection, server_domain).accept_invalid_certs(accept_invalid_certs))
    }

    /// Sets whether to accept invalid TLS certificates on STARTTLS.
    ///
    /// Default is `false`.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Whether the session is currently encrypted.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_tls)
    }

    /// Extensions advertised by the last EHLO.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Whether the last EHLO advertised `extension` (case-insensitive).
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.capabilities.iter().any(|capability| {
            capability
                .split([' ', '='])
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(extension))
        })
    }

    /// SASL mechanisms listed in the `AUTH` capability.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .filter_map(|capability| {
                capability
                    .strip_prefix("AUTH ")
                    .or_else(|| capability.strip_prefix("AUTH="))
            })
            .flat_map(str::split_whitespace)
            .map(str::to_ascii_uppercase)
            .collect()
    }

    /// Reads the server greeting, which must be a 220.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await?.ensure(&[220])
    }

    /// Sends a raw command and reads the reply without checking its code.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_line(command, command).await?;
        self.read_response().await
    }

    /// Sends EHLO and records the advertised extensions.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?.ensure(&[250])?;
        self.capabilities = response.capabilities();
        Ok(response)
    }

    /// Sends STARTTLS and upgrades the connection.
    ///
    /// The advertised extensions are cleared; the caller must EHLO again.
    pub async fn starttls(&mut self) -> Result<Response> {
        if !self.supports("STARTTLS") {
            return Err(ClientError::Unsupported("STARTTLS".to_string()));
        }

        let response = self.command("STARTTLS").await?.ensure(&[220])?;

        let connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
        self.connection = Some(
            connection
                .into_tls(&self.server_domain, self.accept_invalid_certs)
                .await?,
        );
        self.buffer.clear();
        self.capabilities.clear();

        Ok(response)
    }

    /// Authenticates with PLAIN, or LOGIN when PLAIN is not offered.
    pub async fn auth(&mut self, username: &str, password: &str) -> Result<Response> {
        let mechanisms = self.auth_mechanisms();

        if mechanisms.iter().any(|m| m == "PLAIN") {
            let token = STANDARD.encode(format!("\0{username}\0{password}"));
            self.send_line(&format!("AUTH PLAIN {token}"), "AUTH PLAIN ****")
                .await?;
            return self.read_response().await?.ensure(&[235]);
        }

        if mechanisms.iter().any(|m| m == "LOGIN") {
            self.command("AUTH LOGIN").await?.ensure(&[334])?;
            self.send_line(&STANDARD.encode(username), "****").await?;
            self.read_response().await?.ensure(&[334])?;
            self.send_line(&STANDARD.encode(password), "****").await?;
            return self.read_response().await?.ensure(&[235]);
        }

        Err(ClientError::Unsupported(if mechanisms.is_empty() {
            "AUTH".to_string()
        } else {
            format!("AUTH PLAIN or LOGIN (offered: {})", mechanisms.join(" "))
        }))
    }

    /// Sends `MAIL FROM:<from>`. `from` must be a bare address.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>"))
            .await?
            .ensure(&[250])
    }

    /// Sends `RCPT TO:<to>`.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>"))
            .await?
            .ensure(&[250, 251])
    }

    /// Sends DATA, expecting the 354 go-ahead.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await?.ensure(&[354])
    }

    /// Sends the message body, dot-stuffed and terminated by `.`.
    pub async fn send_message(&mut self, message: &[u8]) -> Result<Response> {
        let payload = dot_stuff(message);
        outgoing!(bytes = payload.len(), "<message content>");

        let connection = self.connection.as_mut().ok_or(ClientError::ConnectionClosed)?;
        connection.send(&payload).await?;
        connection.flush().await?;

        self.read_response().await?.ensure(&[250])
    }

    /// Sends QUIT.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await?.ensure(&[221])
    }

    async fn send_line(&mut self, line: &str, logged: &str) -> Result<()> {
        outgoing!("{logged}");

        let connection = self.connection.as_mut().ok_or(ClientError::ConnectionClosed)?;
        connection.send(format!("{line}\r\n").as_bytes()).await?;
        connection.flush().await
    }

    async fn read_response(&mut self) -> Result<Response> {
        let mut chunk = [0u8; BUFFER_SIZE];

        loop {
            if let Some((response, consumed)) = Response::parse_response(&self.buffer)? {
                self.buffer.drain(..consumed);
                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer.len() >= MAX_BUFFER_SIZE {
                return Err(ClientError::ParseError(format!(
                    "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                )));
            }

            let connection = self.connection.as_mut().ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut chunk).await?;
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Escape leading dots and append the end-of-data marker.
fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 8);
    let mut line_start = true;

    for &byte in message {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        line_start = byte == b'\n';
    }

    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}
