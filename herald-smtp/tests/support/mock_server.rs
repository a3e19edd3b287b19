//! Scripted SMTP server for exercising the client and the delivery engine.
//!
//! Replies are looked up by verb and can be overridden one at a time.
//! Commands are recorded for assertions. Slow replies and dropped
//! connections can be injected, and the server can offer STARTTLS or speak
//! TLS from the first byte using the self-signed certificate in `certs/`.
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> std::io::Result<()> {
//! let server = MockSmtpServer::builder()
//!     .respond("RCPT", 550, "User unknown")
//!     .build()
//!     .await?;
//!
//! // Point a client at server.port() and inspect server.commands().await
//! server.shutdown();
//! # Ok(())
//! # }
//! ```
#![allow(dead_code)] // Shared by several test crates; not every helper is used by each.

use std::{
    collections::HashMap,
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};

/// Pseudo-verb for the banner sent on connect.
pub const GREETING: &str = "GREETING";
/// Pseudo-verb for the reply to the terminating `.` line.
pub const DOT: &str = ".";

const CERT: &[u8] = include_bytes!("certs/cert.pem");
const KEY: &[u8] = include_bytes!("certs/key.pem");

/// A command as the server saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    /// Everything after `AUTH `, e.g. `PLAIN AHVzZXIAc2VjcmV0`.
    Auth(String),
    /// A line sent in answer to a 334 challenge.
    AuthResponse(String),
    /// Argument of MAIL, e.g. `FROM:<a@b.com>`.
    MailFrom(String),
    /// Argument of RCPT, e.g. `TO:<c@d.com>`.
    RcptTo(String),
    Data,
    /// Raw bytes between the 354 and the terminating dot line.
    MessageContent(Vec<u8>),
    Quit,
    StartTls,
    /// Not a command: the TLS handshake completed at this point.
    Handshake,
    Other(String),
}

fn line(code: u16, text: &str) -> String {
    format!("{code} {text}\r\n")
}

fn multiline(code: u16, lines: &[String]) -> String {
    let last = lines.len().saturating_sub(1);
    lines.iter().enumerate().fold(String::new(), |mut out, (i, text)| {
        let separator = if i < last { '-' } else { ' ' };
        let _ = write!(out, "{code}{separator}{text}\r\n");
        out
    })
}

fn acceptor() -> std::io::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut &CERT[..]).collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut &KEY[..])?.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key in fixture")
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(std::io::Error::other)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// What the server offers for encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tls {
    Off,
    StartTls,
    Implicit,
}

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Plain,
    Upgraded,
    Implicit,
}

impl Stage {
    const fn greets(self) -> bool {
        !matches!(self, Self::Upgraded)
    }

    const fn secured(self) -> bool {
        !matches!(self, Self::Plain)
    }
}

enum Next<S> {
    Done,
    Upgrade(S),
}

struct Script {
    replies: HashMap<&'static str, String>,
    ehlo_code: u16,
    ehlo_lines: Vec<String>,
    tls: Tls,
    acceptor: Option<TlsAcceptor>,
    response_delay: Option<Duration>,
    hang_up_after: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        let replies = HashMap::from([
            (GREETING, line(220, "Mock SMTP Server")),
            ("AUTH", line(235, "Authentication successful")),
            ("MAIL", line(250, "OK")),
            ("RCPT", line(250, "OK")),
            ("DATA", line(354, "Start mail input; end with <CRLF>.<CRLF>")),
            (DOT, line(250, "OK: Message accepted")),
            ("QUIT", line(221, "Bye")),
            ("STARTTLS", line(502, "Command not implemented")),
        ]);

        Self {
            replies,
            ehlo_code: 250,
            ehlo_lines: ["localhost", "AUTH PLAIN LOGIN", "SIZE 10000"]
                .map(String::from)
                .to_vec(),
            tls: Tls::Off,
            acceptor: None,
            response_delay: None,
            hang_up_after: None,
        }
    }
}

impl Script {
    fn reply(&self, verb: &str) -> &str {
        self.replies
            .get(verb)
            .map_or("500 Unknown command\r\n", String::as_str)
    }

    /// STARTTLS is only advertised while the link is still in the clear.
    fn ehlo(&self, stage: Stage) -> String {
        let mut lines = self.ehlo_lines.clone();
        if self.tls == Tls::StartTls && !stage.secured() {
            lines.push("STARTTLS".to_string());
        }
        multiline(self.ehlo_code, &lines)
    }
}

struct Session<'a> {
    script: &'a Script,
    commands: &'a RwLock<Vec<SmtpCommand>>,
}

impl Session<'_> {
    async fn record(&self, command: SmtpCommand) {
        self.commands.write().await.push(command);
    }

    async fn send(
        &self,
        writer: &mut (impl AsyncWriteExt + Unpin),
        reply: &str,
    ) -> std::io::Result<()> {
        if let Some(delay) = self.script.response_delay {
            tokio::time::sleep(delay).await;
        }
        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await
    }

    async fn handshake(
        &self,
        stream: TcpStream,
    ) -> std::io::Result<tokio_rustls::server::TlsStream<TcpStream>> {
        let acceptor = self
            .script
            .acceptor
            .as_ref()
            .ok_or_else(|| std::io::Error::other("TLS is not enabled on this server"))?;

        let stream = acceptor.accept(stream).await?;
        self.record(SmtpCommand::Handshake).await;
        Ok(stream)
    }

    async fn serve(&self, stream: TcpStream) -> std::io::Result<()> {
        let mut answered = 0;

        if self.script.tls == Tls::Implicit {
            let stream = self.handshake(stream).await?;
            self.converse(stream, Stage::Implicit, &mut answered).await?;
            return Ok(());
        }

        if let Next::Upgrade(stream) = self.converse(stream, Stage::Plain, &mut answered).await? {
            let stream = self.handshake(stream).await?;
            self.converse(stream, Stage::Upgraded, &mut answered).await?;
        }

        Ok(())
    }

    async fn converse<S>(
        &self,
        stream: S,
        stage: Stage,
        answered: &mut usize,
    ) -> std::io::Result<Next<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        let mut buffer = String::new();

        if stage.greets() {
            stream.write_all(self.script.reply(GREETING).as_bytes()).await?;
            stream.flush().await?;
        }

        loop {
            if self.script.hang_up_after.is_some_and(|n| *answered >= n) {
                return Ok(Next::Done);
            }

            buffer.clear();
            let Ok(read) = timeout(Duration::from_secs(10), stream.read_line(&mut buffer)).await
            else {
                return Ok(Next::Done);
            };
            if read? == 0 {
                return Ok(Next::Done);
            }
            *answered += 1;

            let received = buffer.trim_end_matches(['\r', '\n']);
            tracing::debug!("Mock server received: {received}");

            let (verb, argument) = received.split_once(' ').unwrap_or((received, ""));
            let verb = verb.to_ascii_uppercase();
            let argument = argument.to_string();

            match verb.as_str() {
                "EHLO" => {
                    self.record(SmtpCommand::Ehlo(argument)).await;
                    self.send(&mut stream, &self.script.ehlo(stage)).await?;
                    continue;
                }
                "STARTTLS" => {
                    self.record(SmtpCommand::StartTls).await;
                    if self.script.tls == Tls::StartTls && !stage.secured() {
                        self.send(&mut stream, &line(220, "Ready to start TLS")).await?;
                        return Ok(Next::Upgrade(stream.into_inner()));
                    }
                }
                "MAIL" => self.record(SmtpCommand::MailFrom(argument)).await,
                "RCPT" => self.record(SmtpCommand::RcptTo(argument)).await,
                "AUTH" => {
                    let login = argument.eq_ignore_ascii_case("LOGIN");
                    self.record(SmtpCommand::Auth(argument)).await;

                    if login {
                        for prompt in ["VXNlcm5hbWU6", "UGFzc3dvcmQ6"] {
                            self.send(&mut stream, &line(334, prompt)).await?;
                            buffer.clear();
                            if stream.read_line(&mut buffer).await? == 0 {
                                return Ok(Next::Done);
                            }
                            let answer = buffer.trim_end_matches(['\r', '\n']).to_string();
                            self.record(SmtpCommand::AuthResponse(answer)).await;
                        }
                    }
                }
                "DATA" => {
                    self.record(SmtpCommand::Data).await;
                    let reply = self.script.reply("DATA");
                    self.send(&mut stream, reply).await?;
                    if !reply.starts_with("354") {
                        continue;
                    }

                    let mut content = Vec::new();
                    let mut data_line = Vec::new();
                    loop {
                        data_line.clear();
                        if stream.read_until(b'\n', &mut data_line).await? == 0 {
                            return Ok(Next::Done);
                        }
                        if data_line == b".\r\n" {
                            break;
                        }
                        content.extend_from_slice(&data_line);
                    }

                    self.record(SmtpCommand::MessageContent(content)).await;
                    self.send(&mut stream, self.script.reply(DOT)).await?;
                    continue;
                }
                "QUIT" => {
                    self.record(SmtpCommand::Quit).await;
                    self.send(&mut stream, self.script.reply("QUIT")).await?;
                    return Ok(Next::Done);
                }
                _ => self.record(SmtpCommand::Other(received.to_string())).await,
            }

            self.send(&mut stream, self.script.reply(&verb)).await?;
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    stopped: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command received so far, across all connections.
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// Index of the first recorded command matching `predicate`.
    pub async fn position(&self, predicate: impl Fn(&SmtpCommand) -> bool) -> Option<usize> {
        self.commands().await.iter().position(predicate)
    }

    /// The message bodies received so far.
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands()
            .await
            .into_iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content),
                _ => None,
            })
            .collect()
    }

    /// Number of connections accepted.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    /// Answer `verb` (or [`GREETING`] / [`DOT`]) with a single-line reply.
    #[must_use]
    pub fn respond(mut self, verb: &'static str, code: u16, text: &str) -> Self {
        self.script.replies.insert(verb, line(code, text));
        self
    }

    /// Replace the EHLO reply; the first entry is the greeting line.
    #[must_use]
    pub fn ehlo(mut self, code: u16, lines: &[&str]) -> Self {
        self.script.ehlo_code = code;
        self.script.ehlo_lines = lines.iter().map(ToString::to_string).collect();
        self
    }

    /// Advertise STARTTLS and upgrade the connection when asked.
    #[must_use]
    pub const fn starttls(mut self) -> Self {
        self.script.tls = Tls::StartTls;
        self
    }

    /// Handshake before the greeting, as on port 465.
    #[must_use]
    pub const fn implicit_tls(mut self) -> Self {
        self.script.tls = Tls::Implicit;
        self
    }

    /// Wait before every reply after the greeting.
    #[must_use]
    pub const fn response_delay(mut self, delay: Duration) -> Self {
        self.script.response_delay = Some(delay);
        self
    }

    /// Close the connection once `count` commands have been read.
    #[must_use]
    pub const fn hang_up_after(mut self, count: usize) -> Self {
        self.script.hang_up_after = Some(count);
        self
    }

    /// Bind to an ephemeral loopback port and start serving.
    pub async fn build(mut self) -> std::io::Result<MockSmtpServer> {
        if self.script.tls != Tls::Off {
            self.script.acceptor = Some(acceptor()?);
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = MockSmtpServer {
            addr,
            commands: Arc::default(),
            stopped: Arc::default(),
            connections: Arc::default(),
        };

        let script = Arc::new(self.script);
        let commands = Arc::clone(&server.commands);
        let stopped = Arc::clone(&server.stopped);
        let connections = Arc::clone(&server.connections);

        tokio::spawn(async move {
            while !stopped.load(Ordering::Relaxed) {
                // Short accept timeout so the stop flag is noticed.
                let Ok(Ok((stream, _))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                connections.fetch_add(1, Ordering::Relaxed);
                let script = Arc::clone(&script);
                let commands = Arc::clone(&commands);

                tokio::spawn(async move {
                    let session = Session {
                        script: &script,
                        commands: &commands,
                    };
                    if let Err(e) = session.serve(stream).await {
                        tracing::debug!("Mock server client error: {e}");
                    }
                });
            }
        });

        Ok(server)
    }
}
