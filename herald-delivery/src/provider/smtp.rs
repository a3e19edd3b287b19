//! Relay submission over SMTP.

use std::{fmt, future::Future, net::IpAddr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use herald_common::address::{self, envelope_address};
use herald_smtp::{HtmlMessage, SmtpClient, message::message_id};
use herald_store::Job;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Phase, Provider, ProviderError, QuotaInfo, SendReceipt, rate::RateWindows};
use crate::error::{DeliveryError, PermanentError, SystemError, TemporaryError};

const NAME: &str = "smtp";

/// How the connection to the relay is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SecurityMode {
    /// Plain connect, then upgrade with STARTTLS before authenticating.
    StartTls,
    /// TLS from the first byte.
    ImplicitTls,
    /// Plain connect, upgraded with STARTTLS when the relay offers it.
    Plain,
}

impl SecurityMode {
    /// The conventional mode for a submission port: 587 is STARTTLS, 465 is
    /// implicit TLS, anything else is plain with opportunistic STARTTLS.
    #[must_use]
    pub const fn for_port(port: u16) -> Self {
        match port {
            587 => Self::StartTls,
            465 => Self::ImplicitTls,
            _ => Self::Plain,
        }
    }
}

/// Per-phase limits for one SMTP session, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SmtpTimeouts {
    #[serde(default = "default_command_timeout")]
    pub connect_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub greeting_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub ehlo_secs: u64,

    /// Covers the STARTTLS command and the handshake.
    #[serde(default = "default_command_timeout")]
    pub starttls_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub auth_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub mail_from_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub rcpt_to_secs: u64,

    /// Applies separately to the DATA command and to the message transfer.
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_command_timeout(),
            greeting_secs: default_command_timeout(),
            ehlo_secs: default_command_timeout(),
            starttls_secs: default_command_timeout(),
            auth_secs: default_command_timeout(),
            mail_from_secs: default_command_timeout(),
            rcpt_to_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

impl SmtpTimeouts {
    /// Limit for a phase of the session.
    #[must_use]
    pub const fn for_phase(&self, phase: Phase) -> Duration {
        Duration::from_secs(match phase {
            Phase::Validate | Phase::Connect => self.connect_secs,
            Phase::Greeting => self.greeting_secs,
            Phase::Hello => self.ehlo_secs,
            Phase::StartTls => self.starttls_secs,
            Phase::Auth => self.auth_secs,
            Phase::MailFrom => self.mail_from_secs,
            Phase::RcptTo => self.rcpt_to_secs,
            Phase::Data => self.data_secs,
        })
    }

    #[must_use]
    pub const fn quit(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }
}

const fn default_command_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

const fn default_port() -> u16 {
    587
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

#[allow(clippy::unnecessary_wraps)]
const fn default_max_per_hour() -> Option<u32> {
    Some(1000)
}

#[allow(clippy::unnecessary_wraps)]
const fn default_max_per_day() -> Option<u32> {
    Some(10_000)
}

#[derive(Clone, Deserialize)]
pub struct SmtpProviderConfig {
    pub host: String,

    /// Default: 587
    #[serde(default = "default_port")]
    pub port: u16,

    /// Empty means no AUTH.
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Sender used when a job carries none; falls back to `username`.
    #[serde(default)]
    pub from: String,

    /// Overrides the mode derived from `port`.
    #[serde(default)]
    pub security: Option<SecurityMode>,

    /// Name announced in EHLO.
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// Accept any certificate (self-signed relays only).
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: Option<u32>,

    #[serde(default = "default_max_per_day")]
    pub max_per_day: Option<u32>,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

impl fmt::Debug for SmtpProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpProviderConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"****")
            .field("from", &self.from)
            .field("security", &self.security())
            .field("helo_name", &self.helo_name)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("max_per_hour", &self.max_per_hour)
            .field("max_per_day", &self.max_per_day)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl SmtpProviderConfig {
    /// A config for `host:port` with every other field at its default.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            from: String::new(),
            security: None,
            helo_name: default_helo_name(),
            accept_invalid_certs: false,
            max_per_hour: default_max_per_hour(),
            max_per_day: default_max_per_day(),
            timeouts: SmtpTimeouts::default(),
        }
    }

    #[must_use]
    pub fn security(&self) -> SecurityMode {
        self.security.unwrap_or(SecurityMode::for_port(self.port))
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    fn is_loopback(&self) -> bool {
        self.host.eq_ignore_ascii_case("localhost")
            || self
                .host
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip.is_loopback())
    }
}

/// Submits jobs to a single relay.
///
/// Every send opens a fresh session:
///
/// ```text
/// connect -> greeting -> EHLO [-> STARTTLS -> EHLO] [-> AUTH]
///         -> MAIL FROM -> RCPT TO -> DATA -> QUIT
/// ```
///
/// Credentials are only sent over an encrypted link, or to a relay on the
/// loopback interface.
///
/// The envelope sender is always the bare address, while the `From`
/// header keeps whatever display form the job carries.
#[derive(Debug)]
pub struct SmtpProvider {
    config: SmtpProviderConfig,
    security: SecurityMode,
    rate: RateWindows,
}

impl SmtpProvider {
    /// # Errors
    ///
    /// Fails with [`SystemError::Configuration`] when the host is missing or a
    /// username has no password.
    pub fn new(config: SmtpProviderConfig) -> Result<Self, DeliveryError> {
        if config.host.trim().is_empty() {
            return Err(SystemError::Configuration("SMTP host is required".to_string()).into());
        }

        if config.has_credentials() && config.password.is_empty() {
            return Err(SystemError::Configuration(format!(
                "SMTP username {} has no password",
                config.username
            ))
            .into());
        }

        let security = config.security();
        if config.accept_invalid_certs {
            warn!(
                host = %config.host,
                "SECURITY WARNING: TLS certificate validation is disabled for this relay"
            );
        }

        Ok(Self {
            rate: RateWindows::new(config.max_per_hour, config.max_per_day, Utc::now()),
            security,
            config,
        })
    }

    #[must_use]
    pub const fn security(&self) -> SecurityMode {
        self.security
    }

    /// Whether to upgrade a session that has just said EHLO.
    fn wants_starttls(&self, client: &SmtpClient) -> bool {
        match self.security {
            SecurityMode::StartTls => true,
            SecurityMode::Plain => client.supports("STARTTLS"),
            SecurityMode::ImplicitTls => false,
        }
    }

    fn may_authenticate(&self, encrypted: bool) -> bool {
        encrypted || self.config.is_loopback()
    }

    fn fail(phase: Phase, error: impl Into<DeliveryError>) -> ProviderError {
        ProviderError::new(NAME, phase, error)
    }

    /// Sender for `job`: its own `from`, else the configured one, else the
    /// login name.
    fn sender<'a>(&'a self, job: &'a Job) -> &'a str {
        [
            job.from.as_str(),
            self.config.from.as_str(),
            self.config.username.as_str(),
        ]
            .into_iter()
            .find(|candidate| !candidate.trim().is_empty())
            .unwrap_or_default()
    }

    /// Run one step of the session under its phase timeout.
    async fn step<T>(
        &self,
        phase: Phase,
        fut: impl Future<Output = herald_smtp::Result<T>>,
    ) -> Result<T, ProviderError> {
        let limit = self.config.timeouts.for_phase(phase);

        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Self::fail(phase, DeliveryError::classify(phase, error))),
            Err(_) => Err(Self::fail(
                phase,
                TemporaryError::Timeout(format!("{phase} timed out after {limit:?}")),
            )),
        }
    }

    async fn connect(&self) -> herald_smtp::Result<SmtpClient> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        if self.security == SecurityMode::ImplicitTls {
            SmtpClient::connect_tls(&addr, &self.config.host, self.config.accept_invalid_certs)
                .await
        } else {
            Ok(SmtpClient::connect(&addr, &self.config.host)
                .await?
                .accept_invalid_certs(self.config.accept_invalid_certs))
        }
    }

    async fn transaction(
        &self,
        job: &Job,
        header_from: &str,
        envelope_from: &str,
        envelope_to: &str,
    ) -> Result<SendReceipt, ProviderError> {
        let helo = self.config.helo_name.as_str();

        let mut client = self.step(Phase::Connect, self.connect()).await?;
        self.step(Phase::Greeting, client.read_greeting()).await?;
        self.step(Phase::Hello, client.ehlo(helo)).await?;

        if self.wants_starttls(&client) {
            self.step(Phase::StartTls, client.starttls()).await?;
            self.step(Phase::Hello, client.ehlo(helo)).await?;
        }

        if self.config.has_credentials() {
            if !self.may_authenticate(client.is_tls()) {
                return Err(Self::fail(
                    Phase::Auth,
                    PermanentError::TlsRequired(format!(
                        "refusing to send credentials to {} over an unencrypted connection",
                        self.config.host
                    )),
                ));
            }

            self.step(
                Phase::Auth,
                client.auth(&self.config.username, &self.config.password),
            )
            .await?;
        }

        self.step(Phase::MailFrom, client.mail_from(envelope_from)).await?;
        self.step(Phase::RcptTo, client.rcpt_to(envelope_to)).await?;

        let now = Utc::now();
        let message_id = message_id(&job.id.to_string(), &self.config.host, now);
        let message =
            HtmlMessage::new(header_from, &job.to, &job.subject, &job.html, &message_id).date(now);

        self.step(Phase::Data, client.data()).await?;
        self.step(Phase::Data, client.send_message(&message.render()))
            .await?;

        // The message is accepted; a failed goodbye changes nothing.
        match tokio::time::timeout(self.config.timeouts.quit(), client.quit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => debug!(job_id = %job.id, %error, "QUIT failed after delivery"),
            Err(_) => debug!(job_id = %job.id, "QUIT timed out after delivery"),
        }

        Ok(SendReceipt {
            provider_message_id: message_id,
        })
    }
}

#[async_trait]
impl Provider for SmtpProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(job_id = %job.id, host = %self.config.host, port = self.config.port)
    )]
    async fn send(&self, job: &Job) -> Result<SendReceipt, ProviderError> {
        let header_from = self.sender(job);
        let envelope_from = envelope_address(header_from);
        let envelope_to = envelope_address(&job.to);

        address::validate(&envelope_from).map_err(|e| {
            Self::fail(Phase::Validate, PermanentError::InvalidAddress(format!("sender: {e}")))
        })?;
        address::validate(&envelope_to).map_err(|e| {
            Self::fail(Phase::Validate, PermanentError::InvalidAddress(format!("recipient: {e}")))
        })?;

        let slot = self.rate.acquire(Utc::now()).map_err(|exceeded| {
            Self::fail(
                Phase::Connect,
                TemporaryError::RateLimited(format!(
                    "{} ceiling of {} reached, resets at {}",
                    exceeded.window, exceeded.limit, exceeded.resets_at
                )),
            )
        })?;

        let result = self
            .transaction(job, header_from, &envelope_from, &envelope_to)
            .await;

        // An attempt abandoned before this point drops the slot uncommitted.
        match &result {
            Ok(receipt) => {
                slot.commit();
                debug!(message_id = %receipt.provider_message_id, "Relay accepted message");
            }
            Err(error) => debug!(%error, "Relay did not accept message"),
        }

        result
    }

    fn quota(&self) -> QuotaInfo {
        self.rate.quota(NAME, Utc::now())
    }
}
