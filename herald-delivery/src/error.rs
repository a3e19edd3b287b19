//! Typed error handling for delivery operations.
//!
//! Failures are split into three classes, which drive the retry decision:
//! - Permanent failures (5xx replies, bad addresses) are recorded and only
//!   retried on the slow `retry_delay` schedule while failures remain;
//! - Temporary failures (4xx replies, network trouble) go back to the queue
//!   with a short backoff;
//! - System errors (configuration, internal faults) are treated as permanent.

use herald_smtp::ClientError;
use thiserror::Error;

use crate::provider::Phase;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Failures that will not go away by trying again soon.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// The address failed structural validation before any connection.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Recipient address was rejected by the server.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Message was rejected by the server (policy, content, sender).
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// TLS is required but the server does not offer or refuses it.
    #[error("TLS required: {0}")]
    TlsRequired(String),
}

/// Failures worth retrying after a short backoff.
#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// 421: the server is shutting down the channel or overloaded.
    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// 454, or a local hourly/daily ceiling.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Any other 4xx reply.
    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried soon.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Classify an SMTP client failure by the phase it happened in.
    ///
    /// | Failure                 | Class                          |
    /// |-------------------------|--------------------------------|
    /// | 421                     | Temporary `ServerBusy`         |
    /// | 454                     | Temporary `RateLimited`        |
    /// | other 4xx               | Temporary `SmtpTemporary`      |
    /// | 5xx in Auth             | Permanent `AuthenticationFailed` |
    /// | 5xx in RcptTo           | Permanent `InvalidRecipient`   |
    /// | 5xx in StartTls         | Permanent `TlsRequired`        |
    /// | other 5xx               | Permanent `MessageRejected`    |
    /// | I/O, closed connection  | Temporary `ConnectionFailed`   |
    /// | TLS                     | Temporary `TlsHandshakeFailed` |
    #[must_use]
    pub fn classify(phase: Phase, error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code: 421, message } => {
                TemporaryError::ServerBusy(format!("421 {message}")).into()
            }
            ClientError::SmtpError { code: 454, message } => {
                TemporaryError::RateLimited(format!("454 {message}")).into()
            }
            ClientError::SmtpError { code, message } if (400..500).contains(&code) => {
                TemporaryError::SmtpTemporary(format!("{code} {message}")).into()
            }
            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                let reply = format!("{code} {message}");
                match phase {
                    Phase::Auth => PermanentError::AuthenticationFailed(reply),
                    Phase::RcptTo => PermanentError::InvalidRecipient(reply),
                    Phase::StartTls => PermanentError::TlsRequired(reply),
                    _ => PermanentError::MessageRejected(reply),
                }
                .into()
            }
            ClientError::SmtpError { code, message }
            | ClientError::UnexpectedResponse { code, message } => SystemError::Internal(
                format!("Unexpected SMTP response during {phase}: {code} {message}"),
            )
            .into(),

            ClientError::Io(e) => TemporaryError::ConnectionFailed(format!("I/O error: {e}")).into(),
            ClientError::ConnectionClosed => TemporaryError::ConnectionFailed(
                "Connection closed unexpectedly".to_string(),
            )
            .into(),
            ClientError::TlsError(msg) => TemporaryError::TlsHandshakeFailed(msg).into(),

            ClientError::Unsupported(what) => match phase {
                Phase::StartTls => PermanentError::TlsRequired(format!("server does not offer {what}")),
                Phase::Auth => {
                    PermanentError::AuthenticationFailed(format!("server does not offer {what}"))
                }
                _ => return SystemError::Configuration(format!("server does not offer {what}")).into(),
            }
            .into(),

            ClientError::ParseError(msg) => {
                SystemError::Internal(format!("SMTP protocol parse error: {msg}")).into()
            }
            ClientError::Utf8Error(e) => {
                SystemError::Internal(format!("UTF-8 decoding error: {e}")).into()
            }
        }
    }
}
