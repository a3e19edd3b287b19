//! SMTP submission client.
//!
//! Supports the three ways a relay is usually reached:
//!
//! - plain TCP, optionally authenticated on loopback;
//! - implicit TLS, where the handshake happens before the greeting;
//! - STARTTLS, upgrading a plain session after the first EHLO.
//!
//! ```no_run
//! use herald_smtp::SmtpClient;
//!
//! # async fn example() -> herald_smtp::Result<()> {
//! let mut client = SmtpClient::connect("smtp.example.com:587", "smtp.example.com").await?;
//! client.read_greeting().await?;
//! client.ehlo("client.example.com").await?;
//! client.starttls().await?;
//! client.ehlo("client.example.com").await?;
//! client.auth("user", "secret").await?;
//! client.mail_from("sender@example.com").await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//! client.send_message(b"Subject: Test\r\n\r\nHello\r\n").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::Response;
pub use smtp_client::SmtpClient;
