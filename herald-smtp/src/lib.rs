pub mod client;
pub mod message;

pub use client::{ClientError, Response, Result, SmtpClient};
pub use message::HtmlMessage;
