//! Framing of single-part HTML messages.

use chrono::{DateTime, Utc};

/// `Date` header format (RFC 5322 section 3.3).
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// A single-part `text/html` message ready to go on the wire.
///
/// Headers are always written in the same order:
///
/// ```text
/// From, To, Subject, Date, Message-ID, MIME-Version,
/// Content-Transfer-Encoding, Content-Type
/// ```
///
/// followed by one blank line and the CRLF-normalised body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlMessage {
    /// `From` header, display form kept as given.
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub date: DateTime<Utc>,
    pub message_id: String,
}

impl HtmlMessage {
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        html: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            html: html.into(),
            date: Utc::now(),
            message_id: message_id.into(),
        }
    }

    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    /// The message as sent after DATA, before dot-stuffing.
    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        let date = self.date.format(DATE_FORMAT).to_string();
        let headers = [
            ("From", self.from.as_str()),
            ("To", self.to.as_str()),
            ("Subject", self.subject.as_str()),
            ("Date", date.as_str()),
            ("Message-ID", self.message_id.as_str()),
            ("MIME-Version", "1.0"),
            ("Content-Transfer-Encoding", "8bit"),
            ("Content-Type", "text/html; charset=UTF-8"),
        ];

        let mut out = String::with_capacity(self.html.len() + 512);
        for (name, value) in headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&single_line(value));
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&normalize_body(&self.html));

        out.into_bytes()
    }
}

/// Line endings become CRLF, doubled carriage returns collapse, and the
/// body always ends with CRLF.
#[must_use]
pub fn normalize_body(body: &str) -> String {
    let mut body = body.replace('\n', "\r\n").replace("\r\r", "\r");
    if !body.ends_with("\r\n") {
        body.push_str("\r\n");
    }
    body
}

/// `<{unix_nanos}.{unique}@{host}>`
#[must_use]
pub fn message_id(unique: &str, host: &str, at: DateTime<Utc>) -> String {
    let nanos = at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_micros().saturating_mul(1000));
    format!("<{nanos}.{unique}@{host}>")
}

/// Header values never span lines.
fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    fn message(html: &str) -> HtmlMessage {
        HtmlMessage::new(
            "Notices <a@b.com>",
            "to@example.com",
            "Welcome",
            html,
            "<1.abc@smtp.example.com>",
        )
        .date(at())
    }

    #[test]
    fn renders_fixed_header_block() {
        let rendered = String::from_utf8(message("<p>hi</p>\n").render()).expect("utf8");

        assert_eq!(
            rendered,
            "From: Notices <a@b.com>\r\n\
             To: to@example.com\r\n\
             Subject: Welcome\r\n\
             Date: Tue, 14 Nov 2023 22:13:20 +0000\r\n\
             Message-ID: <1.abc@smtp.example.com>\r\n\
             MIME-Version: 1.0\r\n\
             Content-Transfer-Encoding: 8bit\r\n\
             Content-Type: text/html; charset=UTF-8\r\n\
             \r\n\
             <p>hi</p>\r\n"
        );
    }

    #[test]
    fn content_type_is_followed_by_single_blank_line_and_body() {
        let rendered = message("<p>hi</p>\n").render();
        let needle = b"Content-Type: text/html; charset=UTF-8\r\n\r\n<p>hi</p>\r\n";

        assert!(rendered.windows(needle.len()).any(|w| w == needle));
        assert_eq!(rendered.windows(4).filter(|w| w == b"\r\n\r\n").count(), 1);
    }

    #[test]
    fn body_normalisation() {
        assert_eq!(normalize_body("a\nb"), "a\r\nb\r\n");
        assert_eq!(normalize_body("a\r\nb\r\n"), "a\r\nb\r\n");
        assert_eq!(normalize_body(""), "\r\n");
        assert_eq!(normalize_body("<p>x</p>"), "<p>x</p>\r\n");
    }

    #[test]
    fn header_values_cannot_inject_lines() {
        let mut msg = message("body");
        msg.subject = "Hi\r\nBcc: victim@example.com".to_string();

        let rendered = String::from_utf8(msg.render()).expect("utf8");
        assert!(rendered.contains("Subject: Hi  Bcc: victim@example.com\r\n"));
        assert!(!rendered.contains("\r\nBcc:"));
    }

    #[test]
    fn message_id_uses_nanoseconds_unique_part_and_host() {
        assert_eq!(
            message_id("01HXYZ", "smtp.example.com", at()),
            "<1700000000000000000.01HXYZ@smtp.example.com>"
        );
    }
}
