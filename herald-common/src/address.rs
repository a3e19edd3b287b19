//! Email address validation and envelope extraction.
//!
//! Header values such as `From` may carry a display name
//! (`"Notices <noreply@example.com>"`), while the SMTP envelope only ever
//! takes the bare mailbox. [`envelope_address`] performs that reduction and
//! [`validate`] applies the structural checks every provider relies on.

use thiserror::Error;

/// Reasons an address fails structural validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("email address cannot be empty")]
    Empty,

    #[error("email address must contain exactly one '@': {0}")]
    AtSign(String),

    #[error("email address has an empty local part: {0}")]
    EmptyLocalPart(String),

    #[error("email address has an empty domain: {0}")]
    EmptyDomain(String),

    #[error("email domain must contain a '.': {0}")]
    DomainWithoutDot(String),
}

/// Checks that `address` is a plausible mailbox.
///
/// The address must be non-empty, contain exactly one `@` with non-empty
/// parts on either side, and its domain must contain at least one `.`.
///
/// # Errors
///
/// Returns the first [`AddressError`] the address violates.
pub fn validate(address: &str) -> Result<(), AddressError> {
    if address.is_empty() {
        return Err(AddressError::Empty);
    }

    let mut parts = address.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(AddressError::AtSign(address.to_string()));
    };

    if local.is_empty() {
        return Err(AddressError::EmptyLocalPart(address.to_string()));
    }

    if domain.is_empty() {
        return Err(AddressError::EmptyDomain(address.to_string()));
    }

    if !domain.contains('.') {
        return Err(AddressError::DomainWithoutDot(address.to_string()));
    }

    Ok(())
}

/// Reduces a header value to the bare mailbox used on the SMTP envelope.
///
/// `"Notices <a@b.com>"` becomes `"a@b.com"`; a value that is already bare
/// is returned trimmed. Values `mailparse` cannot make sense of fall back to
/// the text between the outermost angle brackets, if any.
#[must_use]
pub fn envelope_address(header: &str) -> String {
    if let Ok(list) = mailparse::addrparse(header)
        && let Some(info) = list.extract_single_info()
    {
        return info.addr;
    }

    match (header.find('<'), header.rfind('>')) {
        (Some(start), Some(end)) if start < end => header[start + 1..end].trim().to_string(),
        _ => header.trim().to_string(),
    }
}
