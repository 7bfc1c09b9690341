//! SASL PLAIN credential handling.
//!
//! The server advertises exactly one mechanism. Any credentials are
//! accepted; the authentication identity merely becomes the localpart
//! of the session JID. What still has to be right is the payload
//! framing: base64 text containing `authzid NUL authcid NUL password`.

use base64::prelude::*;

use crate::XmppError;

/// Decoded SASL PLAIN credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    /// Authorization identity (usually empty).
    pub authzid: String,
    /// Authentication identity; adopted as the session localpart.
    pub authcid: String,
    /// Password (ignored, no credential backend).
    pub password: String,
}

/// Decode the character data of an `<auth/>` element.
///
/// The decoded payload must contain exactly two NUL separators; any
/// other count is rejected.
pub fn parse_plain(payload: &str) -> Result<PlainCredentials, XmppError> {
    let decoded = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| XmppError::auth_rejected(format!("invalid base64: {}", e)))?;

    let parts: Vec<&[u8]> = decoded.split(|b| *b == 0).collect();
    if parts.len() != 3 {
        return Err(XmppError::auth_rejected(format!(
            "PLAIN payload has {} NUL separators, expected 2",
            parts.len() - 1
        )));
    }

    let field = |bytes: &[u8], name: &str| {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| XmppError::auth_rejected(format!("{} is not UTF-8", name)))
    };

    let credentials = PlainCredentials {
        authzid: field(parts[0], "authzid")?,
        authcid: field(parts[1], "authcid")?,
        password: field(parts[2], "password")?,
    };

    if credentials.authcid.is_empty() {
        return Err(XmppError::auth_rejected("empty authcid"));
    }

    Ok(credentials)
}
