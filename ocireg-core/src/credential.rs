//! Extracts a normalized private-key credential from an HTTP `Authorization`
//! header. The core never signs anything with it; it's an opaque identifier
//! handed to the remote backend and used as a cache key.

use base64::Engine as _;

/// A normalized, `0x`-prefixed private-key string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Credential(String);

impl Credential {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds a credential directly from an already-known key, normalizing
    /// it the same way [`extract`] does. Used by the remote-service layer
    /// to construct cache keys and by tests.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self::normalize(raw.as_ref())
    }

    fn normalize(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("0x") {
            Self(trimmed.to_string())
        } else {
            Self(format!("0x{trimmed}"))
        }
    }
}

/// Parses a raw `Authorization` header value per §4.6: `Basic base64(user:pass)`
/// yields `pass` (or the whole decoded value if `pass` is empty); `Bearer <token>`
/// yields `<token>`. Anything else, or a missing header, yields `None`.
pub fn extract(header_value: Option<&str>) -> Option<Credential> {
    let value = header_value?;
    if let Some(rest) = value.strip_prefix("Basic ") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(rest.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let key = match decoded.split_once(':') {
            Some((_user, pass)) if !pass.is_empty() => pass,
            _ => decoded.as_str(),
        };
        Some(Credential::normalize(key))
    } else if let Some(rest) = value.strip_prefix("Bearer ") {
        Some(Credential::normalize(rest))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(user: &str, pass: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
        )
    }

    #[test]
    fn basic_with_password_uses_password() {
        let header = basic("docker", "deadbeef");
        let cred = extract(Some(&header)).unwrap();
        assert_eq!(cred.as_str(), "0xdeadbeef");
    }

    #[test]
    fn basic_with_empty_password_uses_whole_value() {
        let header = basic("deadbeef", "");
        let cred = extract(Some(&header)).unwrap();
        assert_eq!(cred.as_str(), "0xdeadbeef:");
    }

    #[test]
    fn bearer_uses_token() {
        let cred = extract(Some("Bearer deadbeef")).unwrap();
        assert_eq!(cred.as_str(), "0xdeadbeef");
    }

    #[test]
    fn already_prefixed_is_untouched() {
        let cred = extract(Some("Bearer 0xdeadbeef")).unwrap();
        assert_eq!(cred.as_str(), "0xdeadbeef");
    }

    #[test]
    fn missing_or_unparseable_is_none() {
        assert!(extract(None).is_none());
        assert!(extract(Some("Digest foo")).is_none());
    }
}
