//! `transport://location` contact addresses.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::UsageError;

static TRANSPORT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*$").expect("transport name pattern compiles")
});

/// Whether `name` can be used as an address scheme.
pub(crate) fn is_valid_transport_name(name: &str) -> bool {
    TRANSPORT_NAME.is_match(name)
}

/// Parsed contact address. The location is opaque and passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub transport: String,
    pub location: String,
}

impl Address {
    /// # Errors
    ///
    /// Returns [`UsageError::InvalidAddress`] unless `uri` is
    /// `transport://location` with a valid transport name and a non-empty location.
    pub fn parse(uri: &str) -> Result<Self, UsageError> {
        let invalid = || UsageError::InvalidAddress(uri.to_string());
        let (transport, location) = uri.split_once("://").ok_or_else(invalid)?;
        if !is_valid_transport_name(transport) || location.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            transport: transport.to_string(),
            location: location.to_string(),
        })
    }
}

impl FromStr for Address {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_is_passed_through_verbatim() {
        let addr = Address::parse("http://localhost:3000/qb?x=1").unwrap();
        assert_eq!(addr.transport, "http");
        assert_eq!(addr.location, "localhost:3000/qb?x=1");
        assert_eq!(addr.to_string(), "http://localhost:3000/qb?x=1");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["channel", "://x", "memory://", "1abc://x", "my transport://x"] {
            assert_eq!(
                bad.parse::<Address>(),
                Err(UsageError::InvalidAddress(bad.to_string())),
                "{bad}"
            );
        }
    }

    #[test]
    fn transport_names_follow_scheme_rules() {
        assert!(is_valid_transport_name("memory"));
        assert!(is_valid_transport_name("nats+tls"));
        assert!(!is_valid_transport_name(""));
        assert!(!is_valid_transport_name("-x"));
    }
}
