//! Backend network address

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::BackendError;

/// Host and port of the orchestration backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendAddress {
    host: String,
    port: u16,
}

impl BackendAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, BackendError> {
        let host = host.into();
        let trimmed = host.trim();

        if trimmed.is_empty() {
            return Err(BackendError::InvalidAddress(format!("{host}:{port}")));
        }
        if trimmed.contains(char::is_whitespace) || trimmed.contains('/') {
            return Err(BackendError::InvalidAddress(format!("{host}:{port}")));
        }
        if port == 0 {
            return Err(BackendError::InvalidAddress(format!("{host}:{port}")));
        }

        Ok(Self {
            host: trimmed.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BackendAddress {
    type Err = BackendError;

    /// Parse `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| BackendError::InvalidAddress(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| BackendError::InvalidAddress(s.to_string()))?;

        Self::new(host, port).map_err(|_| BackendError::InvalidAddress(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let address: BackendAddress = "db.internal:5432".parse().unwrap();
        assert_eq!(address.host(), "db.internal");
        assert_eq!(address.port(), 5432);
        assert_eq!(address.to_string(), "db.internal:5432");
    }

    #[test]
    fn test_malformed_addresses() {
        for raw in ["", "localhost", "localhost:", ":5432", "localhost:0", "localhost:99999", "bad host:1"] {
            let result = raw.parse::<BackendAddress>();
            assert!(
                matches!(result, Err(BackendError::InvalidAddress(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_new_trims_host() {
        let address = BackendAddress::new(" localhost ", 7233).unwrap();
        assert_eq!(address.to_string(), "localhost:7233");
    }
}
