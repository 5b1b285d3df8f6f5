//! Remote NBD endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{NbdrootError, NbdrootResult};

/// Host and port of the NBD server, derived once from the boot parameter.
///
/// The split happens at the *last* `:`. Unbracketed IPv6 literals therefore
/// keep every colon but the last in the host (`2001:db8::1:80` is host
/// `2001:db8::1`, port 80). Bracketed IPv6 (`[::1]:80`) is not recognized;
/// the brackets stay part of the host.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTarget {
    host: String,
    port: u16,
}

impl RemoteTarget {
    /// Parse a raw `<host>:<port>` boot parameter value.
    pub fn parse(raw: &str) -> NbdrootResult<Self> {
        let malformed = |reason: &str| NbdrootError::ParameterMalformed {
            value: raw.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = raw
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| malformed("missing ':' between host and port"))?;

        if host.is_empty() {
            return Err(malformed("empty host"));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| malformed(&format!("invalid port '{}': {}", port, e)))?;
        if port == 0 {
            return Err(malformed("port 0"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address string suitable for a socket connect.
    ///
    /// Hosts containing `:` are bracketed so the result parses as a socket address.
    pub fn connect_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for RemoteTarget {
    type Err = NbdrootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.5:10809", "10.0.0.5", 10809)]
    #[case("nbd.example.com:10809", "nbd.example.com", 10809)]
    #[case("2001:db8::1:80", "2001:db8::1", 80)]
    #[case(" 172.16.172.1:10809\n", "172.16.172.1", 10809)]
    fn test_parse_well_formed(#[case] raw: &str, #[case] host: &str, #[case] port: u16) {
        let target = RemoteTarget::parse(raw).unwrap();
        assert_eq!(target.host(), host);
        assert_eq!(target.port(), port);
    }

    #[rstest]
    #[case("10.0.0.5")]
    #[case(":10809")]
    #[case("10.0.0.5:")]
    #[case("10.0.0.5:nbd")]
    #[case("10.0.0.5:0")]
    #[case("10.0.0.5:70000")]
    #[case("")]
    fn test_parse_malformed(#[case] raw: &str) {
        let err = RemoteTarget::parse(raw).unwrap_err();
        assert!(matches!(err, NbdrootError::ParameterMalformed { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_connect_addr_brackets_ipv6() {
        let v4 = RemoteTarget::parse("10.0.0.5:10809").unwrap();
        assert_eq!(v4.connect_addr(), "10.0.0.5:10809");

        let v6 = RemoteTarget::parse("2001:db8::1:80").unwrap();
        assert_eq!(v6.connect_addr(), "[2001:db8::1]:80");
        assert!(v6.connect_addr().parse::<std::net::SocketAddr>().is_ok());
    }

    proptest! {
        #[test]
        fn split_is_at_last_colon(host in "[a-z0-9:.]{0,20}[a-z0-9.]", port in 1u16..) {
            let raw = format!("{}:{}", host, port);
            let target = RemoteTarget::parse(&raw).unwrap();
            prop_assert_eq!(target.host(), host.as_str());
            prop_assert_eq!(target.port(), port);
            prop_assert_eq!(target.to_string(), raw);
        }
    }
}
