#[cfg(feature = "testing")]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 50505;

#[cfg(feature = "testing")]
fn arb_host_name() -> impl proptest::strategy::Strategy<Value = String> {
    use proptest::prelude::*;
    prop_oneof![
        Just("localhost".to_string()),
        Just("127.0.0.1".to_string()),
        (0..255u8, 0..255u8, 0..255u8, 0..255u8)
            .prop_map(|(a, b, c, d)| format!("{}.{}.{}.{}", a, b, c, d)),
        proptest::string::string_regex("[a-z0-9]([a-z0-9-]{0,30}[a-z0-9])?").unwrap()
    ]
}

/// Address under which a node accepts client connections.
#[cfg_attr(feature = "testing", derive(Arbitrary))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    #[cfg_attr(feature = "testing", proptest(strategy = "arb_host_name()"))]
    pub host: String,
    #[cfg_attr(feature = "testing", proptest(strategy = "1..u16::MAX"))]
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        assert!(!host.is_empty(), "Hostname cannot be empty");
        assert!(port > 0, "Port cannot be 0");
        Self { host, port }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or("Missing port")?;
        if host.is_empty() {
            return Err("Missing host".to_string());
        }
        let port = port.parse::<u16>().map_err(|e| e.to_string())?;
        if port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        Ok(NodeAddr {
            host: host.to_string(),
            port,
        })
    }
}

impl From<std::net::SocketAddr> for NodeAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        NodeAddr {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}
