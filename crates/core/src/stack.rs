//! Cluster IP stack selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// IP family layout of the cluster. For dual-stack variants the order is
/// the order of `PodCIDRs` entries on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackType {
    Ipv4,
    Ipv6,
    Ipv4Ipv6,
    Ipv6Ipv4,
}

impl StackType {
    pub fn is_dual(self) -> bool {
        matches!(self, StackType::Ipv4Ipv6 | StackType::Ipv6Ipv4)
    }
}

impl FromStr for StackType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" => Ok(StackType::Ipv4),
            "ipv6" => Ok(StackType::Ipv6),
            "ipv4-ipv6" | "ipv4_ipv6" => Ok(StackType::Ipv4Ipv6),
            "ipv6-ipv4" | "ipv6_ipv4" => Ok(StackType::Ipv6Ipv4),
            other => Err(crate::Error::Config(format!("unknown stack type: {}", other))),
        }
    }
}

impl fmt::Display for StackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackType::Ipv4 => "IPv4",
            StackType::Ipv6 => "IPv6",
            StackType::Ipv4Ipv6 => "IPv4_IPv6",
            StackType::Ipv6Ipv4 => "IPv6_IPv4",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("ipv4".parse::<StackType>().unwrap(), StackType::Ipv4);
        assert_eq!("IPV6-ipv4".parse::<StackType>().unwrap(), StackType::Ipv6Ipv4);
        assert!("both".parse::<StackType>().is_err());
        assert_eq!(StackType::Ipv4Ipv6.to_string(), "IPv4_IPv6");
    }
}
