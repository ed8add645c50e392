//! CIDR helpers. Comparisons always go through parsed prefixes so
//! textual variants of the same range compare equal.

use ipnet::IpNet;

use crate::Error;

pub fn parse(s: &str) -> Result<IpNet, Error> {
    s.parse::<IpNet>()
        .map_err(|e| Error::Parse(format!("invalid CIDR {:?}: {}", s, e)))
}

/// Equality as prefixes, not as strings.
pub fn cidrs_equal(a: &str, b: &str) -> bool {
    match (parse(a), parse(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

pub fn is_ipv4(s: &str) -> bool {
    matches!(parse(s), Ok(IpNet::V4(_)))
}

pub fn is_ipv6(s: &str) -> bool {
    matches!(parse(s), Ok(IpNet::V6(_)))
}

/// A valid pod-CIDR set is one CIDR, or a dual-stack pair with exactly
/// one range per family.
pub fn validate_pod_cidrs(cidrs: &[String]) -> Result<(), Error> {
    match cidrs {
        [] => Err(Error::Parse("empty pod CIDR set".into())),
        [one] => parse(one).map(|_| ()),
        [a, b] => {
            let (a, b) = (parse(a)?, parse(b)?);
            match (a, b) {
                (IpNet::V4(_), IpNet::V6(_)) | (IpNet::V6(_), IpNet::V4(_)) => Ok(()),
                _ => Err(Error::Parse(format!(
                    "pod CIDRs {} and {} are not a dual-stack pair",
                    a, b
                ))),
            }
        }
        more => Err(Error::Parse(format!("too many pod CIDRs: {}", more.len()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textual_variants_compare_equal() {
        assert!(cidrs_equal("10.0.1.0/24", "10.0.1.0/24"));
        assert!(cidrs_equal("2001:db8:0:0::/64", "2001:db8::/64"));
        assert!(!cidrs_equal("10.0.1.0/24", "10.0.2.0/24"));
        assert!(!cidrs_equal("bogus", "bogus"));
    }

    #[test]
    fn dual_stack_shape() {
        let ok = vec!["10.0.1.0/24".to_string(), "2001:db8::/112".to_string()];
        assert!(validate_pod_cidrs(&ok).is_ok());
        let reversed = vec!["2001:db8::/112".to_string(), "10.0.1.0/24".to_string()];
        assert!(validate_pod_cidrs(&reversed).is_ok());
        let same_family = vec!["10.0.1.0/24".to_string(), "10.0.2.0/24".to_string()];
        assert!(validate_pod_cidrs(&same_family).is_err());
        assert!(validate_pod_cidrs(&[]).is_err());
        let three = vec![
            "10.0.1.0/24".to_string(),
            "2001:db8::/112".to_string(),
            "10.0.3.0/24".to_string(),
        ];
        assert!(validate_pod_cidrs(&three).is_err());
    }
}
