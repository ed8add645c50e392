//! PEM certificate-request parsing: subject and SANs, shaped for the
//! validators.

use std::net::IpAddr;

use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509CertificationRequest};

use nimbus_core::Error;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCsr {
    pub common_name: Option<String>,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub uris: Vec<String>,
    pub email_addresses: Vec<String>,
}

impl ParsedCsr {
    pub fn has_forbidden_san_kinds(&self, forbid_ips: bool) -> bool {
        !self.uris.is_empty()
            || !self.email_addresses.is_empty()
            || (forbid_ips && !self.ip_addresses.is_empty())
    }
}

/// Parse a PEM-encoded PKCS#10 request. Everything wrong with the input
/// is a terminal parse error.
pub fn parse_csr_pem(pem: &[u8]) -> Result<ParsedCsr, Error> {
    let (_, doc) = parse_x509_pem(pem)
        .map_err(|e| Error::Parse(format!("certificate request PEM: {}", e)))?;
    if doc.label != "CERTIFICATE REQUEST" && doc.label != "NEW CERTIFICATE REQUEST" {
        return Err(Error::Parse(format!("unexpected PEM label {:?}", doc.label)));
    }
    let (_, req) = X509CertificationRequest::from_der(&doc.contents)
        .map_err(|e| Error::Parse(format!("certificate request DER: {}", e)))?;

    let subject = &req.certification_request_info.subject;
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(String::from);
    let organizations = subject
        .iter_organization()
        .filter_map(|attr| attr.as_str().ok())
        .map(String::from)
        .collect();

    let mut parsed = ParsedCsr { common_name, organizations, ..Default::default() };
    if let Some(extensions) = req.requested_extensions() {
        for ext in extensions {
            let ParsedExtension::SubjectAlternativeName(san) = ext else {
                continue;
            };
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => parsed.dns_names.push((*dns).to_string()),
                    GeneralName::RFC822Name(email) => {
                        parsed.email_addresses.push((*email).to_string())
                    }
                    GeneralName::URI(uri) => parsed.uris.push((*uri).to_string()),
                    GeneralName::IPAddress(bytes) => {
                        let ip = match bytes.len() {
                            4 => {
                                let mut b = [0u8; 4];
                                b.copy_from_slice(bytes);
                                Some(IpAddr::from(b))
                            }
                            16 => {
                                let mut b = [0u8; 16];
                                b.copy_from_slice(bytes);
                                Some(IpAddr::from(b))
                            }
                            _ => None,
                        };
                        match ip {
                            Some(ip) => parsed.ip_addresses.push(ip),
                            None => {
                                return Err(Error::Parse(format!(
                                    "SAN IP with {} bytes",
                                    bytes.len()
                                )))
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csr_pem(cn: &str, org: Option<&str>, sans: &[rcgen::SanType]) -> Vec<u8> {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, cn);
        if let Some(org) = org {
            dn.push(rcgen::DnType::OrganizationName, org);
        }
        params.distinguished_name = dn;
        params.subject_alt_names = sans.to_vec();
        let key = rcgen::KeyPair::generate().unwrap();
        params.serialize_request(&key).unwrap().pem().unwrap().into_bytes()
    }

    #[test]
    fn parses_subject_and_sans() {
        let pem = csr_pem(
            "system:node:i0",
            Some("system:nodes"),
            &[
                rcgen::SanType::DnsName("i0.c.p0.internal".try_into().unwrap()),
                rcgen::SanType::IpAddress("1.2.3.4".parse().unwrap()),
            ],
        );
        let parsed = parse_csr_pem(&pem).unwrap();
        assert_eq!(parsed.common_name.as_deref(), Some("system:node:i0"));
        assert_eq!(parsed.organizations, vec!["system:nodes".to_string()]);
        assert_eq!(parsed.dns_names, vec!["i0.c.p0.internal".to_string()]);
        assert_eq!(parsed.ip_addresses, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
        assert!(parsed.uris.is_empty());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_csr_pem(b"not a pem").is_err());
        let err = parse_csr_pem(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n");
        assert!(err.is_err());
    }
}
