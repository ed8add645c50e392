//! Cloud provider IDs: `scheme://project/zone/instance`.

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderId {
    pub project: String,
    pub zone: String,
    pub instance: String,
}

impl ProviderId {
    /// Parse a node `spec.providerID`. The scheme is accepted but ignored.
    pub fn parse(provider_id: &str) -> Result<Self, Error> {
        let rest = provider_id
            .split_once("://")
            .map(|(_, r)| r)
            .ok_or_else(|| Error::Parse(format!("provider id missing scheme: {:?}", provider_id)))?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [project, zone, instance]
                if !project.is_empty() && !zone.is_empty() && !instance.is_empty() =>
            {
                Ok(ProviderId {
                    project: (*project).to_string(),
                    zone: (*zone).to_string(),
                    instance: (*instance).to_string(),
                })
            }
            _ => Err(Error::Parse(format!(
                "provider id not in scheme://project/zone/instance form: {:?}",
                provider_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gce_form() {
        let id = ProviderId::parse("gce://p0/us-central1-b/node-1").unwrap();
        assert_eq!(id.project, "p0");
        assert_eq!(id.zone, "us-central1-b");
        assert_eq!(id.instance, "node-1");
    }

    #[test]
    fn rejects_malformed() {
        assert!(ProviderId::parse("").is_err());
        assert!(ProviderId::parse("gce://p0/us-central1-b").is_err());
        assert!(ProviderId::parse("p0/zone/instance").is_err());
        assert!(ProviderId::parse("gce://p0//instance").is_err());
    }
}
