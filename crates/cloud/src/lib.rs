//! Nimbus cloud surface: instance model, the `Compute` trait the
//! controllers call, and the tenant-scoped client factory.

#![forbid(unsafe_code)]

mod factory;
pub mod fake;
mod http;

pub use factory::CloudConfig;
pub use http::HttpCompute;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("decode: {0}")]
    Decode(String),
    #[error("config: {0}")]
    Config(String),
}

impl From<CloudError> for nimbus_core::Error {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::NotFound(m) => nimbus_core::Error::NotFound(m),
            CloudError::Transient(m) => nimbus_core::Error::Transient(m),
            CloudError::Status(s) if s >= 500 => {
                nimbus_core::Error::Transient(format!("cloud http {}", s))
            }
            CloudError::Status(s) => nimbus_core::Error::Parse(format!("cloud http {}", s)),
            CloudError::Decode(m) => nimbus_core::Error::Parse(m),
            CloudError::Config(m) => nimbus_core::Error::Config(m),
        }
    }
}

/// A compute instance as returned by the cloud API. Only the fields the
/// controllers consume are modeled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    #[serde(with = "u64_string")]
    pub id: u64,
    pub name: String,
    /// Zone URL; the trailing segment is the zone name.
    pub zone: String,
    pub network_interfaces: Vec<NetworkInterface>,
    pub metadata: InstanceMetadata,
}

impl Instance {
    pub fn zone_name(&self) -> &str {
        trailing_segment(&self.zone)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .items
            .iter()
            .find(|item| item.key == key)
            .and_then(|item| item.value.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceMetadata {
    #[serde(default)]
    pub items: Vec<MetadataEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterface {
    /// Network URL; the trailing segment names the VPC.
    pub network: String,
    /// Subnetwork URL; the trailing segment names the subnet.
    pub subnetwork: String,
    /// Primary internal IPv4 address.
    #[serde(rename = "networkIP")]
    pub network_ip: String,
    /// IPv6 address or range, internal or external, when assigned.
    pub ipv6_address: Option<String>,
    pub alias_ip_ranges: Vec<AliasIpRange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AliasIpRange {
    pub ip_cidr_range: String,
    pub subnetwork_range_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ShieldedVmIdentity {
    pub signing_key: Option<ShieldedKey>,
    pub encryption_key: Option<ShieldedKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ShieldedKey {
    pub ek_cert: Option<String>,
    pub ek_pub: Option<String>,
}

/// The cloud calls the controllers make. Tenant-scoped instances are
/// produced by [`CloudConfig::for_tenant`] + [`HttpCompute::new`]; tests
/// substitute their own impls.
#[async_trait::async_trait]
pub trait Compute: Send + Sync {
    /// Fetch an instance; `Ok(None)` when the cloud says it does not exist.
    async fn instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Option<Instance>, CloudError>;

    /// Zone names available to a project.
    async fn zones(&self, project: &str) -> Result<Vec<String>, CloudError>;

    /// Resources referring to an instance (forwarding-rule style URLs).
    async fn instance_referrers(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Vec<String>, CloudError>;

    /// Shielded VM identity, used by attestation checks.
    async fn shielded_identity(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<ShieldedVmIdentity, CloudError>;
}

/// Trailing path segment of a resource URL.
pub fn trailing_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

mod u64_string {
    //! Instance ids arrive as decimal strings in the wire JSON.
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }
        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_decodes_wire_shape() {
        let raw = serde_json::json!({
            "id": "5554443332221110",
            "name": "node-1",
            "zone": "https://compute.example/v1/projects/p0/zones/us-central1-b",
            "networkInterfaces": [{
                "network": "projects/p0/global/networks/default",
                "subnetwork": "projects/p0/regions/us-central1/subnetworks/subnet-a",
                "networkIP": "10.128.0.3",
                "aliasIpRanges": [
                    {"ipCidrRange": "10.0.1.0/24", "subnetworkRangeName": "pods"}
                ]
            }],
            "metadata": {"items": [
                {"key": "kube-labels", "value": "a=1"},
                {"key": "empty"}
            ]}
        });
        let inst: Instance = serde_json::from_value(raw).unwrap();
        assert_eq!(inst.id, 5554443332221110);
        assert_eq!(inst.zone_name(), "us-central1-b");
        assert_eq!(inst.metadata_value("kube-labels"), Some("a=1"));
        assert_eq!(inst.metadata_value("empty"), None);
        let ifc = &inst.network_interfaces[0];
        assert_eq!(ifc.network_ip, "10.128.0.3");
        assert_eq!(ifc.alias_ip_ranges[0].subnetwork_range_name.as_deref(), Some("pods"));
    }

    #[test]
    fn trailing_segment_handles_bare_names() {
        assert_eq!(trailing_segment("projects/p/global/networks/vpc-1"), "vpc-1");
        assert_eq!(trailing_segment("vpc-1"), "vpc-1");
    }
}
