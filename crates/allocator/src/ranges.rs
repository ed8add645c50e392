//! Pod range derivation: single-interface stack selection and the
//! multi-network interface/param-set matching.

use std::sync::Arc;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use nimbus_cloud::{trailing_segment, Instance, NetworkInterface};
use nimbus_core::{Error, StackType};
use nimbus_hub::CacheKeyed;

/// The multi-network `Network` object, shaped down to what matching
/// needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    /// Deletion timestamp present upstream; such networks are ignored.
    pub deleted: bool,
    /// Name of the GKENetworkParamSet carrying the range details.
    pub params_ref: Option<String>,
}

pub const DEFAULT_NETWORK: &str = "default";

impl Network {
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_NETWORK
    }

    pub fn from_dynamic(obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.clone()?;
        let deleted = obj.metadata.deletion_timestamp.is_some();
        let params_ref = obj
            .data
            .get("spec")
            .and_then(|s| s.get("parametersRef"))
            .and_then(|r| r.get("name"))
            .and_then(|n| n.as_str())
            .map(|s| s.to_string());
        Some(Self { name, deleted, params_ref })
    }
}

impl CacheKeyed for Network {
    fn cache_key(&self) -> String {
        self.name.clone()
    }

    fn label(&self, _key: &str) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GkeNetworkParamSet {
    pub name: String,
    pub vpc: String,
    pub vpc_subnet: String,
    pub pod_range_names: Vec<String>,
}

impl GkeNetworkParamSet {
    pub fn from_dynamic(obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.clone()?;
        let spec = obj.data.get("spec")?;
        let vpc = spec.get("vpc")?.as_str()?.to_string();
        let vpc_subnet = spec.get("vpcSubnet")?.as_str()?.to_string();
        let pod_range_names = spec
            .get("podIPv4Ranges")
            .and_then(|r| r.get("rangeNames"))
            .and_then(|n| n.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        Some(Self { name, vpc, vpc_subnet, pod_range_names })
    }
}

impl CacheKeyed for GkeNetworkParamSet {
    fn cache_key(&self) -> String {
        self.name.clone()
    }

    fn label(&self, _key: &str) -> Option<&str> {
        None
    }
}

/// The (ipv4, ipv6) pair one interface can contribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceRanges {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

/// An interface IPv6 value without a prefix is a bare address; nodes
/// draw pod IPs from its /112.
pub fn widen_ipv6(addr: &str) -> String {
    if addr.contains('/') {
        addr.to_string()
    } else {
        format!("{}/112", addr)
    }
}

pub fn interface_ranges(ifc: &NetworkInterface) -> InterfaceRanges {
    InterfaceRanges {
        ipv4: ifc.alias_ip_ranges.first().map(|r| r.ip_cidr_range.clone()),
        ipv6: ifc.ipv6_address.as_deref().map(widen_ipv6),
    }
}

/// True when the instance spans networks: several interfaces, or one
/// interface carrying several alias ranges.
pub fn is_multi_network(instance: &Instance) -> bool {
    instance.network_interfaces.len() > 1
        || instance
            .network_interfaces
            .first()
            .is_some_and(|ifc| ifc.alias_ip_ranges.len() > 1)
}

/// True when the instance has nothing to allocate from at all.
pub fn has_no_ranges(instance: &Instance) -> bool {
    match instance.network_interfaces.as_slice() {
        [] => true,
        [only] => only.alias_ip_ranges.is_empty() && only.ipv6_address.is_none(),
        _ => false,
    }
}

/// Order the derived pair by the cluster stack. Missing required
/// families fail.
pub fn stack_cidrs(stack: StackType, ranges: &InterfaceRanges) -> Result<Vec<String>, Error> {
    let missing = || {
        Error::Transient(format!(
            "no ranges from which CIDRs can be allocated for stack {}",
            stack
        ))
    };
    match stack {
        StackType::Ipv4 => Ok(vec![ranges.ipv4.clone().ok_or_else(missing)?]),
        StackType::Ipv6 => Ok(vec![ranges.ipv6.clone().ok_or_else(missing)?]),
        StackType::Ipv4Ipv6 => Ok(vec![
            ranges.ipv4.clone().ok_or_else(missing)?,
            ranges.ipv6.clone().ok_or_else(missing)?,
        ]),
        StackType::Ipv6Ipv4 => Ok(vec![
            ranges.ipv6.clone().ok_or_else(missing)?,
            ranges.ipv4.clone().ok_or_else(missing)?,
        ]),
    }
}

/// One non-default network attachment on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeNetwork {
    pub name: String,
    pub cidrs: Vec<String>,
}

/// A north interface: the node-level address on a non-default network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NorthInterface {
    pub network: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiNetworkAllocation {
    pub default_ranges: InterfaceRanges,
    pub north_interfaces: Vec<NorthInterface>,
    pub networks: Vec<NodeNetwork>,
}

/// Match instance interfaces against the observed networks. Networks
/// pending deletion are skipped; an interface matches when the trailing
/// segments of its network and subnet URLs equal the param set's VPC and
/// subnet; the first alias range named by the param set contributes the
/// CIDR.
pub fn match_networks(
    instance: &Instance,
    networks: &[Arc<Network>],
    lookup_params: impl Fn(&str) -> Option<Arc<GkeNetworkParamSet>>,
) -> MultiNetworkAllocation {
    let mut out = MultiNetworkAllocation::default();
    let mut sorted: Vec<&Arc<Network>> = networks.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for network in sorted {
        if network.deleted {
            continue;
        }
        let Some(params) = network.params_ref.as_deref().and_then(&lookup_params) else {
            continue;
        };
        for ifc in &instance.network_interfaces {
            if trailing_segment(&ifc.network) != params.vpc
                || trailing_segment(&ifc.subnetwork) != params.vpc_subnet
            {
                continue;
            }
            let hit = ifc.alias_ip_ranges.iter().find(|r| {
                r.subnetwork_range_name
                    .as_deref()
                    .is_some_and(|n| params.pod_range_names.iter().any(|p| p == n))
            });
            let Some(range) = hit else {
                continue;
            };
            if network.is_default() {
                out.default_ranges = InterfaceRanges {
                    ipv4: Some(range.ip_cidr_range.clone()),
                    ipv6: ifc.ipv6_address.as_deref().map(widen_ipv6),
                };
            } else {
                out.north_interfaces.push(NorthInterface {
                    network: network.name.clone(),
                    ip_address: ifc.network_ip.clone(),
                });
                out.networks.push(NodeNetwork {
                    name: network.name.clone(),
                    cidrs: vec![range.ip_cidr_range.clone()],
                });
            }
            break;
        }
    }
    out
}
