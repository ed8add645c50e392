//! Cluster-SA to cloud-SA maps, shared by reference between the
//! service-account verifier and the node syncer. Lock acquisition stays
//! inside this crate's methods; callers never see the guards.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::RwLock;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use nimbus_core::keys::pod_key;

/// A cluster service account, identified by (namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KsaKey {
    pub namespace: String,
    pub name: String,
}

impl KsaKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self { namespace: namespace.to_string(), name: name.to_string() }
    }
}

impl std::fmt::Display for KsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The verified K-SA → G-SA mapping. Only the verifier replaces it
/// wholesale; everyone else reads.
#[derive(Default)]
pub struct VerifiedSaMap {
    inner: RwLock<FxHashMap<KsaKey, String>>,
}

impl VerifiedSaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a verified mapping, returning the previous G-SA if any.
    pub fn add(&self, ksa: KsaKey, gsa: &str) -> Option<String> {
        self.inner.write().expect("map lock poisoned").insert(ksa, gsa.to_string())
    }

    /// Idempotent removal.
    pub fn remove(&self, ksa: &KsaKey) -> Option<String> {
        self.inner.write().expect("map lock poisoned").remove(ksa)
    }

    pub fn get(&self, ksa: &KsaKey) -> Option<String> {
        self.inner.read().expect("map lock poisoned").get(ksa).cloned()
    }

    /// Wholesale replacement; reserved to the verifier.
    pub fn replace_all(&self, entries: FxHashMap<KsaKey, String>) {
        *self.inner.write().expect("map lock poisoned") = entries;
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize to ConfigMap `data` for persistence.
    pub fn to_config_map_data(&self) -> BTreeMap<String, String> {
        let g = self.inner.read().expect("map lock poisoned");
        let body: BTreeMap<String, &String> = g.iter().map(|(k, v)| (k.to_string(), v)).collect();
        let mut data = BTreeMap::new();
        data.insert(
            VERIFIED_SA_DATA_KEY.to_string(),
            serde_json::to_string(&body).expect("string map serializes"),
        );
        data
    }

    /// Load from ConfigMap `data`. Missing key means an empty map.
    pub fn load_config_map_data(&self, data: &BTreeMap<String, String>) -> nimbus_core::Result<()> {
        let Some(raw) = data.get(VERIFIED_SA_DATA_KEY) else {
            self.replace_all(FxHashMap::default());
            return Ok(());
        };
        let body: BTreeMap<String, String> = serde_json::from_str(raw)
            .map_err(|e| nimbus_core::Error::Parse(format!("verified SA payload: {}", e)))?;
        let mut entries = FxHashMap::default();
        for (k, gsa) in body {
            let (ns, name) = k
                .split_once('/')
                .ok_or_else(|| nimbus_core::Error::Parse(format!("bad K-SA key: {:?}", k)))?;
            entries.insert(KsaKey::new(ns, name), gsa);
        }
        self.replace_all(entries);
        Ok(())
    }
}

pub const VERIFIED_SA_DATA_KEY: &str = "verified-ksa-to-gsa.json";

/// Per-node usage: node → (pod key → G-SA). Pods are cluster-unique, so
/// an add for a pod already tracked on another node moves it.
#[derive(Default)]
pub struct NodeSaMap {
    inner: RwLock<NodeSaInner>,
}

#[derive(Default)]
struct NodeSaInner {
    by_node: FxHashMap<String, FxHashMap<String, String>>,
    node_of_pod: FxHashMap<String, String>,
}

impl NodeSaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `pod` on `node` runs as `gsa`. Returns the pod's
    /// previous G-SA if it was already tracked.
    pub fn add(&self, node: &str, namespace: &str, pod: &str, gsa: &str) -> Option<String> {
        let key = pod_key(namespace, pod);
        let mut g = self.inner.write().expect("map lock poisoned");
        let previous = match g.node_of_pod.insert(key.clone(), node.to_string()) {
            Some(old_node) if old_node != node => {
                g.by_node.get_mut(&old_node).and_then(|pods| pods.remove(&key))
            }
            Some(_) => g.by_node.get(node).and_then(|pods| pods.get(&key).cloned()),
            None => None,
        };
        g.by_node.entry(node.to_string()).or_default().insert(key, gsa.to_string());
        previous
    }

    /// Drop a pod, returning the (node, G-SA) it was tracked under.
    pub fn remove(&self, namespace: &str, pod: &str) -> Option<(String, String)> {
        let key = pod_key(namespace, pod);
        let mut g = self.inner.write().expect("map lock poisoned");
        let node = g.node_of_pod.remove(&key)?;
        let gsa = g.by_node.get_mut(&node).and_then(|pods| pods.remove(&key))?;
        if g.by_node.get(&node).is_some_and(|pods| pods.is_empty()) {
            g.by_node.remove(&node);
        }
        Some((node, gsa))
    }

    /// Duplicate-free list of G-SAs in use on a node, sorted.
    pub fn gsa_emails_by_node(&self, node: &str) -> Vec<String> {
        let g = self.inner.read().expect("map lock poisoned");
        let Some(pods) = g.by_node.get(node) else {
            return Vec::new();
        };
        let mut emails: Vec<String> = pods.values().cloned().collect();
        emails.sort();
        emails.dedup();
        emails
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verified_map_add_returns_previous() {
        let m = VerifiedSaMap::new();
        let ksa = KsaKey::new("ns", "sa");
        assert_eq!(m.add(ksa.clone(), "a@example.iam"), None);
        assert_eq!(m.add(ksa.clone(), "b@example.iam"), Some("a@example.iam".to_string()));
        assert_eq!(m.get(&ksa).as_deref(), Some("b@example.iam"));
        assert_eq!(m.remove(&ksa).as_deref(), Some("b@example.iam"));
        // Idempotent.
        assert_eq!(m.remove(&ksa), None);
    }

    #[test]
    fn verified_map_config_map_round_trip() {
        let m = VerifiedSaMap::new();
        m.add(KsaKey::new("ns1", "sa1"), "a@example.iam");
        m.add(KsaKey::new("ns2", "sa2"), "b@example.iam");
        let data = m.to_config_map_data();

        let loaded = VerifiedSaMap::new();
        loaded.load_config_map_data(&data).unwrap();
        assert_eq!(loaded.get(&KsaKey::new("ns1", "sa1")).as_deref(), Some("a@example.iam"));
        assert_eq!(loaded.get(&KsaKey::new("ns2", "sa2")).as_deref(), Some("b@example.iam"));
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn node_map_tracks_and_removes() {
        let m = NodeSaMap::new();
        assert_eq!(m.add("n1", "ns", "p1", "a@x"), None);
        assert_eq!(m.add("n1", "ns", "p2", "a@x"), None);
        assert_eq!(m.add("n1", "ns", "p3", "b@x"), None);
        assert_eq!(m.gsa_emails_by_node("n1"), vec!["a@x".to_string(), "b@x".to_string()]);

        assert_eq!(m.remove("ns", "p3"), Some(("n1".to_string(), "b@x".to_string())));
        assert_eq!(m.gsa_emails_by_node("n1"), vec!["a@x".to_string()]);
        assert_eq!(m.remove("ns", "p3"), None);
    }

    #[test]
    fn node_map_pod_moves_between_nodes() {
        let m = NodeSaMap::new();
        m.add("n1", "ns", "p1", "a@x");
        assert_eq!(m.add("n2", "ns", "p1", "a@x"), Some("a@x".to_string()));
        assert!(m.gsa_emails_by_node("n1").is_empty());
        assert_eq!(m.gsa_emails_by_node("n2"), vec!["a@x".to_string()]);
    }
}
