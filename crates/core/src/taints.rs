//! Node taints as carried in the `node_taints=` segment of the
//! instance's kube-env metadata: `key=value:Effect` entries, comma
//! separated, serialized sorted by `key=value:effect`.

use serde::{Deserialize, Serialize};

use crate::labels::{validate_label_key, validate_label_value};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

const EFFECTS: [&str; 3] = ["NoSchedule", "PreferNoSchedule", "NoExecute"];

impl Taint {
    fn render(&self) -> String {
        format!("{}={}:{}", self.key, self.value, self.effect)
    }
}

/// Pull the `node_taints=` segment out of a kube-env blob. Segments are
/// separated by semicolons or newlines.
pub fn extract_taints_segment(kube_env: &str) -> Option<&str> {
    kube_env
        .split(|c| c == ';' || c == '\n')
        .map(str::trim)
        .find_map(|seg| seg.strip_prefix("node_taints="))
}

/// Parse `"k=v:NoSchedule,k2=v2:NoExecute"`. The empty string is an
/// empty set.
pub fn parse(s: &str) -> Result<Vec<Taint>, Error> {
    let mut out = Vec::new();
    if s.is_empty() {
        return Ok(out);
    }
    for part in s.split(',') {
        let (kv, effect) = part
            .rsplit_once(':')
            .ok_or_else(|| Error::Parse(format!("taint missing effect: {:?}", part)))?;
        let (k, v) = kv
            .split_once('=')
            .ok_or_else(|| Error::Parse(format!("taint missing '=': {:?}", part)))?;
        if !EFFECTS.contains(&effect) {
            return Err(Error::Parse(format!("unknown taint effect: {:?}", effect)));
        }
        validate_label_key(k)?;
        validate_label_value(v)?;
        out.push(Taint { key: k.to_string(), value: v.to_string(), effect: effect.to_string() });
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// Serialize sorted by `key=value:effect`.
pub fn serialize(taints: &[Taint]) -> String {
    let mut rendered: Vec<String> = taints.iter().map(Taint::render).collect();
    rendered.sort();
    rendered.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_sorted() {
        let taints = parse("b=2:NoExecute,a=1:NoSchedule").unwrap();
        assert_eq!(serialize(&taints), "a=1:NoSchedule,b=2:NoExecute");
        assert_eq!(parse(&serialize(&taints)).unwrap(), taints);
    }

    #[test]
    fn extracts_segment_from_kube_env() {
        let env = "node_labels=a=1;node_taints=dedicated=gpu:NoSchedule;other=x";
        assert_eq!(extract_taints_segment(env), Some("dedicated=gpu:NoSchedule"));
        let env_lines = "node_labels=a=1\nnode_taints=dedicated=gpu:NoSchedule\n";
        assert_eq!(extract_taints_segment(env_lines), Some("dedicated=gpu:NoSchedule"));
        assert_eq!(extract_taints_segment("node_labels=a=1"), None);
    }

    #[test]
    fn rejects_bad_taints() {
        assert!(parse("noeffect=1").is_err());
        assert!(parse("k=v:SortaSchedule").is_err());
        assert!(parse("k:NoSchedule").is_err());
    }
}
