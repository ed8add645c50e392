//! Comma-separated `key=value` label lists as carried by instance
//! metadata and the last-applied annotations. Serialization is sorted so
//! the annotations stay stable across syncs.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::Error;

static LABEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?$").unwrap());
static LABEL_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?)?$").unwrap());
static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*$").unwrap()
});

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// Validate a label key per the Kubernetes qualified-name rules.
pub fn validate_label_key(key: &str) -> Result<(), Error> {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.len() > MAX_PREFIX_LEN || !DNS_SUBDOMAIN.is_match(prefix) {
                return Err(Error::Parse(format!("invalid label key prefix: {:?}", key)));
            }
            name
        }
        None => key,
    };
    if name.is_empty() || name.len() > MAX_NAME_LEN || !LABEL_NAME.is_match(name) {
        return Err(Error::Parse(format!("invalid label key: {:?}", key)));
    }
    Ok(())
}

pub fn validate_label_value(value: &str) -> Result<(), Error> {
    if value.len() > MAX_NAME_LEN || !LABEL_VALUE.is_match(value) {
        return Err(Error::Parse(format!("invalid label value: {:?}", value)));
    }
    Ok(())
}

/// Parse `"a=1,b=2"` into a sorted map. The empty string is an empty set.
pub fn parse(s: &str) -> Result<BTreeMap<String, String>, Error> {
    let mut out = BTreeMap::new();
    if s.is_empty() {
        return Ok(out);
    }
    for part in s.split(',') {
        let (k, v) = part
            .split_once('=')
            .ok_or_else(|| Error::Parse(format!("label entry missing '=': {:?}", part)))?;
        validate_label_key(k)?;
        validate_label_value(v)?;
        out.insert(k.to_string(), v.to_string());
    }
    Ok(out)
}

/// Serialize back to the comma list, sorted by key.
pub fn serialize(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
