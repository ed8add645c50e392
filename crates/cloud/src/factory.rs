//! Tenant-scoped cloud configuration: rewrites the token endpoint and
//! body so API calls authenticate as the tenant.

use nimbus_core::ProviderConfig;
use serde_json::Value;

use crate::CloudError;

/// Base cloud configuration handed to the process at startup, plus the
/// per-tenant rewrites derived from it.
#[derive(Debug, Clone, Default)]
pub struct CloudConfig {
    pub project_id: String,
    /// Endpoint POSTed to for access tokens.
    pub token_url: String,
    /// JSON body for the token request. May arrive wrapped in a JSON
    /// string; the wrapper is preserved.
    pub token_body: String,
    /// Compute API base override; the public endpoint when unset.
    pub api_endpoint: Option<String>,
    /// The cluster's own subnetwork URL.
    pub subnetwork_url: Option<String>,
    /// Resolve the project from each node's provider ID instead of the
    /// configured project.
    pub multi_project: bool,
}

impl CloudConfig {
    /// Derive the configuration for one tenant. Tenants carrying the
    /// tenancy label get the tenant token endpoint; every tenant gets a
    /// token body naming its own project number.
    pub fn for_tenant(&self, tenant: &ProviderConfig) -> Result<CloudConfig, CloudError> {
        let mut out = self.clone();
        if tenant.tenancy.is_some() {
            out.token_url = rewrite_token_url(&self.token_url, tenant)?;
        }
        out.token_body = rewrite_token_body(&self.token_body, tenant)?;
        Ok(out)
    }
}

fn region_from_token_url(url: &str) -> Result<&str, CloudError> {
    url.split("locations/")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CloudError::Config(format!("token URL carries no locations/ segment: {}", url)))
}

/// Replace the `projects/.../clusters/...:generateToken` suffix with the
/// tenant form. Anchored on the first `/projects/` segment; a cluster
/// name containing the literal "projects" is not handled.
fn rewrite_token_url(url: &str, tenant: &ProviderConfig) -> Result<String, CloudError> {
    let region = region_from_token_url(url)?;
    let idx = url
        .find("/projects/")
        .ok_or_else(|| CloudError::Config(format!("cannot rewrite token URL: {}", url)))?;
    Ok(format!(
        "{}/projects/{}/locations/{}/tenants/{}:generateTenantToken",
        &url[..idx],
        tenant.project_number,
        region,
        tenant.name
    ))
}

/// Point `projectNumber` in the token body at the tenant. A body wrapped
/// in a JSON string is unwrapped, rewritten, and wrapped again.
fn rewrite_token_body(body: &str, tenant: &ProviderConfig) -> Result<String, CloudError> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| CloudError::Config(format!("token body is not JSON: {}", e)))?;
    let (mut inner, wrapped) = match parsed {
        Value::String(s) => (
            serde_json::from_str::<Value>(&s)
                .map_err(|e| CloudError::Config(format!("wrapped token body is not JSON: {}", e)))?,
            true,
        ),
        other => (other, false),
    };
    let obj = inner
        .as_object_mut()
        .ok_or_else(|| CloudError::Config("token body is not a JSON object".into()))?;
    obj.insert("projectNumber".to_string(), Value::from(tenant.project_number));
    let rewritten = serde_json::to_string(&inner).expect("JSON value serializes");
    if wrapped {
        Ok(serde_json::to_string(&Value::String(rewritten)).expect("JSON string serializes"))
    } else {
        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str, labelled: bool) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            tenancy: labelled.then(|| name.to_string()),
            project_number: 12345,
            ..Default::default()
        }
    }

    fn base() -> CloudConfig {
        CloudConfig {
            project_id: "host-project".into(),
            token_url:
                "https://container.example/v1/projects/host-project/locations/us-central1/clusters/c1:generateToken"
                    .into(),
            token_body: r#"{"projectNumber":1,"clusterId":"c1"}"#.into(),
            ..Default::default()
        }
    }

    #[test]
    fn rewrites_url_for_labelled_tenant() {
        let cfg = base().for_tenant(&tenant("t1", true)).unwrap();
        assert_eq!(
            cfg.token_url,
            "https://container.example/v1/projects/12345/locations/us-central1/tenants/t1:generateTenantToken"
        );
    }

    #[test]
    fn unlabelled_tenant_keeps_url() {
        let cfg = base().for_tenant(&tenant("t1", false)).unwrap();
        assert_eq!(cfg.token_url, base().token_url);
    }

    #[test]
    fn rewrites_body_project_number() {
        let cfg = base().for_tenant(&tenant("t1", true)).unwrap();
        let v: Value = serde_json::from_str(&cfg.token_body).unwrap();
        assert_eq!(v["projectNumber"], 12345);
        assert_eq!(v["clusterId"], "c1");
    }

    #[test]
    fn unwraps_and_rewraps_quoted_body() {
        let mut b = base();
        b.token_body = serde_json::to_string(&r#"{"projectNumber":1}"#).unwrap();
        let cfg = b.for_tenant(&tenant("t1", true)).unwrap();
        // Still a JSON string on the outside.
        let outer: Value = serde_json::from_str(&cfg.token_body).unwrap();
        let inner: Value = serde_json::from_str(outer.as_str().unwrap()).unwrap();
        assert_eq!(inner["projectNumber"], 12345);
    }

    #[test]
    fn url_without_projects_segment_fails() {
        let mut b = base();
        b.token_url = "https://container.example/v1/locations/us-central1/clusters/c1:generateToken".into();
        let err = b.for_tenant(&tenant("t1", true)).unwrap_err();
        assert!(err.to_string().contains("cannot rewrite token URL"));
    }

    #[test]
    fn invalid_body_fails() {
        let mut b = base();
        b.token_body = "not json".into();
        assert!(b.for_tenant(&tenant("t1", true)).is_err());
        b.token_body = serde_json::to_string("still not json").unwrap();
        assert!(b.for_tenant(&tenant("t1", true)).is_err());
    }
}
