//! Compute-over-HTTP client. Thin on purpose: the interesting logic
//! lives behind the `Compute` trait so controllers and tests never see
//! HTTP.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::{CloudConfig, CloudError, Compute, Instance, ShieldedVmIdentity};

const DEFAULT_BASE: &str = "https://compute.googleapis.com/compute/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 60);

pub struct HttpCompute {
    http: reqwest::Client,
    base: String,
    config: CloudConfig,
    token: Mutex<Option<(String, Instant)>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize, Default)]
struct NamedList {
    #[serde(default)]
    items: Vec<Named>,
}

#[derive(Deserialize)]
struct Named {
    name: String,
}

#[derive(Deserialize, Default)]
struct ReferrerList {
    #[serde(default)]
    items: Vec<Referrer>,
}

#[derive(Deserialize)]
struct Referrer {
    referrer: Option<String>,
}

impl HttpCompute {
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::Config(format!("building http client: {}", e)))?;
        let base = config
            .api_endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE.to_string());
        let base = base.trim_end_matches('/').to_string();
        Ok(Self { http, base, config, token: Mutex::new(None) })
    }

    async fn bearer(&self) -> Result<String, CloudError> {
        {
            let g = self.token.lock().expect("token lock poisoned");
            if let Some((tok, at)) = g.as_ref() {
                if at.elapsed() < TOKEN_LIFETIME {
                    return Ok(tok.clone());
                }
            }
        }
        let resp = self
            .http
            .post(&self.config.token_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(self.config.token_body.clone())
            .send()
            .await
            .map_err(|e| CloudError::Transient(format!("token request: {}", e)))?;
        if !resp.status().is_success() {
            return Err(CloudError::Status(resp.status().as_u16()));
        }
        let tok: TokenResponse = resp
            .json()
            .await
            .map_err(|e| CloudError::Decode(format!("token response: {}", e)))?;
        let mut g = self.token.lock().expect("token lock poisoned");
        *g = Some((tok.access_token.clone(), Instant::now()));
        Ok(tok.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, CloudError> {
        let token = self.bearer().await?;
        debug!(url, "cloud GET");
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CloudError::Transient(format!("{}: {}", url, e)))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(CloudError::Transient(format!("{}: http {}", url, status)));
        }
        if !status.is_success() {
            return Err(CloudError::Status(status.as_u16()));
        }
        let body = resp
            .json::<T>()
            .await
            .map_err(|e| CloudError::Decode(format!("{}: {}", url, e)))?;
        Ok(Some(body))
    }

    fn beta_base(&self) -> String {
        // Shielded identity is only served on the beta surface.
        self.base.replace("/compute/v1", "/compute/beta")
    }
}

#[async_trait::async_trait]
impl Compute for HttpCompute {
    async fn instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Option<Instance>, CloudError> {
        let url = format!("{}/projects/{}/zones/{}/instances/{}", self.base, project, zone, name);
        self.get_json(&url).await
    }

    async fn zones(&self, project: &str) -> Result<Vec<String>, CloudError> {
        let url = format!("{}/projects/{}/zones", self.base, project);
        let list: NamedList = self
            .get_json(&url)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("project {}", project)))?;
        Ok(list.items.into_iter().map(|z| z.name).collect())
    }

    async fn instance_referrers(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Vec<String>, CloudError> {
        let url = format!(
            "{}/projects/{}/zones/{}/instances/{}/referrers",
            self.base, project, zone, name
        );
        let list: ReferrerList = self.get_json(&url).await?.unwrap_or_default();
        Ok(list.items.into_iter().filter_map(|r| r.referrer).collect())
    }

    async fn shielded_identity(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<ShieldedVmIdentity, CloudError> {
        let url = format!(
            "{}/projects/{}/zones/{}/instances/{}/getShieldedVmIdentity",
            self.beta_base(),
            project,
            zone,
            name
        );
        self.get_json(&url)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("shielded identity for {}", name)))
    }
}
