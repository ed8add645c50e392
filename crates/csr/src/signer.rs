//! CSR signer: forwards approved requests to the external signing
//! webhook with jittered exponential backoff and copies the returned
//! certificate into the CSR status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use metrics::{counter, histogram};
use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nimbus_core::{Error, Result};
use nimbus_hub::api::Apis;
use nimbus_hub::{CacheEvent, SharedCache};
use nimbus_queue::{run_workers, WorkQueue};

use crate::{is_approved, parse, SignerKind};

/// One webhook round trip.
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    /// The webhook returned a CSR; its certificate bytes.
    Signed(Vec<u8>),
    /// Transport-level failure; retried.
    Transport(String),
    /// HTTP error; 5xx retried, anything else terminal.
    Http { status: u16, message: String },
}

#[async_trait::async_trait]
pub trait SigningWebhook: Send + Sync {
    async fn submit(&self, csr: &CertificateSigningRequest) -> WebhookOutcome;
}

/// Backoff for webhook calls: full jitter over an exponential curve.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub tries: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { tries: 4, initial: Duration::from_millis(500), multiplier: 1.5, cap: Duration::from_secs(10) }
    }
}

impl BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.cap.as_secs_f64());
        // Full jitter: anywhere in [0, capped).
        let jittered = rand::rng().random_range(0.0..capped.max(f64::EPSILON));
        Duration::from_secs_f64(jittered)
    }
}

pub struct CsrSigner {
    csrs: Arc<SharedCache<CertificateSigningRequest>>,
    apis: Apis,
    webhook: Arc<dyn SigningWebhook>,
    backoff: BackoffPolicy,
}

impl CsrSigner {
    pub fn new(
        csrs: Arc<SharedCache<CertificateSigningRequest>>,
        apis: Apis,
        webhook: Arc<dyn SigningWebhook>,
    ) -> Arc<Self> {
        Self::with_backoff(csrs, apis, webhook, BackoffPolicy::default())
    }

    pub fn with_backoff(
        csrs: Arc<SharedCache<CertificateSigningRequest>>,
        apis: Apis,
        webhook: Arc<dyn SigningWebhook>,
        backoff: BackoffPolicy,
    ) -> Arc<Self> {
        Arc::new(Self { csrs, apis, webhook, backoff })
    }

    pub async fn run(self: Arc<Self>, ctx: CancellationToken, workers: usize) {
        let queue = WorkQueue::with_default_limiter("csr_signer");
        let handler = {
            let queue = Arc::clone(&queue);
            self.csrs.register(move |ev| {
                if let CacheEvent::Applied { new, .. } = ev {
                    queue.enqueue(None, new.metadata.name.as_deref());
                }
            })
        };

        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = self.csrs.wait_synced() => {}
        }
        for csr in self.csrs.list() {
            queue.enqueue(None, csr.metadata.name.as_deref());
        }

        let this = Arc::clone(&self);
        let pool = run_workers(
            Arc::clone(&queue),
            workers,
            Arc::new(move |key| {
                let this = Arc::clone(&this);
                Box::pin(async move { this.sync(&key).await })
            }),
        );
        info!("csr signer running");
        ctx.cancelled().await;
        pool.shutdown().await;
        handler.release();
    }

    pub async fn sync(&self, key: &str) -> Result<()> {
        let Some(csr) = self.csrs.get(key) else {
            return Ok(());
        };
        if !is_approved(&csr) {
            return Ok(());
        }
        let already_signed = csr
            .status
            .as_ref()
            .and_then(|s| s.certificate.as_ref())
            .is_some_and(|c| !c.0.is_empty());
        if already_signed {
            return Ok(());
        }
        // Signer names off the known list are silently skipped.
        if SignerKind::from_name(&csr.spec.signer_name).is_none() {
            debug!(csr = key, signer = %csr.spec.signer_name, "unknown signer, skipping");
            return Ok(());
        }

        let t0 = Instant::now();
        if let Err(e) = parse::parse_csr_pem(&csr.spec.request.0) {
            counter!("csr_signing_total", 1u64, "phase" => "parse", "outcome" => "error");
            histogram!("csr_signing_latency_seconds", t0.elapsed().as_secs_f64(), "outcome" => "error");
            return Err(e);
        }

        match self.submit_with_backoff(&csr).await {
            Ok(certificate) => {
                self.apis.csrs.patch_status_certificate(key, certificate).await?;
                counter!("csr_signing_total", 1u64, "phase" => "sign", "outcome" => "success");
                histogram!("csr_signing_latency_seconds", t0.elapsed().as_secs_f64(), "outcome" => "success");
                Ok(())
            }
            Err(e) => {
                counter!("csr_signing_total", 1u64, "phase" => "sign", "outcome" => "error");
                histogram!("csr_signing_latency_seconds", t0.elapsed().as_secs_f64(), "outcome" => "error");
                Err(e)
            }
        }
    }

    async fn submit_with_backoff(&self, csr: &CertificateSigningRequest) -> Result<Vec<u8>> {
        let name = csr.metadata.name.as_deref().unwrap_or_default();
        let mut last_err = String::new();
        for attempt in 0..self.backoff.tries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
            }
            match self.webhook.submit(csr).await {
                WebhookOutcome::Signed(certificate) => return Ok(certificate),
                WebhookOutcome::Transport(msg) => {
                    warn!(csr = name, attempt, error = %msg, "signing webhook transport failure");
                    last_err = msg;
                }
                WebhookOutcome::Http { status, message } if status >= 500 => {
                    warn!(csr = name, attempt, status, "signing webhook server error");
                    last_err = format!("http {}: {}", status, message);
                }
                WebhookOutcome::Http { status, message } => {
                    return Err(Error::Denied(format!(
                        "signing webhook rejected {}: http {}: {}",
                        name, status, message
                    )));
                }
            }
        }
        Err(Error::Transient(format!(
            "signing webhook failed after {} tries: {}",
            self.backoff.tries, last_err
        )))
    }
}

/// Error body some webhook failures carry.
#[derive(Debug, Deserialize)]
struct WebhookErrorBody {
    #[serde(rename = "Error")]
    error: Option<WebhookErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct WebhookErrorDetail {
    #[serde(rename = "Code")]
    #[allow(dead_code)]
    code: Option<i64>,
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "Status")]
    #[allow(dead_code)]
    status: Option<String>,
}

/// The production webhook client.
pub struct HttpSigningWebhook {
    http: reqwest::Client,
    url: String,
}

impl HttpSigningWebhook {
    pub fn new(url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("building webhook client: {}", e)))?;
        Ok(Self { http, url: url.to_string() })
    }
}

#[async_trait::async_trait]
impl SigningWebhook for HttpSigningWebhook {
    async fn submit(&self, csr: &CertificateSigningRequest) -> WebhookOutcome {
        let resp = match self.http.post(&self.url).json(csr).send().await {
            Ok(resp) => resp,
            Err(e) => return WebhookOutcome::Transport(e.to_string()),
        };
        let status = resp.status();
        if status.is_success() {
            match resp.json::<CertificateSigningRequest>().await {
                Ok(signed) => {
                    let certificate = signed
                        .status
                        .and_then(|s| s.certificate)
                        .map(|c| c.0)
                        .unwrap_or_default();
                    WebhookOutcome::Signed(certificate)
                }
                Err(e) => WebhookOutcome::Transport(format!("decoding signed response: {}", e)),
            }
        } else {
            // Prefer the structured error message, fall back to status text.
            let fallback = status.canonical_reason().unwrap_or("unknown error").to_string();
            let message = match resp.json::<WebhookErrorBody>().await {
                Ok(body) => body.error.and_then(|e| e.message).unwrap_or(fallback),
                Err(_) => fallback,
            };
            WebhookOutcome::Http { status: status.as_u16(), message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_under_cap() {
        let policy = BackoffPolicy::default();
        for attempt in 0..16 {
            assert!(policy.delay(attempt) < Duration::from_secs(10));
        }
    }

    #[test]
    fn error_body_decodes() {
        let raw = r#"{"Error":{"Code":13,"Message":"signer unavailable","Status":"INTERNAL"}}"#;
        let body: WebhookErrorBody = serde_json::from_str(raw).unwrap();
        assert_eq!(body.error.unwrap().message.as_deref(), Some("signer unavailable"));
    }
}
