#![forbid(unsafe_code)]

//! Signer retry behavior against a scripted webhook.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    CertificateSigningRequestStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use nimbus_csr::signer::{BackoffPolicy, CsrSigner, SigningWebhook, WebhookOutcome};
use nimbus_hub::fakes::FakeApis;
use nimbus_hub::SharedCache;

fn request_pem() -> Vec<u8> {
    let params = rcgen::CertificateParams::new(vec!["node-1".to_string()]).unwrap();
    let key = rcgen::KeyPair::generate().unwrap();
    params.serialize_request(&key).unwrap().pem().unwrap().into_bytes()
}

fn approved_csr(name: &str, signer: &str) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
        spec: CertificateSigningRequestSpec {
            request: ByteString(request_pem()),
            signer_name: signer.to_string(),
            ..Default::default()
        },
        status: Some(CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: "Approved".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Scripted webhook: a fixed list of outcomes, then success forever.
struct ScriptedWebhook {
    calls: AtomicUsize,
    script: Vec<WebhookOutcome>,
    then: WebhookOutcome,
}

impl ScriptedWebhook {
    fn new(script: Vec<WebhookOutcome>, then: WebhookOutcome) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), script, then })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SigningWebhook for ScriptedWebhook {
    async fn submit(&self, _csr: &CertificateSigningRequest) -> WebhookOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.get(n).cloned().unwrap_or_else(|| self.then.clone())
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        tries: 4,
        initial: Duration::from_millis(1),
        multiplier: 1.5,
        cap: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn three_server_errors_then_success_signs_on_the_fourth_post() {
    let csrs = SharedCache::<CertificateSigningRequest>::new("csrs");
    csrs.apply(approved_csr("c1", "kubernetes.io/kubelet-serving"));
    let apis = FakeApis::new();

    let err = WebhookOutcome::Http { status: 500, message: "boom".to_string() };
    let webhook = ScriptedWebhook::new(
        vec![err.clone(), err.clone(), err],
        WebhookOutcome::Signed(vec![0x66, 0x61, 0x6b, 0x65]),
    );

    let signer = CsrSigner::with_backoff(
        Arc::clone(&csrs),
        apis.apis(),
        Arc::clone(&webhook) as Arc<dyn SigningWebhook>,
        fast_backoff(),
    );
    signer.sync("c1").await.unwrap();

    assert_eq!(webhook.calls(), 4);
    let certs = apis.csrs.certificates.lock().unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0], ("c1".to_string(), vec![0x66, 0x61, 0x6b, 0x65]));
}

#[tokio::test]
async fn four_failures_exhaust_the_budget() {
    let csrs = SharedCache::<CertificateSigningRequest>::new("csrs");
    csrs.apply(approved_csr("c2", "kubernetes.io/kubelet-serving"));
    let apis = FakeApis::new();

    let webhook = ScriptedWebhook::new(
        Vec::new(),
        WebhookOutcome::Http { status: 503, message: "unavailable".to_string() },
    );
    let signer = CsrSigner::with_backoff(
        Arc::clone(&csrs),
        apis.apis(),
        Arc::clone(&webhook) as Arc<dyn SigningWebhook>,
        fast_backoff(),
    );

    let err = signer.sync("c2").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(webhook.calls(), 4);
    assert!(apis.csrs.certificates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn transport_failures_are_retried_too() {
    let csrs = SharedCache::<CertificateSigningRequest>::new("csrs");
    csrs.apply(approved_csr("c3", "kubernetes.io/kubelet-serving"));
    let apis = FakeApis::new();

    let webhook = ScriptedWebhook::new(
        vec![WebhookOutcome::Transport("connection reset".to_string())],
        WebhookOutcome::Signed(b"cert".to_vec()),
    );
    let signer = CsrSigner::with_backoff(
        Arc::clone(&csrs),
        apis.apis(),
        Arc::clone(&webhook) as Arc<dyn SigningWebhook>,
        fast_backoff(),
    );
    signer.sync("c3").await.unwrap();
    assert_eq!(webhook.calls(), 2);
}

#[tokio::test]
async fn client_error_is_terminal() {
    let csrs = SharedCache::<CertificateSigningRequest>::new("csrs");
    csrs.apply(approved_csr("c4", "kubernetes.io/kubelet-serving"));
    let apis = FakeApis::new();

    let webhook = ScriptedWebhook::new(
        Vec::new(),
        WebhookOutcome::Http { status: 400, message: "malformed".to_string() },
    );
    let signer = CsrSigner::with_backoff(
        Arc::clone(&csrs),
        apis.apis(),
        Arc::clone(&webhook) as Arc<dyn SigningWebhook>,
        fast_backoff(),
    );
    let err = signer.sync("c4").await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(webhook.calls(), 1);
}

#[tokio::test]
async fn unapproved_and_unknown_signers_are_skipped() {
    let csrs = SharedCache::<CertificateSigningRequest>::new("csrs");
    let mut pending = approved_csr("c5", "kubernetes.io/kubelet-serving");
    pending.status = None;
    csrs.apply(pending);
    csrs.apply(approved_csr("c6", "example.com/elsewhere"));
    let apis = FakeApis::new();

    let webhook = ScriptedWebhook::new(Vec::new(), WebhookOutcome::Signed(b"cert".to_vec()));
    let signer = CsrSigner::with_backoff(
        Arc::clone(&csrs),
        apis.apis(),
        Arc::clone(&webhook) as Arc<dyn SigningWebhook>,
        fast_backoff(),
    );
    signer.sync("c5").await.unwrap();
    signer.sync("c6").await.unwrap();
    assert_eq!(webhook.calls(), 0);
}

#[tokio::test]
async fn already_signed_csr_is_not_resubmitted() {
    let csrs = SharedCache::<CertificateSigningRequest>::new("csrs");
    let mut signed = approved_csr("c7", "kubernetes.io/kubelet-serving");
    signed.status.as_mut().unwrap().certificate = Some(ByteString(b"cert".to_vec()));
    csrs.apply(signed);
    let apis = FakeApis::new();

    let webhook = ScriptedWebhook::new(Vec::new(), WebhookOutcome::Signed(b"cert".to_vec()));
    let signer = CsrSigner::with_backoff(
        Arc::clone(&csrs),
        apis.apis(),
        Arc::clone(&webhook) as Arc<dyn SigningWebhook>,
        fast_backoff(),
    );
    signer.sync("c7").await.unwrap();
    assert_eq!(webhook.calls(), 0);
}

#[tokio::test]
async fn unparsable_request_is_a_terminal_parse_error() {
    let csrs = SharedCache::<CertificateSigningRequest>::new("csrs");
    let mut bad = approved_csr("c8", "kubernetes.io/kubelet-serving");
    bad.spec.request = ByteString(b"not pem".to_vec());
    csrs.apply(bad);
    let apis = FakeApis::new();

    let webhook = ScriptedWebhook::new(Vec::new(), WebhookOutcome::Signed(b"cert".to_vec()));
    let signer = CsrSigner::with_backoff(
        Arc::clone(&csrs),
        apis.apis(),
        Arc::clone(&webhook) as Arc<dyn SigningWebhook>,
        fast_backoff(),
    );
    let err = signer.sync("c8").await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(webhook.calls(), 0);
}
