//! Admission webhook HTTP server
//!
//! Serves the validating webhook endpoint plus health probes. TLS is
//! terminated with rustls when a certificate and key are configured.

use super::validator::NfsPvcValidator;
use crate::crd::NfsPvc;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Path the API server posts NfsPvc admission reviews to
pub const VALIDATE_PATH: &str = "/validate-nfspvc-dana-io-v1alpha1-nfspvc";

/// Certificate and key files for serving HTTPS
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Webhook server configuration
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub addr: SocketAddr,
    pub tls: Option<TlsFiles>,
}

/// State shared by webhook handlers
pub struct WebhookState {
    pub validator: NfsPvcValidator,
    pub metrics: Arc<Metrics>,
}

// =============================================================================
// Handlers
// =============================================================================

fn operation_label(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "CREATE",
        Operation::Update => "UPDATE",
        Operation::Delete => "DELETE",
        Operation::Connect => "CONNECT",
    }
}

/// Turn an admission review into the response review
pub async fn handle_review(
    state: &WebhookState,
    review: AdmissionReview<NfsPvc>,
) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<NfsPvc> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            error!(error = %err, "Invalid admission review");
            return AdmissionResponse::invalid(err.to_string()).into_review();
        }
    };

    let operation = operation_label(&request.operation);
    let response = AdmissionResponse::from(&request);

    let response = match state.validator.review(&request).await {
        Ok(()) => {
            debug!(operation, name = %request.name, "Admitted");
            state.metrics.record_admission(operation, true);
            response
        }
        Err(rejection) => {
            warn!(
                operation,
                name = %request.name,
                namespace = ?request.namespace,
                reason = %rejection,
                "Denied"
            );
            state.metrics.record_admission(operation, false);
            response.deny(rejection.to_string())
        }
    };

    response.into_review()
}

async fn validate(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<NfsPvc>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(handle_review(&state, review).await)
}

async fn ok() -> &'static str {
    "ok"
}

/// Build the webhook router
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(VALIDATE_PATH, post(validate))
        .route("/healthz", get(ok))
        .route("/readyz", get(ok))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

fn load_tls(files: &TlsFiles) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(&files.cert)?;
    let key_pem = std::fs::read(&files.key)?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", files.key.display())))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serve the webhook until the process exits
pub async fn serve(config: WebhookConfig, state: Arc<WebhookState>) -> Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(config.addr).await?;

    let Some(files) = config.tls else {
        warn!(addr = %config.addr, "Webhook serving plain HTTP; no TLS certificate configured");
        return axum::serve(listener, app)
            .await
            .map_err(|e| Error::Webhook(e.to_string()));
    };

    let acceptor = load_tls(&files)?;
    info!(addr = %config.addr, cert = %files.cert.display(), "Webhook server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls_stream), TowerToHyperService::new(app))
                .await
            {
                debug!(peer = %peer, error = %e, "Connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NfsPvcSpec;
    use crate::domain::ClusterStore;
    use crate::store::InMemoryStore;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use kube::api::ObjectMeta;
    use serde_json::json;

    fn state(store: Arc<InMemoryStore>) -> WebhookState {
        WebhookState {
            validator: NfsPvcValidator::new(store),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    fn object(server: &str, modes: &[&str]) -> serde_json::Value {
        serde_json::to_value(NfsPvc {
            metadata: ObjectMeta {
                name: Some("data".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: NfsPvcSpec {
                server: server.into(),
                path: "/export".into(),
                capacity: [("storage".to_string(), "5Gi".to_string())].into(),
                access_modes: modes.iter().map(|m| m.to_string()).collect(),
                nfs_version: None,
            },
            status: None,
        })
        .unwrap()
    }

    fn review(
        operation: &str,
        object: serde_json::Value,
        old_object: Option<serde_json::Value>,
    ) -> AdmissionReview<NfsPvc> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "nfspvc.dana.io", "version": "v1alpha1", "kind": "NfsPvc"},
                "resource": {"group": "nfspvc.dana.io", "version": "v1alpha1", "resource": "nfspvcs"},
                "name": "data",
                "namespace": "default",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": object,
                "oldObject": old_object,
                "dryRun": false
            }
        }))
        .unwrap()
    }

    fn allowed(review: &AdmissionReview<DynamicObject>) -> bool {
        review.response.as_ref().map(|r| r.allowed).unwrap_or(false)
    }

    #[tokio::test]
    async fn test_create_review() {
        let store = Arc::new(InMemoryStore::new());
        let state = state(store.clone());

        let response = handle_review(&state, review("CREATE", object("nfs1", &["ReadWriteMany"]), None)).await;
        assert!(allowed(&response));

        store
            .create_claim(PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".into()),
                    namespace: Some("default".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let response = handle_review(&state, review("CREATE", object("nfs1", &["ReadWriteMany"]), None)).await;
        assert!(!allowed(&response));

        let (_, body) = state.metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(r#"nfspvc_admission_reviews_total{allowed="false",operation="CREATE"} 1"#));
    }

    #[tokio::test]
    async fn test_update_review() {
        let state = state(Arc::new(InMemoryStore::new()));
        let old = object("nfs1", &["ReadWriteMany"]);

        let response = handle_review(
            &state,
            review("UPDATE", object("nfs2", &["ReadWriteMany"]), Some(old.clone())),
        )
        .await;
        assert!(!allowed(&response));

        let response = handle_review(&state, review("UPDATE", old.clone(), Some(old))).await;
        assert!(allowed(&response));
    }

    #[test]
    fn test_load_tls_requires_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("tls.crt");
        let key = dir.path().join("tls.key");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let result = load_tls(&TlsFiles { cert, key });
        assert!(matches!(result, Err(Error::Tls(_))));

        let missing = load_tls(&TlsFiles {
            cert: dir.path().join("absent.crt"),
            key: dir.path().join("absent.key"),
        });
        assert!(matches!(missing, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_delete_review() {
        let state = state(Arc::new(InMemoryStore::new()));
        let response = handle_review(&state, review("DELETE", json!(null), Some(object("nfs1", &[])))).await;
        assert!(allowed(&response));

        let (_, body) = state.metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(r#"nfspvc_admission_reviews_total{allowed="true",operation="DELETE"} 1"#));
    }
}
