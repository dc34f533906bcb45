//! The admission gate: an HTTPS endpoint the API server calls before
//! persisting workload creates and updates. Decisions are synchronous; the
//! controllers converge anything the gate could not see.

use crate::config::WebhookConfig;
use crate::crd::AttachedWorkload;
use crate::error::{Error, Result};
use crate::volume::VolumeManager;
use crate::workload::WorkloadDispatcher;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use chrono::Utc;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct AdmissionGate {
    volume_manager: Arc<VolumeManager>,
    workloads: Arc<WorkloadDispatcher>,
}

impl AdmissionGate {
    pub fn new(volume_manager: Arc<VolumeManager>, workloads: Arc<WorkloadDispatcher>) -> Self {
        Self {
            volume_manager,
            workloads,
        }
    }

    /// Review one admission request: attach every used claim, denying on the
    /// first conflict. Released claims are left to the recycler.
    pub async fn review(
        &self,
        review: AdmissionReview<DynamicObject>,
    ) -> AdmissionReview<DynamicObject> {
        let request: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(request) => request,
            Err(error) => {
                error!(%error, "invalid admission review");
                return AdmissionResponse::invalid(error.to_string()).into_review();
            }
        };
        debug!(
            operation = ?request.operation,
            kind = ?request.kind,
            namespace = request.namespace.as_deref().unwrap_or_default(),
            name = request.name,
            "received workload request"
        );

        let response = AdmissionResponse::from(&request);
        match self.admit(&request).await {
            Ok(()) => response.into_review(),
            Err(Error::IrrelevantWorkload {}) => response.into_review(),
            Err(error) => denied(response, &error).into_review(),
        }
    }

    async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> Result<()> {
        let admitted = self.workloads.handle(request).await?;
        let namespace = request.namespace.clone().unwrap_or_default();

        let now = Utc::now();
        for volume in &admitted.used {
            self.volume_manager
                .attach(
                    AttachedWorkload {
                        reference: admitted.reference.clone(),
                        read_only: volume.read_only.unwrap_or(false),
                        replicas: admitted.replicas,
                        timestamp: Some(now),
                    },
                    &namespace,
                    &volume.claim_name,
                )
                .await?;
        }
        Ok(())
    }
}

/// Mark a response as denied, carrying the error's status triple so the
/// caller sees the original reason.
fn denied(response: AdmissionResponse, error: &Error) -> AdmissionResponse {
    let (code, reason) = error.admission_status();
    let mut response = response.deny(error.to_string());
    response.result.code = code;
    response.result.reason = reason.to_string();
    response
}

async fn admit(
    gate: web::Data<AdmissionGate>,
    review: web::Json<AdmissionReview<DynamicObject>>,
) -> impl Responder {
    HttpResponse::Ok().json(gate.review(review.into_inner()).await)
}

/// Serve the admission endpoint until cancelled.
pub async fn serve(
    gate: AdmissionGate,
    bind: &str,
    config: &WebhookConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let tls = load_tls_config(config)?;
    let data = web::Data::new(gate);
    let path = config.workload_webhook_path.clone();

    info!(bind, path, "workload admission enabled, starting webhook server");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route(&path, web::post().to(admit))
    })
    .bind_rustls_021(bind, tls)
    .map_err(|source| Error::WebhookServer { source })?
    .disable_signals()
    .run();

    tokio::select! {
        result = server => result.map_err(|source| Error::WebhookServer { source }),
        _ = cancel.cancelled() => Ok(()),
    }
}

fn load_tls_config(config: &WebhookConfig) -> Result<ServerConfig> {
    let cert_path = config.tls_cert_file.as_ref().ok_or_else(|| Error::TlsConfig {
        message: "--tls-cert-file is required for the admission server".to_string(),
    })?;
    let key_path = config
        .tls_private_key_file
        .as_ref()
        .ok_or_else(|| Error::TlsConfig {
            message: "--tls-private-key-file is required for the admission server".to_string(),
        })?;

    let cert_file = &mut BufReader::new(File::open(cert_path).map_err(|source| Error::ReadFile {
        path: cert_path.display().to_string(),
        source,
    })?);
    let key_file = &mut BufReader::new(File::open(key_path).map_err(|source| Error::ReadFile {
        path: key_path.display().to_string(),
        source,
    })?);

    let cert_chain = certs(cert_file).map_err(|_| Error::TlsConfig {
        message: "failed to retrieve certificates from the certificate file".to_string(),
    })?;
    let mut keys = pkcs8_private_keys(key_file).map_err(|_| Error::TlsConfig {
        message: "failed to retrieve the private keys from the key file".to_string(),
    })?;
    if keys.is_empty() {
        // Key may be in the older traditional encoding.
        let key_file =
            &mut BufReader::new(File::open(key_path).map_err(|source| Error::ReadFile {
                path: key_path.display().to_string(),
                source,
            })?);
        keys = rsa_private_keys(key_file).map_err(|_| Error::TlsConfig {
            message: "failed to retrieve the rsa private keys from the key file".to_string(),
        })?;
    }
    if keys.is_empty() {
        return Err(Error::TlsConfig {
            message: "no keys found in the key file".to_string(),
        });
    }

    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            cert_chain.into_iter().map(Certificate).collect(),
            PrivateKey(keys.remove(0)),
        )
        .map_err(|error| Error::TlsConfig {
            message: error.to_string(),
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn denials_carry_the_error_status() {
        let error = Error::VolumeNotAvailable {
            message: "CephRBD volume cannot be mounted as ReadWrite mode by workloads with 2 replicas"
                .to_string(),
        };
        let response = denied(AdmissionResponse::invalid("seed"), &error);
        assert!(!response.allowed);
        assert_eq!(response.result.code, 400);
        assert_eq!(response.result.reason, "BadRequest");
        assert_eq!(
            response.result.message,
            "CephRBD volume cannot be mounted as ReadWrite mode by workloads with 2 replicas"
        );

        let internal = Error::InvalidKey { key: "x".into() };
        let response = denied(AdmissionResponse::invalid("seed"), &internal);
        assert_eq!(response.result.code, 500);
        assert_eq!(response.result.reason, "InternalError");
    }

    #[test]
    fn missing_certificates_fail_tls_setup() {
        let config = WebhookConfig {
            workload_admission: true,
            webhook_name: "volume-decorator".into(),
            workload_webhook_path: "/storage/workload".into(),
            tls_cert_file: None,
            tls_private_key_file: None,
            client_ca_file: None,
            webhook_url: None,
            service_name: "volume-decorator".into(),
            service_namespace: "kube-system".into(),
        };
        match load_tls_config(&config) {
            Err(Error::TlsConfig { message }) => assert!(message.contains("--tls-cert-file")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
