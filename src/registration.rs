//! Registration of the validating webhook: ensure the configuration exists
//! with the desired rules, and restore it when another actor changes it.

use crate::config::WebhookConfig;
use crate::error::{Error, Result};
use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

const OPERATIONS: [&str; 2] = ["CREATE", "UPDATE"];

/// Build the desired webhook configuration from config and the CA bundle.
pub fn build_webhook(
    config: &WebhookConfig,
    ca_bundle: Vec<u8>,
) -> ValidatingWebhookConfiguration {
    let operations: Vec<String> = OPERATIONS.iter().map(|op| op.to_string()).collect();
    let rule = |groups: &[&str], resources: &[&str]| RuleWithOperations {
        operations: Some(operations.clone()),
        api_groups: Some(groups.iter().map(|group| group.to_string()).collect()),
        api_versions: Some(vec!["v1".to_string()]),
        resources: Some(resources.iter().map(|resource| resource.to_string()).collect()),
        ..Default::default()
    };

    let mut client_config = WebhookClientConfig {
        ca_bundle: Some(ByteString(ca_bundle)),
        ..Default::default()
    };
    match &config.webhook_url {
        Some(url) => {
            client_config.url = Some(format!(
                "https://{}{}",
                url.trim_matches('/'),
                config.workload_webhook_path
            ));
        }
        None => {
            client_config.service = Some(ServiceReference {
                name: config.service_name.clone(),
                namespace: config.service_namespace.clone(),
                path: Some(config.workload_webhook_path.clone()),
                port: None,
            });
        }
    }

    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(config.webhook_name.clone()),
            ..Default::default()
        },
        webhooks: Some(vec![ValidatingWebhook {
            name: format!("{}.storage.tkestack.io", config.webhook_name),
            rules: Some(vec![
                rule(&[""], &["pods"]),
                rule(
                    &["apps"],
                    &["deployments", "statefulsets", "replicasets", "daemonsets"],
                ),
                rule(&["batch"], &["jobs"]),
                rule(&["tkestack.io"], &["tapps"]),
            ]),
            failure_policy: Some("Fail".to_string()),
            client_config,
            side_effects: "None".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            ..Default::default()
        }]),
    }
}

/// Create the webhook configuration, or put a drifted one back in shape.
pub async fn ensure_webhook(client: &Client, config: &WebhookConfig) -> Result<()> {
    let ca_path = config.client_ca_file.as_ref().ok_or_else(|| Error::TlsConfig {
        message: "--client-ca-file is required to register the webhook".to_string(),
    })?;
    let ca_bundle = tokio::fs::read(ca_path)
        .await
        .map_err(|source| Error::ReadFile {
            path: ca_path.display().to_string(),
            source,
        })?;

    let desired = build_webhook(config, ca_bundle);
    let api = Api::<ValidatingWebhookConfiguration>::all(client.clone());

    match api.get_opt(&desired.name_any()).await? {
        None => {
            api.create(&PostParams::default(), &desired).await?;
            info!(webhook = desired.name_any(), "created validating webhook");
        }
        Some(stored) => {
            if serde_json::to_value(&stored.webhooks).ok()
                == serde_json::to_value(&desired.webhooks).ok()
            {
                return Ok(());
            }
            warn!(
                webhook = desired.name_any(),
                "webhook has been modified by someone, restoring it"
            );
            let mut updated = stored.clone();
            updated.webhooks = desired.webhooks;
            api.replace(&stored.name_any(), &PostParams::default(), &updated)
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(url: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            workload_admission: true,
            webhook_name: "volume-decorator".into(),
            workload_webhook_path: "/storage/workload".into(),
            tls_cert_file: None,
            tls_private_key_file: None,
            client_ca_file: None,
            webhook_url: url.map(|url| url.to_string()),
            service_name: "volume-decorator".into(),
            service_namespace: "kube-system".into(),
        }
    }

    #[test]
    fn registers_all_seven_kinds() {
        let webhook = build_webhook(&config(None), b"ca".to_vec());
        let hooks = webhook.webhooks.unwrap();
        assert_eq!(hooks.len(), 1);
        let hook = &hooks[0];
        assert_eq!(hook.name, "volume-decorator.storage.tkestack.io");
        assert_eq!(hook.failure_policy.as_deref(), Some("Fail"));

        let rules = hook.rules.as_ref().unwrap();
        let resources: Vec<_> = rules
            .iter()
            .flat_map(|rule| rule.resources.clone().unwrap_or_default())
            .collect();
        assert_eq!(
            resources,
            vec![
                "pods",
                "deployments",
                "statefulsets",
                "replicasets",
                "daemonsets",
                "jobs",
                "tapps"
            ]
        );
        for rule in rules {
            assert_eq!(
                rule.operations.clone().unwrap_or_default(),
                vec!["CREATE", "UPDATE"]
            );
        }

        // In-cluster configuration points at the service.
        let service = hook.client_config.service.as_ref().unwrap();
        assert_eq!(service.name, "volume-decorator");
        assert_eq!(service.path.as_deref(), Some("/storage/workload"));
    }

    #[test]
    fn external_urls_override_the_service_reference() {
        let webhook = build_webhook(&config(Some("hooks.example.com/")), b"ca".to_vec());
        let hook = &webhook.webhooks.unwrap()[0];
        assert_eq!(
            hook.client_config.url.as_deref(),
            Some("https://hooks.example.com/storage/workload")
        );
        assert!(hook.client_config.service.is_none());
    }
}
