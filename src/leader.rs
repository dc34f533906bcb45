//! Lease based leader election. Optional: multi replica deployments enable
//! it so only one replica runs the controllers and the admission server.

use crate::error::{Error, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const LEASE_NAME: &str = "volume-decorator";
const LEASE_DURATION_SECONDS: i32 = 15;
const RENEW_PERIOD: Duration = Duration::from_secs(5);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

pub struct LeaderElector {
    api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: String) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity,
        }
    }

    /// Block until this replica holds the lease, then keep renewing it in the
    /// background. The returned token is cancelled if the lease is ever lost,
    /// so the caller can shut down instead of running split-brained.
    pub async fn acquire_and_hold(self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.try_acquire().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(error) => warn!(%error, "lease acquisition attempt failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(RETRY_PERIOD) => {}
            }
        }
        info!(identity = self.identity, "acquired the leader lease");

        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RENEW_PERIOD) => {}
                }
                match self.renew().await {
                    Ok(()) => failures = 0,
                    Err(error) => {
                        failures += 1;
                        error!(%error, failures, "lease renewal failed");
                        // Three missed renewals exceed the lease duration.
                        if failures >= 3 {
                            error!(lease = LEASE_NAME, "lost the leader lease, shutting down");
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// One acquisition attempt. Takes the lease when it is free, expired, or
    /// already ours.
    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        match self.api.get_opt(LEASE_NAME).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        ..Default::default()
                    },
                    spec: Some(self.owned_spec(now, None)),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // Another replica won the create race.
                    Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                    Err(error) => Err(Error::from(error)),
                }
            }
            Some(stored) => {
                let spec = stored.spec.clone().unwrap_or_default();
                let holder = spec.holder_identity.clone().unwrap_or_default();
                if holder != self.identity && !lease_expired(&spec) {
                    return Ok(false);
                }
                let transitions = if holder == self.identity {
                    spec.lease_transitions
                } else {
                    Some(spec.lease_transitions.unwrap_or(0) + 1)
                };
                let mut updated = stored;
                updated.spec = Some(self.owned_spec(now, transitions));
                match self
                    .api
                    .replace(LEASE_NAME, &PostParams::default(), &updated)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                    Err(error) => Err(Error::from(error)),
                }
            }
        }
    }

    async fn renew(&self) -> Result<()> {
        let stored = self
            .api
            .get_opt(LEASE_NAME)
            .await?
            .ok_or_else(|| Error::LeaseLost {
                lease: LEASE_NAME.to_string(),
            })?;
        let spec = stored.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Err(Error::LeaseLost {
                lease: LEASE_NAME.to_string(),
            });
        }
        let mut updated = stored;
        let mut spec = spec;
        spec.renew_time = Some(MicroTime(Utc::now()));
        updated.spec = Some(spec);
        self.api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await?;
        Ok(())
    }

    fn owned_spec(&self, now: MicroTime, transitions: Option<i32>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: transitions,
            ..Default::default()
        }
    }
}

/// A lease is expired once its last renewal is older than its duration.
fn lease_expired(spec: &LeaseSpec) -> bool {
    let duration = i64::from(spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS));
    match &spec.renew_time {
        Some(renewed) => renewed.0 + chrono::Duration::seconds(duration) < Utc::now(),
        None => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn leases_expire_by_renew_time() {
        let fresh = LeaseSpec {
            renew_time: Some(MicroTime(Utc::now())),
            lease_duration_seconds: Some(15),
            ..Default::default()
        };
        assert!(!lease_expired(&fresh));

        let stale = LeaseSpec {
            renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(60))),
            lease_duration_seconds: Some(15),
            ..Default::default()
        };
        assert!(lease_expired(&stale));

        assert!(lease_expired(&LeaseSpec::default()));
    }
}
