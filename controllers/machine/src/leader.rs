//! Leader election
//!
//! Exactly one replica reconciles at any time. The election runs over a
//! coordination/v1 Lease: acquire when it is absent, expired, or already
//! ours; renew on a short period; stand down once renewal fails past the
//! deadline. Workers must only run while the lease is held.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{Duration as ChronoDuration, Utc};
use kube::api::PostParams;
use kube::{Api, Client};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{is_already_exists, is_conflict, ControllerError};
use crate::labels::NAMESPACE;

const LEASE_NAME: &str = "vm-operator-controller";
const LEASE_DURATION_SECONDS: i32 = 15;
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

pub struct LeaderElector {
    api: Api<Lease>,
    identity: String,
}

/// Identity of this replica in the lease: hostname plus a random suffix so
/// restarts do not collide with a stale lease entry.
pub fn leader_identity() -> String {
    let hostname =
        std::env::var("HOSTNAME").unwrap_or_else(|_| "machine-controller".to_string());
    format!("{}_{:08x}", hostname, rand::random::<u32>())
}

impl LeaderElector {
    pub fn new(client: &Client, identity: String) -> Self {
        Self {
            api: Api::namespaced(client.clone(), NAMESPACE),
            identity,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Block until this replica holds the lease.
    pub async fn acquire(&self) -> Result<(), ControllerError> {
        let mut ticker = interval(RETRY_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "acquired leader lease");
                    return Ok(());
                }
                Ok(false) => debug!(identity = %self.identity, "lease held elsewhere"),
                Err(e) => warn!(error = %e, "leader election attempt failed"),
            }
        }
    }

    /// Renew the lease until it is lost. Returns when another replica took
    /// over or renewal kept failing past the deadline.
    pub async fn keep_renewed(&self) {
        let mut last_renewed = Instant::now();
        let mut ticker = interval(RETRY_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "leader lease taken by another replica");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal failed");
                    if last_renewed.elapsed() >= RENEW_DEADLINE {
                        warn!(identity = %self.identity, "renew deadline exceeded, standing down");
                        return;
                    }
                }
            }
        }
    }

    /// Best effort: mark the lease expired so the next replica can take
    /// over without waiting out the duration.
    pub async fn release(&self) {
        if let Ok(Some(current)) = self.api.get_opt(LEASE_NAME).await {
            let holder = current
                .spec
                .as_ref()
                .and_then(|s| s.holder_identity.clone())
                .unwrap_or_default();
            if holder != self.identity {
                return;
            }
            let mut updated = current;
            if let Some(spec) = updated.spec.as_mut() {
                spec.holder_identity = Some(String::new());
            }
            if let Err(e) = self
                .api
                .replace(LEASE_NAME, &PostParams::default(), &updated)
                .await
            {
                debug!(error = %e, "lease release failed");
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, ControllerError> {
        let now = MicroTime(Utc::now());

        let Some(current) = self.api.get_opt(LEASE_NAME).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(NAMESPACE.to_string()),
                    ..Default::default()
                },
                spec: Some(self.owned_spec(now.clone(), now, 1)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(e) if is_already_exists(&e) || is_conflict(&e) => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let spec = current.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone().unwrap_or_default();
        let ours = holder == self.identity;
        if !ours && !lease_expired(&spec) {
            return Ok(false);
        }

        let acquire_time = if ours {
            spec.acquire_time.clone().unwrap_or_else(|| now.clone())
        } else {
            now.clone()
        };
        let transitions = spec.lease_transitions.unwrap_or(0) + i32::from(!ours);

        let mut updated = current;
        updated.spec = Some(self.owned_spec(acquire_time, now, transitions));
        match self
            .api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn owned_spec(&self, acquire_time: MicroTime, renew_time: MicroTime, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(acquire_time),
            renew_time: Some(renew_time),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }
}

/// A lease is expired when its last renewal lies further back than its
/// duration. Holders that never renewed count as expired.
fn lease_expired(spec: &LeaseSpec) -> bool {
    let duration = ChronoDuration::seconds(
        spec.lease_duration_seconds
            .unwrap_or(LEASE_DURATION_SECONDS)
            .into(),
    );
    match spec.renew_time.as_ref() {
        Some(renewed) => Utc::now() - renewed.0 > duration,
        None => true,
    }
}
