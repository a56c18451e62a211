//! Lease-based leader election
//!
//! Only the replica holding the `coordination.k8s.io` Lease acts on pods.
//! Standby replicas keep watching so they can take over as soon as the
//! holder stops renewing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use super::cluster::FIELD_MANAGER;

pub const LEASE_NAME: &str = "vpa-graceful-drain-leader";
pub const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound for one acquire/renew round, well inside the lease duration
const RENEW_DEADLINE: Duration = Duration::from_secs(5);

/// Whether the lease can be taken over at `now`. A lease that was never
/// renewed counts as expired.
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(renew) = spec.and_then(|s| s.renew_time.as_ref()) else {
        return true;
    };
    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS);
    now > renew.0 + chrono::Duration::seconds(duration as i64)
}

/// Keep acquiring or renewing the lease, publishing leadership to `is_leader`.
pub async fn run_leader_election(
    client: Client,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, &namespace);
    info!("Leader election using holder ID: {}", identity);

    loop {
        let wait = election_round(
            try_acquire_or_renew(&leases, &namespace, &identity),
            RENEW_DEADLINE,
            &is_leader,
        )
        .await;
        tokio::time::sleep(wait).await;
    }
}

/// Run one acquire/renew attempt under `deadline` and publish the result.
/// Returns how long to wait before the next round.
async fn election_round<F>(attempt: F, deadline: Duration, is_leader: &AtomicBool) -> Duration
where
    F: Future<Output = Result<bool, kube::Error>>,
{
    match tokio::time::timeout(deadline, attempt).await {
        Ok(Ok(true)) => {
            if !is_leader.load(Ordering::Relaxed) {
                info!("Acquired leadership for lease {}", LEASE_NAME);
            }
            is_leader.store(true, Ordering::Relaxed);
            RENEW_INTERVAL
        }
        Ok(Ok(false)) => {
            if is_leader.load(Ordering::Relaxed) {
                warn!("Lost leadership for lease {}", LEASE_NAME);
            }
            is_leader.store(false, Ordering::Relaxed);
            RETRY_INTERVAL
        }
        Ok(Err(e)) => {
            warn!("Leader election error: {:?}", e);
            is_leader.store(false, Ordering::Relaxed);
            RETRY_INTERVAL
        }
        Err(_) => {
            warn!(
                "Lease {} round did not finish within {:?}, stepping down",
                LEASE_NAME, deadline
            );
            is_leader.store(false, Ordering::Relaxed);
            RETRY_INTERVAL
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();
    let params = PatchParams::apply(FIELD_MANAGER);

    let Some(existing) = leases.get_opt(LEASE_NAME).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        return match leases.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!("Created lease {} with holder {}", LEASE_NAME, identity);
                Ok(true)
            }
            // Another replica created it first
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => Err(e),
        };
    };

    let spec = existing.spec.as_ref();
    let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

    if current_holder == Some(identity) {
        let patch = serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        leases
            .patch(LEASE_NAME, &params, &Patch::Merge(&patch))
            .await?;
        return Ok(true);
    }

    if !lease_expired(spec, now) {
        return Ok(false);
    }

    info!(
        "Lease held by {:?} has expired, taking over",
        current_holder
    );
    // Two standbys may race for an expired lease; the resourceVersion
    // precondition lets only one of them win.
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": existing.resource_version() },
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    });
    match leases
        .patch(LEASE_NAME, &params, &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}
