/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Lease-based leader election against `coordination.k8s.io/v1`. Only the
//! leader runs the control loops; every replica keeps serving admission and
//! allocation, where store optimistic concurrency resolves ties.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api,
};

use crate::signal::ShutdownRx;

const LEASE_NAME: &str = "garrison-controller-lock";
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

pub type LeaderRx = tokio::sync::watch::Receiver<bool>;

/// Spawn the elector; the receiver reports leadership transitions.
pub fn spawn(
    client: kube::Client,
    namespace: &str,
    identity: String,
    mut shutdown: ShutdownRx,
) -> (tokio::task::JoinHandle<()>, LeaderRx) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    let api: Api<Lease> = Api::namespaced(client, namespace);

    let handle = tokio::spawn(async move {
        loop {
            match try_acquire_or_renew(&api, &identity).await {
                Ok(is_leader) => {
                    crate::metrics::leader().set(is_leader as i64);
                    if *tx.borrow() != is_leader {
                        tracing::info!(is_leader, %identity, "leadership changed");
                    }
                    tx.send_replace(is_leader);
                }
                Err(error) => {
                    tracing::warn!(%error, "leader election attempt failed");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(RENEW_INTERVAL) => {}
            }
        }
    });

    (handle, rx)
}

async fn try_acquire_or_renew(api: &Api<Lease>, identity: &str) -> crate::Result<bool> {
    let now = Utc::now();
    let existing = api.get_opt(LEASE_NAME).await?;

    let Some(lease) = existing else {
        let lease = desired_lease(identity, now, 0);
        // losing the create race just means someone else leads this round
        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => return Ok(true),
            Err(kube::Error::Api(response)) if response.code == 409 => return Ok(false),
            Err(error) => return Err(error.into()),
        }
    };

    if !may_take_lease(&lease, identity, now) {
        return Ok(false);
    }

    let spec = lease.spec.clone().unwrap_or_default();
    let renewing = spec.holder_identity.as_deref() == Some(identity);
    let transitions = spec.lease_transitions.unwrap_or(0) + i32::from(!renewing);
    let mut desired = desired_lease(identity, now, transitions);
    if renewing {
        desired.spec.as_mut().unwrap().acquire_time = spec.acquire_time;
    }

    let mut params = PatchParams::apply("garrison-leader-elector");
    // the server still rejects this if our lease view is stale
    params.force = true;
    let mut patch = serde_json::to_value(&desired)?;
    patch["apiVersion"] = "coordination.k8s.io/v1".into();
    patch["kind"] = "Lease".into();
    api.patch(LEASE_NAME, &params, &Patch::Apply(patch)).await?;
    Ok(true)
}

/// Whether `identity` may hold the lease now: it already does, the lease is
/// unclaimed, or the current holder let it expire.
fn may_take_lease(lease: &Lease, identity: &str, now: chrono::DateTime<Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    match spec.holder_identity.as_deref() {
        None => true,
        Some(holder) if holder == identity => true,
        Some(_) => {
            let ttl = spec
                .lease_duration_seconds
                .map(|secs| chrono::Duration::seconds(secs as i64))
                .unwrap_or_else(|| chrono::Duration::from_std(LEASE_DURATION).unwrap());
            match &spec.renew_time {
                Some(renewed) => renewed.0 + ttl < now,
                None => true,
            }
        }
    }
}

fn desired_lease(identity: &str, now: chrono::DateTime<Utc>, transitions: i32) -> Lease {
    let mut lease = Lease::default();
    lease.metadata.name = Some(LEASE_NAME.to_owned());
    lease.spec = Some(LeaseSpec {
        holder_identity: Some(identity.to_owned()),
        lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
        acquire_time: Some(MicroTime(now)),
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(transitions),
        ..Default::default()
    });
    lease
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64) -> Lease {
        let mut lease = desired_lease(holder.unwrap_or(""), Utc::now(), 0);
        let spec = lease.spec.as_mut().unwrap();
        spec.holder_identity = holder.map(str::to_owned);
        spec.renew_time = Some(MicroTime(
            Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
        ));
        lease
    }

    #[test]
    fn holder_keeps_renewing() {
        assert!(may_take_lease(&lease(Some("me"), 0), "me", Utc::now()));
        assert!(may_take_lease(&lease(Some("me"), 1000), "me", Utc::now()));
    }

    #[test]
    fn fresh_foreign_lease_is_respected() {
        assert!(!may_take_lease(&lease(Some("other"), 1), "me", Utc::now()));
    }

    #[test]
    fn expired_or_unclaimed_leases_are_taken() {
        assert!(may_take_lease(&lease(Some("other"), 60), "me", Utc::now()));
        assert!(may_take_lease(&lease(None, 0), "me", Utc::now()));
        assert!(may_take_lease(&Lease::default(), "me", Utc::now()));
    }
}
