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

//! The FleetAutoscaler sync loop: every resync interval, evaluate each
//! autoscaler's policy against its Fleet and apply the computed replica
//! target.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use eyre::WrapErr;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Patch, PatchParams},
    runtime::reflector::ObjectRef,
    Api, ResourceExt,
};

use super::{record, run_workers, Result};
use crate::{
    crd::{
        autoscaler::{
            BufferPolicy, FleetAutoscaleRequest, FleetAutoscaleReview, FleetAutoscalerPolicyType,
            FleetAutoscalerStatus, WebhookPolicy,
        },
        fleet::resolve_int_or_percent,
        Fleet, FleetAutoscaler,
    },
    signal::ShutdownRx,
    watch::{key_of, split_key, Store},
    workqueue::WorkQueue,
};

const CONTROLLER: &str = "fleetautoscaler-controller";

pub struct FleetAutoscalerController {
    client: kube::Client,
    autoscalers: Store<FleetAutoscaler>,
    fleets: Store<Fleet>,
    queue: Arc<WorkQueue>,
    resync: Duration,
}

impl FleetAutoscalerController {
    pub fn new(
        client: kube::Client,
        autoscalers: Store<FleetAutoscaler>,
        fleets: Store<Fleet>,
        queue: Arc<WorkQueue>,
        resync: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            autoscalers,
            fleets,
            queue,
            resync,
        })
    }

    pub fn run(self: &Arc<Self>, shutdown: ShutdownRx) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![self.spawn_resync(shutdown.clone())];
        let controller = Arc::clone(self);
        handles.extend(run_workers(
            Arc::clone(&self.queue),
            1,
            shutdown,
            move |key| {
                let controller = Arc::clone(&controller);
                async move { controller.reconcile(&key).await }
            },
        ));
        handles
    }

    /// Periodically re-enqueue every autoscaler; consecutive failures of one
    /// never block the others.
    fn spawn_resync(&self, mut shutdown: ShutdownRx) -> tokio::task::JoinHandle<()> {
        let autoscalers = self.autoscalers.clone();
        let queue = Arc::clone(&self.queue);
        let resync = self.resync;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(resync);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        for fas in autoscalers.state() {
                            queue.enqueue(key_of(&*fas));
                        }
                    }
                }
            }
        })
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let (Some(namespace), name) = split_key(key) else {
            return Ok(());
        };
        let Some(fas) = self.autoscalers.get(&ObjectRef::new(name).within(namespace)) else {
            return Ok(());
        };
        let fas = (*fas).clone();

        let violations = fas.validate();
        if !violations.is_empty() {
            record(&self.client, CONTROLLER, &fas, "InvalidPolicy", violations.join("; ")).await;
            return Ok(());
        }

        let fleet = self
            .fleets
            .get(&ObjectRef::new(&fas.spec.fleet_name).within(namespace));
        let Some(fleet) = fleet else {
            record(
                &self.client,
                CONTROLLER,
                &fas,
                "FleetNotFound",
                format!("Fleet {} does not exist", fas.spec.fleet_name),
            )
            .await;
            self.update_status(&fas, unable_to_scale(&fas)).await?;
            return Ok(());
        };
        let fleet = (*fleet).clone();

        let decision = match self.apply_policy(&fas, &fleet).await {
            Ok(decision) => decision,
            Err(error) => {
                record(&self.client, CONTROLLER, &fas, "PolicyError", format!("{error:#}")).await;
                self.update_status(&fas, unable_to_scale(&fas)).await?;
                return Ok(());
            }
        };

        let current = fleet.status.as_ref().map(|s| s.replicas).unwrap_or_default();
        let mut status = FleetAutoscalerStatus {
            current_replicas: current,
            desired_replicas: current,
            last_scale_time: fas.status.as_ref().and_then(|s| s.last_scale_time.clone()),
            able_to_scale: true,
            scaling_limited: false,
        };

        if let Some((desired, limited)) = decision {
            status.desired_replicas = desired;
            status.scaling_limited = limited;

            if desired != fleet.spec.replicas {
                let fleets: Api<Fleet> = Api::namespaced(self.client.clone(), namespace);
                let patch = serde_json::json!({"spec": {"replicas": desired}});
                fleets
                    .patch(&fleet.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                record(
                    &self.client,
                    CONTROLLER,
                    &fas,
                    "AutoScalingFleet",
                    format!(
                        "Scaling fleet {} from {} to {desired}",
                        fleet.name_any(),
                        fleet.spec.replicas
                    ),
                )
                .await;
                status.last_scale_time = Some(Time(Utc::now()));
            }
        }

        self.update_status(&fas, status).await
    }

    async fn apply_policy(
        &self,
        fas: &FleetAutoscaler,
        fleet: &Fleet,
    ) -> crate::Result<Option<(i32, bool)>> {
        match fas.spec.policy.type_ {
            FleetAutoscalerPolicyType::Buffer => {
                let buffer = fas
                    .spec
                    .policy
                    .buffer
                    .as_ref()
                    .ok_or_else(|| eyre::eyre!("buffer policy missing parameters"))?;
                apply_buffer_policy(buffer, fleet).map(Some)
            }
            FleetAutoscalerPolicyType::Webhook => {
                let webhook = fas
                    .spec
                    .policy
                    .webhook
                    .as_ref()
                    .ok_or_else(|| eyre::eyre!("webhook policy missing parameters"))?;
                let review = FleetAutoscaleReview {
                    request: Some(FleetAutoscaleRequest {
                        uid: fas.metadata.uid.clone().unwrap_or_default(),
                        name: fleet.name_any(),
                        namespace: fleet.namespace().unwrap_or_default(),
                        spec: fleet.spec.clone(),
                        status: fleet.status.clone().unwrap_or_default(),
                    }),
                    response: None,
                };
                let http = webhook_client(webhook)?;
                let endpoint = webhook.endpoint().map_err(|e| eyre::eyre!(e))?;
                Ok(evaluate_webhook(&http, &endpoint, &review)
                    .await?
                    .map(|replicas| (replicas, false)))
            }
        }
    }

    async fn update_status(&self, fas: &FleetAutoscaler, status: FleetAutoscalerStatus) -> Result<()> {
        if fas.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let api: Api<FleetAutoscaler> =
            Api::namespaced(self.client.clone(), &fas.namespace().unwrap_or_default());
        let patch = serde_json::json!({"status": status});
        api.patch_status(&fas.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn unable_to_scale(fas: &FleetAutoscaler) -> FleetAutoscalerStatus {
    FleetAutoscalerStatus {
        able_to_scale: false,
        last_scale_time: fas.status.as_ref().and_then(|s| s.last_scale_time.clone()),
        ..Default::default()
    }
}

/// `desired = clamp(allocated + buffer, min, max)`. The buffer is an
/// absolute count or a percentage of the current replica total.
pub(crate) fn apply_buffer_policy(
    buffer: &BufferPolicy,
    fleet: &Fleet,
) -> crate::Result<(i32, bool)> {
    let status = fleet.status.clone().unwrap_or_default();
    let size = resolve_int_or_percent(&buffer.buffer_size, status.replicas, true)
        .map_err(|e| eyre::eyre!(e))?;
    let raw = status.allocated_replicas + size;
    let desired = raw.clamp(buffer.min_replicas, buffer.max_replicas);
    Ok((desired, desired != raw))
}

/// POST the review and interpret the response; `scale: false` is a no-op.
pub(crate) async fn evaluate_webhook(
    http: &reqwest::Client,
    endpoint: &str,
    review: &FleetAutoscaleReview,
) -> crate::Result<Option<i32>> {
    let response = http
        .post(endpoint)
        .json(review)
        .send()
        .await
        .wrap_err_with(|| format!("posting autoscale review to {endpoint:?}"))?
        .error_for_status()
        .wrap_err("autoscaler webhook returned an error status")?;

    let review: FleetAutoscaleReview = response
        .json()
        .await
        .wrap_err("decoding autoscale review response")?;
    let response = review
        .response
        .ok_or_else(|| eyre::eyre!("autoscaler webhook response missing `response`"))?;

    Ok(response.scale.then_some(response.replicas))
}

fn webhook_client(webhook: &WebhookPolicy) -> crate::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(Duration::from_secs(5));
    if let Some(bundle) = &webhook.ca_bundle {
        let pem = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, bundle)
            .wrap_err("caBundle is not valid base64")?;
        let certificate =
            reqwest::Certificate::from_pem(&pem).wrap_err("caBundle is not a PEM certificate")?;
        builder = builder.add_root_certificate(certificate);
    }
    builder.build().wrap_err("building webhook client")
}
