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

//! The Fleet controller owns one GameServerSet per template revision and
//! realises the deployment strategy: superseded sets drain while the active
//! set grows, and no strategy step ever deletes an Allocated server.

use std::sync::Arc;

use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    runtime::reflector::ObjectRef,
    Api, ResourceExt,
};

use super::{record, run_workers, Result};
use crate::{
    crd::{
        fleet::{resolve_int_or_percent, FleetStatus, FleetStrategyType, RollingUpdate},
        Fleet, GameServerSet, FLEET_NAME_LABEL,
    },
    signal::ShutdownRx,
    watch::{split_key, Store},
    workqueue::WorkQueue,
};

const CONTROLLER: &str = "fleet-controller";

pub struct FleetController {
    client: kube::Client,
    fleets: Store<Fleet>,
    sets: Store<GameServerSet>,
    queue: Arc<WorkQueue>,
}

impl FleetController {
    pub fn new(
        client: kube::Client,
        fleets: Store<Fleet>,
        sets: Store<GameServerSet>,
        queue: Arc<WorkQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            fleets,
            sets,
            queue,
        })
    }

    pub fn run(self: &Arc<Self>, workers: usize, shutdown: ShutdownRx) -> Vec<tokio::task::JoinHandle<()>> {
        let controller = Arc::clone(self);
        run_workers(Arc::clone(&self.queue), workers, shutdown, move |key| {
            let controller = Arc::clone(&controller);
            async move { controller.reconcile(&key).await }
        })
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let (Some(namespace), name) = split_key(key) else {
            return Ok(());
        };
        let Some(fleet) = self.fleets.get(&ObjectRef::new(name).within(namespace)) else {
            return Ok(());
        };
        let fleet = (*fleet).clone();
        if fleet.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        let owned: Vec<GameServerSet> = self
            .sets
            .state()
            .into_iter()
            .filter(|set| set.namespace().as_deref() == Some(namespace))
            .filter(|set| {
                set.labels().get(FLEET_NAME_LABEL).map(String::as_str) == Some(name)
            })
            .map(|set| (*set).clone())
            .collect();

        let (active, rest): (Vec<GameServerSet>, Vec<GameServerSet>) =
            owned.into_iter().partition(|set| fleet.is_active(set));
        let active = active.into_iter().next();

        let api: Api<GameServerSet> = Api::namespaced(self.client.clone(), namespace);

        for (set_name, replicas) in rest_targets(&fleet, active.as_ref(), &rest) {
            let patch = serde_json::json!({"spec": {"replicas": replicas}});
            api.patch(&set_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            record(
                &self.client,
                CONTROLLER,
                &fleet,
                "ScalingGameServerSet",
                format!("Scaling inactive GameServerSet {set_name} to {replicas}"),
            )
            .await;
        }

        // superseded sets linger while allocated servers finish; once
        // observed empty they go away
        for set in rest.iter().filter(|set| {
            set.status.as_ref().map(|s| s.replicas).unwrap_or_default() == 0
                && set.spec.replicas == 0
        }) {
            match api.delete(&set.name_any(), &DeleteParams::default()).await {
                Ok(_) => {
                    record(
                        &self.client,
                        CONTROLLER,
                        &fleet,
                        "DeletingGameServerSet",
                        format!("Deleting inactive GameServerSet {}", set.name_any()),
                    )
                    .await;
                }
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(error) => return Err(error.into()),
            }
        }

        let target = active_target(&fleet, active.as_ref(), &rest);
        match active {
            None => {
                let mut set = fleet.game_server_set();
                set.spec.replicas = target;
                let created = api.create(&PostParams::default(), &set).await?;
                record(
                    &self.client,
                    CONTROLLER,
                    &fleet,
                    "CreatingGameServerSet",
                    format!("Created GameServerSet {}", created.name_any()),
                )
                .await;
            }
            Some(active) if active.spec.replicas != target => {
                let patch = serde_json::json!({"spec": {"replicas": target}});
                api.patch(&active.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                record(
                    &self.client,
                    CONTROLLER,
                    &fleet,
                    "ScalingGameServerSet",
                    format!(
                        "Scaling active GameServerSet {} from {} to {}",
                        active.name_any(),
                        active.spec.replicas,
                        target
                    ),
                )
                .await;
            }
            Some(_) => {}
        }

        self.update_status(&fleet, namespace).await
    }

    /// Fleet status is the sum over owned sets.
    async fn update_status(&self, fleet: &Fleet, namespace: &str) -> Result<()> {
        let status = fleet_status(
            self.sets
                .state()
                .iter()
                .filter(|set| set.namespace().as_deref() == Some(namespace))
                .filter(|set| {
                    set.labels().get(FLEET_NAME_LABEL).map(String::as_str)
                        == fleet.metadata.name.as_deref()
                })
                .filter_map(|set| set.status.as_ref()),
        );
        if fleet.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let api: Api<Fleet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({"status": status});
        api.patch_status(&fleet.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

pub(crate) fn fleet_status<'a>(
    sets: impl Iterator<Item = &'a crate::crd::game_server_set::GameServerSetStatus>,
) -> FleetStatus {
    let mut status = FleetStatus::default();
    for set in sets {
        status.replicas += set.replicas;
        status.ready_replicas += set.ready_replicas;
        status.allocated_replicas += set.allocated_replicas;
        status.reserved_replicas += set.reserved_replicas;
    }
    status
}

fn allocated_of(set: &GameServerSet) -> i32 {
    set.status
        .as_ref()
        .map(|status| status.allocated_replicas)
        .unwrap_or_default()
}

fn rolling_update(fleet: &Fleet) -> RollingUpdate {
    fleet
        .spec
        .strategy
        .rolling_update
        .clone()
        .unwrap_or_default()
}

/// The rollout bounds resolved against the fleet's replica target. Surge
/// rounds up and unavailability down, and both are floored at 1 so a
/// rollout always makes progress.
fn bounds(fleet: &Fleet) -> (i32, i32) {
    let rolling = rolling_update(fleet);
    let desired = fleet.spec.replicas;
    let surge = resolve_int_or_percent(&rolling.max_surge, desired, true)
        .unwrap_or(1)
        .max(1);
    let unavailable = resolve_int_or_percent(&rolling.max_unavailable, desired, false)
        .unwrap_or(1)
        .max(1);
    (surge, unavailable)
}

/// New replica targets for the non-active sets, `(name, replicas)`.
/// Recreate zeroes them all; RollingUpdate steps only the largest set down
/// by `maxUnavailable`. Unchanged sets are omitted.
pub(crate) fn rest_targets(
    fleet: &Fleet,
    active: Option<&GameServerSet>,
    rest: &[GameServerSet],
) -> Vec<(String, i32)> {
    match fleet.spec.strategy.type_ {
        FleetStrategyType::Recreate => rest
            .iter()
            .filter(|set| set.spec.replicas != 0)
            .map(|set| (set.name_any(), 0))
            .collect(),
        FleetStrategyType::RollingUpdate => {
            // hold the old capacity until the new revision has servers to
            // take over
            let active_ready = active
                .and_then(|set| set.status.as_ref())
                .map(|status| status.ready_replicas)
                .unwrap_or_default();
            if active_ready == 0 && active.map(|a| a.spec.replicas).unwrap_or_default() > 0 {
                return vec![];
            }

            let (_, unavailable) = bounds(fleet);
            rest.iter()
                .filter(|set| set.spec.replicas > 0)
                .max_by_key(|set| set.spec.replicas)
                .map(|set| {
                    (
                        set.name_any(),
                        (set.spec.replicas - unavailable).max(0),
                    )
                })
                .into_iter()
                .collect()
        }
    }
}

/// The replica target for the active set: the fleet's target minus the
/// allocated servers still living in superseded sets, additionally surge-
/// bounded during a rolling update so total capacity stays within
/// `replicas + maxSurge`.
pub(crate) fn active_target(
    fleet: &Fleet,
    active: Option<&GameServerSet>,
    rest: &[GameServerSet],
) -> i32 {
    let desired = fleet.spec.replicas;
    let rest_allocated: i32 = rest.iter().map(allocated_of).sum();
    let ceiling = (desired - rest_allocated).max(0);

    match fleet.spec.strategy.type_ {
        FleetStrategyType::Recreate => ceiling,
        FleetStrategyType::RollingUpdate => {
            if rest.is_empty() {
                return ceiling;
            }
            let (surge, _) = bounds(fleet);
            let rest_total: i32 = rest.iter().map(|set| set.spec.replicas).sum();
            let current = active.map(|set| set.spec.replicas).unwrap_or_default();
            // total declared replicas may not exceed desired + surge, and
            // the active set never shrinks mid-rollout
            let room = (desired + surge - rest_total).max(0);
            room.max(current).min(ceiling)
        }
    }
}
