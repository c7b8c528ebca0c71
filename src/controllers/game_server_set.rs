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

//! Keeps the count of non-terminal GameServers of a set equal to its
//! replica target, creating from the template and deleting the least
//! valuable servers first. Allocated and Reserved servers are never
//! touched.

use std::sync::Arc;

use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    runtime::reflector::ObjectRef,
    Api, ResourceExt,
};
use rand::seq::SliceRandom;

use super::{record, run_workers, Result};
use crate::{
    crd::{
        game_server_set::GameServerSetStatus, GameServer, GameServerSet, GameServerState,
        SchedulingStrategy,
    },
    nodes::NodeCounter,
    signal::ShutdownRx,
    watch::{split_key, Store},
    workqueue::WorkQueue,
};

const CONTROLLER: &str = "gameserverset-controller";

/// Upper bound of creations and deletions issued in a single sync, so one
/// large scale never starves other keys. The next sync continues.
const MAX_BURST: usize = 64;

pub struct GameServerSetController {
    client: kube::Client,
    sets: Store<GameServerSet>,
    servers: Store<GameServer>,
    counter: Arc<NodeCounter>,
    queue: Arc<WorkQueue>,
}

impl GameServerSetController {
    pub fn new(
        client: kube::Client,
        sets: Store<GameServerSet>,
        servers: Store<GameServer>,
        counter: Arc<NodeCounter>,
        queue: Arc<WorkQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            sets,
            servers,
            counter,
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
        let Some(set) = self.sets.get(&ObjectRef::new(name).within(namespace)) else {
            return Ok(());
        };
        let set = (*set).clone();
        if set.metadata.deletion_timestamp.is_some() {
            // cascade deletion takes the GameServers down
            return Ok(());
        }

        let owned: Vec<GameServer> = self
            .servers
            .state()
            .into_iter()
            .filter(|gs| gs.namespace().as_deref() == Some(namespace))
            .filter(|gs| gs.owning_set() == Some(name))
            .map(|gs| (*gs).clone())
            .collect();

        let partition = Partition::of(&owned);
        let diff = set.spec.replicas - partition.counted() as i32;

        if diff > 0 {
            self.scale_up(&set, diff as usize).await?;
        } else if diff < 0 {
            self.scale_down(&set, &partition, diff.unsigned_abs() as usize)
                .await?;
        }

        self.update_status(&set, partition.status()).await
    }

    async fn scale_up(&self, set: &GameServerSet, count: usize) -> Result<()> {
        let api: Api<GameServer> =
            Api::namespaced(self.client.clone(), &set.namespace().unwrap_or_default());
        for _ in 0..count.min(MAX_BURST) {
            let mut gs = set.game_server();
            gs.apply_defaults();
            api.create(&PostParams::default(), &gs).await?;
        }
        record(
            &self.client,
            CONTROLLER,
            set,
            "ScalingUp",
            format!("Creating {} GameServers", count.min(MAX_BURST)),
        )
        .await;
        Ok(())
    }

    async fn scale_down(
        &self,
        set: &GameServerSet,
        partition: &Partition<'_>,
        count: usize,
    ) -> Result<()> {
        let candidates = delete_candidates(
            partition,
            count.min(MAX_BURST),
            set.spec.scheduling,
            &self.counter,
        );
        let api: Api<GameServer> =
            Api::namespaced(self.client.clone(), &set.namespace().unwrap_or_default());
        let deleting = candidates.len();

        for gs in candidates {
            match api.delete(&gs.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(error) => return Err(error.into()),
            }
        }

        if deleting > 0 {
            record(
                &self.client,
                CONTROLLER,
                set,
                "ScalingDown",
                format!("Deleting {deleting} GameServers"),
            )
            .await;
        }
        Ok(())
    }

    async fn update_status(&self, set: &GameServerSet, status: GameServerSetStatus) -> Result<()> {
        if set.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let api: Api<GameServerSet> =
            Api::namespaced(self.client.clone(), &set.namespace().unwrap_or_default());
        let patch = serde_json::json!({"status": status});
        api.patch_status(&set.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Owned GameServers bucketed by state class.
#[derive(Default)]
pub(crate) struct Partition<'a> {
    pub ready: Vec<&'a GameServer>,
    pub starting: Vec<&'a GameServer>,
    pub unhealthy: Vec<&'a GameServer>,
    pub errored: Vec<&'a GameServer>,
    pub allocated: usize,
    pub reserved: usize,
    pub shutdown: usize,
    pub deleting: usize,
}

impl<'a> Partition<'a> {
    pub fn of(owned: &'a [GameServer]) -> Self {
        let mut partition = Self::default();
        for gs in owned {
            if gs.is_being_deleted() {
                partition.deleting += 1;
                continue;
            }
            match gs.state() {
                Some(GameServerState::Ready) => partition.ready.push(gs),
                Some(GameServerState::Allocated) => partition.allocated += 1,
                Some(GameServerState::Reserved) => partition.reserved += 1,
                Some(GameServerState::Unhealthy) => partition.unhealthy.push(gs),
                Some(GameServerState::Error) => partition.errored.push(gs),
                Some(GameServerState::Shutdown) => partition.shutdown += 1,
                Some(state) if state.is_before_ready() => partition.starting.push(gs),
                Some(_) | None => partition.starting.push(gs),
            }
        }
        partition
    }

    /// The servers that count against the replica target: everything alive
    /// and not already on the way out.
    pub fn counted(&self) -> usize {
        self.ready.len() + self.starting.len() + self.allocated + self.reserved
    }

    pub fn status(&self) -> GameServerSetStatus {
        GameServerSetStatus {
            replicas: self.counted() as i32,
            ready_replicas: self.ready.len() as i32,
            allocated_replicas: self.allocated as i32,
            reserved_replicas: self.reserved as i32,
            shutdown_replicas: self.shutdown as i32,
        }
    }
}

/// Scale-down victims, least valuable first: unhealthy, then errored, then
/// still-starting, then ready (newest first, so long-lived servers survive).
/// Allocated and Reserved servers are never candidates. Packed prefers
/// servers on nodes with the fewest allocated sessions so drained nodes can
/// be freed; Distributed picks randomly within each class.
pub(crate) fn delete_candidates<'a>(
    partition: &Partition<'a>,
    count: usize,
    scheduling: SchedulingStrategy,
    counter: &NodeCounter,
) -> Vec<&'a GameServer> {
    let order_class = |class: &[&'a GameServer]| -> Vec<&'a GameServer> {
        let mut class: Vec<&'a GameServer> = class.to_vec();
        match scheduling {
            SchedulingStrategy::Packed => class.sort_by(|a, b| {
                let node = |gs: &GameServer| {
                    gs.status
                        .as_ref()
                        .map(|s| s.node_name.clone())
                        .unwrap_or_default()
                };
                counter
                    .allocated(&node(a))
                    .cmp(&counter.allocated(&node(b)))
                    .then_with(|| {
                        // newest first
                        b.metadata
                            .creation_timestamp
                            .cmp(&a.metadata.creation_timestamp)
                    })
                    .then_with(|| a.metadata.name.cmp(&b.metadata.name))
            }),
            SchedulingStrategy::Distributed => class.shuffle(&mut rand::thread_rng()),
        }
        class
    };

    [
        &partition.unhealthy,
        &partition.errored,
        &partition.starting,
        &partition.ready,
    ]
    .into_iter()
    .flat_map(|class| order_class(class))
    .take(count)
    .collect()
}
