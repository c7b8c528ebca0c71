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

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    game_server::{GameServerStatusPort, SchedulingStrategy},
    is_valid_meta_key, GameServer,
};

/// A one-shot request that atomically claims a Ready GameServer for a game
/// session. Submitted over HTTP, resolved synchronously, and never persisted
/// beyond the response.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "allocation.agones.dev",
    version = "v1",
    kind = "GameServerAllocation",
    plural = "gameserverallocations",
    singular = "gameserverallocation",
    namespaced,
    status = "GameServerAllocationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocationSpec {
    /// The selector a GameServer must match to be allocatable.
    #[serde(default)]
    pub required: LabelSelector,
    /// Ordered list of preferred selectors; the first one with a match wins
    /// over the plain required match.
    #[serde(default)]
    pub preferred: Vec<LabelSelector>,
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Labels and annotations merged onto the chosen GameServer as part of
    /// the allocation write.
    #[serde(default, rename = "metadata")]
    pub meta_patch: MetaPatch,
    #[serde(default)]
    pub multi_cluster_setting: MultiClusterSetting,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct MetaPatch {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl MetaPatch {
    pub fn validate(&self) -> Vec<String> {
        self.labels
            .keys()
            .chain(self.annotations.keys())
            .filter(|key| !is_valid_meta_key(key))
            .map(|key| format!("invalid metadata key {key:?}"))
            .collect()
    }

    /// Merge the patch into the chosen server's metadata.
    pub fn apply(&self, gs: &mut GameServer) {
        if !self.labels.is_empty() {
            gs.metadata
                .labels
                .get_or_insert_with(Default::default)
                .extend(self.labels.clone());
        }
        if !self.annotations.is_empty() {
            gs.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .extend(self.annotations.clone());
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterSetting {
    #[serde(default)]
    pub enabled: bool,
    /// Selects the GameServerAllocationPolicy records eligible to route this
    /// request.
    #[serde(default)]
    pub policy_selector: LabelSelector,
}

/// The result state of an allocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum GameServerAllocationState {
    /// A GameServer was claimed; the status carries its connection details.
    Allocated,
    /// No Ready GameServer matched the request.
    UnAllocated,
    /// Conflicts exhausted the request's deadline.
    Contention,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocationStatus {
    pub state: GameServerAllocationState,
    #[serde(default)]
    pub game_server_name: String,
    #[serde(default)]
    pub ports: Vec<GameServerStatusPort>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node_name: String,
}

impl GameServerAllocationStatus {
    pub fn unallocated() -> Self {
        Self {
            state: GameServerAllocationState::UnAllocated,
            game_server_name: String::new(),
            ports: vec![],
            address: String::new(),
            node_name: String::new(),
        }
    }

    pub fn contention() -> Self {
        Self {
            state: GameServerAllocationState::Contention,
            ..Self::unallocated()
        }
    }

    /// The success status for a claimed server; only constructed after the
    /// store update has been acknowledged.
    pub fn allocated(gs: &GameServer) -> Self {
        let status = gs.status.clone().unwrap_or_default();
        Self {
            state: GameServerAllocationState::Allocated,
            game_server_name: gs.metadata.name.clone().unwrap_or_default(),
            ports: status.ports,
            address: status.address,
            node_name: status.node_name,
        }
    }
}

impl GameServerAllocation {
    pub fn validate(&self) -> Vec<String> {
        self.spec.meta_patch.validate()
    }
}
