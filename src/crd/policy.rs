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

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Routing record for multi-cluster allocation: where requests selected by a
/// [`GameServerAllocation`](super::GameServerAllocation)'s policy selector
/// may be forwarded, and with which credentials.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "multicluster.agones.dev",
    version = "v1",
    kind = "GameServerAllocationPolicy",
    plural = "gameserverallocationpolicies",
    singular = "gameserverallocationpolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocationPolicySpec {
    /// Lower priority is tried first; weight draws between equal priorities.
    pub priority: i32,
    pub weight: i32,
    pub connection_info: ClusterConnectionInfo,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConnectionInfo {
    /// A cluster name the receiving orchestrator recognises as itself is
    /// served locally instead of forwarded.
    #[serde(default)]
    pub cluster_name: String,
    /// Endpoints tried in order until one succeeds.
    #[serde(default)]
    pub allocation_endpoints: Vec<String>,
    /// Secret holding `ca.crt`, `tls.crt` and `tls.key` for mTLS to the
    /// remote endpoints.
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub namespace: String,
}
