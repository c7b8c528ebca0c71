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

use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    game_server::{GameServerTemplateSpec, SchedulingStrategy},
    GameServer, GAME_SERVER_SET_LABEL,
};

/// A homogeneous set of GameServers for a single template revision, owned by
/// a [`Fleet`](super::Fleet). The controller keeps the count of non-terminal
/// GameServers equal to `spec.replicas`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "agones.dev",
    version = "v1",
    kind = "GameServerSet",
    plural = "gameserversets",
    singular = "gameserverset",
    shortname = "gss",
    namespaced,
    status = "GameServerSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    /// The number of GameServers this set should maintain.
    pub replicas: i32,
    /// Scheduling strategy, inherited by stamped GameServers.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Template from which GameServers are created. Immutable: a Fleet rolls
    /// out a template change by creating a new set.
    pub template: GameServerTemplateSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetStatus {
    /// The number of non-terminal GameServers in this set.
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub allocated_replicas: i32,
    #[serde(default)]
    pub reserved_replicas: i32,
    /// GameServers in the Shutdown state, awaiting deletion.
    #[serde(default)]
    pub shutdown_replicas: i32,
}

impl GameServerSet {
    /// Stamp a new GameServer from the set's template, labelled and owned so
    /// that cascade deletion and list-by-owner work.
    pub fn game_server(&self) -> GameServer {
        let mut gs = GameServer::new("", self.spec.template.spec.clone());

        gs.metadata = self
            .spec
            .template
            .metadata
            .clone()
            .unwrap_or_default();
        gs.metadata.name = None;
        gs.metadata.generate_name = Some(format!("{}-", self.name_any()));
        gs.metadata.namespace = self.metadata.namespace.clone();
        gs.metadata.owner_references = self.controller_owner_ref(&()).map(|r| vec![r]);
        gs.labels_mut()
            .insert(GAME_SERVER_SET_LABEL.to_owned(), self.name_any());

        gs.spec.scheduling = self.spec.scheduling;
        gs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::game_server::GameServerSpec;

    #[test]
    fn stamped_game_servers_carry_ownership() {
        let mut set = GameServerSet::new(
            "simple-abcd",
            GameServerSetSpec {
                replicas: 3,
                scheduling: SchedulingStrategy::Distributed,
                template: GameServerTemplateSpec {
                    metadata: None,
                    spec: GameServerSpec::default(),
                },
            },
        );
        set.metadata.namespace = Some("default".into());
        set.metadata.uid = Some("1234".into());

        let gs = set.game_server();
        assert_eq!(gs.metadata.generate_name.as_deref(), Some("simple-abcd-"));
        assert_eq!(gs.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(gs.owning_set(), Some("simple-abcd"));
        assert_eq!(gs.spec.scheduling, SchedulingStrategy::Distributed);

        let owner = &gs.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "GameServerSet");
        assert_eq!(owner.name, "simple-abcd");
        assert_eq!(owner.controller, Some(true));
    }
}
