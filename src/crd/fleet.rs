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

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    game_server::{GameServerTemplateSpec, SchedulingStrategy},
    game_server_set::GameServerSetSpec,
    GameServerSet, FLEET_NAME_LABEL,
};

/// User-declared intent for a pool of interchangeable game-server instances.
/// The controller realises a Fleet through one or more [`GameServerSet`]s,
/// rolling template changes without evicting allocated sessions.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "agones.dev",
    version = "v1",
    kind = "Fleet",
    plural = "fleets",
    singular = "fleet",
    shortname = "flt",
    namespaced,
    status = "FleetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct FleetSpec {
    /// The requested total of game servers, across all states except the
    /// terminal ones.
    pub replicas: i32,
    /// Deployment strategy for template changes.
    #[serde(default)]
    pub strategy: FleetStrategy,
    /// Scheduling strategy, inherited by owned sets and servers.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Template for the GameServers this fleet maintains.
    pub template: GameServerTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetStrategy {
    #[serde(rename = "type", default)]
    pub type_: FleetStrategyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum FleetStrategyType {
    /// Scale every superseded set straight to zero. Allocated servers linger
    /// until their sessions finish, so this still never interrupts play.
    Recreate,
    /// Step superseded sets down by `maxUnavailable` while growing the active
    /// set within `maxSurge`.
    #[default]
    RollingUpdate,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// How many servers past `replicas` may exist during a rollout; an
    /// absolute count or a percentage of `replicas`.
    #[serde(default = "default_rolling_bound")]
    pub max_surge: IntOrString,
    /// How far below `replicas` the ready count may drop during a rollout.
    #[serde(default = "default_rolling_bound")]
    pub max_unavailable: IntOrString,
}

fn default_rolling_bound() -> IntOrString {
    IntOrString::String("25%".to_owned())
}

impl Default for RollingUpdate {
    fn default() -> Self {
        Self {
            max_surge: default_rolling_bound(),
            max_unavailable: default_rolling_bound(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    /// The total of non-terminal GameServers across owned sets.
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub allocated_replicas: i32,
    #[serde(default)]
    pub reserved_replicas: i32,
}

/// Resolve an absolute-or-percentage bound against `total`.
///
/// Percentages round up when `round_up` (maxSurge, so a rollout always makes
/// progress) and down otherwise (maxUnavailable, so it never overshoots).
pub fn resolve_int_or_percent(
    value: &IntOrString,
    total: i32,
    round_up: bool,
) -> Result<i32, String> {
    match value {
        IntOrString::Int(n) if *n >= 0 => Ok(*n),
        IntOrString::Int(n) => Err(format!("negative bound: {n}")),
        IntOrString::String(s) => {
            let percent: i64 = s
                .strip_suffix('%')
                .and_then(|digits| digits.parse().ok())
                .filter(|p| *p >= 0)
                .ok_or_else(|| format!("invalid percentage {s:?}"))?;
            let scaled = percent * total as i64;
            let resolved = if round_up {
                (scaled + 99) / 100
            } else {
                scaled / 100
            };
            Ok(resolved as i32)
        }
    }
}

impl Fleet {
    /// Defaulting applied by the mutating admission webhook. Idempotent.
    pub fn apply_defaults(&mut self) {
        if self.spec.strategy.type_ == FleetStrategyType::RollingUpdate
            && self.spec.strategy.rolling_update.is_none()
        {
            self.spec.strategy.rolling_update = Some(RollingUpdate::default());
        }
    }

    /// Validation applied by the validating admission webhook; the embedded
    /// GameServer template is validated with the GameServer rules.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = vec![];
        if self.spec.replicas < 0 {
            errors.push("spec.replicas must not be negative".to_owned());
        }
        if let Some(rolling) = &self.spec.strategy.rolling_update {
            for (field, value, round_up) in [
                ("maxSurge", &rolling.max_surge, true),
                ("maxUnavailable", &rolling.max_unavailable, false),
            ] {
                if let Err(err) = resolve_int_or_percent(value, self.spec.replicas, round_up) {
                    errors.push(format!("spec.strategy.rollingUpdate.{field}: {err}"));
                }
            }
        }

        let mut template = crate::crd::GameServer::new("", self.spec.template.spec.clone());
        template.metadata.namespace = self.metadata.namespace.clone();
        errors.extend(
            template
                .validate()
                .into_iter()
                .map(|err| format!("spec.template: {err}")),
        );
        errors
    }

    /// Construct (without persisting) a GameServerSet for the fleet's current
    /// template revision.
    pub fn game_server_set(&self) -> GameServerSet {
        let mut set = GameServerSet::new(
            "",
            GameServerSetSpec {
                // replicas chosen by the deployment strategy before persisting
                replicas: 0,
                scheduling: self.spec.scheduling,
                template: self.spec.template.clone(),
            },
        );
        set.metadata.name = None;
        set.metadata.generate_name = Some(format!("{}-", self.name_any()));
        set.metadata.namespace = self.metadata.namespace.clone();
        set.metadata.owner_references = self.controller_owner_ref(&()).map(|r| vec![r]);
        set.labels_mut()
            .insert(FLEET_NAME_LABEL.to_owned(), self.name_any());
        set
    }

    /// Whether `set` realises the fleet's current template revision.
    pub fn is_active(&self, set: &GameServerSet) -> bool {
        serde_json::to_value(&set.spec.template).ok()
            == serde_json::to_value(&self.spec.template).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::game_server::GameServerSpec;

    fn fixture() -> Fleet {
        let mut fleet = Fleet::new(
            "simple",
            FleetSpec {
                replicas: 8,
                strategy: Default::default(),
                scheduling: Default::default(),
                template: GameServerTemplateSpec {
                    metadata: None,
                    spec: GameServerSpec::default(),
                },
            },
        );
        fleet.metadata.namespace = Some("default".into());
        fleet.metadata.uid = Some("fleet-uid".into());
        fleet
    }

    #[test]
    fn defaults_fill_rolling_update_and_are_idempotent() {
        let mut fleet = fixture();
        fleet.apply_defaults();
        let rolling = fleet.spec.strategy.rolling_update.clone().unwrap();
        assert_eq!(rolling.max_surge, IntOrString::String("25%".into()));

        let once = serde_json::to_value(&fleet).unwrap();
        fleet.apply_defaults();
        assert_eq!(once, serde_json::to_value(&fleet).unwrap());
    }

    #[test]
    fn percentages_resolve_with_directed_rounding() {
        let quarter = IntOrString::String("25%".to_owned());
        // maxSurge rounds up, maxUnavailable rounds down
        assert_eq!(resolve_int_or_percent(&quarter, 10, true).unwrap(), 3);
        assert_eq!(resolve_int_or_percent(&quarter, 10, false).unwrap(), 2);
        assert_eq!(resolve_int_or_percent(&quarter, 8, true).unwrap(), 2);
        assert_eq!(resolve_int_or_percent(&IntOrString::Int(4), 8, false).unwrap(), 4);
        assert!(resolve_int_or_percent(&IntOrString::String("nope".into()), 8, true).is_err());
        assert!(resolve_int_or_percent(&IntOrString::Int(-1), 8, true).is_err());
    }

    #[test]
    fn active_set_matches_on_template_equality() {
        let fleet = fixture();
        let set = fleet.game_server_set();
        assert!(fleet.is_active(&set));

        let mut other = set.clone();
        other.spec.template.spec.container = Some("other".into());
        assert!(!fleet.is_active(&other));
    }

    #[test]
    fn owned_set_carries_fleet_label() {
        let fleet = fixture();
        let set = fleet.game_server_set();
        assert_eq!(set.metadata.generate_name.as_deref(), Some("simple-"));
        assert_eq!(
            set.metadata.labels.as_ref().unwrap().get(FLEET_NAME_LABEL),
            Some(&"simple".to_owned())
        );
        let owner = &set.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Fleet");
        assert_eq!(owner.controller, Some(true));
    }
}
