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

//! The custom resources managed by the controller, in the `agones.dev` API
//! group and its `allocation`, `autoscaling` and `multicluster` subgroups.

pub mod allocation;
pub mod autoscaler;
pub mod fleet;
pub mod game_server;
pub mod game_server_set;
pub mod policy;

pub use self::{
    allocation::{GameServerAllocation, GameServerAllocationState},
    autoscaler::FleetAutoscaler,
    fleet::Fleet,
    game_server::{GameServer, GameServerState, Protocol, SchedulingStrategy},
    game_server_set::GameServerSet,
    policy::GameServerAllocationPolicy,
};

/// Label placed on a GameServer pointing at the GameServerSet that owns it.
pub const GAME_SERVER_SET_LABEL: &str = "agones.dev/gameserverset";
/// Label placed on a GameServerSet pointing at the Fleet that owns it.
pub const FLEET_NAME_LABEL: &str = "agones.dev/fleet";
/// Label placed on a Pod pointing at the GameServer that owns it.
pub const GAME_SERVER_POD_LABEL: &str = "agones.dev/gameserver";
/// Role label attached to Pods created for GameServers.
pub const ROLE_LABEL: &str = "agones.dev/role";
pub const GAME_SERVER_ROLE: &str = "gameserver";

/// Finalizer attached at admission so the controller observes the terminal
/// transition before the record disappears.
pub const GAME_SERVER_FINALIZER: &str = "agones.dev/controller";

/// Annotation that marks a GameServer as having no Pod; its value is the
/// address the server is reachable at.
pub const DEV_ADDRESS_ANNOTATION: &str = "agones.dev/dev-address";

/// Name of the sidecar container injected into GameServer Pods.
pub const SIDECAR_CONTAINER: &str = "garrison-sdk";

/// Whether `key` is usable as a Kubernetes label or annotation key:
/// an optional DNS-1123 prefix, a `/`, and a qualified name.
pub fn is_valid_meta_key(key: &str) -> bool {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty()
                || prefix.len() > 253
                || !prefix
                    .split('.')
                    .all(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
            {
                return false;
            }
            name
        }
        None => key,
    };

    !name.is_empty()
        && name.len() <= 63
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_keys() {
        assert!(is_valid_meta_key("mode"));
        assert!(is_valid_meta_key("example.com/mode"));
        assert!(is_valid_meta_key("a-b_c.d"));
        assert!(!is_valid_meta_key(""));
        assert!(!is_valid_meta_key("/mode"));
        assert!(!is_valid_meta_key("example..com/mode"));
        assert!(!is_valid_meta_key("-leading"));
        assert!(!is_valid_meta_key("trailing-"));
        assert!(!is_valid_meta_key(&"x".repeat(64)));
    }
}
