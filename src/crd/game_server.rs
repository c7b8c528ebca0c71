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

use k8s_openapi::{
    api::core::v1::PodTemplateSpec,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DEV_ADDRESS_ANNOTATION, GAME_SERVER_FINALIZER, GAME_SERVER_SET_LABEL};

/// A single game server process managed as a stateful unit with an assigned
/// address. Created directly by a user, or through a [`GameServerSet`].
///
/// [`GameServerSet`]: super::GameServerSet
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "agones.dev",
    version = "v1",
    kind = "GameServer",
    plural = "gameservers",
    singular = "gameserver",
    shortname = "gs",
    namespaced,
    status = "GameServerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Which Pod container is the game server. Only required if there is
    /// more than one container defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Ports that are to be exposed via the game server.
    #[serde(default)]
    pub ports: Vec<GameServerPort>,
    /// Configures health checking.
    #[serde(default)]
    pub health: Health,
    /// Scheduling strategy. Defaults to "Packed".
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Parameters for the SDK server sidecar container.
    #[serde(default)]
    pub sdk_server: SdkServer,
    /// Describes the Pod that will be created for the GameServer.
    pub template: PodTemplateSpec,
}

impl Default for GameServerSpec {
    fn default() -> Self {
        Self {
            container: None,
            ports: vec![],
            health: Default::default(),
            scheduling: Default::default(),
            sdk_server: Default::default(),
            template: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Health {
    /// Whether health checking is disabled or not.
    #[serde(default)]
    pub disabled: bool,
    /// The number of seconds each health ping has to occur in.
    #[serde(rename = "periodSeconds", default = "default_period_seconds")]
    pub period_seconds: i32,
    /// How many failures in a row constitutes unhealthy.
    #[serde(rename = "failureThreshold", default = "default_failure_threshold")]
    pub failure_threshold: i32,
    /// Initial delay before checking health.
    #[serde(
        rename = "initialDelaySeconds",
        default = "default_initial_delay_seconds"
    )]
    pub initial_delay_seconds: i32,
}

fn default_period_seconds() -> i32 {
    5
}
fn default_initial_delay_seconds() -> i32 {
    5
}
fn default_failure_threshold() -> i32 {
    5
}

impl Default for Health {
    fn default() -> Self {
        Self {
            disabled: false,
            period_seconds: default_period_seconds(),
            failure_threshold: default_failure_threshold(),
            initial_delay_seconds: default_initial_delay_seconds(),
        }
    }
}

/// A port to be exposed via the GameServer.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    /// The descriptive name of the port.
    pub name: String,
    /// Defines the policy for how [`Self::host_port`] is populated.
    ///
    /// - `Dynamic` will allocate a host port within the port range passed to
    ///   the controller at installation time.
    /// - `Static` requires `hostPort` to name the port that game clients will
    ///   connect to.
    /// - `Passthrough` dynamically sets the container port to the same value
    ///   as the dynamically selected host port.
    #[serde(default)]
    pub port_policy: PortPolicy,
    /// The name of the container on which to open the port. Defaults to the
    /// game server container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// The port that is being opened on the specified container's process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    /// The port exposed on the host for clients to connect to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    /// The network protocol being used. Defaults to UDP.
    #[serde(default)]
    pub protocol: Protocol,
}

impl GameServerPort {
    /// Whether the host port still has to be chosen by the port allocator.
    pub fn needs_host_port(&self) -> bool {
        matches!(self.port_policy, PortPolicy::Dynamic | PortPolicy::Passthrough)
            && self.host_port.unwrap_or_default() == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PortPolicy {
    /// The user defines the host port to be used in the configuration.
    Static,
    /// The system will choose an open port for the GameServer in question.
    #[default]
    Dynamic,
    /// Dynamically sets the container port to the same value as the
    /// dynamically selected host port.
    Passthrough,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Protocol {
    #[default]
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "TCPUDP")]
    UdpTcp,
}

/// The strategy used when scheduling GameServer Pods across a cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SchedulingStrategy {
    /// Prioritise nodes that already hold Allocated GameServers, to bin pack
    /// sessions onto as few nodes as possible. Most useful for dynamically
    /// sized clusters.
    #[default]
    Packed,
    /// Spread sessions across as many nodes as possible. Most useful for
    /// statically sized clusters.
    Distributed,
}

/// Parameters for the SDK server sidecar container.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SdkServer {
    /// The log level for SDK server (sidecar) logs.
    #[serde(default)]
    pub log_level: SdkServerLogLevel,
    /// The port on which the SDK server binds its gRPC server.
    #[serde(default = "default_sdk_grpc_port")]
    pub grpc_port: u16,
    /// The port on which the SDK server binds its HTTP gateway.
    #[serde(default = "default_sdk_http_port")]
    pub http_port: u16,
}

fn default_sdk_grpc_port() -> u16 {
    9357
}
fn default_sdk_http_port() -> u16 {
    9358
}

impl Default for SdkServer {
    fn default() -> Self {
        Self {
            log_level: Default::default(),
            grpc_port: default_sdk_grpc_port(),
            http_port: default_sdk_http_port(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SdkServerLogLevel {
    #[default]
    Info,
    Debug,
    Error,
}

/// The current state of a GameServer within its lifecycle state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum GameServerState {
    /// A dynamically allocating GameServer is being created, an open port
    /// needs to be allocated.
    PortAllocation,
    /// The Pod for the GameServer is being created.
    Creating,
    /// The Pod has been created but is not yet scheduled.
    Starting,
    /// The Pod has been scheduled in the cluster; we have a node name.
    Scheduled,
    /// The GameServer has declared that it is ready.
    RequestReady,
    /// The GameServer is ready to take connections from game clients.
    Ready,
    /// The GameServer has shutdown and everything needs to be deleted.
    Shutdown,
    /// Something has gone wrong that cannot be resolved.
    Error,
    /// The GameServer has failed its health checks.
    Unhealthy,
    /// The GameServer is reserved: it can be allocated but not removed.
    Reserved,
    /// The GameServer has been allocated to a session.
    Allocated,
}

impl GameServerState {
    /// States that end reconciliation; the record is only waiting on cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown | Self::Error | Self::Unhealthy)
    }

    /// States on the creation path, before the server can take traffic.
    pub fn is_before_ready(self) -> bool {
        matches!(
            self,
            Self::PortAllocation
                | Self::Creating
                | Self::Starting
                | Self::Scheduled
                | Self::RequestReady
        )
    }
}

impl std::fmt::Display for GameServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The observed status of a GameServer.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<GameServerState>,
    #[serde(default)]
    pub ports: Vec<GameServerStatusPort>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node_name: String,
    /// When a `Reserved` GameServer returns to `Ready`. Persisted so that a
    /// controller restart re-arms the timer rather than losing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_until: Option<Time>,
}

/// A port that was assigned to a GameServer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct GameServerStatusPort {
    pub name: String,
    pub port: u16,
}

/// The spec and metadata used by [`GameServerSet`]s and [`Fleet`]s to stamp
/// out GameServers.
///
/// [`GameServerSet`]: super::GameServerSet
/// [`Fleet`]: super::Fleet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct GameServerTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    pub spec: GameServerSpec,
}

impl GameServer {
    pub fn state(&self) -> Option<GameServerState> {
        self.status.as_ref().and_then(|status| status.state)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether a scale-down or rollout may remove this server. Allocated and
    /// Reserved servers own sessions and are never deletable.
    pub fn is_deletable(&self) -> bool {
        !matches!(
            self.state(),
            Some(GameServerState::Allocated | GameServerState::Reserved)
        )
    }

    /// The address supplied through the development annotation, marking this
    /// GameServer as running outside the cluster with no Pod.
    pub fn dev_address(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(DEV_ADDRESS_ANNOTATION))
            .map(String::as_str)
    }

    /// The GameServerSet this server belongs to, if any.
    pub fn owning_set(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(GAME_SERVER_SET_LABEL))
            .map(String::as_str)
    }

    /// Whether any port still needs a host port from the allocator.
    pub fn needs_port_allocation(&self) -> bool {
        self.spec.ports.iter().any(GameServerPort::needs_host_port)
    }

    /// How much longer a Reserved server is withheld at `now`.
    /// `None` means the reservation has no deadline and holds until the
    /// sidecar acts; a zero duration means it has expired.
    pub fn reservation_remaining(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<std::time::Duration> {
        let until = self.status.as_ref()?.reserved_until.as_ref()?;
        Some((until.0 - now).to_std().unwrap_or_default())
    }

    /// Defaulting applied by the mutating admission webhook. Idempotent:
    /// applying it twice produces no further change.
    pub fn apply_defaults(&mut self) {
        if self.spec.container.is_none() {
            if let Some([container]) = self
                .spec
                .template
                .spec
                .as_ref()
                .map(|spec| spec.containers.as_slice())
            {
                self.spec.container = Some(container.name.clone());
            }
        }

        for port in &mut self.spec.ports {
            if port.container.is_none() {
                port.container = self.spec.container.clone();
            }
        }

        if !self
            .finalizers()
            .iter()
            .any(|f| f == GAME_SERVER_FINALIZER)
        {
            self.metadata
                .finalizers
                .get_or_insert_with(Default::default)
                .push(GAME_SERVER_FINALIZER.to_owned());
        }

        if self.status.as_ref().and_then(|s| s.state).is_none() {
            let state = if self.needs_port_allocation() {
                GameServerState::PortAllocation
            } else {
                GameServerState::Creating
            };
            self.status.get_or_insert_with(Default::default).state = Some(state);
        }
    }

    /// Validation applied by the validating admission webhook, and re-checked
    /// by the reconciler in case an invalid spec slipped through. Returns the
    /// list of violations; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = vec![];

        let containers = self
            .spec
            .template
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();

        if self.dev_address().is_none() {
            if containers.is_empty() {
                errors.push("spec.template must declare at least one container".to_owned());
            }
            match &self.spec.container {
                Some(name) if !containers.iter().any(|c| &c.name == name) => {
                    errors.push(format!("spec.container {name:?} does not match a Pod container"));
                }
                None if containers.len() > 1 => {
                    errors.push(
                        "spec.container is required when there is more than one container"
                            .to_owned(),
                    );
                }
                _ => {}
            }
        }

        for port in &self.spec.ports {
            match port.port_policy {
                PortPolicy::Dynamic | PortPolicy::Passthrough => {
                    if port.host_port.unwrap_or_default() != 0 {
                        errors.push(format!(
                            "hostPort cannot be specified with a {:?} portPolicy for port {:?}",
                            port.port_policy, port.name
                        ));
                    }
                }
                PortPolicy::Static => {
                    if port.host_port.unwrap_or_default() == 0 {
                        errors.push(format!(
                            "hostPort is required for port {:?} with a Static portPolicy",
                            port.name
                        ));
                    }
                }
            }

            if self.dev_address().is_some() && port.port_policy != PortPolicy::Static {
                errors.push(format!(
                    "portPolicy must be Static on development GameServers for port {:?}",
                    port.name
                ));
            }
        }

        if let Some(dev) = self.dev_address() {
            if dev.parse::<std::net::IpAddr>().is_err() {
                errors.push(format!("invalid development address {dev:?}, must be an IP"));
            }
        }

        if !self.spec.health.disabled {
            let health = &self.spec.health;
            if health.period_seconds <= 0
                || health.failure_threshold <= 0
                || health.initial_delay_seconds < 0
            {
                errors.push("health check periods and thresholds must be positive".to_owned());
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn fixture() -> GameServer {
        let mut gs = GameServer::new(
            "simple",
            GameServerSpec {
                ports: vec![GameServerPort {
                    name: "default".into(),
                    port_policy: PortPolicy::Dynamic,
                    container: None,
                    container_port: Some(7777),
                    host_port: None,
                    protocol: Protocol::Udp,
                }],
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "game".into(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        gs.metadata.namespace = Some("default".into());
        gs
    }

    #[test]
    fn defaults_fill_container_and_initial_state() {
        let mut gs = fixture();
        gs.apply_defaults();

        assert_eq!(gs.spec.container.as_deref(), Some("game"));
        assert_eq!(gs.spec.ports[0].container.as_deref(), Some("game"));
        assert_eq!(gs.state(), Some(GameServerState::PortAllocation));
        assert_eq!(gs.metadata.finalizers.as_deref(), Some(&[GAME_SERVER_FINALIZER.to_owned()][..]));
    }

    #[test]
    fn defaults_are_idempotent() {
        let mut gs = fixture();
        gs.apply_defaults();
        let once = serde_json::to_value(&gs).unwrap();
        gs.apply_defaults();
        assert_eq!(once, serde_json::to_value(&gs).unwrap());
    }

    #[test]
    fn static_ports_skip_port_allocation() {
        let mut gs = fixture();
        gs.spec.ports[0].port_policy = PortPolicy::Static;
        gs.spec.ports[0].host_port = Some(7777);
        gs.apply_defaults();
        assert_eq!(gs.state(), Some(GameServerState::Creating));
    }

    #[test]
    fn validate_rejects_dynamic_host_port() {
        let mut gs = fixture();
        gs.spec.ports[0].host_port = Some(7777);
        let errors = gs.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("hostPort cannot be specified"));
    }

    #[test]
    fn validate_rejects_unknown_container() {
        let mut gs = fixture();
        gs.spec.container = Some("missing".into());
        assert!(!gs.validate().is_empty());
    }

    #[test]
    fn validate_requires_container_choice_for_multiple() {
        let mut gs = fixture();
        gs.spec
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers
            .push(Container {
                name: "second".into(),
                ..Default::default()
            });
        let errors = gs.validate();
        assert!(errors.iter().any(|e| e.contains("spec.container is required")));
    }

    #[test]
    fn validate_dev_address() {
        let mut gs = fixture();
        gs.annotations_mut()
            .insert(DEV_ADDRESS_ANNOTATION.into(), "192.168.0.1".into());

        // dynamic ports are not allowed against a dev address
        assert!(!gs.validate().is_empty());

        gs.spec.ports[0].port_policy = PortPolicy::Static;
        gs.spec.ports[0].host_port = Some(7777);
        assert!(gs.validate().is_empty());

        gs.annotations_mut()
            .insert(DEV_ADDRESS_ANNOTATION.into(), "not-an-ip".into());
        assert!(!gs.validate().is_empty());
    }

    #[test]
    fn reservations_expire_against_the_persisted_deadline() {
        let now = chrono::Utc::now();
        let mut gs = fixture();
        assert_eq!(gs.reservation_remaining(now), None);

        gs.status = Some(GameServerStatus {
            state: Some(GameServerState::Reserved),
            reserved_until: Some(Time(now + chrono::Duration::seconds(5))),
            ..Default::default()
        });
        let remaining = gs.reservation_remaining(now).unwrap();
        assert!(remaining > std::time::Duration::from_secs(4));

        // a restart that comes back after the deadline sees zero remaining
        let later = now + chrono::Duration::seconds(6);
        assert_eq!(
            gs.reservation_remaining(later).unwrap(),
            std::time::Duration::ZERO
        );
    }

    #[test]
    fn state_classes() {
        assert!(GameServerState::Shutdown.is_terminal());
        assert!(GameServerState::Unhealthy.is_terminal());
        assert!(!GameServerState::Allocated.is_terminal());
        assert!(GameServerState::Scheduled.is_before_ready());
        assert!(!GameServerState::Ready.is_before_ready());
    }

    #[test]
    fn wire_format_round_trips() {
        let mut gs = fixture();
        gs.apply_defaults();
        let value = serde_json::to_value(&gs).unwrap();
        assert_eq!(value["spec"]["ports"][0]["portPolicy"], "Dynamic");
        assert_eq!(value["spec"]["ports"][0]["protocol"], "UDP");
        assert_eq!(value["status"]["state"], "PortAllocation");

        let back: GameServer = serde_json::from_value(value).unwrap();
        assert_eq!(back.state(), Some(GameServerState::PortAllocation));
    }
}
