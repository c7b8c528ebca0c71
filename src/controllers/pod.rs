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

//! Construction of the Pod backing a GameServer: the user's template plus
//! the injected SDK sidecar, port mappings and ownership metadata.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, Pod,
        Probe, ResourceRequirements,
    },
    apimachinery::pkg::{api::resource::Quantity, util::intstr::IntOrString},
};
use kube::{Resource, ResourceExt};

use crate::crd::{
    GameServer, Protocol, GAME_SERVER_POD_LABEL, GAME_SERVER_ROLE, ROLE_LABEL, SIDECAR_CONTAINER,
};

/// Health endpoint served by the sidecar; the kubelet's liveness probe on it
/// carries the GameServer's health parameters.
const HEALTH_PATH: &str = "/gshealthz";
const HEALTH_PORT: i32 = 8080;

#[derive(Clone, Debug)]
pub struct SidecarConfig {
    pub image: String,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub always_pull: bool,
}

/// Build the Pod for a GameServer. Fails only on an unusable template; the
/// caller maps that onto the terminal `Error` state.
pub fn build_pod(gs: &GameServer, sidecar: &SidecarConfig) -> Result<Pod, String> {
    let template = &gs.spec.template;
    let mut pod_spec = template
        .spec
        .clone()
        .ok_or_else(|| "template does not declare a pod spec".to_owned())?;
    if pod_spec.containers.is_empty() {
        return Err("template does not declare any containers".to_owned());
    }

    for port in &gs.spec.ports {
        let target = port.container.as_deref().or(gs.spec.container.as_deref());
        let container = pod_spec
            .containers
            .iter_mut()
            .find(|c| Some(c.name.as_str()) == target)
            .ok_or_else(|| format!("port {:?} names an unknown container", port.name))?;

        let container_port = port.container_port.or(port.host_port).unwrap_or_default();
        let mappings = container.ports.get_or_insert_with(Vec::new);
        for protocol in port.protocol.as_pod_protocols() {
            mappings.push(ContainerPort {
                container_port: container_port as i32,
                host_port: port.host_port.map(|p| p as i32),
                protocol: Some((*protocol).to_owned()),
                ..Default::default()
            });
        }
    }

    pod_spec.containers.push(sidecar_container(gs, sidecar));

    let mut metadata = template.metadata.clone().unwrap_or_default();
    metadata.name = Some(gs.name_any());
    metadata.generate_name = None;
    metadata.namespace = gs.namespace();
    metadata.owner_references = gs.controller_owner_ref(&()).map(|r| vec![r]);
    let labels: &mut BTreeMap<String, String> =
        metadata.labels.get_or_insert_with(Default::default);
    labels.insert(ROLE_LABEL.to_owned(), GAME_SERVER_ROLE.to_owned());
    labels.insert(GAME_SERVER_POD_LABEL.to_owned(), gs.name_any());

    Ok(Pod {
        metadata,
        spec: Some(pod_spec),
        status: None,
    })
}

fn sidecar_container(gs: &GameServer, sidecar: &SidecarConfig) -> Container {
    let health = &gs.spec.health;
    let liveness_probe = (!health.disabled).then(|| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_owned()),
            port: IntOrString::Int(HEALTH_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(health.initial_delay_seconds),
        period_seconds: Some(health.period_seconds),
        failure_threshold: Some(health.failure_threshold),
        ..Default::default()
    });

    let mut resources = ResourceRequirements::default();
    if !sidecar.cpu_request.is_empty() {
        resources.requests = Some(
            [("cpu".to_owned(), Quantity(sidecar.cpu_request.clone()))].into(),
        );
    }
    if !sidecar.cpu_limit.is_empty() {
        resources.limits = Some([("cpu".to_owned(), Quantity(sidecar.cpu_limit.clone()))].into());
    }

    Container {
        name: SIDECAR_CONTAINER.to_owned(),
        image: Some(sidecar.image.clone()),
        image_pull_policy: sidecar.always_pull.then(|| "Always".to_owned()),
        env: Some(vec![
            EnvVar {
                name: "GAMESERVER_NAME".to_owned(),
                value: Some(gs.name_any()),
                value_from: None,
            },
            EnvVar {
                name: "POD_NAMESPACE".to_owned(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.namespace".to_owned(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
        ]),
        liveness_probe,
        resources: Some(resources),
        ..Default::default()
    }
}

impl Protocol {
    fn as_pod_protocols(self) -> &'static [&'static str] {
        match self {
            Self::Udp => &["UDP"],
            Self::Tcp => &["TCP"],
            Self::UdpTcp => &["UDP", "TCP"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::game_server::{
        GameServerPort, GameServerSpec, Health, PortPolicy,
    };
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};

    fn sidecar() -> SidecarConfig {
        SidecarConfig {
            image: "gcr.io/example/sdk-server:0.4".into(),
            cpu_request: "30m".into(),
            cpu_limit: "500m".into(),
            always_pull: false,
        }
    }

    fn game_server() -> GameServer {
        let mut gs = GameServer::new(
            "simple-gs",
            GameServerSpec {
                container: Some("game".into()),
                ports: vec![GameServerPort {
                    name: "default".into(),
                    port_policy: PortPolicy::Dynamic,
                    container: Some("game".into()),
                    container_port: Some(7654),
                    host_port: Some(7777),
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
        gs.metadata.uid = Some("gs-uid".into());
        gs
    }

    #[test]
    fn injects_sidecar_with_env_probe_and_resources() {
        let pod = build_pod(&game_server(), &sidecar()).unwrap();
        let containers = &pod.spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 2);

        let side = containers.iter().find(|c| c.name == SIDECAR_CONTAINER).unwrap();
        assert_eq!(side.image.as_deref(), Some("gcr.io/example/sdk-server:0.4"));

        let env = side.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "GAMESERVER_NAME"
            && e.value.as_deref() == Some("simple-gs")));
        assert!(env.iter().any(|e| e.name == "POD_NAMESPACE" && e.value_from.is_some()));

        let probe = side.liveness_probe.as_ref().unwrap();
        assert_eq!(probe.http_get.as_ref().unwrap().path.as_deref(), Some(HEALTH_PATH));
        assert_eq!(probe.period_seconds, Some(5));
        assert_eq!(probe.failure_threshold, Some(5));

        let resources = side.resources.as_ref().unwrap();
        assert_eq!(
            resources.requests.as_ref().unwrap()["cpu"],
            Quantity("30m".into())
        );
    }

    #[test]
    fn maps_ports_onto_the_game_container() {
        let pod = build_pod(&game_server(), &sidecar()).unwrap();
        let game = &pod.spec.as_ref().unwrap().containers[0];
        let ports = game.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].container_port, 7654);
        assert_eq!(ports[0].host_port, Some(7777));
        assert_eq!(ports[0].protocol.as_deref(), Some("UDP"));
    }

    #[test]
    fn tcpudp_ports_map_twice() {
        let mut gs = game_server();
        gs.spec.ports[0].protocol = Protocol::UdpTcp;
        let pod = build_pod(&gs, &sidecar()).unwrap();
        let ports = pod.spec.as_ref().unwrap().containers[0].ports.as_ref().unwrap().clone();
        let protocols: Vec<_> = ports.iter().filter_map(|p| p.protocol.as_deref()).collect();
        assert_eq!(protocols, vec!["UDP", "TCP"]);
    }

    #[test]
    fn disabled_health_skips_the_probe() {
        let mut gs = game_server();
        gs.spec.health = Health {
            disabled: true,
            ..Default::default()
        };
        let pod = build_pod(&gs, &sidecar()).unwrap();
        let side = pod.spec.as_ref().unwrap().containers.last().unwrap().clone();
        assert!(side.liveness_probe.is_none());
    }

    #[test]
    fn pod_carries_ownership_and_role_labels() {
        let pod = build_pod(&game_server(), &sidecar()).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("simple-gs"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[ROLE_LABEL], GAME_SERVER_ROLE);
        assert_eq!(labels[GAME_SERVER_POD_LABEL], "simple-gs");
        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "GameServer");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn empty_template_is_rejected() {
        let mut gs = game_server();
        gs.spec.template.spec = None;
        assert!(build_pod(&gs, &sidecar()).is_err());
    }
}
