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

//! Maps Pod-level failures onto GameServer health: a server whose Pod has
//! failed, restarted past its liveness threshold, or disappeared after
//! scheduling is moved to `Unhealthy`.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Patch, PatchParams},
    runtime::reflector::ObjectRef,
    Api, ResourceExt,
};

use super::{record, run_workers, Result};
use crate::{
    crd::{GameServer, GameServerState},
    signal::ShutdownRx,
    watch::{split_key, Store},
    workqueue::WorkQueue,
};

const CONTROLLER: &str = "health-controller";

pub struct HealthController {
    client: kube::Client,
    servers: Store<GameServer>,
    pods: Store<Pod>,
    queue: Arc<WorkQueue>,
}

impl HealthController {
    pub fn new(
        client: kube::Client,
        servers: Store<GameServer>,
        pods: Store<Pod>,
        queue: Arc<WorkQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            servers,
            pods,
            queue,
        })
    }

    pub fn run(self: &Arc<Self>, shutdown: ShutdownRx) -> Vec<tokio::task::JoinHandle<()>> {
        let controller = Arc::clone(self);
        run_workers(Arc::clone(&self.queue), 1, shutdown, move |key| {
            let controller = Arc::clone(&controller);
            async move { controller.reconcile(&key).await }
        })
    }

    async fn reconcile(&self, key: &str) -> Result<()> {
        let (Some(namespace), name) = split_key(key) else {
            return Ok(());
        };
        let Some(gs) = self.servers.get(&ObjectRef::new(name).within(namespace)) else {
            return Ok(());
        };

        if skip_health_checks(&gs) {
            return Ok(());
        }

        let pod = self
            .pods
            .get(&ObjectRef::new(name).within(namespace))
            .map(|pod| (*pod).clone());

        if let Some(reason) = unhealthy_reason(&gs, pod.as_ref()) {
            let api: Api<GameServer> = Api::namespaced(self.client.clone(), namespace);
            let status = serde_json::json!({"status": {"state": GameServerState::Unhealthy}});
            api.patch_status(&gs.name_any(), &PatchParams::default(), &Patch::Merge(&status))
                .await?;
            record(&self.client, CONTROLLER, &*gs, "Unhealthy", reason).await;
        }
        Ok(())
    }
}

fn skip_health_checks(gs: &GameServer) -> bool {
    gs.is_being_deleted()
        || gs.dev_address().is_some()
        || gs.state().is_none()
        || gs.state().is_some_and(|state| state.is_terminal())
}

/// Why a GameServer should be marked Unhealthy, if it should.
fn unhealthy_reason(gs: &GameServer, pod: Option<&Pod>) -> Option<String> {
    let state = gs.state()?;

    let Some(pod) = pod else {
        // the Pod exists from Starting onward; losing it later means the
        // server is gone
        return (!matches!(
            state,
            GameServerState::PortAllocation | GameServerState::Creating
        ))
        .then(|| "Pod is missing".to_owned());
    };

    if pod.metadata.deletion_timestamp.is_some() {
        return Some("Pod is being deleted".to_owned());
    }

    let pod_status = pod.status.as_ref()?;
    if pod_status.phase.as_deref() == Some("Failed") {
        return Some("Pod has failed".to_owned());
    }

    if !gs.spec.health.disabled {
        let game_container = gs.spec.container.as_deref();
        let restarts = pod_status
            .container_statuses
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|status| game_container.map_or(true, |name| name == status.name))
            .map(|status| status.restart_count)
            .max()
            .unwrap_or(0);
        if restarts > 0 {
            return Some(format!("Container has restarted {restarts} time(s)"));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::game_server::{GameServerStatus, Health};
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    fn game_server(state: GameServerState) -> GameServer {
        let mut gs = GameServer::new("gs1", Default::default());
        gs.spec.container = Some("game".into());
        gs.status = Some(GameServerStatus {
            state: Some(state),
            ..Default::default()
        });
        gs
    }

    fn pod_with_restarts(container: &str, restarts: i32) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: container.into(),
                    restart_count: restarts,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn missing_pod_is_unhealthy_after_creation() {
        assert!(unhealthy_reason(&game_server(GameServerState::Ready), None).is_some());
        assert!(unhealthy_reason(&game_server(GameServerState::Starting), None).is_some());
        // before the pod exists there is nothing to check
        assert!(unhealthy_reason(&game_server(GameServerState::Creating), None).is_none());
        assert!(unhealthy_reason(&game_server(GameServerState::PortAllocation), None).is_none());
    }

    #[test]
    fn failed_pod_is_unhealthy() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Failed".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(unhealthy_reason(&game_server(GameServerState::Ready), Some(&pod)).is_some());
    }

    #[test]
    fn restarts_trip_the_health_check() {
        let gs = game_server(GameServerState::Ready);
        let healthy = pod_with_restarts("game", 0);
        assert!(unhealthy_reason(&gs, Some(&healthy)).is_none());

        let restarted = pod_with_restarts("game", 2);
        assert!(unhealthy_reason(&gs, Some(&restarted)).is_some());

        // restarts of unrelated containers are not the game server's problem
        let other = pod_with_restarts("sidecar-ish", 2);
        assert!(unhealthy_reason(&gs, Some(&other)).is_none());
    }

    #[test]
    fn disabled_health_ignores_restarts() {
        let mut gs = game_server(GameServerState::Ready);
        gs.spec.health = Health {
            disabled: true,
            ..Default::default()
        };
        let restarted = pod_with_restarts("game", 5);
        assert!(unhealthy_reason(&gs, Some(&restarted)).is_none());
    }

    #[test]
    fn skips_dev_and_terminal_servers() {
        let mut dev = game_server(GameServerState::Ready);
        dev.annotations_mut().insert(
            crate::crd::DEV_ADDRESS_ANNOTATION.into(),
            "192.168.0.1".into(),
        );
        assert!(skip_health_checks(&dev));
        assert!(skip_health_checks(&game_server(GameServerState::Unhealthy)));
        assert!(!skip_health_checks(&game_server(GameServerState::Ready)));
    }
}
