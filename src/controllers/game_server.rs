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

//! The GameServer lifecycle controller: drives each server through the
//! state machine from creation to shutdown, owns its Pod, and arbitrates
//! port assignment and address resolution.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    runtime::reflector::ObjectRef,
    Api, ResourceExt,
};

use super::{pod::build_pod, record, run_workers, Error, Result, SidecarConfig};
use crate::{
    crd::{
        game_server::{GameServerPort, GameServerStatusPort},
        GameServer, GameServerState, GAME_SERVER_FINALIZER,
    },
    ports::PortAllocator,
    signal::ShutdownRx,
    watch::{split_key, Store},
    workqueue::WorkQueue,
};

const CONTROLLER: &str = "gameserver-controller";

pub struct GameServerController {
    client: kube::Client,
    servers: Store<GameServer>,
    pods: Store<Pod>,
    nodes: Store<Node>,
    queue: Arc<WorkQueue>,
    ports: Arc<PortAllocator>,
    sidecar: SidecarConfig,
}

impl GameServerController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: kube::Client,
        servers: Store<GameServer>,
        pods: Store<Pod>,
        nodes: Store<Node>,
        queue: Arc<WorkQueue>,
        ports: Arc<PortAllocator>,
        sidecar: SidecarConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            servers,
            pods,
            nodes,
            queue,
            ports,
            sidecar,
        })
    }

    pub fn run(self: &Arc<Self>, workers: usize, shutdown: ShutdownRx) -> Vec<tokio::task::JoinHandle<()>> {
        let controller = Arc::clone(self);
        run_workers(Arc::clone(&self.queue), workers, shutdown, move |key| {
            let controller = Arc::clone(&controller);
            async move { controller.reconcile(&key).await }
        })
    }

    /// Dispatch on the observed state. Each handler is idempotent: replaying
    /// a sync against converged state performs no writes.
    async fn reconcile(&self, key: &str) -> Result<()> {
        let (Some(namespace), name) = split_key(key) else {
            return Ok(());
        };
        let Some(gs) = self.servers.get(&ObjectRef::new(name).within(namespace)) else {
            return Ok(());
        };
        let gs = (*gs).clone();

        if gs.is_being_deleted() {
            return self.sync_deletion(&gs).await;
        }

        let Some(state) = gs.state() else {
            return self.sync_unseeded(&gs).await;
        };

        // development servers have no Pod; the whole creation path collapses
        // into publishing the annotation-supplied address
        if gs.dev_address().is_some() && state.is_before_ready() {
            return self.sync_development(&gs).await;
        }

        match state {
            GameServerState::PortAllocation => self.sync_port_allocation(&gs).await,
            GameServerState::Creating => self.sync_creating(&gs).await,
            GameServerState::Starting => self.sync_starting(&gs).await,
            // the sidecar's Ready call moves Scheduled → RequestReady
            GameServerState::Scheduled => Ok(()),
            GameServerState::RequestReady => self.sync_request_ready(&gs).await,
            GameServerState::Reserved => self.sync_reserved(&gs).await,
            GameServerState::Shutdown => self.sync_shutdown(&gs).await,
            GameServerState::Ready
            | GameServerState::Allocated
            | GameServerState::Error
            | GameServerState::Unhealthy => Ok(()),
        }
    }

    /// A record with no seeded state: admission was bypassed. Re-apply the
    /// defaults, or park the record in `Error` if it does not validate.
    async fn sync_unseeded(&self, gs: &GameServer) -> Result<()> {
        let mut defaulted = gs.clone();
        defaulted.apply_defaults();

        let violations = defaulted.validate();
        if !violations.is_empty() {
            record(&self.client, CONTROLLER, gs, "InvalidSpec", violations.join("; ")).await;
            return self.move_to_state(gs, GameServerState::Error).await;
        }

        let api = self.api(gs);
        api.replace(&gs.name_any(), &PostParams::default(), &defaulted)
            .await?;
        let status = serde_json::json!({"status": defaulted.status});
        api.patch_status(&gs.name_any(), &PatchParams::default(), &Patch::Merge(&status))
            .await?;
        Ok(())
    }

    /// Straight to Ready on the annotation-supplied address and static
    /// ports, skipping ports, Pod and scheduling entirely.
    async fn sync_development(&self, gs: &GameServer) -> Result<()> {
        let violations = gs.validate();
        if !violations.is_empty() {
            record(&self.client, CONTROLLER, gs, "InvalidSpec", violations.join("; ")).await;
            return self.move_to_state(gs, GameServerState::Error).await;
        }

        let status = serde_json::json!({"status": {
            "state": GameServerState::Ready,
            "address": gs.dev_address().unwrap_or_default(),
            "ports": status_ports(&gs.spec.ports),
        }});
        self.api(gs)
            .patch_status(&gs.name_any(), &PatchParams::default(), &Patch::Merge(&status))
            .await?;
        Ok(())
    }

    async fn sync_port_allocation(&self, gs: &GameServer) -> Result<()> {
        let violations = gs.validate();
        if !violations.is_empty() {
            record(&self.client, CONTROLLER, gs, "InvalidSpec", violations.join("; ")).await;
            return self.move_to_state(gs, GameServerState::Error).await;
        }

        if gs.needs_port_allocation() {
            // exhaustion leaves the record in PortAllocation; the queue
            // retries with backoff as capacity frees up
            let ports = self.ports.allocate(gs)?;
            let patch = serde_json::json!({"spec": {"ports": ports}});
            self.api(gs)
                .patch(&gs.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            record(&self.client, CONTROLLER, gs, "PortAllocation", "Ports allocated".into()).await;
        }

        self.move_to_state(gs, GameServerState::Creating).await
    }

    async fn sync_creating(&self, gs: &GameServer) -> Result<()> {
        if self.pod_of(gs).is_none() {
            let pod = match build_pod(gs, &self.sidecar) {
                Ok(pod) => pod,
                Err(reason) => {
                    record(&self.client, CONTROLLER, gs, "InvalidPodSpec", reason).await;
                    return self.move_to_state(gs, GameServerState::Error).await;
                }
            };

            let pods: Api<Pod> = Api::namespaced(
                self.client.clone(),
                &gs.namespace().unwrap_or_default(),
            );
            match pods.create(&PostParams::default(), &pod).await {
                Ok(_) => {
                    record(
                        &self.client,
                        CONTROLLER,
                        gs,
                        "CreatingPod",
                        format!("Pod {} created", gs.name_any()),
                    )
                    .await;
                }
                // another worker or a stale cache got there first
                Err(kube::Error::Api(response)) if response.code == 409 => {}
                Err(kube::Error::Api(response)) if response.code == 422 => {
                    record(&self.client, CONTROLLER, gs, "InvalidPodSpec", response.message).await;
                    return self.move_to_state(gs, GameServerState::Error).await;
                }
                Err(error) => return Err(error.into()),
            }
        }

        self.move_to_state(gs, GameServerState::Starting).await
    }

    async fn sync_starting(&self, gs: &GameServer) -> Result<()> {
        let Some(pod) = self.pod_of(gs) else {
            return Err(Error::MissingPod(gs.name_any()));
        };
        let Some(node_name) = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .filter(|name| !name.is_empty())
        else {
            // not scheduled yet; the pod watch re-enqueues on update
            return Ok(());
        };

        self.apply_address(gs, &node_name, GameServerState::Scheduled)
            .await
    }

    async fn sync_request_ready(&self, gs: &GameServer) -> Result<()> {
        let populated = gs
            .status
            .as_ref()
            .is_some_and(|status| !status.address.is_empty() && !status.node_name.is_empty());
        if populated {
            return self.move_to_state(gs, GameServerState::Ready).await;
        }

        // address resolution may not have happened if the sidecar raced
        // ahead of the Scheduled step
        let Some(pod) = self.pod_of(gs) else {
            return Err(Error::MissingPod(gs.name_any()));
        };
        let Some(node_name) = pod.spec.as_ref().and_then(|spec| spec.node_name.clone()) else {
            return Err(Error::MissingPod(gs.name_any()));
        };
        self.apply_address(gs, &node_name, GameServerState::Ready)
            .await
    }

    /// Reserved servers return to Ready once their persisted deadline
    /// passes; a controller restart re-arms the timer from status.
    async fn sync_reserved(&self, gs: &GameServer) -> Result<()> {
        let Some(remaining) = gs.reservation_remaining(Utc::now()) else {
            // reservation without a deadline holds until the sidecar acts
            return Ok(());
        };

        if remaining > Duration::ZERO {
            self.queue
                .enqueue_after(crate::watch::key_of(gs), remaining);
            return Ok(());
        }

        let status = serde_json::json!({"status": {
            "state": GameServerState::Ready,
            "reservedUntil": null,
        }});
        self.api(gs)
            .patch_status(&gs.name_any(), &PatchParams::default(), &Patch::Merge(&status))
            .await?;
        record(&self.client, CONTROLLER, gs, "Ready", "Reservation expired".into()).await;
        Ok(())
    }

    async fn sync_shutdown(&self, gs: &GameServer) -> Result<()> {
        match self
            .api(gs)
            .delete(&gs.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => {
                record(&self.client, CONTROLLER, gs, "Shutdown", "Deletion started".into()).await;
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Deletion in progress: take the Pod down first, then drop the
    /// finalizer so the record can disappear.
    async fn sync_deletion(&self, gs: &GameServer) -> Result<()> {
        if gs.dev_address().is_none() {
            if let Some(pod) = self.pod_of(gs) {
                if pod.metadata.deletion_timestamp.is_none() {
                    let pods: Api<Pod> = Api::namespaced(
                        self.client.clone(),
                        &gs.namespace().unwrap_or_default(),
                    );
                    match pods.delete(&pod.name_any(), &DeleteParams::default()).await {
                        Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => {}
                        Err(error) => return Err(error.into()),
                    }
                    record(&self.client, CONTROLLER, gs, "DeletingPod", pod.name_any()).await;
                }
                // wait for the pod to go; its delete event re-enqueues us
                return Ok(());
            }
        }

        self.ports.release(gs.metadata.uid.as_deref().unwrap_or_default());

        let remaining: Vec<String> = gs
            .finalizers()
            .iter()
            .filter(|f| *f != GAME_SERVER_FINALIZER)
            .cloned()
            .collect();
        if remaining.len() != gs.finalizers().len() {
            let patch = serde_json::json!({"metadata": {"finalizers": remaining}});
            self.api(gs)
                .patch(&gs.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(())
    }

    /// Resolve the node's address, publish it with the assigned ports, and
    /// advance to `next`.
    async fn apply_address(
        &self,
        gs: &GameServer,
        node_name: &str,
        next: GameServerState,
    ) -> Result<()> {
        let Some(node) = self.nodes.get(&ObjectRef::new(node_name)) else {
            return Err(Error::MissingNode(node_name.to_owned()));
        };
        let Some(address) = address_of(&node) else {
            return Err(Error::MissingNode(node_name.to_owned()));
        };

        let status = serde_json::json!({"status": {
            "state": next,
            "address": address,
            "nodeName": node_name,
            "ports": status_ports(&gs.spec.ports),
        }});
        self.api(gs)
            .patch_status(&gs.name_any(), &PatchParams::default(), &Patch::Merge(&status))
            .await?;
        record(
            &self.client,
            CONTROLLER,
            gs,
            "Address",
            format!("Address {address} assigned on node {node_name}"),
        )
        .await;
        Ok(())
    }

    async fn move_to_state(&self, gs: &GameServer, state: GameServerState) -> Result<()> {
        let status = serde_json::json!({"status": {"state": state}});
        self.api(gs)
            .patch_status(&gs.name_any(), &PatchParams::default(), &Patch::Merge(&status))
            .await?;
        Ok(())
    }

    fn api(&self, gs: &GameServer) -> Api<GameServer> {
        Api::namespaced(self.client.clone(), &gs.namespace().unwrap_or_default())
    }

    /// The Pod backing a GameServer shares its name.
    fn pod_of(&self, gs: &GameServer) -> Option<Pod> {
        let namespace = gs.namespace()?;
        let pod = self
            .pods
            .get(&ObjectRef::new(&gs.name_any()).within(&namespace))?;
        is_game_server_pod(&pod, gs).then(|| (*pod).clone())
    }
}

/// Whether `pod` is controlled by `gs`, guarding against unrelated pods
/// that happen to share the name.
fn is_game_server_pod(pod: &Pod, gs: &GameServer) -> bool {
    pod.metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|owner| {
            owner.controller == Some(true)
                && owner.kind == "GameServer"
                && Some(owner.uid.as_str()) == gs.metadata.uid.as_deref()
        })
}

/// Status ports mirror the assigned spec ports.
fn status_ports(ports: &[GameServerPort]) -> Vec<GameServerStatusPort> {
    ports
        .iter()
        .filter_map(|port| {
            port.host_port.map(|host_port| GameServerStatusPort {
                name: port.name.clone(),
                port: host_port,
            })
        })
        .collect()
}

/// External IP when the node has one, internal otherwise.
fn address_of(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_deref()?;
    addresses
        .iter()
        .find(|address| address.type_ == "ExternalIP")
        .or_else(|| addresses.iter().find(|address| address.type_ == "InternalIP"))
        .map(|address| address.address.clone())
}
