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

//! Host-port assignment for GameServers with a `Dynamic` or `Passthrough`
//! port policy, drawn from the configured `[min, max]` range such that no two
//! non-terminal GameServers on the same node share a `(port, protocol)`.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::crd::{
    game_server::{GameServerPort, PortPolicy},
    GameServer, Protocol, SchedulingStrategy,
};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no ports available in range {min}-{max}")]
pub struct NoPortsAvailable {
    pub min: u16,
    pub max: u16,
}

#[derive(Clone, Debug)]
struct Assignment {
    gs_uid: String,
    set: Option<String>,
    protocol: Protocol,
    port: u16,
}

#[derive(Default)]
struct Table {
    /// node name → assignments on that node. BTreeMap keeps node scans
    /// deterministic.
    nodes: BTreeMap<String, Vec<Assignment>>,
}

impl Table {
    fn is_free(&self, node: &str, port: u16, protocol: Protocol) -> bool {
        self.nodes
            .get(node)
            .map(|row| {
                !row.iter()
                    .any(|a| a.port == port && protocols_conflict(a.protocol, protocol))
            })
            .unwrap_or(false)
    }
}

/// `TCPUDP` occupies the port for both protocols.
fn protocols_conflict(a: Protocol, b: Protocol) -> bool {
    a == b || a == Protocol::UdpTcp || b == Protocol::UdpTcp
}

pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    table: Mutex<Table>,
}

impl PortAllocator {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            min_port,
            max_port,
            table: Mutex::new(Table::default()),
        }
    }

    /// Rebuild the table from the current cluster state: one row per node,
    /// with every port held by a non-terminal GameServer replayed into it.
    /// Run once on leader-lease acquisition, before any controller worker.
    pub fn sync<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a str>,
        servers: impl IntoIterator<Item = &'a GameServer>,
    ) {
        let mut table = Table::default();
        for node in nodes {
            table.nodes.entry(node.to_owned()).or_default();
        }

        for gs in servers {
            if gs.is_being_deleted() || gs.state().is_some_and(|s| s.is_terminal()) {
                continue;
            }
            let node_hint = gs
                .status
                .as_ref()
                .map(|status| status.node_name.as_str())
                .filter(|name| !name.is_empty());

            for port in &gs.spec.ports {
                let (Some(host_port), PortPolicy::Dynamic | PortPolicy::Passthrough) =
                    (port.host_port, port.port_policy)
                else {
                    continue;
                };

                // Scheduled servers replay onto their node; pending ones onto
                // the first node still free for that port.
                let node = node_hint
                    .filter(|name| table.nodes.contains_key(*name))
                    .map(str::to_owned)
                    .or_else(|| {
                        table
                            .nodes
                            .keys()
                            .find(|n| table.is_free(n, host_port, port.protocol))
                            .cloned()
                    });

                if let Some(node) = node {
                    table.nodes.entry(node).or_default().push(Assignment {
                        gs_uid: uid_of(gs),
                        set: gs.owning_set().map(str::to_owned),
                        protocol: port.protocol,
                        port: host_port,
                    });
                }
            }
        }

        *self.table.lock() = table;
    }

    pub fn node_added(&self, name: &str) {
        self.table.lock().nodes.entry(name.to_owned()).or_default();
    }

    /// Drop a node's row. Returns the UIDs of GameServers whose assignments
    /// referred to it so they can be re-reconciled.
    pub fn node_removed(&self, name: &str) -> Vec<String> {
        let mut table = self.table.lock();
        let Some(row) = table.nodes.remove(name) else {
            return vec![];
        };
        let mut uids: Vec<String> = row.into_iter().map(|a| a.gs_uid).collect();
        uids.sort();
        uids.dedup();
        uids
    }

    /// Assign a host port for every spec port that needs one, and return the
    /// updated port list. All-or-nothing: on exhaustion no assignment is
    /// recorded.
    pub fn allocate(&self, gs: &GameServer) -> Result<Vec<GameServerPort>, NoPortsAvailable> {
        let uid = uid_of(gs);
        let set = gs.owning_set().map(str::to_owned);
        let mut ports = gs.spec.ports.clone();

        let mut table = self.table.lock();
        let node_order = self.node_order(&table, gs.spec.scheduling, set.as_deref());

        for port in ports.iter_mut().filter(|p| p.needs_host_port()) {
            let mut chosen = None;
            'nodes: for node in &node_order {
                for candidate in self.min_port..=self.max_port {
                    if table.is_free(node, candidate, port.protocol) {
                        chosen = Some((node.clone(), candidate));
                        break 'nodes;
                    }
                }
            }

            let Some((node, host_port)) = chosen else {
                table
                    .nodes
                    .values_mut()
                    .for_each(|row| row.retain(|a| a.gs_uid != uid));
                return Err(NoPortsAvailable {
                    min: self.min_port,
                    max: self.max_port,
                });
            };

            table.nodes.entry(node).or_default().push(Assignment {
                gs_uid: uid.clone(),
                set: set.clone(),
                protocol: port.protocol,
                port: host_port,
            });

            port.host_port = Some(host_port);
            if port.port_policy == PortPolicy::Passthrough {
                port.container_port = Some(host_port);
            }
        }

        Ok(ports)
    }

    /// Clear all assignments held by a GameServer. Idempotent.
    pub fn release(&self, gs_uid: &str) {
        self.table
            .lock()
            .nodes
            .values_mut()
            .for_each(|row| row.retain(|a| a.gs_uid != gs_uid));
    }

    /// Node scan order: Packed prefers nodes already holding an assignment
    /// from the same GameServerSet so sessions concentrate; Distributed
    /// shuffles.
    fn node_order(
        &self,
        table: &Table,
        scheduling: SchedulingStrategy,
        set: Option<&str>,
    ) -> Vec<String> {
        let mut nodes: Vec<String> = table.nodes.keys().cloned().collect();
        match scheduling {
            SchedulingStrategy::Packed => {
                if let Some(set) = set {
                    nodes.sort_by_key(|node| {
                        let same_set = table.nodes[node]
                            .iter()
                            .any(|a| a.set.as_deref() == Some(set));
                        (!same_set, node.clone())
                    });
                }
            }
            SchedulingStrategy::Distributed => nodes.shuffle(&mut rand::thread_rng()),
        }
        nodes
    }
}

fn uid_of(gs: &GameServer) -> String {
    gs.metadata
        .uid
        .clone()
        .or_else(|| gs.metadata.name.clone())
        .unwrap_or_default()
}
