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

//! Per-node counts of Ready and Allocated GameServers, fed from the
//! GameServer watch stream and consumed by scheduling decisions: the Packed
//! allocation sort key and the scale-down delete priority.

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    crd::{GameServer, GameServerState},
    watch::{key_of, Event},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub ready: u64,
    pub allocated: u64,
}

#[derive(Default)]
pub struct NodeCounter {
    counts: DashMap<String, NodeCounts>,
    /// Last counted (node, state) per server, so watch events can be turned
    /// into deltas.
    seen: DashMap<String, (String, GameServerState)>,
    relist: Mutex<Option<Vec<GameServer>>>,
}

impl NodeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a GameServer watch event.
    pub fn observe(&self, event: &Event<GameServer>) {
        match event {
            Event::Apply(gs) => self.apply(gs),
            Event::Delete(gs) => self.forget(&key_of(gs)),
            Event::Init => *self.relist.lock() = Some(vec![]),
            Event::InitApply(gs) => {
                if let Some(pending) = self.relist.lock().as_mut() {
                    pending.push(gs.clone());
                }
            }
            Event::InitDone => {
                if let Some(pending) = self.relist.lock().take() {
                    self.counts.clear();
                    self.seen.clear();
                    for gs in &pending {
                        self.apply(gs);
                    }
                }
            }
        }
    }

    pub fn counts(&self, node: &str) -> NodeCounts {
        self.counts.get(node).map(|c| *c).unwrap_or_default()
    }

    pub fn allocated(&self, node: &str) -> u64 {
        self.counts(node).allocated
    }

    pub fn node_removed(&self, node: &str) {
        self.counts.remove(node);
        self.seen.retain(|_, (seen_node, _)| seen_node.as_str() != node);
    }

    fn apply(&self, gs: &GameServer) {
        let key = key_of(gs);
        match countable(gs) {
            Some((node, state)) => {
                let previous = self.seen.insert(key, (node.to_owned(), state));
                if previous.as_ref().map(|(n, s)| (n.as_str(), *s)) == Some((node, state)) {
                    return;
                }
                if let Some((node, state)) = previous {
                    self.adjust(&node, state, -1);
                }
                self.adjust(node, state, 1);
            }
            None => self.forget(&key),
        }
    }

    fn forget(&self, key: &str) {
        if let Some((_, (node, state))) = self.seen.remove(key) {
            self.adjust(&node, state, -1);
        }
    }

    fn adjust(&self, node: &str, state: GameServerState, delta: i64) {
        let mut counts = self.counts.entry(node.to_owned()).or_default();
        let slot = match state {
            GameServerState::Ready => &mut counts.ready,
            GameServerState::Allocated => &mut counts.allocated,
            _ => return,
        };
        *slot = slot.saturating_add_signed(delta);
    }
}

fn countable(gs: &GameServer) -> Option<(&str, GameServerState)> {
    if gs.is_being_deleted() {
        return None;
    }
    let status = gs.status.as_ref()?;
    let state = status.state?;
    if !matches!(state, GameServerState::Ready | GameServerState::Allocated)
        || status.node_name.is_empty()
    {
        return None;
    }
    Some((status.node_name.as_str(), state))
}
