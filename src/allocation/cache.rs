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

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    crd::{GameServer, GameServerState},
    watch::{key_of, Event},
};

/// Servers currently eligible for allocation: in state `Ready`, with no
/// deletion timestamp. Fed from the GameServer watch; the generation counter
/// lets the dispatcher refresh its sorted slice only when something changed.
#[derive(Default)]
pub struct ReadyServerCache {
    servers: DashMap<String, GameServer>,
    generation: AtomicU64,
    /// Relist buffer: `InitApply` events accumulate here and replace the
    /// live map atomically on `InitDone`.
    relist: Mutex<Option<Vec<GameServer>>>,
}

fn is_eligible(gs: &GameServer) -> bool {
    gs.state() == Some(GameServerState::Ready) && !gs.is_being_deleted()
}

impl ReadyServerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a watch event.
    pub fn track(&self, event: &Event<GameServer>) {
        match event {
            Event::Apply(gs) => {
                if is_eligible(gs) {
                    self.insert(gs.clone());
                } else {
                    self.remove(&key_of(gs));
                }
            }
            Event::Delete(gs) => {
                self.remove(&key_of(gs));
            }
            Event::Init => {
                *self.relist.lock() = Some(vec![]);
            }
            Event::InitApply(gs) => {
                if is_eligible(gs) {
                    if let Some(pending) = self.relist.lock().as_mut() {
                        pending.push(gs.clone());
                    }
                }
            }
            Event::InitDone => {
                if let Some(pending) = self.relist.lock().take() {
                    self.servers.clear();
                    for gs in pending {
                        self.servers.insert(key_of(&gs), gs);
                    }
                    self.generation.fetch_add(1, Ordering::Release);
                }
            }
        }
    }

    /// Restore a server the update workers failed to allocate.
    pub fn insert(&self, gs: GameServer) {
        self.servers.insert(key_of(&gs), gs);
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Claim a server out of the cache. Happens-before the store write that
    /// marks it Allocated.
    pub fn remove(&self, key: &str) -> Option<GameServer> {
        let removed = self.servers.remove(key).map(|(_, gs)| gs);
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::Release);
        }
        removed
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<GameServer> {
        self.servers.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::game_server::GameServerStatus;

    fn game_server(name: &str, state: GameServerState) -> GameServer {
        let mut gs = GameServer::new(name, Default::default());
        gs.metadata.namespace = Some("default".into());
        gs.status = Some(GameServerStatus {
            state: Some(state),
            ..Default::default()
        });
        gs
    }

    #[test]
    fn retains_only_ready_servers() {
        let cache = ReadyServerCache::new();
        cache.track(&Event::Apply(game_server("gs1", GameServerState::Ready)));
        cache.track(&Event::Apply(game_server("gs2", GameServerState::Allocated)));
        assert_eq!(cache.len(), 1);

        // a Ready server leaving Ready falls out of the cache
        cache.track(&Event::Apply(game_server("gs1", GameServerState::Shutdown)));
        assert!(cache.is_empty());
    }

    #[test]
    fn deleting_servers_are_not_eligible() {
        let cache = ReadyServerCache::new();
        let mut gs = game_server("gs1", GameServerState::Ready);
        gs.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        cache.track(&Event::Apply(gs));
        assert!(cache.is_empty());
    }

    #[test]
    fn generation_tracks_changes() {
        let cache = ReadyServerCache::new();
        let generation = cache.generation();
        cache.track(&Event::Apply(game_server("gs1", GameServerState::Ready)));
        assert!(cache.generation() > generation);

        // removing a missing key is not a change
        let generation = cache.generation();
        cache.remove("default/other");
        assert_eq!(cache.generation(), generation);
    }

    #[test]
    fn relist_replaces_contents() {
        let cache = ReadyServerCache::new();
        cache.track(&Event::Apply(game_server("stale", GameServerState::Ready)));

        cache.track(&Event::Init);
        cache.track(&Event::InitApply(game_server("gs1", GameServerState::Ready)));
        cache.track(&Event::InitApply(game_server("gs2", GameServerState::Creating)));
        cache.track(&Event::InitDone);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].metadata.name.as_deref(), Some("gs1"));
    }
}
