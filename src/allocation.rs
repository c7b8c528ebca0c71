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

//! The latency-sensitive allocation path: an HTTP request claims a Ready
//! GameServer and transitions it to Allocated under at-most-once semantics.
//!
//! The local pipeline is a producer (HTTP handler) → bounded channel →
//! single dispatcher → update-worker pool → response channel topology. The
//! dispatcher is the only task that removes servers from the ready cache, so
//! selection is serial and no two requests can claim the same server.

mod cache;
mod find;
mod multicluster;
mod service;

pub use self::{
    cache::ReadyServerCache,
    find::{find_game_server_for_allocation, selector_matches, sort_for_packed, NoGameServerReady},
    multicluster::{choose_policy, client_from_secret},
    service::{spawn_server, Allocator, AllocatorConfig},
};
