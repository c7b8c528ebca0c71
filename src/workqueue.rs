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

//! A keyed work queue with the reconcile-loop guarantees the controllers
//! rely on: a key is processed by at most one worker at a time, enqueues
//! arriving during processing coalesce into a single follow-up, and failed
//! keys are retried with exponential backoff.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys that need (another) reconcile, including ones observed while
    /// their key was processing.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    closed: bool,
}

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enqueue(&self, key: String) {
        let mut state = self.state.lock();
        if state.closed || !state.dirty.insert(key.clone()) {
            return;
        }
        // a key mid-reconcile is re-queued when the worker finishes
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            self.notify.notify_one();
        }
    }

    pub fn enqueue_after(self: &Arc<Self>, key: String, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Next key to reconcile; `None` once the queue is shut down.
    pub async fn next(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a reconcile as finished successfully; re-queues the key if it
    /// went dirty while processing.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        state.failures.remove(key);
        if state.dirty.contains(key) && !state.closed {
            state.queue.push_back(key.to_owned());
            self.notify.notify_one();
        }
    }

    /// Mark a reconcile as failed; the key comes back after an exponential,
    /// capped backoff.
    pub fn retry(self: &Arc<Self>, key: String) {
        let delay = {
            let mut state = self.state.lock();
            state.processing.remove(&key);
            state.dirty.remove(&key);
            let attempts = state.failures.entry(key.clone()).or_insert(0);
            *attempts += 1;
            backoff(*attempts)
        };
        tracing::debug!(queue = self.name, %key, ?delay, "requeueing after failure");
        self.enqueue_after(key, delay);
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}

fn backoff(attempts: u32) -> Duration {
    BASE_DELAY
        .saturating_mul(1u32 << (attempts - 1).min(16))
        .min(MAX_DELAY)
}
