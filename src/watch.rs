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

//! Watch-stream plumbing shared by every controller: one reflector per
//! resource kind keeps an informer cache warm, while registered handlers
//! fan events out to work queues and in-memory indexes.

use std::{fmt::Debug, sync::Arc};

use futures::TryStreamExt;
use kube::{
    runtime::{reflector, watcher, WatchStreamExt},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;

use crate::{signal::ShutdownRx, workqueue::WorkQueue};

pub use kube::runtime::{reflector::Store, watcher::Event};

/// Callbacks invoked for every watch event, after the reflector store has
/// absorbed it.
pub type EventHandler<K> = Box<dyn Fn(&Event<K>) + Send + Sync>;

/// Cache key for work queues and store lookups.
pub fn key_of<K: Resource>(object: &K) -> String {
    match object.namespace() {
        Some(namespace) => format!("{namespace}/{}", object.name_any()),
        None => object.name_any(),
    }
}

pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, key),
    }
}

/// An event handler that enqueues the object's own key.
pub fn enqueue<K: Resource>(queue: Arc<WorkQueue>) -> EventHandler<K> {
    enqueue_mapped(queue, |object: &K| Some(key_of(object)))
}

/// An event handler that enqueues a key derived from the object, e.g. the
/// key of its controlling owner. Returning `None` skips the event.
pub fn enqueue_mapped<K, F>(queue: Arc<WorkQueue>, map: F) -> EventHandler<K>
where
    K: Resource,
    F: Fn(&K) -> Option<String> + Send + Sync + 'static,
{
    Box::new(move |event| {
        let object = match event {
            Event::Apply(object) | Event::InitApply(object) | Event::Delete(object) => object,
            Event::Init | Event::InitDone => return,
        };
        if let Some(key) = map(object) {
            queue.enqueue(key);
        }
    })
}

/// Drive a watch for `api` into `writer`'s store, invoking `handlers` for
/// every event until shutdown. The stream retries internally with backoff;
/// individual watch errors are logged and never fatal.
pub fn spawn<K>(
    kind: &'static str,
    api: Api<K>,
    writer: reflector::store::Writer<K>,
    config: watcher::Config,
    mut shutdown: ShutdownRx,
    handlers: Vec<EventHandler<K>>,
) -> tokio::task::JoinHandle<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let stream = reflector(writer, watcher(api, config).default_backoff());
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = stream.try_next() => match event {
                    Ok(Some(event)) => {
                        for handler in &handlers {
                            handler(&event);
                        }
                    }
                    Ok(None) => {
                        tracing::error!(kind, "watch stream terminated");
                        break;
                    }
                    Err(error) => {
                        tracing::warn!(kind, %error, "watch error, stream will retry");
                    }
                },
            }
        }
        tracing::debug!(kind, "watch stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::GameServer;

    #[tokio::test]
    async fn mapped_enqueue_routes_events() {
        let queue = WorkQueue::new("test");
        let handler = enqueue::<GameServer>(Arc::clone(&queue));

        let mut gs = GameServer::new("gs1", Default::default());
        gs.metadata.namespace = Some("default".into());

        handler(&Event::Apply(gs.clone()));
        handler(&Event::Init);
        handler(&Event::Delete(gs));

        // the Delete coalesced with the queued Apply
        assert_eq!(queue.next().await.as_deref(), Some("default/gs1"));
        queue.done("default/gs1");
        queue.close();
        assert_eq!(queue.next().await, None);
    }

    #[test]
    fn key_round_trip() {
        assert_eq!(split_key("default/gs1"), (Some("default"), "gs1"));
        assert_eq!(split_key("node-a"), (None, "node-a"));
    }
}
