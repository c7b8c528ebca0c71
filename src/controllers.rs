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

//! The control loops: each reconciles declared intent against observed
//! cluster state, driven by a rate-limited work queue fed from watch events.

pub mod autoscaler;
pub mod fleet;
pub mod game_server;
pub mod game_server_set;
pub mod health;
pub mod pod;

pub use self::{
    autoscaler::FleetAutoscalerController, fleet::FleetController,
    game_server::GameServerController, game_server_set::GameServerSetController,
    health::HealthController, pod::SidecarConfig,
};

use std::sync::Arc;

use kube::Resource;

use crate::{metrics, signal::ShutdownRx, workqueue::WorkQueue};

/// Reconcile failure. Transient store errors requeue with backoff and are
/// never surfaced to the user; the rest are visible through events and
/// object status.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store request failed: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    NoPortsAvailable(#[from] crate::ports::NoPortsAvailable),
    #[error("pod for GameServer {0} not observed yet")]
    MissingPod(String),
    #[error("node {0} not observed yet, or has no address")]
    MissingNode(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Run `workers` reconcile loops over `queue` until shutdown. Failed keys
/// are retried with the queue's backoff.
pub(crate) fn run_workers<F, Fut>(
    queue: Arc<WorkQueue>,
    workers: usize,
    shutdown: ShutdownRx,
    reconcile: F,
) -> Vec<tokio::task::JoinHandle<()>>
where
    F: Fn(String) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    (0..workers.max(1))
        .map(|_| {
            let queue = Arc::clone(&queue);
            let reconcile = reconcile.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let key = tokio::select! {
                        _ = shutdown.changed() => break,
                        key = queue.next() => match key {
                            Some(key) => key,
                            None => break,
                        },
                    };
                    match reconcile(key.clone()).await {
                        Ok(()) => {
                            metrics::reconciles_total()
                                .with_label_values(&[queue.name(), "ok"])
                                .inc();
                            queue.done(&key);
                        }
                        Err(error) => {
                            metrics::reconciles_total()
                                .with_label_values(&[queue.name(), "error"])
                                .inc();
                            tracing::warn!(queue = queue.name(), %key, %error, "reconcile failed");
                            queue.retry(key);
                        }
                    }
                }
            })
        })
        .collect()
}

/// Emit a Kubernetes Event for a notable transition. Failures are logged,
/// never propagated: events are best-effort.
pub(crate) async fn record<K>(
    client: &kube::Client,
    controller: &str,
    object: &K,
    reason: &str,
    note: String,
) where
    K: Resource<DynamicType = ()>,
{
    use kube::runtime::events::{Event, EventType, Recorder, Reporter};

    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: controller.into(),
            instance: None,
        },
        object.object_ref(&()),
    );
    let event = Event {
        type_: EventType::Normal,
        reason: reason.into(),
        note: Some(note),
        action: reason.into(),
        secondary: None,
    };
    if let Err(error) = recorder.publish(event).await {
        tracing::debug!(%error, reason, "failed to publish event");
    }
}
