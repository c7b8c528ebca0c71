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

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, ResourceExt,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use super::{cache::ReadyServerCache, find, multicluster};
use crate::{
    crd::{
        allocation::GameServerAllocationStatus, GameServer, GameServerAllocation,
        GameServerAllocationPolicy, GameServerState,
    },
    metrics,
    nodes::NodeCounter,
    signal::ShutdownRx,
    watch::{key_of, Store},
};

#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Size of the update-worker pool performing the store writes.
    pub workers: usize,
    /// Bound of the request channel feeding the dispatcher.
    pub queue_capacity: usize,
    /// Per-request deadline; conflicts retry through the dispatcher until it
    /// elapses, after which the request resolves to `Contention`.
    pub request_timeout: Duration,
    /// When above 1, sample uniformly from the best N required matches to
    /// spread contention under concurrent bursts.
    pub top_n: usize,
    /// Cluster name under which multi-cluster policies address this cluster.
    pub local_cluster_name: Option<String>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1024,
            request_timeout: Duration::from_secs(10),
            top_n: 1,
            local_cluster_name: None,
        }
    }
}

struct PendingRequest {
    gsa: GameServerAllocation,
    deadline: Instant,
    reply: oneshot::Sender<Outcome>,
}

enum Outcome {
    /// The store write was acknowledged; the boxed allocation carries the
    /// success status.
    Allocated(Box<GameServerAllocation>),
    NoneReady,
    /// The claim lost an optimistic-concurrency race, or ran out of
    /// deadline. The server has been restored to the cache.
    Conflict,
}

/// The allocation engine. Requests enter through [`Allocator::allocate`],
/// flow through the single dispatcher for serial selection, and are
/// committed by the update-worker pool.
pub struct Allocator {
    client: kube::Client,
    cache: Arc<ReadyServerCache>,
    policies: Store<GameServerAllocationPolicy>,
    tx: mpsc::Sender<PendingRequest>,
    config: AllocatorConfig,
}

impl Allocator {
    pub fn spawn(
        client: kube::Client,
        cache: Arc<ReadyServerCache>,
        counter: Arc<NodeCounter>,
        policies: Store<GameServerAllocationPolicy>,
        config: AllocatorConfig,
        shutdown: ShutdownRx,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (work_tx, work_rx) = mpsc::channel(config.workers * 2);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        tokio::spawn(dispatcher(
            Arc::clone(&cache),
            counter,
            rx,
            work_tx,
            config.top_n,
            shutdown,
        ));
        for _ in 0..config.workers {
            tokio::spawn(update_worker(
                client.clone(),
                Arc::clone(&cache),
                Arc::clone(&work_rx),
            ));
        }

        Arc::new(Self {
            client,
            cache,
            policies,
            tx,
            config,
        })
    }

    /// Resolve an allocation request, either locally or forwarded to a peer
    /// cluster per its multi-cluster setting. `Err` is reserved for routing
    /// failures; logical outcomes land in the returned status.
    pub async fn allocate(
        &self,
        gsa: GameServerAllocation,
    ) -> crate::Result<GameServerAllocation> {
        if gsa.spec.multi_cluster_setting.enabled {
            self.allocate_multicluster(gsa).await
        } else {
            Ok(self.allocate_local(gsa).await)
        }
    }

    async fn allocate_local(&self, mut gsa: GameServerAllocation) -> GameServerAllocation {
        let started = Instant::now();
        let deadline = started + self.config.request_timeout;

        let outcome = loop {
            let (reply, rx) = oneshot::channel();
            let request = PendingRequest {
                gsa: gsa.clone(),
                deadline,
                reply,
            };
            if self.tx.send(request).await.is_err() {
                break Outcome::Conflict;
            }
            match rx.await {
                Ok(Outcome::Conflict) if Instant::now() < deadline => continue,
                Ok(outcome) => break outcome,
                Err(_) => break Outcome::Conflict,
            }
        };

        metrics::allocation_duration().observe(started.elapsed().as_secs_f64());
        match outcome {
            Outcome::Allocated(result) => {
                metrics::allocations_total().with_label_values(&["Allocated"]).inc();
                *result
            }
            Outcome::NoneReady => {
                metrics::allocations_total().with_label_values(&["UnAllocated"]).inc();
                gsa.status = Some(GameServerAllocationStatus::unallocated());
                gsa
            }
            Outcome::Conflict => {
                metrics::allocations_total().with_label_values(&["Contention"]).inc();
                gsa.status = Some(GameServerAllocationStatus::contention());
                gsa
            }
        }
    }

    async fn allocate_multicluster(
        &self,
        gsa: GameServerAllocation,
    ) -> crate::Result<GameServerAllocation> {
        let selector = &gsa.spec.multi_cluster_setting.policy_selector;
        let policies: Vec<GameServerAllocationPolicy> = self
            .policies
            .state()
            .into_iter()
            .filter(|policy| policy.metadata.namespace == gsa.metadata.namespace)
            .filter(|policy| find::selector_matches(selector, policy.metadata.labels.as_ref()))
            .map(|policy| (*policy).clone())
            .collect();

        let Some(policy) = multicluster::choose_policy(&policies) else {
            return Err(eyre::eyre!(
                "no GameServerAllocationPolicy matched the policy selector"
            ));
        };

        let connection = &policy.spec.connection_info;
        if self.config.local_cluster_name.as_deref() == Some(connection.cluster_name.as_str()) {
            return Ok(self.allocate_local(gsa).await);
        }

        multicluster::forward(self.client.clone(), policy, gsa).await
    }
}

/// The single selection loop: drains the ready cache into a sorted slice,
/// serves requests one at a time, and removes every chosen server from the
/// slice and cache before the update worker sees it, so the next request
/// cannot pick the same server.
async fn dispatcher(
    cache: Arc<ReadyServerCache>,
    counter: Arc<NodeCounter>,
    mut rx: mpsc::Receiver<PendingRequest>,
    work_tx: mpsc::Sender<(PendingRequest, GameServer)>,
    top_n: usize,
    mut shutdown: ShutdownRx,
) {
    let mut sorted: Vec<GameServer> = vec![];
    let mut seen_generation: Option<u64> = None;

    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let generation = cache.generation();
        if seen_generation != Some(generation) {
            sorted = cache.snapshot();
            find::sort_for_packed(&mut sorted, &counter);
            seen_generation = Some(generation);
        }

        if request.deadline <= Instant::now() {
            request.reply.send(Outcome::Conflict).ok();
            continue;
        }

        match find::find_game_server_for_allocation(&request.gsa, &sorted, top_n) {
            Err(_) => {
                request.reply.send(Outcome::NoneReady).ok();
            }
            Ok(index) => {
                let gs = sorted.remove(index);
                cache.remove(&key_of(&gs));
                // our own removal bumped the generation; fold it in since the
                // local slice already reflects it
                seen_generation = Some(cache.generation());
                if work_tx.send((request, gs)).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn update_worker(
    client: kube::Client,
    cache: Arc<ReadyServerCache>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(PendingRequest, GameServer)>>>,
) {
    loop {
        let item = work_rx.lock().await.recv().await;
        let Some((request, gs)) = item else { break };

        if request.deadline <= Instant::now() {
            cache.insert(gs);
            request.reply.send(Outcome::Conflict).ok();
            continue;
        }

        match commit(&client, &gs, &request.gsa).await {
            Ok(updated) => {
                crate::controllers::record(
                    &client,
                    "gameserverallocation",
                    &updated,
                    "Allocated",
                    "Allocated to a game session".into(),
                )
                .await;
                let mut gsa = request.gsa;
                gsa.status = Some(GameServerAllocationStatus::allocated(&updated));
                request.reply.send(Outcome::Allocated(Box::new(gsa))).ok();
            }
            Err(error) => {
                tracing::debug!(
                    game_server = %key_of(&gs),
                    %error,
                    "allocation write failed, restoring server to cache"
                );
                cache.insert(gs);
                request.reply.send(Outcome::Conflict).ok();
            }
        }
    }
}

/// The store write that claims the server. The metadata replace carries the
/// cached resourceVersion, so a concurrent claim from another replica loses
/// with a conflict rather than double-allocating.
async fn commit(
    client: &kube::Client,
    gs: &GameServer,
    gsa: &GameServerAllocation,
) -> kube::Result<GameServer> {
    let namespace = gs.namespace().unwrap_or_default();
    let name = gs.name_any();
    let api: Api<GameServer> = Api::namespaced(client.clone(), &namespace);

    let mut updated = gs.clone();
    gsa.spec.meta_patch.apply(&mut updated);
    api.replace(&name, &PostParams::default(), &updated).await?;

    let status = serde_json::json!({"status": {"state": GameServerState::Allocated}});
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
        .await
}

/// `POST /apis/allocation.agones.dev/v1/namespaces/{ns}/gameserverallocations`.
pub fn spawn_server(
    allocator: Arc<Allocator>,
    addr: SocketAddr,
    mut shutdown: ShutdownRx,
) -> crate::Result<tokio::task::JoinHandle<Result<(), hyper::Error>>> {
    let make_svc = make_service_fn(move |_conn| {
        let allocator = Arc::clone(&allocator);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let allocator = Arc::clone(&allocator);
                async move { Ok::<_, Infallible>(handle_request(request, allocator).await) }
            }))
        }
    });

    let server = hyper::Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            shutdown.changed().await.ok();
        });

    tracing::info!(%addr, "allocation endpoint listening");
    Ok(tokio::spawn(server))
}

async fn handle_request(request: Request<Body>, allocator: Arc<Allocator>) -> Response<Body> {
    if request.method() != Method::POST {
        return plain_response(StatusCode::METHOD_NOT_ALLOWED, "only POST is supported");
    }

    let Some(namespace) = parse_path(request.uri().path()).map(str::to_owned) else {
        return plain_response(StatusCode::NOT_FOUND, "not found");
    };

    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(error) => {
            return plain_response(StatusCode::UNPROCESSABLE_ENTITY, &error.to_string());
        }
    };

    let mut gsa = match parse_body(&body) {
        Ok(gsa) => gsa,
        Err(message) => return plain_response(StatusCode::UNPROCESSABLE_ENTITY, &message),
    };
    gsa.metadata.namespace = Some(namespace);

    match allocator.allocate(gsa).await {
        Ok(result) => {
            let body = serde_json::to_vec(&result).unwrap_or_default();
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        }
        Err(error) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string()),
    }
}

fn parse_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/apis/allocation.agones.dev/v1/namespaces/")?;
    let (namespace, tail) = rest.split_once('/')?;
    (tail == "gameserverallocations" && !namespace.is_empty()).then_some(namespace)
}

fn parse_body(body: &[u8]) -> Result<GameServerAllocation, String> {
    let mut value: serde_json::Value =
        serde_json::from_slice(body).map_err(|error| error.to_string())?;
    // clients commonly omit metadata entirely; treat it as empty
    if let Some(object) = value.as_object_mut() {
        object
            .entry("metadata")
            .or_insert_with(|| serde_json::json!({}));
    }
    let gsa: GameServerAllocation =
        serde_json::from_value(value).map_err(|error| error.to_string())?;
    let violations = gsa.validate();
    if violations.is_empty() {
        Ok(gsa)
    } else {
        Err(violations.join("; "))
    }
}

fn plain_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_owned()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        allocation::GameServerAllocationSpec,
        game_server::{GameServerState, GameServerStatus},
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    #[test]
    fn path_parsing() {
        assert_eq!(
            parse_path("/apis/allocation.agones.dev/v1/namespaces/default/gameserverallocations"),
            Some("default")
        );
        assert_eq!(parse_path("/apis/allocation.agones.dev/v1/namespaces//gameserverallocations"), None);
        assert_eq!(parse_path("/apis/allocation.agones.dev/v1/namespaces/default/other"), None);
        assert_eq!(parse_path("/healthz"), None);
    }

    #[test]
    fn body_parsing_rejects_invalid_payloads() {
        assert!(parse_body(b"not json").is_err());

        let invalid_patch = serde_json::json!({
            "spec": {"metadata": {"labels": {"-bad-": "x"}}}
        });
        assert!(parse_body(&serde_json::to_vec(&invalid_patch).unwrap()).is_err());

        let valid = serde_json::json!({"spec": {}});
        assert!(parse_body(&serde_json::to_vec(&valid).unwrap()).is_ok());
    }

    fn ready(name: &str) -> GameServer {
        let mut gs = GameServer::new(name, Default::default());
        gs.metadata.namespace = Some("default".into());
        gs.metadata.labels = Some([("fleet".to_owned(), "simple".to_owned())].into());
        gs.status = Some(GameServerStatus {
            state: Some(GameServerState::Ready),
            node_name: "node-a".into(),
            address: "10.0.0.1".into(),
            ..Default::default()
        });
        gs
    }

    fn allocation_request() -> GameServerAllocation {
        let mut gsa = GameServerAllocation::new(
            "",
            GameServerAllocationSpec {
                required: LabelSelector {
                    match_labels: Some([("fleet".to_owned(), "simple".to_owned())].into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        gsa.metadata.namespace = Some("default".into());
        gsa
    }

    /// No pair of concurrent requests may be handed the same server: the
    /// dispatcher removes a chosen server from cache and slice before the
    /// next request is served.
    #[tokio::test]
    async fn dispatcher_never_hands_out_a_server_twice() {
        let cache = Arc::new(ReadyServerCache::new());
        cache.insert(ready("gs1"));
        cache.insert(ready("gs2"));

        let (tx, rx) = mpsc::channel(16);
        let (work_tx, mut work_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) =
            crate::signal::channel(crate::signal::ShutdownKind::Testing);
        tokio::spawn(dispatcher(
            Arc::clone(&cache),
            Arc::new(NodeCounter::new()),
            rx,
            work_tx,
            1,
            shutdown_rx,
        ));

        let deadline = Instant::now() + Duration::from_secs(30);
        let mut replies = vec![];
        for _ in 0..3 {
            let (reply, reply_rx) = oneshot::channel();
            tx.send(PendingRequest {
                gsa: allocation_request(),
                deadline,
                reply,
            })
            .await
            .unwrap();
            replies.push(reply_rx);
        }

        let (_, first) = work_rx.recv().await.unwrap();
        let (_, second) = work_rx.recv().await.unwrap();
        assert_ne!(first.metadata.name, second.metadata.name);
        assert!(cache.is_empty());

        // the third request finds the cache drained
        match replies.pop().unwrap().await.unwrap() {
            Outcome::NoneReady => {}
            Outcome::Allocated(_) | Outcome::Conflict => {
                panic!("expected NoneReady for the third request")
            }
        }
    }

    #[tokio::test]
    async fn dispatcher_fails_expired_requests_without_selection() {
        let cache = Arc::new(ReadyServerCache::new());
        cache.insert(ready("gs1"));

        let (tx, rx) = mpsc::channel(16);
        let (work_tx, _work_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) =
            crate::signal::channel(crate::signal::ShutdownKind::Testing);
        tokio::spawn(dispatcher(
            Arc::clone(&cache),
            Arc::new(NodeCounter::new()),
            rx,
            work_tx,
            1,
            shutdown_rx,
        ));

        let (reply, reply_rx) = oneshot::channel();
        tx.send(PendingRequest {
            gsa: allocation_request(),
            deadline: Instant::now() - Duration::from_millis(1),
            reply,
        })
        .await
        .unwrap();

        match reply_rx.await.unwrap() {
            Outcome::Conflict => {}
            Outcome::Allocated(_) | Outcome::NoneReady => panic!("expected Conflict"),
        }
        // the server was never claimed
        assert_eq!(cache.len(), 1);
    }
}
