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

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{runtime::reflector::store::Writer, runtime::watcher, Api, ResourceExt};

use crate::{
    admin, admission,
    allocation::{self, Allocator, AllocatorConfig, ReadyServerCache},
    config::Config,
    controllers::{
        FleetAutoscalerController, FleetController, GameServerController,
        GameServerSetController, HealthController, SidecarConfig,
    },
    crd::{
        Fleet, FleetAutoscaler, GameServer, GameServerAllocationPolicy, GameServerSet,
        FLEET_NAME_LABEL, GAME_SERVER_POD_LABEL, GAME_SERVER_ROLE, ROLE_LABEL,
    },
    leader,
    nodes::NodeCounter,
    ports::PortAllocator,
    signal::{self, ShutdownRx},
    watch::{self, key_of, Event, Store},
    workqueue::WorkQueue,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(clap::Parser)]
#[clap(version, about = "Control plane for fleets of dedicated game servers on Kubernetes")]
pub struct Cli {
    #[clap(
        long,
        env = "KUBECONFIG",
        help = "Path to a kubeconfig file. In-cluster configuration is used when omitted."
    )]
    pub kubeconfig: Option<PathBuf>,
    #[clap(
        long,
        env,
        default_value = "us-docker.pkg.dev/garrison-images/release/sdk-server:0.4",
        help = "Image of the SDK sidecar injected next to every game server container."
    )]
    pub sidecar_image: String,
    #[clap(long, env, default_value = "30m")]
    pub sidecar_cpu_request: String,
    #[clap(long, env, default_value = "500m")]
    pub sidecar_cpu_limit: String,
    #[clap(long, env, help = "Always pull the sidecar image.")]
    pub always_pull_sidecar: bool,
    #[clap(
        long,
        env,
        default_value_t = 7000,
        help = "Low end of the host port range for Dynamic and Passthrough ports."
    )]
    pub min_port: u16,
    #[clap(long, env, default_value_t = 8000)]
    pub max_port: u16,
    #[clap(
        long,
        env,
        help = "Port range as MIN-MAX; shorthand for --min-port and --max-port."
    )]
    pub port_range: Option<String>,
    #[clap(
        long,
        env,
        default_value = "/certs",
        help = "Directory holding tls.crt and tls.key for the admission webhook."
    )]
    pub cert_dir: PathBuf,
    #[clap(long, env, default_value_t = 8443)]
    pub allocation_port: u16,
    #[clap(long, env, default_value_t = 8081)]
    pub webhook_port: u16,
    #[clap(long, env, default_value_t = 8080)]
    pub admin_port: u16,
    #[clap(long, env, default_value_t = 30)]
    pub autoscaler_resync_seconds: u64,
    #[clap(long, env, default_value_t = 8)]
    pub gameserver_workers: usize,
    #[clap(long, env, default_value_t = 8)]
    pub allocation_workers: usize,
    #[clap(
        long,
        env,
        default_value_t = 1,
        help = "Sample the allocation from the best N candidates instead of always the first."
    )]
    pub allocation_top_n: usize,
    #[clap(
        long,
        env,
        help = "Name under which multi-cluster allocation policies address this cluster."
    )]
    pub cluster_name: Option<String>,
    #[clap(long, env = "POD_NAMESPACE", default_value = "garrison-system")]
    pub namespace: String,
    #[clap(short, long, env, help = "Whether to suppress log output.")]
    pub quiet: bool,
}

impl Cli {
    /// Drives the whole orchestrator lifecycle from the command line
    /// arguments: watches, servers, leader election and control loops.
    pub async fn drive(self) -> crate::Result<()> {
        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
        tracing::info!(version = VERSION, "starting garrison");

        let config = self.config().map_err(|reason| eyre::eyre!(reason))?;
        config.validate().map_err(|reason| eyre::eyre!(reason))?;
        let client = self.client().await?;
        let shutdown = signal::spawn_handler();

        Orchestrator::new(client, config).run(shutdown).await
    }

    fn config(&self) -> Result<Config, String> {
        let (min_port, max_port) = match &self.port_range {
            Some(range) => range
                .split_once('-')
                .and_then(|(min, max)| Some((min.parse().ok()?, max.parse().ok()?)))
                .ok_or_else(|| format!("invalid port range {range:?}, expected MIN-MAX"))?,
            None => (self.min_port, self.max_port),
        };

        Ok(Config {
            sidecar: SidecarConfig {
                image: self.sidecar_image.clone(),
                cpu_request: self.sidecar_cpu_request.clone(),
                cpu_limit: self.sidecar_cpu_limit.clone(),
                always_pull: self.always_pull_sidecar,
            },
            min_port,
            max_port,
            cert_dir: self.cert_dir.clone(),
            allocation_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.allocation_port)),
            webhook_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.webhook_port)),
            admin_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.admin_port)),
            autoscaler_resync: Duration::from_secs(self.autoscaler_resync_seconds),
            game_server_workers: self.gameserver_workers,
            allocation: AllocatorConfig {
                workers: self.allocation_workers,
                top_n: self.allocation_top_n.max(1),
                local_cluster_name: self.cluster_name.clone(),
                ..Default::default()
            },
            namespace: self.namespace.clone(),
            identity: std::env::var("HOSTNAME")
                .unwrap_or_else(|_| format!("garrison-{}", std::process::id())),
        })
    }

    async fn client(&self) -> crate::Result<kube::Client> {
        let config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
                kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &kube::config::KubeConfigOptions::default(),
                )
                .await?
            }
            None => kube::Config::infer().await?,
        };
        Ok(kube::Client::try_from(config)?)
    }
}

struct Stores {
    game_servers: Store<GameServer>,
    game_server_sets: Store<GameServerSet>,
    fleets: Store<Fleet>,
    autoscalers: Store<FleetAutoscaler>,
    policies: Store<GameServerAllocationPolicy>,
    pods: Store<Pod>,
    nodes: Store<Node>,
}

struct Queues {
    game_servers: Arc<WorkQueue>,
    health: Arc<WorkQueue>,
    game_server_sets: Arc<WorkQueue>,
    fleets: Arc<WorkQueue>,
    autoscalers: Arc<WorkQueue>,
}

struct Orchestrator {
    client: kube::Client,
    config: Config,
    ports: Arc<PortAllocator>,
    counter: Arc<NodeCounter>,
    cache: Arc<ReadyServerCache>,
    queues: Queues,
}

impl Orchestrator {
    fn new(client: kube::Client, config: Config) -> Self {
        Self {
            ports: Arc::new(PortAllocator::new(config.min_port, config.max_port)),
            counter: Arc::new(NodeCounter::new()),
            cache: Arc::new(ReadyServerCache::new()),
            queues: Queues {
                game_servers: WorkQueue::new("gameserver"),
                health: WorkQueue::new("health"),
                game_server_sets: WorkQueue::new("gameserverset"),
                fleets: WorkQueue::new("fleet"),
                autoscalers: WorkQueue::new("fleetautoscaler"),
            },
            client,
            config,
        }
    }

    async fn run(self, mut shutdown: ShutdownRx) -> crate::Result<()> {
        let stores = self.spawn_watches(shutdown.clone());

        // request-serving surfaces run on every replica
        let allocator = Allocator::spawn(
            self.client.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.counter),
            stores.policies.clone(),
            self.config.allocation.clone(),
            shutdown.clone(),
        );
        let _allocation_server =
            allocation::spawn_server(allocator, self.config.allocation_addr, shutdown.clone())?;
        let _webhook_server = admission::spawn(
            self.config.webhook_addr,
            &self.config.cert_dir,
            shutdown.clone(),
        )
        .await?;
        let _admin_server = admin::spawn(self.config.admin_addr, shutdown.clone())?;

        let (_leader_handle, mut leader_rx) = leader::spawn(
            self.client.clone(),
            &self.config.namespace,
            self.config.identity.clone(),
            shutdown.clone(),
        );

        // control loops run on the leader only
        let mut leading = false;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_leader = *leader_rx.borrow();
                    if is_leader && !leading {
                        leading = true;
                        self.on_lease_acquired(&stores).await;
                        self.start_controllers(&stores, shutdown.clone());
                    } else if !is_leader && leading {
                        // a lost lease means another replica may already be
                        // reconciling; restart rather than race it
                        return Err(eyre::eyre!("leader lease lost, exiting for restart"));
                    }
                }
            }
        }

        tracing::info!("shutdown complete");
        Ok(())
    }

    fn spawn_watches(&self, shutdown: ShutdownRx) -> Stores {
        let game_servers = Writer::<GameServer>::default();
        let game_server_sets = Writer::<GameServerSet>::default();
        let fleets = Writer::<Fleet>::default();
        let autoscalers = Writer::<FleetAutoscaler>::default();
        let policies = Writer::<GameServerAllocationPolicy>::default();
        let pods = Writer::<Pod>::default();
        let nodes = Writer::<Node>::default();

        let stores = Stores {
            game_servers: game_servers.as_reader(),
            game_server_sets: game_server_sets.as_reader(),
            fleets: fleets.as_reader(),
            autoscalers: autoscalers.as_reader(),
            policies: policies.as_reader(),
            pods: pods.as_reader(),
            nodes: nodes.as_reader(),
        };

        let mut watches = Vec::with_capacity(7);
        watches.push(watch::spawn(
            "GameServer",
            Api::all(self.client.clone()),
            game_servers,
            watcher::Config::default(),
            shutdown.clone(),
            vec![
                watch::enqueue(Arc::clone(&self.queues.game_servers)),
                watch::enqueue(Arc::clone(&self.queues.health)),
                watch::enqueue_mapped(Arc::clone(&self.queues.game_server_sets), |gs: &GameServer| {
                    Some(format!("{}/{}", gs.namespace()?, gs.owning_set()?))
                }),
                {
                    let cache = Arc::clone(&self.cache);
                    Box::new(move |event| cache.track(event))
                },
                {
                    let counter = Arc::clone(&self.counter);
                    Box::new(move |event| counter.observe(event))
                },
                {
                    let ports = Arc::clone(&self.ports);
                    Box::new(move |event| {
                        if let Event::Delete(gs) = event {
                            ports.release(gs.metadata.uid.as_deref().unwrap_or_default());
                        }
                    })
                },
            ],
        ));

        watches.push(watch::spawn(
            "Pod",
            Api::all(self.client.clone()),
            pods,
            watcher::Config::default().labels(&format!("{ROLE_LABEL}={GAME_SERVER_ROLE}")),
            shutdown.clone(),
            vec![
                watch::enqueue_mapped(Arc::clone(&self.queues.game_servers), owner_game_server),
                watch::enqueue_mapped(Arc::clone(&self.queues.health), owner_game_server),
            ],
        ));

        watches.push(watch::spawn(
            "GameServerSet",
            Api::all(self.client.clone()),
            game_server_sets,
            watcher::Config::default(),
            shutdown.clone(),
            vec![
                watch::enqueue(Arc::clone(&self.queues.game_server_sets)),
                watch::enqueue_mapped(Arc::clone(&self.queues.fleets), |set: &GameServerSet| {
                    let fleet = set.labels().get(FLEET_NAME_LABEL)?;
                    Some(format!("{}/{fleet}", set.namespace()?))
                }),
            ],
        ));

        watches.push(watch::spawn(
            "Fleet",
            Api::all(self.client.clone()),
            fleets,
            watcher::Config::default(),
            shutdown.clone(),
            vec![watch::enqueue(Arc::clone(&self.queues.fleets))],
        ));

        watches.push(watch::spawn(
            "FleetAutoscaler",
            Api::all(self.client.clone()),
            autoscalers,
            watcher::Config::default(),
            shutdown.clone(),
            vec![watch::enqueue(Arc::clone(&self.queues.autoscalers))],
        ));

        watches.push(watch::spawn(
            "GameServerAllocationPolicy",
            Api::all(self.client.clone()),
            policies,
            watcher::Config::default(),
            shutdown.clone(),
            vec![],
        ));

        watches.push(watch::spawn(
            "Node",
            Api::all(self.client.clone()),
            nodes,
            watcher::Config::default(),
            shutdown.clone(),
            vec![{
                let ports = Arc::clone(&self.ports);
                let counter = Arc::clone(&self.counter);
                let servers = stores.game_servers.clone();
                let queue = Arc::clone(&self.queues.game_servers);
                Box::new(move |event: &Event<Node>| match event {
                    Event::Apply(node) | Event::InitApply(node) => {
                        ports.node_added(&node.name_any());
                    }
                    Event::Delete(node) => {
                        let name = node.name_any();
                        let orphans = ports.node_removed(&name);
                        counter.node_removed(&name);
                        // anything that referred to the node needs a fresh look
                        for gs in servers.state() {
                            let uid = gs.metadata.uid.as_deref().unwrap_or_default();
                            let on_node = gs
                                .status
                                .as_ref()
                                .is_some_and(|status| status.node_name == name);
                            if on_node || orphans.iter().any(|o| o == uid) {
                                queue.enqueue(key_of(&*gs));
                            }
                        }
                    }
                    Event::Init | Event::InitDone => {}
                })
            }],
        ));
        // handles are detached; the watches exit on the shutdown signal
        drop(watches);

        stores
    }

    /// One-time global-state replay on lease acquisition: the port table is
    /// rebuilt from the observed cluster before any control loop runs.
    async fn on_lease_acquired(&self, stores: &Stores) {
        for ready in [
            stores.game_servers.wait_until_ready().await,
            stores.nodes.wait_until_ready().await,
            stores.pods.wait_until_ready().await,
            stores.game_server_sets.wait_until_ready().await,
            stores.fleets.wait_until_ready().await,
        ] {
            if ready.is_err() {
                tracing::warn!("a watch writer stopped before its first list completed");
            }
        }

        let node_names: Vec<String> = stores
            .nodes
            .state()
            .iter()
            .map(|node| node.name_any())
            .collect();
        let servers: Vec<GameServer> = stores
            .game_servers
            .state()
            .iter()
            .map(|gs| (**gs).clone())
            .collect();
        self.ports
            .sync(node_names.iter().map(String::as_str), servers.iter());
        tracing::info!(
            nodes = node_names.len(),
            game_servers = servers.len(),
            "port allocator synchronised"
        );
    }

    fn start_controllers(&self, stores: &Stores, shutdown: ShutdownRx) {
        GameServerController::new(
            self.client.clone(),
            stores.game_servers.clone(),
            stores.pods.clone(),
            stores.nodes.clone(),
            Arc::clone(&self.queues.game_servers),
            Arc::clone(&self.ports),
            self.config.sidecar.clone(),
        )
        .run(self.config.game_server_workers, shutdown.clone());

        HealthController::new(
            self.client.clone(),
            stores.game_servers.clone(),
            stores.pods.clone(),
            Arc::clone(&self.queues.health),
        )
        .run(shutdown.clone());

        GameServerSetController::new(
            self.client.clone(),
            stores.game_server_sets.clone(),
            stores.game_servers.clone(),
            Arc::clone(&self.counter),
            Arc::clone(&self.queues.game_server_sets),
        )
        .run(1, shutdown.clone());

        FleetController::new(
            self.client.clone(),
            stores.fleets.clone(),
            stores.game_server_sets.clone(),
            Arc::clone(&self.queues.fleets),
        )
        .run(1, shutdown.clone());

        FleetAutoscalerController::new(
            self.client.clone(),
            stores.autoscalers.clone(),
            stores.fleets.clone(),
            Arc::clone(&self.queues.autoscalers),
            self.config.autoscaler_resync,
        )
        .run(shutdown);
    }
}

fn owner_game_server(pod: &Pod) -> Option<String> {
    let owner = pod.labels().get(GAME_SERVER_POD_LABEL)?;
    Some(format!("{}/{owner}", pod.namespace()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn flags_have_workable_defaults() {
        let cli = Cli::parse_from(["garrison"]);
        let config = cli.config().unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_port, 7000);
        assert_eq!(config.max_port, 8000);
        assert_eq!(config.autoscaler_resync, Duration::from_secs(30));
    }

    #[test]
    fn port_range_flags_are_validated() {
        let cli = Cli::parse_from(["garrison", "--min-port", "9000", "--max-port", "8000"]);
        assert!(cli.config().unwrap().validate().is_err());
    }

    #[test]
    fn port_range_shorthand_overrides_the_pair() {
        let cli = Cli::parse_from(["garrison", "--port-range", "7100-7200"]);
        let config = cli.config().unwrap();
        assert_eq!((config.min_port, config.max_port), (7100, 7200));

        let cli = Cli::parse_from(["garrison", "--port-range", "sideways"]);
        assert!(cli.config().is_err());
    }

    #[test]
    fn pod_to_game_server_mapping_uses_the_ownership_label() {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("default".into());
        assert_eq!(owner_game_server(&pod), None);

        pod.labels_mut()
            .insert(GAME_SERVER_POD_LABEL.into(), "simple-gs".into());
        assert_eq!(owner_game_server(&pod).as_deref(), Some("default/simple-gs"));
    }
}
