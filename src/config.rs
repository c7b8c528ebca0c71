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

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{allocation::AllocatorConfig, controllers::SidecarConfig};

/// Runtime configuration assembled from the command line.
#[derive(Clone, Debug)]
pub struct Config {
    pub sidecar: SidecarConfig,
    /// Host-port range for Dynamic and Passthrough port policies.
    pub min_port: u16,
    pub max_port: u16,
    /// Directory holding `tls.crt` / `tls.key` for the admission webhook.
    pub cert_dir: PathBuf,
    pub allocation_addr: SocketAddr,
    pub webhook_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    /// FleetAutoscaler sync cadence.
    pub autoscaler_resync: Duration,
    /// Worker count for the GameServer controller; the Fleet and set
    /// controllers run a single worker per queue.
    pub game_server_workers: usize,
    pub allocation: AllocatorConfig,
    /// Namespace holding the leader-election lease.
    pub namespace: String,
    /// Identity recorded in the lease.
    pub identity: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(format!(
                "invalid port range {}-{}",
                self.min_port, self.max_port
            ));
        }
        if self.game_server_workers == 0 {
            return Err("gameserver workers must be at least 1".to_owned());
        }
        if self.allocation.workers == 0 {
            return Err("allocation workers must be at least 1".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            sidecar: SidecarConfig {
                image: "sdk:latest".into(),
                cpu_request: "30m".into(),
                cpu_limit: "500m".into(),
                always_pull: false,
            },
            min_port: 7000,
            max_port: 8000,
            cert_dir: "/certs".into(),
            allocation_addr: "0.0.0.0:8443".parse().unwrap(),
            webhook_addr: "0.0.0.0:8081".parse().unwrap(),
            admin_addr: "0.0.0.0:8080".parse().unwrap(),
            autoscaler_resync: Duration::from_secs(30),
            game_server_workers: 8,
            allocation: AllocatorConfig::default(),
            namespace: "garrison-system".into(),
            identity: "garrison-1".into(),
        }
    }

    #[test]
    fn port_range_must_be_ordered() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.min_port = 9000;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.min_port = 0;
        assert!(bad.validate().is_err());
    }
}
