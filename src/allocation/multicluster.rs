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

//! Multi-cluster dispatch: pick a routing policy by priority and weight,
//! and forward the allocation request to its endpoints in order with mTLS
//! material drawn from the policy's secret.

use eyre::WrapErr;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use rand::Rng;

use crate::crd::{GameServerAllocation, GameServerAllocationPolicy};

/// Select a policy: only the best (lowest) priority group is eligible, and
/// within it the draw is weight-proportional. Equal weights degenerate to a
/// uniform pick, which is also the tie-break for identical records.
pub fn choose_policy(
    policies: &[GameServerAllocationPolicy],
) -> Option<&GameServerAllocationPolicy> {
    let best = policies.iter().map(|p| p.spec.priority).min()?;
    let group: Vec<&GameServerAllocationPolicy> = policies
        .iter()
        .filter(|p| p.spec.priority == best)
        .collect();

    let total: i64 = group.iter().map(|p| p.spec.weight.max(0) as i64).sum();
    if total == 0 {
        return Some(group[rand::thread_rng().gen_range(0..group.len())]);
    }

    let mut draw = rand::thread_rng().gen_range(0..total);
    for policy in &group {
        draw -= policy.spec.weight.max(0) as i64;
        if draw < 0 {
            return Some(policy);
        }
    }
    group.last().copied()
}

/// Forward `gsa` to the policy's endpoints in order, returning the first
/// successful response. All endpoints failing yields the last error.
pub async fn forward(
    client: kube::Client,
    policy: &GameServerAllocationPolicy,
    gsa: GameServerAllocation,
) -> crate::Result<GameServerAllocation> {
    let connection = &policy.spec.connection_info;
    let secrets: Api<Secret> = Api::namespaced(client, &connection.namespace);
    let secret = secrets
        .get(&connection.secret_name)
        .await
        .wrap_err_with(|| format!("fetching allocation secret {:?}", connection.secret_name))?;

    let http = client_from_secret(&secret)?;
    try_endpoints(&http, &connection.allocation_endpoints, &gsa).await
}

async fn try_endpoints(
    http: &reqwest::Client,
    endpoints: &[String],
    gsa: &GameServerAllocation,
) -> crate::Result<GameServerAllocation> {
    let mut last_error = eyre::eyre!("no allocation endpoints configured");

    for endpoint in endpoints {
        let result = async {
            let response = http.post(endpoint).json(gsa).send().await?;
            let response = response.error_for_status()?;
            response.json::<GameServerAllocation>().await
        }
        .await;

        match result {
            Ok(allocation) => return Ok(allocation),
            Err(error) => {
                tracing::warn!(%endpoint, %error, "remote allocation endpoint failed");
                last_error = eyre::Report::new(error).wrap_err(format!("endpoint {endpoint:?}"));
            }
        }
    }

    Err(last_error)
}

/// Build an mTLS client from the policy secret's `ca.crt`, `tls.crt` and
/// `tls.key`. Any missing key aborts the dispatch with a descriptive error.
pub fn client_from_secret(secret: &Secret) -> crate::Result<reqwest::Client> {
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let field = |key: &str| -> crate::Result<Vec<u8>> {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|bytes| bytes.0.clone())
            .ok_or_else(|| eyre::eyre!("secret {name:?} is missing key {key:?}"))
    };

    let ca = reqwest::Certificate::from_pem(&field("ca.crt")?)
        .wrap_err_with(|| format!("secret {name:?}: invalid ca.crt"))?;

    let mut identity_pem = field("tls.crt")?;
    identity_pem.push(b'\n');
    identity_pem.extend(field("tls.key")?);
    let identity = reqwest::Identity::from_pem(&identity_pem)
        .wrap_err_with(|| format!("secret {name:?}: invalid tls.crt/tls.key pair"))?;

    reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(ca)
        .identity(identity)
        .build()
        .wrap_err("building multicluster http client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::policy::{ClusterConnectionInfo, GameServerAllocationPolicySpec};
    use std::collections::HashSet;

    fn policy(name: &str, priority: i32, weight: i32) -> GameServerAllocationPolicy {
        GameServerAllocationPolicy::new(
            name,
            GameServerAllocationPolicySpec {
                priority,
                weight,
                connection_info: ClusterConnectionInfo::default(),
            },
        )
    }

    #[test]
    fn lowest_priority_group_wins() {
        let policies = vec![policy("far", 2, 100), policy("near", 1, 1)];
        for _ in 0..20 {
            let chosen = choose_policy(&policies).unwrap();
            assert_eq!(chosen.metadata.name.as_deref(), Some("near"));
        }
    }

    #[test]
    fn weight_zero_is_never_drawn_against_positive_weight() {
        let policies = vec![policy("never", 1, 0), policy("always", 1, 50)];
        for _ in 0..50 {
            let chosen = choose_policy(&policies).unwrap();
            assert_eq!(chosen.metadata.name.as_deref(), Some("always"));
        }
    }

    #[test]
    fn equal_weights_tie_break_uniformly() {
        let policies = vec![policy("a", 1, 10), policy("b", 1, 10)];
        let seen: HashSet<String> = (0..200)
            .map(|_| choose_policy(&policies).unwrap().metadata.name.clone().unwrap())
            .collect();
        assert_eq!(seen.len(), 2, "both equally-weighted policies must be drawn");
    }

    #[test]
    fn empty_policy_list() {
        assert!(choose_policy(&[]).is_none());
    }

    #[test]
    fn missing_secret_keys_are_descriptive() {
        let mut secret = Secret::default();
        secret.metadata.name = Some("allocator-tls".into());
        secret.data = Some(
            [(
                "ca.crt".to_owned(),
                k8s_openapi::ByteString(b"not-a-cert".to_vec()),
            )]
            .into(),
        );

        let error = client_from_secret(&secret).unwrap_err();
        // ca.crt is present but tls.crt is not; with an invalid ca.crt the
        // parse error mentions it first
        let message = format!("{error:#}");
        assert!(
            message.contains("ca.crt"),
            "unexpected error message: {message}"
        );

        secret.data = Some(Default::default());
        let error = client_from_secret(&secret).unwrap_err();
        assert!(format!("{error}").contains("ca.crt"));
    }

    /// Endpoints are tried in order: a dead endpoint is skipped and the
    /// healthy one's response is returned.
    #[tokio::test]
    async fn forwards_in_order_until_success() {
        use hyper::service::{make_service_fn, service_fn};
        use std::convert::Infallible;

        let response = serde_json::json!({
            "metadata": {},
            "spec": {},
            "status": {"state": "Allocated", "gameServerName": "remote-gs"}
        });
        let make_svc = make_service_fn(move |_| {
            let response = response.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req| {
                    let body = serde_json::to_vec(&response).unwrap();
                    async move {
                        Ok::<_, Infallible>(hyper::Response::new(hyper::Body::from(body)))
                    }
                }))
            }
        });
        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let good = format!("http://{}", server.local_addr());
        tokio::spawn(server);

        let endpoints = vec!["http://127.0.0.1:9".to_owned(), good];
        let http = reqwest::Client::new();
        let gsa = GameServerAllocation::new("", Default::default());

        let allocated = try_endpoints(&http, &endpoints, &gsa).await.unwrap();
        assert_eq!(
            allocated.status.as_ref().unwrap().game_server_name,
            "remote-gs"
        );

        // every endpoint failing surfaces the last error
        let endpoints = vec!["http://127.0.0.1:9".to_owned()];
        let error = try_endpoints(&http, &endpoints, &gsa).await.unwrap_err();
        assert!(format!("{error}").contains("127.0.0.1:9"));
    }
}
