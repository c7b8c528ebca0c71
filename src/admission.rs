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

//! The admission webhook server: one mutating (defaulting) and one
//! validating endpoint per resource kind, served over TLS. Fail-closed: a
//! handler error denies the review rather than letting an unchecked object
//! through.

use std::{convert::Infallible, net::SocketAddr, path::Path, sync::Arc};

use eyre::WrapErr;
use hyper::{server::conn::Http, service::service_fn, Body, Method, Request, Response, StatusCode};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::{
    crd::{Fleet, FleetAutoscaler, GameServer},
    signal::ShutdownRx,
};

/// Bind the webhook endpoint and serve reviews until shutdown.
pub async fn spawn(
    addr: SocketAddr,
    cert_dir: &Path,
    mut shutdown: ShutdownRx,
) -> crate::Result<tokio::task::JoinHandle<()>> {
    let acceptor = tls_acceptor(cert_dir)?;
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding admission webhook listener on {addr}"))?;
    tracing::info!(%addr, "admission webhook listening");

    Ok(tokio::spawn(async move {
        loop {
            let (stream, _peer) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(%error, "failed to accept webhook connection");
                        continue;
                    }
                },
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => {
                        let served = Http::new()
                            .serve_connection(tls, service_fn(route))
                            .await;
                        if let Err(error) = served {
                            tracing::debug!(%error, "webhook connection ended with error");
                        }
                    }
                    Err(error) => tracing::debug!(%error, "webhook TLS handshake failed"),
                }
            });
        }
    }))
}

fn tls_acceptor(cert_dir: &Path) -> crate::Result<TlsAcceptor> {
    let cert_path = cert_dir.join("tls.crt");
    let key_path = cert_dir.join("tls.key");

    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(&cert_path)
            .wrap_err_with(|| format!("opening {}", cert_path.display()))?,
    ))
    .collect::<Result<_, _>>()
    .wrap_err("reading webhook certificate chain")?;

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(&key_path)
            .wrap_err_with(|| format!("opening {}", key_path.display()))?,
    ))
    .wrap_err("reading webhook private key")?
    .ok_or_else(|| eyre::eyre!("no private key found in {}", key_path.display()))?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .wrap_err("building webhook TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn route(request: Request<Body>) -> Result<Response<Body>, Infallible> {
    if request.method() != Method::POST {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let path = request.uri().path().to_owned();
    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(_) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::UNPROCESSABLE_ENTITY;
            return Ok(response);
        }
    };

    let review = match path.as_str() {
        "/mutate/gameservers" => review::<GameServer>(&body, |request, object| {
            mutate(request, object, GameServer::apply_defaults)
        }),
        "/mutate/fleets" => review::<Fleet>(&body, |request, object| {
            mutate(request, object, Fleet::apply_defaults)
        }),
        "/validate/gameservers" => review::<GameServer>(&body, |request, object| {
            validate(request, &object.validate())
        }),
        "/validate/fleets" => review::<Fleet>(&body, |request, object| {
            validate(request, &object.validate())
        }),
        "/validate/fleetautoscalers" => review::<FleetAutoscaler>(&body, |request, object| {
            validate(request, &object.validate())
        }),
        _ => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            return Ok(response);
        }
    };

    let body = serde_json::to_vec(&review).unwrap_or_default();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap())
}

/// Decode, dispatch and re-wrap one review. Every failure path produces a
/// denial so nothing slips through unvalidated.
fn review<K>(
    body: &[u8],
    handler: impl Fn(&AdmissionRequest<K>, K) -> AdmissionResponse,
) -> AdmissionReview<kube::core::DynamicObject>
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned + Serialize + Clone,
{
    let review: AdmissionReview<K> = match serde_json::from_slice(body) {
        Ok(review) => review,
        Err(error) => {
            return AdmissionResponse::invalid(format!("undecodable review: {error}"))
                .into_review();
        }
    };
    let request: AdmissionRequest<K> = match review.try_into() {
        Ok(request) => request,
        Err(error) => {
            return AdmissionResponse::invalid(format!("malformed review: {error}")).into_review();
        }
    };

    let response = match (&request.operation, request.object.clone()) {
        // nothing to default or validate on the way out
        (Operation::Delete | Operation::Connect, _) => AdmissionResponse::from(&request),
        (_, Some(object)) => handler(&request, object),
        (_, None) => AdmissionResponse::invalid("review carries no object"),
    };
    response.into_review()
}

/// Defaulting mutation: the JSON-patch between the submitted object and the
/// defaulted one. Defaults are idempotent, so re-running the webhook
/// produces an empty patch.
fn mutate<K>(
    request: &AdmissionRequest<K>,
    mut object: K,
    apply: impl Fn(&mut K),
) -> AdmissionResponse
where
    K: kube::Resource<DynamicType = ()> + Serialize + Clone,
{
    let original = match serde_json::to_value(&object) {
        Ok(value) => value,
        Err(error) => return AdmissionResponse::invalid(error.to_string()),
    };
    apply(&mut object);
    let defaulted = match serde_json::to_value(&object) {
        Ok(value) => value,
        Err(error) => return AdmissionResponse::invalid(error.to_string()),
    };

    let patch = json_patch::diff(&original, &defaulted);
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(error) => AdmissionResponse::invalid(error.to_string()),
    }
}

fn validate<K>(request: &AdmissionRequest<K>, violations: &[String]) -> AdmissionResponse
where
    K: kube::Resource<DynamicType = ()>,
{
    if violations.is_empty() {
        AdmissionResponse::from(request)
    } else {
        AdmissionResponse::from(request).deny(violations.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::game_server::{GameServerPort, GameServerSpec, PortPolicy};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    fn game_server(ports: Vec<GameServerPort>) -> GameServer {
        let mut gs = GameServer::new(
            "simple",
            GameServerSpec {
                ports,
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "game".into(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        gs.metadata.namespace = Some("default".into());
        gs
    }

    fn review_body<K: Serialize + kube::Resource<DynamicType = ()>>(object: &K) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "review-uid",
                "kind": {"group": K::group(&()), "version": K::version(&()), "kind": K::kind(&())},
                "resource": {"group": K::group(&()), "version": K::version(&()), "resource": K::plural(&())},
                "operation": "CREATE",
                "userInfo": {},
                "object": object,
            }
        }))
        .unwrap()
    }

    #[test]
    fn mutation_emits_defaulting_patch_and_is_idempotent() {
        let gs = game_server(vec![]);
        let body = review_body(&gs);
        let review = super::review::<GameServer>(&body, |request, object| {
            mutate(request, object, GameServer::apply_defaults)
        });

        let response = review.response.unwrap();
        assert!(response.allowed);
        let patch: json_patch::Patch =
            serde_json::from_slice(response.patch.as_ref().unwrap()).unwrap();
        assert!(!patch.0.is_empty(), "defaulting must patch a raw spec");

        // a defaulted object round-trips to an empty patch
        let mut defaulted = gs;
        defaulted.apply_defaults();
        let body = review_body(&defaulted);
        let review = super::review::<GameServer>(&body, |request, object| {
            mutate(request, object, GameServer::apply_defaults)
        });
        let patch: json_patch::Patch =
            serde_json::from_slice(review.response.unwrap().patch.as_ref().unwrap()).unwrap();
        assert!(patch.0.is_empty());
    }

    #[test]
    fn validation_denies_bad_specs() {
        let gs = game_server(vec![GameServerPort {
            name: "default".into(),
            port_policy: PortPolicy::Dynamic,
            container: None,
            container_port: Some(7777),
            host_port: Some(7777),
            protocol: Default::default(),
        }]);
        let body = review_body(&gs);
        let review = super::review::<GameServer>(&body, |request, object| {
            validate(request, &object.validate())
        });
        let response = review.response.unwrap();
        assert!(!response.allowed);
        assert!(response
            .result
            .message
            .contains("hostPort cannot be specified"));
    }

    #[test]
    fn validation_allows_good_specs() {
        let gs = game_server(vec![]);
        let body = review_body(&gs);
        let review = super::review::<GameServer>(&body, |request, object| {
            validate(request, &object.validate())
        });
        assert!(review.response.unwrap().allowed);
    }

    #[test]
    fn undecodable_reviews_fail_closed() {
        let review = super::review::<GameServer>(b"not json", |request, object| {
            validate(request, &object.validate())
        });
        let response = review.response.unwrap();
        assert!(!response.allowed);
        assert!(response.result.message.contains("undecodable review"));
    }
}
