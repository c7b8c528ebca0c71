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

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server as HyperServer, StatusCode};

use crate::signal::ShutdownRx;

/// The admin endpoint: Prometheus metrics and liveness.
pub fn spawn(
    addr: SocketAddr,
    mut shutdown: ShutdownRx,
) -> crate::Result<tokio::task::JoinHandle<Result<(), hyper::Error>>> {
    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |req| async move {
            Ok::<_, Infallible>(handle_request(req))
        }))
    });

    let server = HyperServer::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            shutdown.changed().await.ok();
        });

    tracing::info!(%addr, "admin endpoint listening");
    Ok(tokio::spawn(server))
}

fn handle_request(request: Request<Body>) -> Response<Body> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => collect_metrics(),
        (&Method::GET, "/live") => Response::new("ok".into()),
        (_, _) => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

fn collect_metrics() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let mut buffer = vec![];
    let encoder = prometheus::TextEncoder::new();
    let body =
        prometheus::Encoder::encode(&encoder, &crate::metrics::registry().gather(), &mut buffer)
            .map_err(|error| tracing::warn!(%error, "failed to encode metrics"))
            .and_then(|_| {
                String::from_utf8(buffer)
                    .map(Body::from)
                    .map_err(|error| tracing::warn!(%error, "failed to convert metrics to utf8"))
            });

    match body {
        Ok(body) => {
            *response.body_mut() = body;
        }
        Err(_) => {
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_and_liveness_routes() {
        crate::metrics::allocations_total()
            .with_label_values(&["Allocated"])
            .inc();

        let response = handle_request(
            Request::builder()
                .method(Method::GET)
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        );
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_request(
            Request::builder()
                .method(Method::GET)
                .uri("/live")
                .body(Body::empty())
                .unwrap(),
        );
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_request(
            Request::builder()
                .method(Method::GET)
                .uri("/nope")
                .body(Body::empty())
                .unwrap(),
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
