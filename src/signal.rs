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

//! Process shutdown propagation. One watch channel fans the signal out to
//! every watch task, work queue worker and server; workers drain their
//! current reconcile before exiting, so a SIGTERM never abandons a store
//! write mid-flight.

/// Receiver side of the shutdown channel, cloned into every long-running
/// task.
pub type ShutdownRx = tokio::sync::watch::Receiver<ShutdownKind>;
pub type ShutdownTx = tokio::sync::watch::Sender<ShutdownKind>;

#[derive(Copy, Clone, PartialEq, Default, Debug)]
pub enum ShutdownKind {
    /// An operator-initiated stop (SIGTERM from the kubelet, SIGINT at a
    /// terminal); everything winds down in order.
    #[default]
    Normal,
    /// Test-owned channels; the test decides when and whether to fire.
    Testing,
}

/// Install the process signal listener and return the receiver that
/// observes it.
pub fn spawn_handler() -> ShutdownRx {
    let (tx, rx) = channel(ShutdownKind::default());
    crate::metrics::shutdown_initiated().set(0);
    tokio::spawn(listen_for_signals(tx));
    rx
}

pub fn channel(kind: ShutdownKind) -> (ShutdownTx, ShutdownRx) {
    tokio::sync::watch::channel(kind)
}

async fn listen_for_signals(shutdown_tx: ShutdownTx) {
    #[cfg(target_os = "linux")]
    let mut sig_term =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).unwrap();
    #[cfg(target_os = "linux")]
    let sig_term = sig_term.recv();
    #[cfg(not(target_os = "linux"))]
    let sig_term = std::future::pending::<()>();

    let signal = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sig_term => "SIGTERM",
    };

    crate::metrics::shutdown_initiated().set(1);
    tracing::info!(%signal, "shutting down from signal");
    // receivers may already be gone if the runtime is tearing down
    shutdown_tx.send(ShutdownKind::Normal).ok();
}
