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

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace("garrison")
        .subsystem(subsystem)
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub(crate) fn registry() -> &'static Registry {
    &REGISTRY
}

/// Allocation requests served, by outcome (`Allocated`, `UnAllocated`, `Contention`).
pub(crate) fn allocations_total() -> &'static IntCounterVec {
    static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
        let metric = IntCounterVec::new(
            opts(
                "allocations_total",
                "allocation",
                "allocation requests served, by outcome",
            ),
            &["outcome"],
        )
        .unwrap();
        registry().register(Box::new(metric.clone())).unwrap();
        metric
    });
    &METRIC
}

/// End-to-end latency of the local allocation pipeline.
pub(crate) fn allocation_duration() -> &'static Histogram {
    static METRIC: Lazy<Histogram> = Lazy::new(|| {
        let metric = Histogram::with_opts(HistogramOpts {
            common_opts: opts(
                "allocation_duration_seconds",
                "allocation",
                "end to end latency of the allocation pipeline",
            ),
            buckets: vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        })
        .unwrap();
        registry().register(Box::new(metric.clone())).unwrap();
        metric
    });
    &METRIC
}

/// Reconciles performed, per controller, by result.
pub(crate) fn reconciles_total() -> &'static IntCounterVec {
    static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
        let metric = IntCounterVec::new(
            opts(
                "reconciles_total",
                "controller",
                "reconciles performed, per controller, by result",
            ),
            &["controller", "result"],
        )
        .unwrap();
        registry().register(Box::new(metric.clone())).unwrap();
        metric
    });
    &METRIC
}

/// 1 once a shutdown signal has been observed and the process is draining.
pub(crate) fn shutdown_initiated() -> &'static IntGauge {
    static METRIC: Lazy<IntGauge> = Lazy::new(|| {
        let metric = IntGauge::with_opts(opts(
            "shutdown_initiated",
            "controller",
            "1 once a shutdown signal has been observed",
        ))
        .unwrap();
        registry().register(Box::new(metric.clone())).unwrap();
        metric
    });
    &METRIC
}

/// Whether this replica currently holds the controller leader lease.
pub(crate) fn leader() -> &'static IntGauge {
    static METRIC: Lazy<IntGauge> = Lazy::new(|| {
        let metric = IntGauge::with_opts(opts(
            "leader",
            "controller",
            "1 when this replica holds the leader lease",
        ))
        .unwrap();
        registry().register(Box::new(metric.clone())).unwrap();
        metric
    });
    &METRIC
}
