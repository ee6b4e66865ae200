//! Metrics definitions for the gateway.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "gateway.requests",
    metric_type: MetricType::Counter,
    description: "Requests handled, tagged by route and status",
};

pub const LOCK_CONTENTION: MetricDef = MetricDef {
    name: "gateway.lock.contention",
    metric_type: MetricType::Counter,
    description: "Requests rejected because the entity lock was held",
};

pub const UPSTREAM_REQUEST_DURATION: MetricDef = MetricDef {
    name: "gateway.upstream.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent on an upstream HTTP request in seconds",
};

pub const BROKER_DISCONNECTS: MetricDef = MetricDef {
    name: "gateway.broker.disconnects",
    metric_type: MetricType::Counter,
    description: "Broker disconnect attempts, tagged by outcome",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS,
    LOCK_CONTENTION,
    UPSTREAM_REQUEST_DURATION,
    BROKER_DISCONNECTS,
];
