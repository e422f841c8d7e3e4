use std::{borrow::Cow, sync::Arc, time::Duration};

use influxdb3_cluster_topology::Host;
use metric::{DurationHistogram, Metric, Registry, U64Counter, U64Gauge};

use crate::Error;

pub(crate) const HOST_QUEUE_HEALTH_METRIC_NAME: &str = "cluster_client_host_queue_health";

/// Names of the instruments recorded for one kind of session operation.
#[derive(Debug)]
struct OpMetricNames {
    success: &'static str,
    errors: &'static str,
    latency: &'static str,
    nodes_responding_errors: &'static str,
}

const WRITE_METRIC_NAMES: OpMetricNames = OpMetricNames {
    success: "cluster_client_write_success",
    errors: "cluster_client_write_errors",
    latency: "cluster_client_write_latency",
    nodes_responding_errors: "cluster_client_write_nodes_responding_errors",
};

const FETCH_METRIC_NAMES: OpMetricNames = OpMetricNames {
    success: "cluster_client_fetch_success",
    errors: "cluster_client_fetch_errors",
    latency: "cluster_client_fetch_latency",
    nodes_responding_errors: "cluster_client_fetch_nodes_responding_errors",
};

/// Outcome counters and latency of one kind of session operation.
#[derive(Debug)]
pub(crate) struct OpMetrics {
    success: U64Counter,
    errors_bad_request: U64Counter,
    errors_internal: U64Counter,
    latency: DurationHistogram,
    nodes_responding_errors: Metric<U64Counter>,
}

impl OpMetrics {
    fn new(registry: &Registry, names: &OpMetricNames) -> Self {
        let success: Metric<U64Counter> = registry.register_metric(
            names.success,
            "session operations that met their consistency level",
        );
        let errors: Metric<U64Counter> =
            registry.register_metric(names.errors, "session operations that failed");
        let latency: Metric<DurationHistogram> = registry.register_metric(
            names.latency,
            "latency of single session operation attempts",
        );
        let nodes_responding_errors = registry.register_metric(
            names.nodes_responding_errors,
            "failed session operations by the number of replicas that returned an error",
        );
        Self {
            success: success.recorder([]),
            errors_bad_request: errors.recorder([("kind", "bad_request")]),
            errors_internal: errors.recorder([("kind", "internal")]),
            latency: latency.recorder([]),
            nodes_responding_errors,
        }
    }

    pub(crate) fn record(&self, result: Result<(), &Error>, replicas: usize, latency: Duration) {
        self.latency.record(latency);
        let Err(err) = result else {
            self.success.inc(1);
            return;
        };

        let bad_request = err.is_bad_request();
        if bad_request {
            self.errors_bad_request.inc(1);
        } else {
            self.errors_internal.inc(1);
        }

        let responding_errors = err.num_error().min(replicas);
        if responding_errors > 0 {
            let kind = if bad_request { "bad_request" } else { "error" };
            self.nodes_responding_errors
                .recorder([
                    ("nodes", Cow::Owned(responding_errors.to_string())),
                    ("kind", Cow::Borrowed(kind)),
                ])
                .inc(1);
        }
    }
}

#[derive(Debug)]
pub(crate) struct SessionMetrics {
    pub(crate) write: OpMetrics,
    pub(crate) fetch: OpMetrics,
}

impl SessionMetrics {
    pub(crate) fn new(registry: &Arc<Registry>) -> Self {
        Self {
            write: OpMetrics::new(registry, &WRITE_METRIC_NAMES),
            fetch: OpMetrics::new(registry, &FETCH_METRIC_NAMES),
        }
    }
}

pub(crate) const REPLICATE_METRIC_NAME: &str = "cluster_client_replicate";

/// Outcomes of replicating writes to async clusters.
#[derive(Debug)]
pub(crate) struct ReplicateMetrics {
    /// Replications started.
    pub(crate) executed: U64Counter,
    /// Replications dropped because too many were in flight.
    pub(crate) not_executed: U64Counter,
    pub(crate) success: U64Counter,
    pub(crate) error: U64Counter,
}

impl ReplicateMetrics {
    pub(crate) fn new(registry: &Registry) -> Self {
        let replicate: Metric<U64Counter> = registry.register_metric(
            REPLICATE_METRIC_NAME,
            "writes replicated to async clusters by outcome",
        );
        Self {
            executed: replicate.recorder([("outcome", "executed")]),
            not_executed: replicate.recorder([("outcome", "not_executed")]),
            success: replicate.recorder([("outcome", "success")]),
            error: replicate.recorder([("outcome", "error")]),
        }
    }
}

/// Gauge reporting whether `host` had a healthy connection after the last health check round.
pub(crate) fn host_queue_health(registry: &Registry, host: &Host) -> U64Gauge {
    registry
        .register_metric::<U64Gauge>(
            HOST_QUEUE_HEALTH_METRIC_NAME,
            "1 if the host had a healthy connection after the last health check, 0 otherwise",
        )
        .recorder([("host", Cow::Owned(host.id().to_string()))])
}
