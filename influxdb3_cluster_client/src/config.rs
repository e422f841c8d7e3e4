//! Client configuration.
//!
//! [`ClusterClientConfig`] is the command line / environment surface, [`Options`] the runtime
//! form consumed by the session.

use std::time::Duration;

use influxdb3_cluster_topology::{
    ConnectConsistencyLevel, ConsistencyLevel, Host, ReadConsistencyLevel,
};

use crate::{Error, Result, iterator::EqualTimestampStrategy, retry::RetryOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub write_consistency_level: ConsistencyLevel,
    pub read_consistency_level: ReadConsistencyLevel,
    pub cluster_connect_consistency_level: ConnectConsistencyLevel,
    pub cluster_connect_timeout: Duration,

    pub write_request_timeout: Duration,
    pub fetch_request_timeout: Duration,
    pub truncate_request_timeout: Duration,

    pub min_connection_count: usize,
    pub max_connection_count: usize,
    pub host_connect_timeout: Duration,
    pub background_connect_interval: Duration,
    pub background_connect_stutter: Duration,
    pub background_health_check_interval: Duration,
    pub background_health_check_stutter: Duration,
    pub background_health_check_fail_limit: usize,
    pub background_health_check_fail_throttle_factor: f64,

    pub write_batch_size: usize,
    pub fetch_batch_size: usize,
    pub host_queue_ops_flush_size: usize,
    pub host_queue_ops_flush_interval: Duration,
    /// Rotated op arrays a host queue buffers before enqueuers block.
    pub host_queue_ops_array_pool_size: usize,
    pub host_queue_emits_health_status: bool,
    /// Batch dispatches in flight across all host queues.
    pub host_queue_dispatch_pool_size: usize,
    /// Batch dispatches in flight per host queue.
    pub host_queue_max_concurrent_dispatches: usize,

    /// Writes being replicated to async clusters at once, across every async cluster.
    pub async_write_worker_pool_size: usize,
    /// Replications started but not finished before new ones are dropped.
    pub async_write_max_concurrency: usize,

    /// Added to the timestamp of every write.
    pub write_timestamp_offset: Duration,
    pub write_shards_initializing: bool,
    pub shards_leaving_count_towards_consistency: bool,
    pub use_v2_batch_apis: bool,

    /// Fraction of failed writes and fetches that are logged, between 0 and 1.
    pub log_error_sample_rate: f64,

    pub write_retry: RetryOptions,
    pub fetch_retry: RetryOptions,
    pub equal_timestamp_strategy: EqualTimestampStrategy,

    /// The host this client runs on, excluded from peer sets.
    pub origin: Option<Host>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            write_consistency_level: ConsistencyLevel::Majority,
            read_consistency_level: ReadConsistencyLevel::Majority,
            cluster_connect_consistency_level: ConnectConsistencyLevel::Any,
            cluster_connect_timeout: Duration::from_secs(20),
            write_request_timeout: Duration::from_secs(10),
            fetch_request_timeout: Duration::from_secs(15),
            truncate_request_timeout: Duration::from_secs(60),
            min_connection_count: 2,
            max_connection_count: 32,
            host_connect_timeout: Duration::from_secs(5),
            background_connect_interval: Duration::from_secs(4),
            background_connect_stutter: Duration::from_secs(2),
            background_health_check_interval: Duration::from_secs(4),
            background_health_check_stutter: Duration::from_secs(2),
            background_health_check_fail_limit: 4,
            background_health_check_fail_throttle_factor: 0.5,
            write_batch_size: 128,
            fetch_batch_size: 128,
            host_queue_ops_flush_size: 128,
            host_queue_ops_flush_interval: Duration::from_millis(5),
            host_queue_ops_array_pool_size: 8,
            host_queue_emits_health_status: false,
            host_queue_dispatch_pool_size: 128,
            host_queue_max_concurrent_dispatches: 4096,
            async_write_worker_pool_size: 128,
            async_write_max_concurrency: 4096,
            write_timestamp_offset: Duration::ZERO,
            write_shards_initializing: true,
            shards_leaving_count_towards_consistency: false,
            use_v2_batch_apis: false,
            log_error_sample_rate: 0.0,
            write_retry: RetryOptions {
                initial_backoff: Duration::from_millis(500),
                backoff_factor: 3.0,
                max_retries: 2,
                ..Default::default()
            },
            fetch_retry: RetryOptions {
                initial_backoff: Duration::from_millis(500),
                backoff_factor: 2.0,
                max_retries: 3,
                ..Default::default()
            },
            equal_timestamp_strategy: EqualTimestampStrategy::default(),
            origin: None,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        let zero_sized = [
            ("write batch size", self.write_batch_size),
            ("fetch batch size", self.fetch_batch_size),
            ("host queue ops flush size", self.host_queue_ops_flush_size),
            (
                "host queue ops array pool size",
                self.host_queue_ops_array_pool_size,
            ),
            ("max connection count", self.max_connection_count),
            (
                "host queue dispatch pool size",
                self.host_queue_dispatch_pool_size,
            ),
            (
                "host queue max concurrent dispatches",
                self.host_queue_max_concurrent_dispatches,
            ),
            (
                "async write worker pool size",
                self.async_write_worker_pool_size,
            ),
            (
                "async write max concurrency",
                self.async_write_max_concurrency,
            ),
            (
                "background health check fail limit",
                self.background_health_check_fail_limit,
            ),
        ];
        if let Some((name, _)) = zero_sized.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidOptions(format!("{name} must be positive")));
        }
        if self.min_connection_count > self.max_connection_count {
            return Err(Error::InvalidOptions(format!(
                "min connection count {} exceeds max connection count {}",
                self.min_connection_count, self.max_connection_count
            )));
        }
        if !(0.0..=1.0).contains(&self.log_error_sample_rate) {
            return Err(Error::InvalidOptions(format!(
                "log error sample rate {} is not between 0 and 1",
                self.log_error_sample_rate
            )));
        }
        if self.background_health_check_fail_throttle_factor < 0.0 {
            return Err(Error::InvalidOptions(
                "background health check fail throttle factor cannot be negative".to_string(),
            ));
        }
        self.write_retry.validate()?;
        self.fetch_retry.validate()
    }
}

/// Configuration of the cluster client.
#[derive(Debug, Clone, clap::Parser)]
pub struct ClusterClientConfig {
    /// Replicas that must acknowledge a write, one of 'one', 'majority' or 'all'
    #[clap(
        long = "cluster-write-consistency-level",
        env = "INFLUXDB3_CLUSTER_CLIENT_WRITE_CONSISTENCY_LEVEL",
        default_value = "majority",
        action
    )]
    pub write_consistency_level: ConsistencyLevel,

    /// Replicas that must answer a read, one of 'none', 'one', 'unstrict_majority', 'majority',
    /// 'unstrict_all' or 'all'
    #[clap(
        long = "cluster-read-consistency-level",
        env = "INFLUXDB3_CLUSTER_CLIENT_READ_CONSISTENCY_LEVEL",
        default_value = "majority",
        action
    )]
    pub read_consistency_level: ReadConsistencyLevel,

    /// Connections required before the client is considered connected to the cluster
    ///
    /// 'any' starts at 'all' and lowers the level each time the connect timeout elapses.
    #[clap(
        long = "cluster-connect-consistency-level",
        env = "INFLUXDB3_CLUSTER_CLIENT_CONNECT_CONSISTENCY_LEVEL",
        default_value = "any",
        action
    )]
    pub cluster_connect_consistency_level: ConnectConsistencyLevel,

    #[clap(
        long = "cluster-connect-timeout",
        env = "INFLUXDB3_CLUSTER_CLIENT_CONNECT_TIMEOUT",
        default_value = "20s",
        action
    )]
    pub cluster_connect_timeout: humantime::Duration,

    #[clap(
        long = "cluster-write-request-timeout",
        env = "INFLUXDB3_CLUSTER_CLIENT_WRITE_REQUEST_TIMEOUT",
        default_value = "10s",
        action
    )]
    pub write_request_timeout: humantime::Duration,

    #[clap(
        long = "cluster-fetch-request-timeout",
        env = "INFLUXDB3_CLUSTER_CLIENT_FETCH_REQUEST_TIMEOUT",
        default_value = "15s",
        action
    )]
    pub fetch_request_timeout: humantime::Duration,

    #[clap(
        long = "cluster-truncate-request-timeout",
        env = "INFLUXDB3_CLUSTER_CLIENT_TRUNCATE_REQUEST_TIMEOUT",
        default_value = "60s",
        action
    )]
    pub truncate_request_timeout: humantime::Duration,

    /// Connections each host needs to count towards the connect consistency level
    #[clap(
        long = "cluster-min-connection-count",
        env = "INFLUXDB3_CLUSTER_CLIENT_MIN_CONNECTION_COUNT",
        default_value = "2",
        action
    )]
    pub min_connection_count: usize,

    #[clap(
        long = "cluster-max-connection-count",
        env = "INFLUXDB3_CLUSTER_CLIENT_MAX_CONNECTION_COUNT",
        default_value = "32",
        action
    )]
    pub max_connection_count: usize,

    #[clap(
        long = "cluster-host-connect-timeout",
        env = "INFLUXDB3_CLUSTER_CLIENT_HOST_CONNECT_TIMEOUT",
        default_value = "5s",
        action
    )]
    pub host_connect_timeout: humantime::Duration,

    #[clap(
        long = "cluster-health-check-interval",
        env = "INFLUXDB3_CLUSTER_CLIENT_HEALTH_CHECK_INTERVAL",
        default_value = "4s",
        action
    )]
    pub background_health_check_interval: humantime::Duration,

    /// Consecutive failed health checks after which a connection is dropped
    #[clap(
        long = "cluster-health-check-fail-limit",
        env = "INFLUXDB3_CLUSTER_CLIENT_HEALTH_CHECK_FAIL_LIMIT",
        default_value = "4",
        action
    )]
    pub background_health_check_fail_limit: usize,

    #[clap(
        long = "cluster-write-batch-size",
        env = "INFLUXDB3_CLUSTER_CLIENT_WRITE_BATCH_SIZE",
        default_value = "128",
        action
    )]
    pub write_batch_size: usize,

    #[clap(
        long = "cluster-fetch-batch-size",
        env = "INFLUXDB3_CLUSTER_CLIENT_FETCH_BATCH_SIZE",
        default_value = "128",
        action
    )]
    pub fetch_batch_size: usize,

    /// Pending ops that trigger a flush of a host queue
    #[clap(
        long = "cluster-host-queue-flush-size",
        env = "INFLUXDB3_CLUSTER_CLIENT_HOST_QUEUE_FLUSH_SIZE",
        default_value = "128",
        action
    )]
    pub host_queue_ops_flush_size: usize,

    /// Longest time an op waits in a host queue before it is flushed, 0s to only flush on size
    #[clap(
        long = "cluster-host-queue-flush-interval",
        env = "INFLUXDB3_CLUSTER_CLIENT_HOST_QUEUE_FLUSH_INTERVAL",
        default_value = "5ms",
        action
    )]
    pub host_queue_ops_flush_interval: humantime::Duration,

    #[clap(
        long = "cluster-host-queue-emit-health",
        env = "INFLUXDB3_CLUSTER_CLIENT_HOST_QUEUE_EMIT_HEALTH",
        default_value_t = false,
        action
    )]
    pub host_queue_emits_health_status: bool,

    #[clap(
        long = "cluster-write-shards-initializing",
        env = "INFLUXDB3_CLUSTER_CLIENT_WRITE_SHARDS_INITIALIZING",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub write_shards_initializing: bool,

    #[clap(
        long = "cluster-shards-leaving-count-towards-consistency",
        env = "INFLUXDB3_CLUSTER_CLIENT_SHARDS_LEAVING_COUNT_TOWARDS_CONSISTENCY",
        default_value_t = false,
        action
    )]
    pub shards_leaving_count_towards_consistency: bool,

    #[clap(
        long = "cluster-use-v2-batch-apis",
        env = "INFLUXDB3_CLUSTER_CLIENT_USE_V2_BATCH_APIS",
        default_value_t = false,
        action
    )]
    pub use_v2_batch_apis: bool,

    #[clap(
        long = "cluster-write-timestamp-offset",
        env = "INFLUXDB3_CLUSTER_CLIENT_WRITE_TIMESTAMP_OFFSET",
        default_value = "0s",
        action
    )]
    pub write_timestamp_offset: humantime::Duration,

    #[clap(
        long = "cluster-log-error-sample-rate",
        env = "INFLUXDB3_CLUSTER_CLIENT_LOG_ERROR_SAMPLE_RATE",
        default_value = "0",
        action
    )]
    pub log_error_sample_rate: f64,

    /// How a series read picks between replicas reporting the same timestamp
    #[clap(
        long = "cluster-equal-timestamp-strategy",
        env = "INFLUXDB3_CLUSTER_CLIENT_EQUAL_TIMESTAMP_STRATEGY",
        default_value = "last_pushed",
        action
    )]
    pub equal_timestamp_strategy: EqualTimestampStrategy,

    /// Writes replicated to async clusters at once
    #[clap(
        long = "cluster-async-write-worker-pool-size",
        env = "INFLUXDB3_CLUSTER_CLIENT_ASYNC_WRITE_WORKER_POOL_SIZE",
        default_value = "128",
        action
    )]
    pub async_write_worker_pool_size: usize,

    /// Replications in flight before further writes are not replicated
    #[clap(
        long = "cluster-async-write-max-concurrency",
        env = "INFLUXDB3_CLUSTER_CLIENT_ASYNC_WRITE_MAX_CONCURRENCY",
        default_value = "4096",
        action
    )]
    pub async_write_max_concurrency: usize,

    #[clap(
        long = "cluster-write-max-retries",
        env = "INFLUXDB3_CLUSTER_CLIENT_WRITE_MAX_RETRIES",
        default_value = "2",
        action
    )]
    pub write_max_retries: usize,

    #[clap(
        long = "cluster-fetch-max-retries",
        env = "INFLUXDB3_CLUSTER_CLIENT_FETCH_MAX_RETRIES",
        default_value = "3",
        action
    )]
    pub fetch_max_retries: usize,
}

impl ClusterClientConfig {
    /// Convert into validated runtime [`Options`]; settings without a flag keep their defaults.
    pub fn to_options(&self) -> Result<Options> {
        let defaults = Options::default();
        let opts = Options {
            write_consistency_level: self.write_consistency_level,
            read_consistency_level: self.read_consistency_level,
            cluster_connect_consistency_level: self.cluster_connect_consistency_level,
            cluster_connect_timeout: *self.cluster_connect_timeout,
            write_request_timeout: *self.write_request_timeout,
            fetch_request_timeout: *self.fetch_request_timeout,
            truncate_request_timeout: *self.truncate_request_timeout,
            min_connection_count: self.min_connection_count,
            max_connection_count: self.max_connection_count,
            host_connect_timeout: *self.host_connect_timeout,
            background_health_check_interval: *self.background_health_check_interval,
            background_health_check_fail_limit: self.background_health_check_fail_limit,
            write_batch_size: self.write_batch_size,
            fetch_batch_size: self.fetch_batch_size,
            host_queue_ops_flush_size: self.host_queue_ops_flush_size,
            host_queue_ops_flush_interval: *self.host_queue_ops_flush_interval,
            host_queue_emits_health_status: self.host_queue_emits_health_status,
            write_timestamp_offset: *self.write_timestamp_offset,
            write_shards_initializing: self.write_shards_initializing,
            shards_leaving_count_towards_consistency: self
                .shards_leaving_count_towards_consistency,
            use_v2_batch_apis: self.use_v2_batch_apis,
            log_error_sample_rate: self.log_error_sample_rate,
            equal_timestamp_strategy: self.equal_timestamp_strategy,
            async_write_worker_pool_size: self.async_write_worker_pool_size,
            async_write_max_concurrency: self.async_write_max_concurrency,
            write_retry: RetryOptions {
                max_retries: self.write_max_retries,
                ..defaults.write_retry
            },
            fetch_retry: RetryOptions {
                max_retries: self.fetch_max_retries,
                ..defaults.fetch_retry
            },
            ..defaults
        };
        opts.validate()?;
        Ok(opts)
    }
}
