//! Pool of connections to a single storage node.
//!
//! Two background tasks run while the pool is open: one tops the pool up to
//! `max_connection_count` and one health checks existing connections, removing those that fail
//! `background_health_check_fail_limit` checks in a row. Both sleep for their interval plus a
//! random stutter drawn from a generator seeded by the host address, so pools for different hosts
//! do not run in lockstep.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use influxdb3_cluster_topology::Host;
use metric::U64Gauge;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::RwLock;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio_util::sync::CancellationToken;
use twox_hash::XxHash64;

use crate::{
    Error, Result, Status,
    config::Options,
    rpc::{NodeClient, NodeConnector},
};

#[derive(Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    host: Host,
    connector: Arc<dyn NodeConnector>,
    opts: Arc<Options>,
    state: RwLock<PoolState>,
    next: AtomicUsize,
    shutdown: CancellationToken,
    health: Option<U64Gauge>,
}

#[derive(Debug)]
struct PoolState {
    status: Status,
    conns: Vec<Arc<dyn NodeClient>>,
}

impl ConnectionPool {
    pub(crate) fn new(
        host: Host,
        connector: Arc<dyn NodeConnector>,
        opts: Arc<Options>,
        health: Option<U64Gauge>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                host,
                connector,
                opts,
                state: RwLock::new(PoolState {
                    status: Status::NotOpen,
                    conns: vec![],
                }),
                next: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                health,
            }),
        }
    }

    /// Start the connect and health check tasks. Does nothing unless the pool was never opened.
    pub(crate) fn open(&self) {
        {
            let mut state = self.inner.state.write();
            if state.status != Status::NotOpen {
                return;
            }
            state.status = Status::Open;
        }

        let seed = XxHash64::oneshot(0, self.inner.host.address().as_bytes());
        tokio::spawn(Arc::clone(&self.inner).connect_every(StdRng::seed_from_u64(seed)));
        tokio::spawn(
            Arc::clone(&self.inner).health_check_every(StdRng::seed_from_u64(seed.rotate_left(1))),
        );
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.inner.state.read().conns.len()
    }

    /// The next connection in round robin order.
    pub(crate) fn next_client(&self) -> Result<Arc<dyn NodeClient>> {
        let state = self.inner.state.read();
        if state.status != Status::Open {
            return Err(Error::ConnectionPoolClosed);
        }
        if state.conns.is_empty() {
            return Err(Error::HostNotAvailable(Box::new(Error::NoConnections)));
        }
        let n = self.inner.next.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&state.conns[n % state.conns.len()]))
    }

    pub(crate) fn close(&self) {
        let conns = {
            let mut state = self.inner.state.write();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Closed;
            std::mem::take(&mut state.conns)
        };
        self.inner.shutdown.cancel();
        for conn in conns {
            conn.close();
        }
        info!(host = %self.inner.host, "closed connection pool");
    }
}

impl PoolInner {
    fn is_open(&self) -> bool {
        self.state.read().status == Status::Open
    }

    async fn connect_every(self: Arc<Self>, mut rng: StdRng) {
        loop {
            let missing = {
                let state = self.state.read();
                if state.status != Status::Open {
                    return;
                }
                self.opts
                    .max_connection_count
                    .saturating_sub(state.conns.len())
            };
            if missing > 0 {
                join_all((0..missing).map(|_| self.connect_one())).await;
            }

            let wait = self.opts.background_connect_interval
                + stutter(&mut rng, self.opts.background_connect_stutter);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {},
            }
        }
    }

    async fn connect_one(&self) {
        let client = match tokio::time::timeout(
            self.opts.host_connect_timeout,
            self.connector.connect(&self.host),
        )
        .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                debug!(host = %self.host, error = %e, "could not connect to host");
                return;
            }
            Err(_) => {
                debug!(host = %self.host, "timed out connecting to host");
                return;
            }
        };

        if let Err(e) = self.check_health(client.as_ref()).await {
            debug!(host = %self.host, error = %e, "new connection failed health check");
            client.close();
            return;
        }

        let mut state = self.state.write();
        if state.status != Status::Open || state.conns.len() >= self.opts.max_connection_count {
            drop(state);
            client.close();
            return;
        }
        state.conns.push(client);
    }

    async fn check_health(&self, client: &dyn NodeClient) -> Result<()> {
        match tokio::time::timeout(self.opts.host_connect_timeout, client.health()).await {
            Ok(Ok(health)) if health.ok => Ok(()),
            Ok(Ok(health)) => Err(Error::InternalServer(format!(
                "node reported unhealthy: {}",
                health.status
            ))),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn health_check_every(self: Arc<Self>, mut rng: StdRng) {
        loop {
            let wait = self.opts.background_health_check_interval
                + stutter(&mut rng, self.opts.background_health_check_stutter);
            let deadline = tokio::time::Instant::now() + wait;

            let conns = {
                let state = self.state.read();
                if state.status != Status::Open {
                    return;
                }
                state.conns.clone()
            };
            let healthy = join_all(conns.iter().map(|c| self.check_with_retries(c.as_ref()))).await;

            let mut num_healthy = 0;
            for (conn, healthy) in conns.iter().zip(healthy) {
                if healthy {
                    num_healthy += 1;
                } else {
                    self.remove(conn);
                }
            }
            if let Some(gauge) = &self.health {
                if self.is_open() {
                    gauge.set(u64::from(num_healthy > 0));
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {},
            }
        }
    }

    /// Whether `client` passes one of up to `fail_limit` consecutive checks.
    async fn check_with_retries(&self, client: &dyn NodeClient) -> bool {
        let limit = self.opts.background_health_check_fail_limit;
        let throttle = self
            .opts
            .host_connect_timeout
            .mul_f64(self.opts.background_health_check_fail_throttle_factor);
        for attempt in 1..=limit {
            match self.check_health(client).await {
                Ok(()) => return true,
                Err(e) => {
                    debug!(host = %self.host, attempt, error = %e, "health check failed");
                }
            }
            if attempt < limit {
                tokio::time::sleep(throttle).await;
            }
        }
        false
    }

    fn remove(&self, conn: &Arc<dyn NodeClient>) {
        let removed = {
            let mut state = self.state.write();
            if state.status != Status::Open {
                return;
            }
            state
                .conns
                .iter()
                .position(|c| Arc::ptr_eq(c, conn))
                .map(|idx| state.conns.swap_remove(idx))
        };
        if let Some(conn) = removed {
            warn!(
                host = %self.host,
                fail_limit = self.opts.background_health_check_fail_limit,
                "removing connection after failed health checks"
            );
            conn.close();
        }
    }
}

fn stutter(rng: &mut StdRng, max: Duration) -> Duration {
    let max = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.gen_range(0..=max))
}

#[cfg(test)]
mod tests {
    use metric::{Attributes, Metric, Registry};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        metrics::{HOST_QUEUE_HEALTH_METRIC_NAME, host_queue_health},
        rpc::{
            NodeHealth, RpcError,
            mock::{MockConnector, MockNodeClient},
        },
    };

    fn opts() -> Options {
        Options {
            min_connection_count: 1,
            max_connection_count: 3,
            host_connect_timeout: Duration::from_secs(1),
            background_connect_interval: Duration::from_secs(10),
            background_connect_stutter: Duration::ZERO,
            background_health_check_interval: Duration::from_secs(1),
            background_health_check_stutter: Duration::ZERO,
            background_health_check_fail_limit: 2,
            background_health_check_fail_throttle_factor: 0.5,
            ..Default::default()
        }
    }

    fn pool(connector: &Arc<MockConnector>, opts: Options) -> ConnectionPool {
        ConnectionPool::new(
            Host::new("h0", "10.0.0.0:9000"),
            Arc::clone(connector) as _,
            Arc::new(opts),
            None,
        )
    }

    fn unhealthy() -> Result<NodeHealth, RpcError> {
        Ok(NodeHealth {
            ok: false,
            status: "bootstrapping".to_string(),
            bootstrapped: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fills_up_to_max_connections() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, opts());
        assert!(matches!(
            pool.next_client(),
            Err(Error::ConnectionPoolClosed)
        ));

        pool.open();
        pool.open();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.connection_count(), 3);
        assert_eq!(connector.connects(), 3);

        // later rounds never grow the pool past max
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(pool.connection_count(), 3);
        assert_eq!(connector.connects(), 3);

        pool.close();
    }

    #[tokio::test(start_paused = true)]
    async fn no_connections_is_host_not_available() {
        let connector = Arc::new(MockConnector::new());
        connector.refuse("h0");
        let pool = pool(&connector, opts());
        pool.open();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let err = pool.next_client().unwrap_err();
        assert!(err.is_host_not_available());
        assert!(err.is_non_retryable());

        connector.accept("h0");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(pool.connection_count(), 3);
        assert!(pool.next_client().is_ok());
        pool.close();
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_new_connection_is_dropped() {
        let connector = Arc::new(
            MockConnector::new()
                .with_client("h0", MockNodeClient::new().with_health_ret([unhealthy()])),
        );
        let pool = pool(
            &connector,
            Options {
                max_connection_count: 1,
                ..opts()
            },
        );
        pool.open();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(connector.client("h0").closes(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(pool.connection_count(), 1);
        pool.close();
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn failing_health_checks_remove_connection_once() {
        let connector = Arc::new(MockConnector::new().with_client(
            "h0",
            MockNodeClient::new().with_health_ret([
                // new connection check
                Ok(NodeHealth {
                    ok: true,
                    status: "up".to_string(),
                    bootstrapped: true,
                }),
                Err(RpcError::Timeout),
                unhealthy(),
            ]),
        ));
        let pool = pool(
            &connector,
            Options {
                max_connection_count: 1,
                ..opts()
            },
        );
        pool.open();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(connector.client("h0").closes(), 1);

        // the connect loop replaces the removed connection
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(connector.client("h0").closes(), 1);
        pool.close();
    }

    #[tokio::test(start_paused = true)]
    async fn single_success_clears_failures() {
        let connector = Arc::new(MockConnector::new().with_client(
            "h0",
            MockNodeClient::new().with_health_ret([
                Ok(NodeHealth {
                    ok: true,
                    status: "up".to_string(),
                    bootstrapped: true,
                }),
                Err(RpcError::Timeout),
            ]),
        ));
        let pool = pool(
            &connector,
            Options {
                max_connection_count: 1,
                ..opts()
            },
        );
        pool.open();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(connector.client("h0").closes(), 0);
        pool.close();
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_and_close() {
        let connector = Arc::new(MockConnector::new());
        let pool = pool(&connector, opts());
        pool.open();
        tokio::time::sleep(Duration::from_millis(1)).await;
        for _ in 0..6 {
            pool.next_client().unwrap();
        }

        pool.close();
        pool.close();
        assert_eq!(pool.connection_count(), 0);
        // all three pooled connections share the host's mock client
        assert_eq!(connector.client("h0").closes(), 3);
        assert!(matches!(
            pool.next_client(),
            Err(Error::ConnectionPoolClosed)
        ));

        // background loops have exited
        let checks = connector.client("h0").health_checks();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.client("h0").health_checks(), checks);
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_health() {
        let registry = Registry::new();
        let host = Host::new("h0", "10.0.0.0:9000");
        let connector = Arc::new(MockConnector::new());
        let pool = ConnectionPool::new(
            host.clone(),
            Arc::clone(&connector) as _,
            Arc::new(opts()),
            Some(host_queue_health(&registry, &host)),
        );
        pool.open();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let value = registry
            .get_instrument::<Metric<U64Gauge>>(HOST_QUEUE_HEALTH_METRIC_NAME)
            .unwrap()
            .get_observer(&Attributes::from(&[("host", "h0")]))
            .unwrap()
            .fetch();
        assert_eq!(value, 1);
        pool.close();
    }

    #[test]
    fn stutter_is_bounded() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(stutter(&mut rng, Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(stutter(&mut rng, Duration::from_millis(5)) <= Duration::from_millis(5));
        }
    }
}
