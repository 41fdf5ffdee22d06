//! The multiplexer: pools, ring, accept loop, and liveness polling.
//!
//! Owns every long-lived piece of the proxy. Client sessions are spawned
//! off the accept loop under a semaphore cap; a background task probes
//! one connection per pool on an interval and refreshes a cached status
//! snapshot. Shutdown is cooperative: an active flag checked at loop
//! boundaries, then a bounded wait for in-flight sessions to drain.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::backend::BackendTimeouts;
use crate::config::ProxyConfig;
use crate::metrics::{self, MetricsSink};
use crate::pool::ConnectionPool;
use crate::pubsub::SubscriptionRegistry;
use crate::ring::HashRing;
use crate::session::{self, SessionContext};

/// How long the accept loop blocks before re-checking the active flag.
const ACCEPT_WAKE: Duration = Duration::from_millis(250);

/// Point-in-time view of the proxy, refreshed by the liveness poller.
/// Read cheaply under a shared lock by whoever wants it.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub shards: Vec<ShardStatus>,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub endpoint: String,
    pub live: bool,
}

/// The proxy core: everything between the listen socket and the shards.
pub struct Multiplexer {
    ctx: Arc<SessionContext>,
    active: Arc<AtomicBool>,
    session_permits: Arc<Semaphore>,
    max_sessions: usize,
    next_session_id: AtomicU64,
    check_interval: Duration,
    probe_timeout: Duration,
    status: RwLock<StatusSnapshot>,
}

impl Multiplexer {
    /// Builds pools for every configured shard and the ring over them.
    /// Unreachable shards do not fail startup; their pools begin dead and
    /// reconnect lazily.
    pub async fn new(config: &ProxyConfig, sink: Arc<dyn MetricsSink>) -> Arc<Self> {
        let timeouts = config.timeouts();
        let backend_timeouts = BackendTimeouts {
            connect: timeouts.connect,
            read: timeouts.backend_read,
            write: timeouts.backend_write,
        };

        let mut pools = Vec::with_capacity(config.shards.len());
        for endpoint in &config.shards {
            let pool =
                ConnectionPool::new(endpoint.clone(), config.pool_capacity, backend_timeouts)
                    .await;
            info!(endpoint = %endpoint, live = pool.is_live(), "shard pool ready");
            pools.push(Arc::new(pool));
        }

        let shards = pools
            .iter()
            .map(|p| ShardStatus {
                endpoint: p.endpoint().to_string(),
                live: p.is_live(),
            })
            .collect();

        let ring = Arc::new(HashRing::new(pools));
        let registry =
            SubscriptionRegistry::new(Arc::clone(&ring), backend_timeouts, Arc::clone(&sink));

        Arc::new(Self {
            ctx: Arc::new(SessionContext {
                ring,
                registry,
                timeouts,
                metrics: sink,
            }),
            active: Arc::new(AtomicBool::new(true)),
            session_permits: Arc::new(Semaphore::new(config.max_sessions)),
            max_sessions: config.max_sessions,
            next_session_id: AtomicU64::new(1),
            check_interval: config.check_interval(),
            probe_timeout: timeouts.probe,
            status: RwLock::new(StatusSnapshot {
                shards,
                active_sessions: 0,
            }),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flips the active flag. Loops notice at their next boundary; the
    /// accept loop also stops taking new connections immediately.
    pub fn initiate_shutdown(&self) {
        info!("shutdown initiated");
        self.active.store(false, Ordering::Release);
    }

    /// The cached status payload.
    pub async fn status(&self) -> StatusSnapshot {
        self.status.read().await.clone()
    }

    /// Serves connections on `listener` until shutdown. The caller binds
    /// the listener, so tests can pass an ephemeral port.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let poller = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.liveness_loop().await })
        };

        info!("accepting client connections");
        while self.is_active() {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = tokio::time::sleep(ACCEPT_WAKE) => continue,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // one failed accept never stops the loop
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let permit = match Arc::clone(&self.session_permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    warn!(peer = %peer, "session cap reached, dropping connection");
                    continue;
                }
                Err(TryAcquireError::Closed) => break,
            };

            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            self.ctx.metrics.incr_counter(metrics::SESSIONS_ACCEPTED, 1);
            self.set_session_gauge();
            debug!(session = id, peer = %peer, "session accepted");

            let ctx = Arc::clone(&self.ctx);
            let active = Arc::clone(&self.active);
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                session::run(id, stream, ctx, active).await;
                drop(permit);
                this.set_session_gauge();
            });
        }
        drop(listener);

        poller.abort();
    }

    /// Waits up to `grace` for in-flight sessions to finish. Returns
    /// whether the drain completed.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let all = self.max_sessions as u32;
        match tokio::time::timeout(grace, self.session_permits.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                info!("all sessions drained");
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                warn!("shutdown grace expired with sessions still active");
                false
            }
        }
    }

    fn active_sessions(&self) -> usize {
        self.max_sessions - self.session_permits.available_permits()
    }

    fn set_session_gauge(&self) {
        self.ctx
            .metrics
            .set_gauge(metrics::SESSIONS_ACTIVE, self.active_sessions() as f64);
    }

    /// Probes one connection per pool each interval and refreshes the
    /// status snapshot.
    async fn liveness_loop(&self) {
        while self.is_active() {
            tokio::time::sleep(self.check_interval).await;

            let mut live = 0usize;
            for pool in self.ctx.ring.pools() {
                // the pool enforces the probe deadline itself; cancelling
                // it from outside would lose the slot it holds mid-probe
                if pool.check_pool_state(self.probe_timeout).await {
                    live += 1;
                }
            }
            self.ctx
                .metrics
                .set_gauge(metrics::POOLS_LIVE, live as f64);

            let shards = self
                .ctx
                .ring
                .pools()
                .iter()
                .map(|p| ShardStatus {
                    endpoint: p.endpoint().to_string(),
                    live: p.is_live(),
                })
                .collect();
            let mut status = self.status.write().await;
            status.shards = shards;
            status.active_sessions = self.active_sessions();
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("active", &self.is_active())
            .field("shards", &self.ctx.ring.pools().len())
            .finish()
    }
}
