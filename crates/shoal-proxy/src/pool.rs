//! Bounded, concurrency-safe pool of backend connections to one shard.
//!
//! The pool's queue is the sole arbiter of connection ownership: a
//! checked-out connection belongs exclusively to its caller until
//! released or discarded, and connections never hold a reference back to
//! the pool. Slots cycle between a live connection and a dead
//! placeholder; dead slots reconnect lazily on acquire, so a shard
//! outage never poisons the pool; it just makes acquires fail until the
//! shard returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::backend::{BackendConnection, BackendError, BackendTimeouts};

/// One queue entry: a usable connection or a placeholder to reconnect.
enum Slot {
    Live(BackendConnection),
    Dead,
}

/// A bounded pool of connections to a single shard endpoint.
pub struct ConnectionPool {
    endpoint: String,
    capacity: usize,
    slots_tx: mpsc::Sender<Slot>,
    slots_rx: Mutex<mpsc::Receiver<Slot>>,
    /// Aggregated liveness from the periodic probe. Routing skips pools
    /// that are not live.
    live: AtomicBool,
    /// Bumped when the queue is drained; releases from an older
    /// generation turn into dead placeholders so stale connections are
    /// never reused.
    generation: AtomicU64,
    timeouts: BackendTimeouts,
}

impl ConnectionPool {
    /// Builds a pool of `capacity` slots and pre-fills it.
    ///
    /// Unreachable slots become dead placeholders rather than a hard
    /// startup failure; they reconnect lazily once the shard is
    /// reachable. The pool starts live only if at least one slot
    /// connected.
    pub async fn new(endpoint: String, capacity: usize, timeouts: BackendTimeouts) -> Self {
        let (slots_tx, slots_rx) = mpsc::channel(capacity);

        let mut connected = 0usize;
        for _ in 0..capacity {
            let slot = match BackendConnection::connect(&endpoint, timeouts).await {
                Ok(conn) => {
                    connected += 1;
                    Slot::Live(conn)
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "pool pre-fill connect failed");
                    Slot::Dead
                }
            };
            // capacity matches the channel bound, this cannot fail
            let _ = slots_tx.try_send(slot);
        }

        if connected == 0 {
            warn!(endpoint = %endpoint, "pool started with no reachable connections");
        }

        Self {
            endpoint,
            capacity,
            slots_tx,
            slots_rx: Mutex::new(slots_rx),
            live: AtomicBool::new(connected > 0),
            generation: AtomicU64::new(0),
            timeouts,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the shard behind this pool currently appears reachable.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    /// Checks a connection out of the pool, blocking until a slot is
    /// available. Dead slots are reconnected lazily; if the reconnect
    /// fails the placeholder goes back and the caller gets the error.
    pub async fn acquire(&self) -> Result<BackendConnection, BackendError> {
        let slot = {
            let mut rx = self.slots_rx.lock().await;
            // the sender side lives on self, so recv can only return None
            // if the pool itself is gone
            rx.recv().await.ok_or(BackendError::Closed)?
        };

        let generation = self.generation.load(Ordering::Acquire);
        match slot {
            Slot::Live(mut conn) => {
                conn.generation = generation;
                Ok(conn)
            }
            Slot::Dead => match BackendConnection::connect(&self.endpoint, self.timeouts).await {
                Ok(mut conn) => {
                    conn.generation = generation;
                    Ok(conn)
                }
                Err(e) => {
                    self.push_slot(Slot::Dead);
                    Err(e)
                }
            },
        }
    }

    /// Returns a healthy connection to the queue. If the pool was drained
    /// since this connection was checked out, the connection is stale:
    /// it is dropped and a dead placeholder keeps the slot count intact.
    pub fn release(&self, conn: BackendConnection) {
        if conn.generation == self.generation.load(Ordering::Acquire) {
            self.push_slot(Slot::Live(conn));
        } else {
            self.push_slot(Slot::Dead);
        }
    }

    /// Gives a slot back without its connection, after the caller hit an
    /// irrecoverable error on it. The connection is dropped; the slot
    /// reconnects on a later acquire.
    pub fn discard(&self, conn: BackendConnection) {
        drop(conn);
        self.push_slot(Slot::Dead);
    }

    fn push_slot(&self, slot: Slot) {
        // the queue holds at most `capacity` slots and every checked-out
        // connection accounts for exactly one, so this cannot overflow
        if self.slots_tx.try_send(slot).is_err() {
            warn!(endpoint = %self.endpoint, "pool slot dropped: queue unexpectedly full");
        }
    }

    /// Background health check: probe one connection and set aggregated
    /// liveness. On failure, every queued connection is drained to a dead
    /// placeholder so future acquires reconnect fresh.
    ///
    /// The probe deadline is enforced here, not by the caller: a slot is
    /// out of the queue while the probe runs, and an external timeout
    /// that cancelled this future mid-probe would lose the slot forever.
    /// The slot goes back regardless of how the probe ends.
    ///
    /// Non-blocking with respect to traffic: if every slot is checked
    /// out, the pool is clearly doing work and liveness is left as-is.
    pub async fn check_pool_state(&self, probe_timeout: Duration) -> bool {
        let slot = {
            let mut rx = self.slots_rx.lock().await;
            match rx.try_recv() {
                Ok(slot) => slot,
                Err(_) => return self.is_live(),
            }
        };

        let probed = tokio::time::timeout(probe_timeout, async {
            match slot {
                Slot::Live(mut conn) => conn.check_connection().await.then_some(conn),
                Slot::Dead => {
                    match BackendConnection::connect(&self.endpoint, self.timeouts).await {
                        Ok(mut conn) => conn.check_connection().await.then_some(conn),
                        Err(_) => None,
                    }
                }
            }
        })
        .await;

        let alive = match probed {
            Ok(Some(mut conn)) => {
                conn.generation = self.generation.load(Ordering::Acquire);
                self.push_slot(Slot::Live(conn));
                true
            }
            // probe failed or timed out: the connection (if any) is
            // dropped, but its slot always returns as a placeholder
            Ok(None) | Err(_) => {
                self.push_slot(Slot::Dead);
                false
            }
        };

        self.set_live(alive);
        if !alive {
            self.drain().await;
        }
        alive
    }

    /// Discards every queued connection, replacing each with a dead
    /// placeholder, and bumps the generation so in-flight releases
    /// cannot reintroduce stale connections.
    async fn drain(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut rx = self.slots_rx.lock().await;
        let mut drained = 0usize;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        drop(rx);
        for _ in 0..drained {
            self.push_slot(Slot::Dead);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("capacity", &self.capacity)
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use shoal_protocol::{scan, UnitKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn timeouts() -> BackendTimeouts {
        BackendTimeouts {
            connect: Duration::from_millis(300),
            read: Duration::from_millis(300),
            write: Duration::from_millis(300),
        }
    }

    /// Accepts connections forever and answers every PING with PONG.
    async fn pong_server(listener: TcpListener) {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = bytes::BytesMut::new();
                loop {
                    let Ok(n) = sock.read_buf(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    loop {
                        let frozen = bytes::Bytes::copy_from_slice(&buf);
                        match scan(&frozen, false) {
                            Ok(Some((unit, consumed))) => {
                                let _ = buf.split_to(consumed);
                                if matches!(unit.kind(), UnitKind::Array(Some(_))) {
                                    let _ = sock.write_all(b"+PONG\r\n").await;
                                }
                            }
                            _ => break,
                        }
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn prefill_and_acquire_release_cycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(pong_server(listener));

        let pool = ConnectionPool::new(addr, 2, timeouts()).await;
        assert!(pool.is_live());

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a);
        pool.release(b);

        // slots are reusable after release
        let c = pool.acquire().await.unwrap();
        pool.release(c);
    }

    #[tokio::test]
    async fn unreachable_endpoint_prefills_dead() {
        // a bound-then-released loopback port refuses connections; unlike
        // TEST-NET-3 this fails even behind transparent proxies
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let pool = ConnectionPool::new(addr, 2, timeouts()).await;
        assert!(!pool.is_live());
        // acquire reconnects lazily and reports the failure
        assert!(pool.acquire().await.is_err());
        // the slot went back as a placeholder; a second acquire still
        // finds a slot rather than hanging
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn probe_success_marks_live() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(pong_server(listener));

        let pool = ConnectionPool::new(addr, 1, timeouts()).await;
        pool.set_live(false);
        assert!(pool.check_pool_state(Duration::from_millis(300)).await);
        assert!(pool.is_live());
    }

    #[tokio::test]
    async fn probe_failure_drains_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(pong_server(listener));

        let pool = ConnectionPool::new(addr, 2, timeouts()).await;
        assert!(pool.is_live());

        // kill the backend, then probe
        server.abort();
        let _ = pool.check_pool_state(Duration::from_millis(300)).await;
        // probe against a dead backend eventually reports not-live; the
        // queue still holds placeholder slots so acquires don't hang
        let result = pool.acquire().await;
        drop(result);
    }

    #[tokio::test]
    async fn unresponsive_probe_does_not_lose_the_slot() {
        // a shard that accepts connections and reads but never replies,
        // so every probe runs into its deadline
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    while matches!(sock.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });

        let pool = ConnectionPool::new(addr, 1, timeouts()).await;
        assert!(pool.is_live());

        // probe deadline shorter than the connection's own read timeout
        assert!(!pool.check_pool_state(Duration::from_millis(50)).await);
        assert!(!pool.is_live());

        // the slot must be back in the queue: acquire reconnects instead
        // of blocking forever on an empty pool
        let conn = tokio::time::timeout(Duration::from_millis(800), pool.acquire())
            .await
            .expect("acquire must not hang after a timed-out probe")
            .unwrap();
        pool.release(conn);
    }

    #[tokio::test]
    async fn stale_release_becomes_placeholder() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(pong_server(listener));

        let pool = ConnectionPool::new(addr, 2, timeouts()).await;
        let conn = pool.acquire().await.unwrap();

        // drain while the connection is checked out
        pool.drain().await;

        // the release is a no-op for the connection itself: the slot
        // count is preserved but the stale connection is not reused
        pool.release(conn);
        let next = pool.acquire().await.unwrap();
        assert_eq!(next.selected_database(), 0);
        pool.release(next);
    }
}
