//! Channel subscription fan-out.
//!
//! Sessions never forward SUBSCRIBE/UNSUBSCRIBE to a backend themselves.
//! Instead the registry keeps one long-lived worker per channel with at
//! least one subscriber; the worker holds its own dedicated backend
//! connection (dialed directly at the routed pool's endpoint, never
//! checked out of the pool) and copies every published message verbatim
//! to all current subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::backend::{BackendConnection, BackendTimeouts};
use crate::metrics::{self, MetricsSink};
use crate::ring::HashRing;

/// How long an unbound worker sleeps before retrying to bind.
const REBIND_DELAY: Duration = Duration::from_millis(250);

/// How often a bound worker wakes from a quiet channel to check its stop
/// flag and subscriber count.
const IDLE_WAKE: Duration = Duration::from_millis(250);

/// Per-subscriber bound on fan-out delivery, so one slow client cannot
/// stall the rest.
const FANOUT_SEND_TIMEOUT: Duration = Duration::from_millis(50);

/// One session's delivery endpoint for published messages.
struct Subscriber {
    session_id: u64,
    tx: mpsc::Sender<Bytes>,
}

/// A channel with at least one subscriber and a worker reading it.
struct Subscription {
    channel: String,
    subscribers: Mutex<Vec<Subscriber>>,
    stop: AtomicBool,
}

impl Subscription {
    fn new(channel: String) -> Self {
        Self {
            channel,
            subscribers: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        }
    }

    /// Adds a subscriber, unless the subscription was already stopped.
    ///
    /// The stop check happens under the subscriber lock, the same lock
    /// [`Self::remove`] sets the flag under, so an add can never land on
    /// a subscription whose teardown was already decided.
    async fn add(&self, session_id: u64, tx: mpsc::Sender<Bytes>) -> bool {
        let mut subs = self.subscribers.lock().await;
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        // re-subscribing replaces the old endpoint
        subs.retain(|s| s.session_id != session_id);
        subs.push(Subscriber { session_id, tx });
        true
    }

    /// Removes one subscriber, compacting the set. The last removal marks
    /// the subscription stopped while still holding the subscriber lock.
    /// Returns the number of subscribers left.
    async fn remove(&self, session_id: u64) -> usize {
        let mut subs = self.subscribers.lock().await;
        if let Some(pos) = subs.iter().position(|s| s.session_id == session_id) {
            subs.swap_remove(pos);
        }
        if subs.is_empty() {
            self.stop.store(true, Ordering::Release);
        }
        subs.len()
    }

    /// Copies `raw` to every current subscriber. Delivery to each is
    /// time-bounded; a closed endpoint is compacted out.
    async fn fan_out(&self, raw: &Bytes) -> usize {
        let mut subs = self.subscribers.lock().await;
        let mut delivered = 0usize;
        let mut i = 0;
        while i < subs.len() {
            match subs[i]
                .tx
                .send_timeout(raw.clone(), FANOUT_SEND_TIMEOUT)
                .await
            {
                Ok(()) => {
                    delivered += 1;
                    i += 1;
                }
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    // slow client: this message is dropped for them, the
                    // subscription stays
                    debug!(
                        channel = %self.channel,
                        session = subs[i].session_id,
                        "subscriber too slow, message dropped"
                    );
                    i += 1;
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    subs.swap_remove(i);
                }
            }
        }
        delivered
    }
}

/// All live subscriptions, keyed by channel name.
pub struct SubscriptionRegistry {
    channels: StdMutex<HashMap<String, Arc<Subscription>>>,
    ring: Arc<HashRing>,
    timeouts: BackendTimeouts,
    metrics: Arc<dyn MetricsSink>,
}

impl SubscriptionRegistry {
    pub fn new(
        ring: Arc<HashRing>,
        timeouts: BackendTimeouts,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels: StdMutex::new(HashMap::new()),
            ring,
            timeouts,
            metrics,
        })
    }

    /// Adds a session to `channel`, spawning the channel's worker if this
    /// is its first subscriber. Messages arrive on `tx` as verbatim wire
    /// bytes.
    pub async fn subscribe(self: &Arc<Self>, channel: &str, session_id: u64, tx: mpsc::Sender<Bytes>) {
        loop {
            let (subscription, spawned) = {
                let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
                match map.get(channel) {
                    Some(existing) => (Arc::clone(existing), false),
                    None => {
                        let created = Arc::new(Subscription::new(channel.to_string()));
                        map.insert(channel.to_string(), Arc::clone(&created));
                        (created, true)
                    }
                }
            };

            if subscription.add(session_id, tx.clone()).await {
                if spawned {
                    let registry = Arc::clone(self);
                    tokio::spawn(async move {
                        registry.run_worker(subscription).await;
                    });
                }
                return;
            }

            // lost a race with the channel's last unsubscribe: the entry
            // we picked up is already stopped. Drop it and retry with a
            // fresh subscription.
            let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            if map
                .get(channel)
                .is_some_and(|s| Arc::ptr_eq(s, &subscription))
            {
                map.remove(channel);
            }
        }
    }

    /// Removes a session from `channel`. The last unsubscribe stops the
    /// worker and drops the channel entry.
    pub async fn unsubscribe(&self, channel: &str, session_id: u64) {
        let subscription = {
            let map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            map.get(channel).map(Arc::clone)
        };
        let Some(subscription) = subscription else {
            return;
        };

        // remove() marks the subscription stopped when the set empties
        if subscription.remove(session_id).await == 0 {
            let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            // only drop the entry if it is still the same subscription: a
            // concurrent re-subscribe may have replaced it
            if map
                .get(channel)
                .is_some_and(|s| Arc::ptr_eq(s, &subscription))
            {
                map.remove(channel);
            }
        }
    }

    /// Session teardown: removes the session from every named channel.
    pub async fn unsubscribe_all(&self, session_id: u64, channels: &[String]) {
        for channel in channels {
            self.unsubscribe(channel, session_id).await;
        }
    }

    /// Dials the routed shard directly and issues SUBSCRIBE, consuming
    /// the acknowledgement so the worker loop only ever sees published
    /// messages.
    async fn bind(&self, channel: &str) -> Option<BackendConnection> {
        let pool = self.ring.route(channel.as_bytes())?;
        let mut conn = match BackendConnection::connect(pool.endpoint(), self.timeouts).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(channel, endpoint = %pool.endpoint(), error = %e, "subscription bind failed");
                return None;
            }
        };

        let mut out = bytes::BytesMut::with_capacity(64);
        shoal_protocol::reply::write_command(&[b"subscribe", channel.as_bytes()], &mut out);
        if let Err(e) = conn.write_raw(&out).await {
            debug!(channel, error = %e, "subscribe write failed");
            return None;
        }
        match conn.read_unit().await {
            Ok(_ack) => Some(conn),
            Err(e) => {
                debug!(channel, error = %e, "subscribe ack read failed");
                None
            }
        }
    }

    /// The per-channel worker loop: bind, read, validate, fan out.
    async fn run_worker(&self, subscription: Arc<Subscription>) {
        let channel = subscription.channel.clone();
        debug!(channel = %channel, "subscription worker started");

        let mut bound: Option<BackendConnection> = None;
        while !subscription.stop.load(Ordering::Acquire) {
            let Some(conn) = bound.as_mut() else {
                bound = self.bind(&channel).await;
                if bound.is_none() {
                    tokio::time::sleep(REBIND_DELAY).await;
                }
                continue;
            };

            // wake periodically so a stopped worker does not linger on a
            // quiet channel
            let unit = tokio::select! {
                result = conn.read_unit_untimed() => result,
                _ = tokio::time::sleep(IDLE_WAKE) => continue,
            };

            match unit {
                Ok(unit) if is_published_message(&unit) => {
                    let raw = unit.raw().clone();
                    let delivered = subscription.fan_out(&raw).await;
                    self.metrics
                        .incr_counter(metrics::PUBSUB_MESSAGES, delivered as u64);
                }
                Ok(_) => {
                    // anything but a message array means the binding is
                    // stale
                    warn!(channel = %channel, "unexpected unit on subscription, rebinding");
                    if let Some(conn) = bound.take() {
                        conn.quit().await;
                    }
                }
                Err(e) => {
                    debug!(channel = %channel, error = %e, "subscription read failed, rebinding");
                    bound = None;
                }
            }
        }

        if let Some(conn) = bound.take() {
            conn.quit().await;
        }
        debug!(channel = %channel, "subscription worker stopped");
    }
}

/// A well-formed published message: a 3-element array whose first element
/// reads "message".
fn is_published_message(unit: &shoal_protocol::ProtocolUnit) -> bool {
    match unit.kind() {
        shoal_protocol::UnitKind::Array(Some(elems)) if elems.len() == 3 => elems[0]
            .string_value()
            .is_some_and(|s| s.as_ref() == b"message"),
        _ => false,
    }
}
