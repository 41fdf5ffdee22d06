//! One client connection, as a pipelined state machine.
//!
//! Each session runs as a task pair: a reader that decodes inbound bytes
//! into command batches, and a consumer that handles them. The two talk
//! over a bounded batch queue plus a separate error queue the consumer
//! drains first. Forwarded commands go out as their exact original bytes
//! and responses come back strictly FIFO, so pipelined clients see
//! replies in the order they sent commands, regardless of which shard
//! answered first. Replies accumulate in an out-buffer and reach the
//! socket in one write per batch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use shoal_protocol::{reply, scan, Command, ProtocolError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Timeouts;
use crate::metrics::{self, MetricsSink};
use crate::pool::ConnectionPool;
use crate::pubsub::SubscriptionRegistry;
use crate::ring::HashRing;

/// Commands per decoded batch before the reader hands off.
const MAX_BATCH: usize = 64;

/// Bound on in-flight batches between reader and consumer.
const BATCH_QUEUE_DEPTH: usize = 16;

/// Ack for an unsubscribe when the session has no subscriptions.
const UNSUBSCRIBE_NONE: &[u8] = b"*3\r\n$11\r\nunsubscribe\r\n$-1\r\n:0\r\n";

/// Shared collaborators every session needs.
pub struct SessionContext {
    pub ring: Arc<HashRing>,
    pub registry: Arc<SubscriptionRegistry>,
    pub timeouts: Timeouts,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Runs one client session to completion. Fatal errors are logged here;
/// they never propagate to the accept loop.
pub async fn run(id: u64, stream: TcpStream, ctx: Arc<SessionContext>, active: Arc<AtomicBool>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(session = id, error = %e, "nodelay failed");
    }
    let (read_half, write_half) = stream.into_split();

    let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
    let (err_tx, err_rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
    let (sub_tx, sub_rx) = mpsc::channel(64);

    let reader = tokio::spawn(read_loop(
        read_half,
        batch_tx,
        err_tx,
        Arc::clone(&active),
        ctx.timeouts.client_read,
    ));

    let mut consumer = Consumer {
        id,
        write: write_half,
        ctx: Arc::clone(&ctx),
        session_db: 0,
        channels: Vec::new(),
        pending: VecDeque::new(),
        out: BytesMut::with_capacity(4096),
        sub_tx,
        alive: true,
    };
    if let Err(e) = consumer.run(batch_rx, err_rx, sub_rx, active).await {
        debug!(session = id, error = %e, "session ended with error");
    }

    // the consumer is done; the reader may still be blocked on the socket
    reader.abort();
    ctx.registry.unsubscribe_all(id, &consumer.channels).await;
    debug!(session = id, "session closed");
}

// ---------------------------------------------------------------------
// reader task
// ---------------------------------------------------------------------

/// Decodes inbound bytes into command batches. Read timeouts are not
/// errors; they only bound how long the loop blocks before re-checking
/// the shutdown flag.
///
/// A syntax error discards everything still buffered: unit boundaries
/// past malformed bytes are unknowable, so resynchronization waits for
/// the client's next write. Commands decoded ahead of the error are
/// handed off before the error is reported.
async fn read_loop(
    mut read: OwnedReadHalf,
    batch_tx: mpsc::Sender<Vec<Command>>,
    err_tx: mpsc::Sender<ProtocolError>,
    active: Arc<AtomicBool>,
    read_timeout: Duration,
) {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        // drain every complete unit currently buffered
        let mut batch = Vec::new();
        loop {
            if buf.is_empty() {
                break;
            }
            let frozen = buf.split().freeze();
            match scan(&frozen, false) {
                Ok(Some((unit, consumed))) => {
                    if consumed < frozen.len() {
                        buf.extend_from_slice(&frozen[consumed..]);
                    }
                    match Command::from_unit(unit) {
                        Ok(cmd) => {
                            batch.push(cmd);
                            if batch.len() >= MAX_BATCH {
                                if batch_tx.send(std::mem::take(&mut batch)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            // the unit itself was consumed; only its
                            // interpretation failed. Hand off what was
                            // decoded before it first.
                            if !batch.is_empty()
                                && batch_tx.send(std::mem::take(&mut batch)).await.is_err()
                            {
                                return;
                            }
                            if err_tx.send(e).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Ok(None) => {
                    // incomplete unit: put the bytes back, wait for more
                    buf.extend_from_slice(&frozen);
                    break;
                }
                Err(e) => {
                    // a syntax error discards the rest of the buffer;
                    // commands decoded ahead of it are handed off first
                    buf.clear();
                    if !batch.is_empty()
                        && batch_tx.send(std::mem::take(&mut batch)).await.is_err()
                    {
                        return;
                    }
                    if err_tx.send(e).await.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
        if !batch.is_empty() && batch_tx.send(batch).await.is_err() {
            return;
        }

        match tokio::time::timeout(read_timeout, read.read_buf(&mut buf)).await {
            Ok(Ok(0)) => return, // client disconnected
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "client read failed");
                return;
            }
            Err(_) => {
                if !active.load(Ordering::Acquire) {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// consumer task
// ---------------------------------------------------------------------

struct Consumer {
    id: u64,
    write: OwnedWriteHalf,
    ctx: Arc<SessionContext>,
    /// Database the client selected; applied to backends lazily.
    session_db: u32,
    /// Channels this session is subscribed to, in subscription order.
    channels: Vec<String>,
    /// Accepted commands awaiting forwarding, strictly FIFO.
    pending: VecDeque<Command>,
    /// Replies queued for the client, written once per batch.
    out: BytesMut,
    sub_tx: mpsc::Sender<Bytes>,
    alive: bool,
}

impl Consumer {
    async fn run(
        &mut self,
        mut batch_rx: mpsc::Receiver<Vec<Command>>,
        mut err_rx: mpsc::Receiver<ProtocolError>,
        mut sub_rx: mpsc::Receiver<Bytes>,
        active: Arc<AtomicBool>,
    ) -> std::io::Result<()> {
        while self.alive && active.load(Ordering::Acquire) {
            tokio::select! {
                biased;

                Some(err) = err_rx.recv() => {
                    warn!(session = self.id, error = %err, "protocol error from client");
                    // the reader queues decoded batches before reporting
                    // an error, so anything in the batch queue right now
                    // predates the bad unit. Answer it first.
                    while let Ok(batch) = batch_rx.try_recv() {
                        for cmd in batch {
                            self.handle(cmd).await;
                            if !self.alive {
                                break;
                            }
                        }
                        if !self.alive {
                            break;
                        }
                    }
                    self.flush_pending().await;
                    reply::write_error("Protocol error", &mut self.out);
                }

                maybe_batch = batch_rx.recv() => {
                    match maybe_batch {
                        Some(batch) => {
                            for cmd in batch {
                                self.handle(cmd).await;
                                if !self.alive {
                                    break;
                                }
                            }
                        }
                        None => break, // reader gone: client closed or errored
                    }
                }

                Some(push) = sub_rx.recv() => {
                    self.out.extend_from_slice(&push);
                }
            }

            // forward only once both inbound queues are quiet, so a burst
            // of pipelined commands is relayed in one pass
            if self.alive && err_rx.is_empty() && batch_rx.is_empty() && !self.pending.is_empty() {
                self.flush_pending().await;
            }
            self.write_out().await?;
        }
        self.flush_pending().await;
        self.write_out().await
    }

    async fn handle(&mut self, cmd: Command) {
        // while subscribed, everything except subscribe/unsubscribe gets
        // the same reply as an unsupported command
        if !self.channels.is_empty() && !cmd.is(b"subscribe") && !cmd.is(b"unsubscribe") {
            self.out.extend_from_slice(reply::ERR_UNSUPPORTED);
            return;
        }

        if cmd.is(b"ping") && cmd.arg_count() == 0 {
            self.flush_pending().await;
            self.out.extend_from_slice(reply::PONG);
            return;
        }
        if cmd.is(b"quit") {
            self.flush_pending().await;
            self.out.extend_from_slice(reply::OK);
            self.alive = false;
            return;
        }
        if cmd.is(b"select") {
            self.flush_pending().await;
            self.handle_select(&cmd);
            return;
        }
        if cmd.is(b"subscribe") {
            self.flush_pending().await;
            self.handle_subscribe(&cmd).await;
            return;
        }
        if cmd.is(b"unsubscribe") {
            self.flush_pending().await;
            self.handle_unsubscribe(&cmd).await;
            return;
        }

        let multiplexing = self.ctx.ring.is_multiplexing();
        if !crate::classify::is_supported(cmd.name(), multiplexing, cmd.has_multiple_args()) {
            self.ctx.metrics.incr_counter(metrics::COMMANDS_REJECTED, 1);
            self.out.extend_from_slice(reply::ERR_UNSUPPORTED);
            return;
        }

        self.pending.push_back(cmd);
    }

    /// SELECT is answered locally and applied to backends lazily, the
    /// next time a command reaches a backend on a different database.
    fn handle_select(&mut self, cmd: &Command) {
        let db = cmd
            .first_arg()
            .filter(|_| cmd.arg_count() == 1)
            .and_then(|arg| std::str::from_utf8(arg).ok())
            .and_then(|s| s.parse::<u32>().ok());
        match db {
            Some(db) => {
                self.session_db = db;
                self.out.extend_from_slice(reply::OK);
            }
            None => reply::write_error("invalid DB index", &mut self.out),
        }
    }

    async fn handle_subscribe(&mut self, cmd: &Command) {
        // one channel per command; the multi-channel form is rejected
        // like any other unsupported shape
        let Some(channel) = cmd.first_arg().filter(|_| cmd.arg_count() == 1) else {
            self.out.extend_from_slice(reply::ERR_UNSUPPORTED);
            return;
        };
        let channel = String::from_utf8_lossy(channel).into_owned();

        self.ctx
            .registry
            .subscribe(&channel, self.id, self.sub_tx.clone())
            .await;
        if !self.channels.contains(&channel) {
            self.channels.push(channel.clone());
        }

        reply::write_subscription_ack(
            b"subscribe",
            channel.as_bytes(),
            self.channels.len() as i64,
            &mut self.out,
        );
    }

    async fn handle_unsubscribe(&mut self, cmd: &Command) {
        if cmd.arg_count() > 1 {
            self.out.extend_from_slice(reply::ERR_UNSUPPORTED);
            return;
        }

        if cmd.arg_count() == 0 {
            // bare unsubscribe drops every subscription, one ack each
            if self.channels.is_empty() {
                self.out.extend_from_slice(UNSUBSCRIBE_NONE);
                return;
            }
            while let Some(channel) = self.channels.pop() {
                self.ctx.registry.unsubscribe(&channel, self.id).await;
                reply::write_subscription_ack(
                    b"unsubscribe",
                    channel.as_bytes(),
                    self.channels.len() as i64,
                    &mut self.out,
                );
            }
            return;
        }

        let Some(arg) = cmd.first_arg() else {
            self.out.extend_from_slice(reply::ERR_UNSUPPORTED);
            return;
        };
        let channel = String::from_utf8_lossy(arg).into_owned();
        if let Some(pos) = self.channels.iter().position(|c| *c == channel) {
            self.channels.remove(pos);
            self.ctx.registry.unsubscribe(&channel, self.id).await;
        }
        reply::write_subscription_ack(
            b"unsubscribe",
            channel.as_bytes(),
            self.channels.len() as i64,
            &mut self.out,
        );
    }

    /// Forwards every pending command in order, queuing each response
    /// before the next command goes out.
    async fn flush_pending(&mut self) {
        while let Some(cmd) = self.pending.pop_front() {
            self.forward(cmd).await;
        }
    }

    /// Forwards one command's raw bytes to its routed shard and copies
    /// the response back verbatim. Backend failures degrade to a
    /// connection-down reply; they are never fatal to the session.
    async fn forward(&mut self, cmd: Command) {
        let pool: Option<Arc<ConnectionPool>> = match cmd.first_arg() {
            Some(key) => self.ctx.ring.route(key).cloned(),
            None => {
                let pool = self.ctx.ring.default_pool();
                pool.is_live().then(|| Arc::clone(pool))
            }
        };
        let Some(pool) = pool else {
            self.out.extend_from_slice(reply::ERR_CONNECTION_DOWN);
            return;
        };

        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(session = self.id, error = %e, "backend acquire failed");
                return self.backend_failed();
            }
        };

        if conn.selected_database() != self.session_db {
            if let Err(e) = conn.select_database(self.session_db).await {
                debug!(session = self.id, error = %e, "lazy select failed");
                pool.discard(conn);
                return self.backend_failed();
            }
        }

        if let Err(e) = conn.write_raw(cmd.raw()).await {
            debug!(session = self.id, error = %e, "backend write failed");
            pool.discard(conn);
            return self.backend_failed();
        }
        let unit = match conn.read_unit().await {
            Ok(unit) => unit,
            Err(e) => {
                debug!(session = self.id, error = %e, "backend read failed");
                pool.discard(conn);
                return self.backend_failed();
            }
        };

        self.out.extend_from_slice(unit.raw());
        pool.release(conn);
        self.ctx.metrics.incr_counter(metrics::COMMANDS_FORWARDED, 1);
    }

    fn backend_failed(&mut self) {
        self.ctx.metrics.incr_counter(metrics::BACKEND_ERRORS, 1);
        self.out.extend_from_slice(reply::ERR_CONNECTION_DOWN);
    }

    /// Writes everything queued for the client in one shot. A client
    /// write failure or timeout is the one fatal session error.
    async fn write_out(&mut self) -> std::io::Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let bytes = self.out.split();
        tokio::time::timeout(self.ctx.timeouts.client_write, self.write.write_all(&bytes))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "client write timeout"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn commands_ahead_of_a_syntax_error_are_handed_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = server.into_split();

        let (batch_tx, mut batch_rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
        let (err_tx, mut err_rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
        let active = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            read_half,
            batch_tx,
            err_tx,
            Arc::clone(&active),
            Duration::from_millis(200),
        ));

        // a good ping, a bulk with a corrupt terminator, then a quit the
        // error throws away
        client
            .write_all(b"*1\r\n$4\r\nping\r\n$3\r\nfoXY*1\r\n$4\r\nquit\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), batch_rx.recv())
            .await
            .unwrap()
            .expect("batch decoded before the error");
        assert_eq!(batch.len(), 1);
        assert!(batch[0].is(b"ping"));

        let err = tokio::time::timeout(Duration::from_secs(2), err_rx.recv())
            .await
            .unwrap()
            .expect("the syntax error itself");
        assert_eq!(err, ProtocolError::MissingTerminator);

        // everything buffered after the bad unit was discarded
        let rest = tokio::time::timeout(Duration::from_secs(2), batch_rx.recv())
            .await
            .unwrap();
        assert!(rest.is_none());
        reader.await.unwrap();
    }
}
