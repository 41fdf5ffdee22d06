//! One socket to one shard.
//!
//! A [`BackendConnection`] tracks which database the backend currently
//! has selected so the session layer can apply a client's SELECT lazily,
//! and offers a PING round-trip as a liveness probe. All I/O carries
//! independent connect/read/write timeouts; a timeout is fatal only to
//! this one connection instance: the caller discards it and the pool
//! reconnects lazily.

use std::time::Duration;

use bytes::BytesMut;
use shoal_protocol::{reply, scan, ProtocolError, ProtocolUnit, UnitKind};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Initial capacity for a backend connection's read buffer.
const READ_BUF_CAPACITY: usize = 4096;

/// Errors from backend connections and their pools.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Dial, read, or write failed at the socket level.
    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An I/O operation exceeded its timeout.
    #[error("backend timed out")]
    Timeout,

    /// The backend closed the connection.
    #[error("backend closed the connection")]
    Closed,

    /// The backend's reply bytes were not well-formed protocol.
    #[error("backend protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The backend replied, but not with what the operation requires
    /// (e.g. anything but `+OK` to a SELECT).
    #[error("unexpected reply from backend")]
    UnexpectedReply,
}

/// Timeouts applied to a backend connection's I/O.
#[derive(Debug, Clone, Copy)]
pub struct BackendTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

/// An established connection to one shard.
pub struct BackendConnection {
    endpoint: String,
    stream: TcpStream,
    read_buf: BytesMut,
    selected_database: u32,
    timeouts: BackendTimeouts,
    /// Pool generation this connection was checked out under. Set by the
    /// pool at acquire time; a release against a newer generation is a
    /// no-op. Connections never hold a reference back to their pool.
    pub(crate) generation: u64,
}

impl BackendConnection {
    /// Dials `endpoint` within the connect timeout. New connections start
    /// on database 0.
    pub async fn connect(
        endpoint: &str,
        timeouts: BackendTimeouts,
    ) -> Result<Self, BackendError> {
        let stream = tokio::time::timeout(timeouts.connect, TcpStream::connect(endpoint))
            .await
            .map_err(|_| BackendError::Timeout)??;
        stream.set_nodelay(true)?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            stream,
            read_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            selected_database: 0,
            timeouts,
            generation: 0,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The database the backend currently has selected on this socket.
    pub fn selected_database(&self) -> u32 {
        self.selected_database
    }

    /// Writes raw bytes within the write timeout.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), BackendError> {
        tokio::time::timeout(self.timeouts.write, self.stream.write_all(bytes))
            .await
            .map_err(|_| BackendError::Timeout)??;
        Ok(())
    }

    /// Reads one complete protocol unit within the read timeout.
    pub async fn read_unit(&mut self) -> Result<ProtocolUnit, BackendError> {
        tokio::time::timeout(self.timeouts.read, self.read_unit_untimed())
            .await
            .map_err(|_| BackendError::Timeout)?
    }

    /// Reads one complete protocol unit with no deadline. Used by the
    /// subscription workers, which may legitimately wait minutes for a
    /// message; they bound the wait themselves with a select.
    ///
    /// Cancel-safe: partial bytes stay in the read buffer, so a cancelled
    /// call can be retried without losing stream framing.
    pub async fn read_unit_untimed(&mut self) -> Result<ProtocolUnit, BackendError> {
        loop {
            if !self.read_buf.is_empty() {
                let frozen = self.read_buf.split().freeze();
                match scan(&frozen, false)? {
                    Some((unit, consumed)) => {
                        if consumed < frozen.len() {
                            self.read_buf.extend_from_slice(&frozen[consumed..]);
                        }
                        return Ok(unit);
                    }
                    None => {
                        // incomplete, put the bytes back and read more
                        self.read_buf.extend_from_slice(&frozen);
                    }
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(BackendError::Closed);
            }
        }
    }

    /// Switches the backend to database `db`, requiring an exact `+OK`
    /// within the read timeout.
    ///
    /// Any other reply, or a timeout, is fatal to this connection: the
    /// caller must discard it and never return it to the pool, because
    /// its selected database can no longer be trusted.
    pub async fn select_database(&mut self, db: u32) -> Result<(), BackendError> {
        let mut digits = itoa::Buffer::new();
        let mut out = BytesMut::with_capacity(32);
        reply::write_command(&[b"select", digits.format(db).as_bytes()], &mut out);

        self.write_raw(&out).await?;
        let unit = self.read_unit().await?;
        match unit.kind() {
            UnitKind::Status(s) if s.as_ref() == b"OK" => {
                self.selected_database = db;
                Ok(())
            }
            _ => Err(BackendError::UnexpectedReply),
        }
    }

    /// Liveness probe: PING and require exactly `+PONG`. Never panics;
    /// any failure simply reports the connection as not alive.
    pub async fn check_connection(&mut self) -> bool {
        let mut out = BytesMut::with_capacity(16);
        reply::write_command(&[b"ping"], &mut out);

        if let Err(e) = self.write_raw(&out).await {
            debug!(endpoint = %self.endpoint, error = %e, "liveness probe write failed");
            return false;
        }
        match self.read_unit().await {
            Ok(unit) => matches!(unit.kind(), UnitKind::Status(s) if s.as_ref() == b"PONG"),
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "liveness probe read failed");
                false
            }
        }
    }

    /// Best-effort QUIT before the connection is dropped, so the backend
    /// recycles it cleanly. Errors are ignored; the socket is going away
    /// either way.
    pub async fn quit(mut self) {
        let mut out = BytesMut::with_capacity(16);
        reply::write_command(&[b"quit"], &mut out);
        let _ = self.write_raw(&out).await;
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("endpoint", &self.endpoint)
            .field("selected_database", &self.selected_database)
            .finish_non_exhaustive()
    }
}
