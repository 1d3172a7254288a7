//! A single authenticated channel to one server.
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bufstream::BufStream;
use log::trace;

use crate::connstring::Host;
use crate::error::{Error, Result};
use crate::stream::{Stream, StreamConnector};
use crate::wire_protocol::buffer::BufferPool;
use crate::wire_protocol::operations::Message;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// One TCP (or TLS) channel to a server.
///
/// A connection is owned by exactly one caller between pool checkout and
/// checkin, so at most one request is ever in flight: `send` records the
/// request id and `receive` insists the reply correlates to it. Any
/// transport or framing failure poisons the connection; a poisoned
/// connection is discarded at checkin instead of being reused.
pub struct Connection {
    /// Monotonic identifier, unique within the process.
    pub id: u64,
    pub host: Host,
    stream: BufStream<Stream>,
    // Request ids are unique within this connection, not across the client.
    request_counter: i32,
    created_at: Instant,
    last_used_at: Instant,
    /// The owning pool's generation at creation; stale generations are
    /// discarded at checkin.
    pub generation: usize,
    poisoned: bool,
    /// `source.username` keys of the credentials applied on this channel.
    pub authenticated_credentials: Vec<String>,
}

impl Connection {
    /// Opens a stream to `host` and applies the socket timeouts.
    pub fn connect(
        host: &Host,
        connector: &StreamConnector,
        socket_timeout: Option<Duration>,
        generation: usize,
    ) -> Result<Connection> {
        let stream = connector.connect(host)?;
        stream.set_read_timeout(socket_timeout).map_err(|e| {
            Error::SocketError(host.clone(), e)
        })?;
        stream.set_write_timeout(socket_timeout).map_err(|e| {
            Error::SocketError(host.clone(), e)
        })?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst);
        trace!("conn#{} opened to {}", id, host);

        let now = Instant::now();
        Ok(Connection {
            id: id,
            host: host.clone(),
            stream: BufStream::new(stream),
            request_counter: 0,
            created_at: now,
            last_used_at: now,
            generation: generation,
            poisoned: false,
            authenticated_credentials: Vec::new(),
        })
    }

    /// Returns the next request id for this connection; strictly increasing.
    pub fn next_request_id(&mut self) -> i32 {
        self.request_counter += 1;
        self.request_counter
    }

    /// Writes a fully assembled frame to the socket.
    ///
    /// The frame is staged in a pooled buffer so the socket sees one write.
    pub fn send(&mut self, message: &Message, buffers: &BufferPool) -> Result<()> {
        if self.poisoned {
            return Err(Error::InternalError(
                format!("conn#{} used after being poisoned", self.id),
            ));
        }

        let mut frame = buffers.take();
        let assembled = message.write(&mut frame);
        if let Err(err) = assembled {
            // Nothing reached the wire; the connection is still clean.
            buffers.give(frame);
            return Err(err);
        }

        let written = self.stream
            .write_all(&frame)
            .and_then(|_| self.stream.flush());
        buffers.give(frame);

        match written {
            Ok(()) => Ok(()),
            Err(err) => {
                self.poisoned = true;
                Err(Error::from_write(err, &self.host))
            }
        }
    }

    /// Reads one reply and checks it correlates to `response_to`.
    pub fn receive(&mut self, response_to: i32) -> Result<Message> {
        let message = match Message::read(&mut self.stream) {
            Ok(message) => message,
            Err(err) => {
                self.poisoned = true;
                return Err(match err {
                    Error::IoError(io_err) => Error::from_read(io_err, &self.host),
                    other => other,
                });
            }
        };

        let header = *message.header();
        if header.response_to != response_to {
            self.poisoned = true;
            return Err(Error::ResponseError(format!(
                "conn#{} expected a reply to request {} but read a reply to {}",
                self.id,
                response_to,
                header.response_to
            )));
        }

        Ok(message)
    }

    /// Sends `message` and waits for its correlated reply.
    pub fn round_trip(&mut self, message: &Message, buffers: &BufferPool) -> Result<Message> {
        self.send(message, buffers)?;
        self.receive(message.request_id())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Stamps the connection as just-used; called at checkin.
    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the idle or lifetime bound has been exceeded. `None` bounds
    /// are unlimited.
    pub fn is_expired(
        &self,
        max_idle_time: Option<Duration>,
        max_life_time: Option<Duration>,
    ) -> bool {
        if let Some(max_idle) = max_idle_time {
            if self.idle_for() >= max_idle {
                return true;
            }
        }
        if let Some(max_life) = max_life_time {
            if self.age() >= max_life {
                return true;
            }
        }
        false
    }
}
