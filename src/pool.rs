//! Bounded connection pooling for a single server.
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use log::{debug, warn};

use crate::auth::Authenticator;
use crate::connection::Connection;
use crate::connstring::Host;
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::options::ClientOptions;
use crate::stream::StreamConnector;
use crate::wire_protocol::buffer::BufferPool;

/// Handles threaded connections to one server address.
///
/// The pool is a bounded multiset: `total` never exceeds
/// `max_pool_size`, and at most `max_wait_queue_size` threads may block in
/// checkout at once. Idle connections are reused LIFO so warm sockets are
/// preferred. Connection opens and credential handshakes always happen
/// outside the pool mutex, with `total` reserved in advance.
#[derive(Clone)]
pub struct ConnectionPool {
    /// The server this pool connects to.
    pub host: Host,
    inner: Arc<Mutex<PoolInner>>,
    // Signaled whenever a connection is returned or a slot frees up.
    wait_lock: Arc<Condvar>,
    // Signaled only on close, to end the maintenance thread's sleep.
    shutdown_signal: Arc<Condvar>,
    connector: StreamConnector,
    authenticator: Authenticator,
    credentials: Vec<Arc<Credential>>,
    buffers: Arc<BufferPool>,
    options: Arc<ClientOptions>,
}

struct PoolInner {
    // Idle connections, most recently used last.
    available: Vec<Connection>,
    // Connections created and not yet destroyed, idle or checked out.
    total: usize,
    // Threads currently blocked in checkout.
    waiters: usize,
    // Bumped by invalidate(); connections from older generations are
    // discarded instead of reused.
    generation: usize,
    closed: bool,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.host)
            .finish()
    }
}

/// Holds a checked-out connection, returning it to the pool when dropped.
pub struct PooledConnection {
    // Always Some until drop or discard takes it.
    conn: Option<Connection>,
    pool: ConnectionPool,
}

impl Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn);
        }
    }
}

impl ConnectionPool {
    pub fn new(
        host: Host,
        connector: StreamConnector,
        authenticator: Authenticator,
        credentials: Vec<Arc<Credential>>,
        buffers: Arc<BufferPool>,
        options: Arc<ClientOptions>,
    ) -> ConnectionPool {
        ConnectionPool {
            host: host,
            inner: Arc::new(Mutex::new(PoolInner {
                available: Vec::new(),
                total: 0,
                waiters: 0,
                generation: 0,
                closed: false,
            })),
            wait_lock: Arc::new(Condvar::new()),
            shutdown_signal: Arc::new(Condvar::new()),
            connector: connector,
            authenticator: authenticator,
            credentials: credentials,
            buffers: buffers,
            options: options,
        }
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Acquires a connection, blocking up to the configured
    /// `max_wait_time` when the pool is saturated.
    pub fn check_out(&self) -> Result<PooledConnection> {
        self.check_out_with_deadline(Instant::now() + self.options.max_wait_time)
    }

    /// Acquires a connection, blocking until `deadline` at the latest.
    pub fn check_out_with_deadline(&self, deadline: Instant) -> Result<PooledConnection> {
        let mut locked = self.inner.lock()?;

        loop {
            if locked.closed {
                return Err(Error::PoolClosed(self.host.clone()));
            }

            // Reuse the warmest idle connection, discarding any that
            // expired or predate the last invalidation.
            while let Some(conn) = locked.available.pop() {
                let stale = conn.generation != locked.generation ||
                    conn.is_expired(
                        self.options.max_connection_idle_time,
                        self.options.max_connection_life_time,
                    );
                if stale {
                    locked.total -= 1;
                    drop(conn);
                    continue;
                }
                return Ok(self.wrap(conn));
            }

            // Create a new connection if the bound allows; the open and the
            // handshake run outside the lock with the slot reserved.
            if locked.total < self.options.max_pool_size {
                locked.total += 1;
                let generation = locked.generation;
                drop(locked);

                match self.open_connection(generation) {
                    Ok(conn) => return Ok(self.wrap(conn)),
                    Err(err) => {
                        let mut relocked = self.inner.lock()?;
                        relocked.total -= 1;
                        // The freed slot may unblock a waiter.
                        self.wait_lock.notify_one();
                        return Err(err);
                    }
                }
            }

            if locked.waiters >= self.options.max_wait_queue_size {
                return Err(Error::WaitQueueFull(self.host.clone()));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::WaitQueueTimeout(self.host.clone()));
            }

            locked.waiters += 1;
            let (relocked, wait_result) = self.wait_lock.wait_timeout(locked, deadline - now)?;
            locked = relocked;
            locked.waiters -= 1;

            if wait_result.timed_out() && locked.available.is_empty() &&
                locked.total >= self.options.max_pool_size && !locked.closed
            {
                return Err(Error::WaitQueueTimeout(self.host.clone()));
            }
        }
    }

    fn wrap(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
        }
    }

    // Opens and authenticates a new connection. Never called under the lock.
    fn open_connection(&self, generation: usize) -> Result<Connection> {
        let mut conn = Connection::connect(
            &self.host,
            &self.connector,
            self.options.socket_timeout,
            generation,
        )?;

        if let Err(err) = self.authenticator.authenticate_all(
            &mut conn,
            &self.credentials,
            &self.buffers,
        )
        {
            // Drop rather than pool a connection whose handshake failed.
            drop(conn);
            return Err(err);
        }

        Ok(conn)
    }

    // Returns a connection to the pool, or destroys it if it can no longer
    // be trusted.
    fn check_in(&self, mut conn: Connection) {
        conn.touch();

        let mut locked = match self.inner.lock() {
            Ok(locked) => locked,
            Err(_) => return,
        };

        let discard = locked.closed || conn.is_poisoned() ||
            conn.generation != locked.generation ||
            conn.is_expired(None, self.options.max_connection_life_time);

        if discard {
            locked.total -= 1;
            drop(conn);
        } else {
            locked.available.push(conn);
        }

        self.wait_lock.notify_one();
    }

    /// Closes all idle connections and marks checked-out ones for discard
    /// at checkin. The pool stays usable.
    pub fn invalidate(&self) {
        if let Ok(mut locked) = self.inner.lock() {
            locked.generation += 1;
            let drained = locked.available.len();
            locked.available.clear();
            locked.total -= drained;
            debug!("pool for {} invalidated, {} idle dropped", self.host, drained);
            self.wait_lock.notify_all();
        }
    }

    /// Shuts the pool down; every subsequent checkout fails with
    /// `PoolClosed`.
    pub fn close(&self) {
        if let Ok(mut locked) = self.inner.lock() {
            locked.closed = true;
            let drained = locked.available.len();
            locked.available.clear();
            locked.total -= drained;
            self.wait_lock.notify_all();
            self.shutdown_signal.notify_all();
        }
    }

    /// (total, available, waiters) under the lock, for diagnostics and
    /// tests.
    pub fn stats(&self) -> (usize, usize, usize) {
        match self.inner.lock() {
            Ok(locked) => (locked.total, locked.available.len(), locked.waiters),
            Err(_) => (0, 0, 0),
        }
    }

    /// Spawns the background task that prunes expired connections and keeps
    /// `min_pool_size` warm connections open. Ends when the pool closes.
    pub fn spawn_maintenance(&self) -> thread::JoinHandle<()> {
        let pool = self.clone();
        thread::Builder::new()
            .name(format!("pool-maintenance-{}", pool.host))
            .spawn(move || pool.run_maintenance())
            .expect("failed to spawn pool maintenance thread")
    }

    fn run_maintenance(&self) {
        loop {
            {
                let locked = match self.inner.lock() {
                    Ok(locked) => locked,
                    Err(_) => return,
                };
                if locked.closed {
                    return;
                }
                let (locked, _) = match self.shutdown_signal.wait_timeout(
                    locked,
                    self.options.maintenance_frequency,
                ) {
                    Ok(res) => res,
                    Err(_) => return,
                };
                if locked.closed {
                    return;
                }
            }

            self.perform_maintenance();
        }
    }

    /// One maintenance pass: close idle/expired connections, then top the
    /// pool back up to `min_pool_size`.
    pub fn perform_maintenance(&self) {
        let expired = {
            let mut locked = match self.inner.lock() {
                Ok(locked) => locked,
                Err(_) => return,
            };
            if locked.closed {
                return;
            }

            let generation = locked.generation;
            let idle = self.options.max_connection_idle_time;
            let life = self.options.max_connection_life_time;
            let (keep, expired): (Vec<_>, Vec<_>) =
                locked.available.drain(..).partition(|conn| {
                    conn.generation == generation && !conn.is_expired(idle, life)
                });
            locked.available = keep;
            locked.total -= expired.len();
            expired
        };

        if !expired.is_empty() {
            debug!(
                "pool for {} pruned {} expired connections",
                self.host,
                expired.len()
            );
            drop(expired);
            self.wait_lock.notify_all();
        }

        // Open replacements one at a time so a slow handshake never starves
        // the checkout path of slots.
        loop {
            let generation = {
                let mut locked = match self.inner.lock() {
                    Ok(locked) => locked,
                    Err(_) => return,
                };
                if locked.closed || locked.total >= self.options.min_pool_size {
                    return;
                }
                locked.total += 1;
                locked.generation
            };

            match self.open_connection(generation) {
                Ok(conn) => {
                    if let Ok(mut locked) = self.inner.lock() {
                        if locked.closed || conn.generation != locked.generation {
                            locked.total -= 1;
                            drop(conn);
                            return;
                        }
                        locked.available.push(conn);
                        self.wait_lock.notify_one();
                    }
                }
                Err(err) => {
                    warn!("pool for {} failed to open warm connection: {}", self.host, err);
                    if let Ok(mut locked) = self.inner.lock() {
                        locked.total -= 1;
                    }
                    return;
                }
            }
        }
    }
}
