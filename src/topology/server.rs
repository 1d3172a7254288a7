//! Per-server state: the live description, the connection pool, and the
//! monitor that keeps both fresh.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Instant;

use bson::oid;

use crate::auth::Authenticator;
use crate::connstring::Host;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::wire_protocol::operations::{MessageLimits, DEFAULT_MAX_DOCUMENT_SIZE,
                                       DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_WRITE_BATCH_SIZE};

use super::monitor::{IsMasterResult, Monitor};
use super::{ServerFactory, TopologyState};

/// Round-trip time is smoothed with an exponentially weighted moving
/// average. A divisor of 5 places roughly 85% of the weight on the 9 most
/// recent observations while staying in integer arithmetic.
pub const ROUND_TRIP_DIVISOR: i64 = 5;

/// Describes the server role within a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerType {
    /// Standalone server.
    Standalone,
    /// Shard router.
    Mongos,
    /// Replica set primary.
    RSPrimary,
    /// Replica set secondary.
    RSSecondary,
    /// Replica set arbiter.
    RSArbiter,
    /// Replica set member of some other type.
    RSOther,
    /// Replica set ghost member.
    RSGhost,
    /// Server type is currently unknown.
    Unknown,
}

impl ServerType {
    /// Whether writes may be directed at a server of this type.
    pub fn accepts_writes(&self) -> bool {
        match *self {
            ServerType::Standalone | ServerType::Mongos | ServerType::RSPrimary => true,
            _ => false,
        }
    }
}

/// Server information gathered from monitoring.
///
/// A description is never mutated in place once published; the monitor
/// builds a replacement and swaps it in under the server's lock.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    /// The server type.
    pub server_type: ServerType,
    /// Whether the last probe succeeded.
    pub ok: bool,
    /// Any error encountered while monitoring this server.
    pub err: Arc<Option<Error>>,
    /// Smoothed round-trip time of the monitor probe, in milliseconds.
    pub round_trip_time: Option<i64>,
    /// The minimum wire version supported by this server.
    pub min_wire_version: i64,
    /// The maximum wire version supported by this server.
    pub max_wire_version: i64,
    /// The canonical address the server reports for itself.
    pub me: Option<Host>,
    /// All hosts in the replica set known by this server.
    pub hosts: Vec<Host>,
    /// All passive members of the replica set known by this server.
    pub passives: Vec<Host>,
    /// All arbiters in the replica set known by this server.
    pub arbiters: Vec<Host>,
    /// Server tags for targeted read operations on specific members.
    pub tags: BTreeMap<String, String>,
    /// The replica set name.
    pub set_name: String,
    /// The server's current election id, if it believes it is a primary.
    pub election_id: Option<oid::ObjectId>,
    /// The server's opinion of who the primary is.
    pub primary: Option<Host>,
    pub max_bson_object_size: i64,
    pub max_message_size_bytes: i64,
    pub max_write_batch_size: i64,
}

impl ServerDescription {
    /// Returns a default, unknown server description.
    pub fn new() -> ServerDescription {
        ServerDescription {
            server_type: ServerType::Unknown,
            ok: false,
            err: Arc::new(None),
            round_trip_time: None,
            min_wire_version: 0,
            max_wire_version: 0,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            tags: BTreeMap::new(),
            set_name: String::new(),
            election_id: None,
            primary: None,
            max_bson_object_size: DEFAULT_MAX_DOCUMENT_SIZE as i64,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE as i64,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE as i64,
        }
    }

    /// Updates the description from an isMaster response and the probe's
    /// measured round-trip time.
    pub fn update(&mut self, ismaster: IsMasterResult, round_trip_time: i64) {
        if !ismaster.ok {
            self.set_err(Error::OperationError {
                message: "ismaster returned a not-ok response.".to_owned(),
                code: None,
                response: bson::Document::new(),
            });
            return;
        }

        self.ok = true;
        self.err = Arc::new(None);
        self.min_wire_version = ismaster.min_wire_version;
        self.max_wire_version = ismaster.max_wire_version;
        self.me = ismaster.me;
        self.hosts = ismaster.hosts;
        self.passives = ismaster.passives;
        self.arbiters = ismaster.arbiters;
        self.tags = ismaster.tags;
        self.set_name = ismaster.set_name;
        self.election_id = ismaster.election_id;
        self.primary = ismaster.primary;
        self.max_bson_object_size = ismaster.max_bson_object_size;
        self.max_message_size_bytes = ismaster.max_message_size_bytes;
        self.max_write_batch_size = ismaster.max_write_batch_size;

        self.round_trip_time = match self.round_trip_time {
            // (rtt / div) + (old_rtt * (div-1)/div)
            Some(old_rtt) => {
                Some(
                    round_trip_time / ROUND_TRIP_DIVISOR +
                        (old_rtt / ROUND_TRIP_DIVISOR) * (ROUND_TRIP_DIVISOR - 1),
                )
            }
            None => Some(round_trip_time),
        };

        let set_name_empty = self.set_name.is_empty();

        self.server_type = if ismaster.msg == "isdbgrid" {
            ServerType::Mongos
        } else if ismaster.is_master && !set_name_empty {
            ServerType::RSPrimary
        } else if ismaster.is_secondary && !set_name_empty {
            ServerType::RSSecondary
        } else if ismaster.arbiter_only && !set_name_empty {
            ServerType::RSArbiter
        } else if !set_name_empty {
            ServerType::RSOther
        } else if ismaster.is_replica_set {
            ServerType::RSGhost
        } else {
            ServerType::Standalone
        }
    }

    /// Records a monitoring error and reverts the server type to Unknown.
    pub fn set_err(&mut self, err: Error) {
        self.err = Arc::new(Some(err));
        self.clear();
    }

    // Reset the server type to unknown.
    pub fn clear(&mut self) {
        self.ok = false;
        self.election_id = None;
        self.round_trip_time = None;
        self.server_type = ServerType::Unknown;
        self.set_name = String::new();
    }

    /// The frame limits outbound messages to this server must honor.
    pub fn message_limits(&self) -> MessageLimits {
        MessageLimits {
            max_document_size: self.max_bson_object_size as i32,
            max_message_size: self.max_message_size_bytes as i32,
            max_write_batch_size: self.max_write_batch_size as usize,
        }
    }

    /// Whether this server's tags are a superset of `tag_set`.
    pub fn matches_tags(&self, tag_set: &BTreeMap<String, String>) -> bool {
        tag_set.iter().all(|(key, val)| {
            self.tags.get(key).map_or(false, |v| v == val)
        })
    }
}

impl Default for ServerDescription {
    fn default() -> Self {
        ServerDescription::new()
    }
}

/// Holds status and connection information about a single server.
#[derive(Clone)]
pub struct Server {
    /// Host connection details.
    pub host: Host,
    /// Monitored server information.
    pub description: Arc<RwLock<ServerDescription>>,
    /// The connection pool for this server.
    pool: Arc<ConnectionPool>,
    monitor_running: Arc<AtomicBool>,
    monitor: Arc<Monitor>,
    // Joined when the topology closes.
    threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl Server {
    /// Creates the server, its pool, and (unless suppressed for tests) its
    /// monitor and pool-maintenance threads.
    pub fn new(
        host: Host,
        factory: &ServerFactory,
        topology: Weak<TopologyState>,
        run_monitor: bool,
    ) -> Server {
        let description = Arc::new(RwLock::new(ServerDescription::new()));

        let pool = Arc::new(ConnectionPool::new(
            host.clone(),
            factory.connector.clone(),
            factory.authenticator.clone(),
            factory.credentials.clone(),
            factory.buffers.clone(),
            factory.options.clone(),
        ));

        let monitor = Arc::new(Monitor::new(
            host.clone(),
            pool.clone(),
            description.clone(),
            topology,
            factory,
        ));

        let mut threads = Vec::new();
        if run_monitor {
            let monitor_clone = monitor.clone();
            let handle = thread::Builder::new()
                .name(format!("monitor-{}", host))
                .spawn(move || monitor_clone.run())
                .expect("failed to spawn server monitor thread");
            threads.push(handle);
            threads.push(pool.spawn_maintenance());
        }

        Server {
            host: host,
            description: description,
            monitor_running: monitor.running.clone(),
            monitor: monitor,
            pool: pool,
            threads: Arc::new(Mutex::new(threads)),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Checks a connection out of this server's pool.
    pub fn acquire_connection(&self) -> Result<PooledConnection> {
        self.pool.check_out()
    }

    /// Checks a connection out, bounded by an operation deadline.
    pub fn acquire_connection_with_deadline(&self, deadline: Instant) -> Result<PooledConnection> {
        self.pool.check_out_with_deadline(deadline)
    }

    /// A point-in-time copy of the server description.
    pub fn description_snapshot(&self) -> ServerDescription {
        match self.description.read() {
            Ok(locked) => locked.clone(),
            Err(_) => ServerDescription::new(),
        }
    }

    /// Asks the monitor to probe ahead of its next scheduled heartbeat.
    pub fn request_update(&self) {
        self.monitor.request_update();
    }

    /// Stops the monitor and closes the pool. Threads are joined by
    /// `join_threads`.
    pub fn shutdown(&self) {
        self.monitor_running.store(false, Ordering::SeqCst);
        self.monitor.request_update();
        self.pool.close();
    }

    /// Joins the monitor and maintenance threads; call after `shutdown`.
    pub fn join_threads(&self) {
        if let Ok(mut threads) = self.threads.lock() {
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }
    }
}
