//! Background health probing of a single server.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use bson::{Bson, oid};
use bson::{bson, doc};
use log::{debug, trace};

use crate::auth::Authenticator;
use crate::connection::Connection;
use crate::connstring::{self, Host};
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::options::ClientOptions;
use crate::pool::ConnectionPool;
use crate::stream::StreamConnector;
use crate::wire_protocol::buffer::BufferPool;
use crate::wire_protocol::flags::OpQueryFlags;
use crate::wire_protocol::operations::{Message, MessageLimits, DEFAULT_MAX_DOCUMENT_SIZE,
                                       DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_WRITE_BATCH_SIZE};

use super::server::ServerDescription;
use super::{ServerFactory, TopologyState};

/// The result of an isMaster probe.
#[derive(Clone, Debug, PartialEq)]
pub struct IsMasterResult {
    pub ok: bool,
    pub is_master: bool,
    pub max_bson_object_size: i64,
    pub max_message_size_bytes: i64,
    pub max_write_batch_size: i64,
    pub min_wire_version: i64,
    pub max_wire_version: i64,

    // Shards
    pub msg: String,

    // Replica sets
    pub is_replica_set: bool,
    pub is_secondary: bool,
    pub me: Option<Host>,
    pub hosts: Vec<Host>,
    pub passives: Vec<Host>,
    pub arbiters: Vec<Host>,
    pub arbiter_only: bool,
    pub tags: BTreeMap<String, String>,
    pub set_name: String,
    pub election_id: Option<oid::ObjectId>,
    pub primary: Option<Host>,
    pub hidden: bool,
}

impl IsMasterResult {
    /// Parses an isMaster response document from the server.
    pub fn new(doc: bson::Document) -> Result<IsMasterResult> {
        let mut result = IsMasterResult {
            ok: false,
            is_master: false,
            max_bson_object_size: DEFAULT_MAX_DOCUMENT_SIZE as i64,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE as i64,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE as i64,
            min_wire_version: 0,
            max_wire_version: 0,
            msg: String::new(),
            is_replica_set: false,
            is_secondary: false,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            arbiter_only: false,
            tags: BTreeMap::new(),
            set_name: String::new(),
            election_id: None,
            primary: None,
            hidden: false,
        };

        result.ok = match doc.get("ok") {
            Some(&Bson::FloatingPoint(v)) => v == 1.0,
            Some(&Bson::I32(v)) => v == 1,
            Some(&Bson::I64(v)) => v == 1,
            // Pre-command-shaped responses omit the flag on success.
            None => true,
            _ => false,
        };

        if let Some(&Bson::Boolean(b)) = doc.get("ismaster") {
            result.is_master = b;
        }

        if let Some(v) = int_field(&doc, "maxBsonObjectSize") {
            result.max_bson_object_size = v;
        }

        if let Some(v) = int_field(&doc, "maxMessageSizeBytes") {
            result.max_message_size_bytes = v;
        }

        if let Some(v) = int_field(&doc, "maxWriteBatchSize") {
            result.max_write_batch_size = v;
        }

        if let Some(v) = int_field(&doc, "minWireVersion") {
            result.min_wire_version = v;
        }

        if let Some(v) = int_field(&doc, "maxWireVersion") {
            result.max_wire_version = v;
        }

        if let Some(&Bson::String(ref s)) = doc.get("msg") {
            result.msg = s.to_owned();
        }

        if let Some(&Bson::Boolean(b)) = doc.get("secondary") {
            result.is_secondary = b;
        }

        if let Some(&Bson::Boolean(b)) = doc.get("isreplicaset") {
            result.is_replica_set = b;
        }

        if let Some(&Bson::String(ref s)) = doc.get("setName") {
            result.set_name = s.to_owned();
        }

        if let Some(&Bson::String(ref s)) = doc.get("me") {
            result.me = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::Array(ref arr)) = doc.get("hosts") {
            result.hosts = parse_host_array(arr);
        }

        if let Some(&Bson::Array(ref arr)) = doc.get("passives") {
            result.passives = parse_host_array(arr);
        }

        if let Some(&Bson::Array(ref arr)) = doc.get("arbiters") {
            result.arbiters = parse_host_array(arr);
        }

        if let Some(&Bson::String(ref s)) = doc.get("primary") {
            result.primary = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::Boolean(b)) = doc.get("arbiterOnly") {
            result.arbiter_only = b;
        }

        if let Some(&Bson::Boolean(b)) = doc.get("hidden") {
            result.hidden = b;
        }

        if let Some(&Bson::Document(ref tags)) = doc.get("tags") {
            for (k, v) in tags.iter() {
                if let Bson::String(ref tag) = *v {
                    result.tags.insert(k.to_owned(), tag.to_owned());
                }
            }
        }

        if let Some(&Bson::ObjectId(ref id)) = doc.get("electionId") {
            result.election_id = Some(id.clone());
        }

        Ok(result)
    }
}

fn int_field(doc: &bson::Document, key: &str) -> Option<i64> {
    match doc.get(key) {
        Some(&Bson::I32(v)) => Some(i64::from(v)),
        Some(&Bson::I64(v)) => Some(v),
        Some(&Bson::FloatingPoint(v)) => Some(v as i64),
        _ => None,
    }
}

fn parse_host_array(arr: &[Bson]) -> Vec<Host> {
    arr.iter()
        .filter_map(|bson| match *bson {
            Bson::String(ref s) => connstring::parse_host(s).ok(),
            _ => None,
        })
        .collect()
}

/// Monitors and updates server and topology information.
///
/// The monitor owns a dedicated connection that is never offered to the
/// pool. A failed probe invalidates the pool, publishes the server as
/// Unknown, and retries on the short reconnect cadence instead of the full
/// heartbeat interval.
pub struct Monitor {
    host: Host,
    pool: Arc<ConnectionPool>,
    server_description: Arc<RwLock<ServerDescription>>,
    topology: Weak<TopologyState>,
    connector: StreamConnector,
    authenticator: Authenticator,
    credentials: Vec<Arc<Credential>>,
    buffers: Arc<BufferPool>,
    options: Arc<ClientOptions>,
    pub running: Arc<AtomicBool>,
    // Interruptible sleep between heartbeats.
    sleep_lock: Mutex<bool>,
    sleep_signal: Condvar,
}

impl Monitor {
    pub fn new(
        host: Host,
        pool: Arc<ConnectionPool>,
        server_description: Arc<RwLock<ServerDescription>>,
        topology: Weak<TopologyState>,
        factory: &ServerFactory,
    ) -> Monitor {
        let mut connector = factory.connector.clone();
        connector.connect_timeout = Some(factory.options.heartbeat_connect_timeout);

        Monitor {
            host: host,
            pool: pool,
            server_description: server_description,
            topology: topology,
            connector: connector,
            authenticator: factory.authenticator.clone(),
            credentials: factory.credentials.clone(),
            buffers: factory.buffers.clone(),
            options: factory.options.clone(),
            // True from construction so a shutdown that races the thread's
            // first iteration is never lost.
            running: Arc::new(AtomicBool::new(true)),
            sleep_lock: Mutex::new(false),
            sleep_signal: Condvar::new(),
        }
    }

    /// Wakes the monitor ahead of its next scheduled probe.
    pub fn request_update(&self) {
        if let Ok(mut requested) = self.sleep_lock.lock() {
            *requested = true;
            self.sleep_signal.notify_all();
        }
    }

    /// The monitor loop. Runs until the topology shuts it down.
    pub fn run(&self) {
        let mut conn: Option<Connection> = None;

        while self.running.load(Ordering::SeqCst) {
            let probe = self.probe(&mut conn);

            let interval = match probe {
                Ok(description) => {
                    self.publish(description);
                    self.options.heartbeat_frequency
                }
                Err(err) => {
                    debug!("monitor probe of {} failed: {}", self.host, err);
                    conn = None;
                    // Stale pooled sockets are useless once the server is
                    // unreachable.
                    self.pool.invalidate();
                    self.publish_err(err);
                    self.options.heartbeat_connect_retry_frequency
                }
            };

            self.sleep(interval);
        }
    }

    // One probe: connect if necessary, run isMaster, fold the response into
    // a fresh description.
    fn probe(&self, conn: &mut Option<Connection>) -> Result<ServerDescription> {
        if conn.is_none() {
            *conn = Some(self.connect()?);
        }

        let result = {
            let live = conn.as_mut().unwrap();
            self.is_master(live)
        };

        match result {
            Ok((ismaster, rtt_millis)) => {
                let mut description = self.server_description.read()?.clone();
                description.update(ismaster, rtt_millis);
                trace!(
                    "monitor probe of {}: {:?} rtt={:?}ms",
                    self.host,
                    description.server_type,
                    description.round_trip_time
                );
                Ok(description)
            }
            Err(err) => {
                *conn = None;
                Err(err)
            }
        }
    }

    fn connect(&self) -> Result<Connection> {
        let mut conn = Connection::connect(
            &self.host,
            &self.connector,
            Some(self.options.heartbeat_socket_timeout),
            0,
        )?;

        if let Err(err) = self.authenticator.authenticate_all(
            &mut conn,
            &self.credentials,
            &self.buffers,
        )
        {
            // Credential trouble poisons the pool's connections too, but the
            // server stays in the topology so an operator can rotate
            // credentials without a restart.
            self.pool.invalidate();
            return Err(err);
        }

        Ok(conn)
    }

    // Runs isMaster on the dedicated connection, measuring round-trip time.
    fn is_master(&self, conn: &mut Connection) -> Result<(IsMasterResult, i64)> {
        let request_id = conn.next_request_id();
        let message = Message::new_query(
            request_id,
            OpQueryFlags::empty(),
            "local.$cmd".to_owned(),
            0,
            -1,
            doc! { "ismaster": 1 },
            None,
            &MessageLimits::default(),
        )?;

        let start = time::precise_time_ns();
        let reply = conn.round_trip(&message, &self.buffers)?;
        let rtt_millis = ((time::precise_time_ns() - start) / 1_000_000) as i64;

        let document = match reply {
            Message::OpReply { mut documents, .. } => {
                if documents.is_empty() {
                    return Err(Error::ResponseError(
                        "ismaster returned no response.".to_owned(),
                    ));
                }
                documents.remove(0)
            }
            _ => {
                return Err(Error::ResponseError(
                    "ismaster received a non-reply message.".to_owned(),
                ))
            }
        };

        Ok((IsMasterResult::new(document)?, rtt_millis))
    }

    // Swaps the fresh description in and lets the topology recompute
    // membership. The server lock is released before the topology lock is
    // taken.
    fn publish(&self, description: ServerDescription) {
        if let Ok(mut locked) = self.server_description.write() {
            *locked = description.clone();
        }

        if let Some(state) = self.topology.upgrade() {
            TopologyState::apply_update(&state, self.host.clone(), description);
        }
    }

    fn publish_err(&self, err: Error) {
        let description = {
            match self.server_description.write() {
                Ok(mut locked) => {
                    locked.set_err(err);
                    locked.clone()
                }
                Err(_) => return,
            }
        };

        if let Some(state) = self.topology.upgrade() {
            TopologyState::apply_update(&state, self.host.clone(), description);
        }
    }

    // Sleeps between heartbeats; request_update and shutdown cut it short.
    fn sleep(&self, duration: Duration) {
        let guard = match self.sleep_lock.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let mut requested = guard;
        if *requested {
            *requested = false;
            return;
        }

        if let Ok((mut guard, _)) = self.sleep_signal.wait_timeout(requested, duration) {
            *guard = false;
        }
    }
}
