//! Cluster state: the set of known servers, their monitored descriptions,
//! and server selection against them.
pub mod monitor;
pub mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use bson::oid;
use log::debug;
use rand::Rng;

use crate::auth::Authenticator;
use crate::common::{ReadMode, ReadPreference};
use crate::connstring::Host;
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::options::ClientOptions;
use crate::stream::StreamConnector;
use crate::wire_protocol::buffer::BufferPool;

use self::server::{Server, ServerDescription, ServerType};

/// Servers whose smoothed round-trip time is within this band above the
/// fastest candidate are considered equivalent and chosen among at random.
pub const LATENCY_WINDOW_MS: i64 = 15;

/// Describes the type of topology for a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    Unknown,
}

/// What an operation needs from the server it selects.
#[derive(Clone, Debug)]
pub enum SelectionCriteria {
    /// A server that accepts writes.
    Write,
    /// A server satisfying the given read preference.
    Read(ReadPreference),
}

/// Everything needed to stand up a new `Server` when the topology discovers
/// one.
#[derive(Clone)]
pub struct ServerFactory {
    pub options: Arc<ClientOptions>,
    pub connector: StreamConnector,
    pub authenticator: Authenticator,
    pub credentials: Vec<Arc<Credential>>,
    pub buffers: Arc<BufferPool>,
    /// Suppressed in tests that drive descriptions by hand.
    pub run_monitors: bool,
}

/// Topology information gathered from server set monitoring.
pub struct TopologyDescription {
    pub ttype: TopologyType,
    /// The replica set name, required up front or learned from a member.
    pub set_name: String,
    servers: HashMap<Host, Server>,
    max_election_id: Option<oid::ObjectId>,
}

/// The shared, lock-guarded cluster state and its change signal.
pub struct TopologyState {
    description: Mutex<TopologyDescription>,
    // Signaled whenever any server description changes.
    change_signal: Condvar,
    closed: AtomicBool,
    factory: ServerFactory,
}

/// Holds status and connection information about a server set.
#[derive(Clone)]
pub struct Topology {
    state: Arc<TopologyState>,
}

impl TopologyDescription {
    fn new(set_name: String, ttype: TopologyType) -> TopologyDescription {
        TopologyDescription {
            ttype: ttype,
            set_name: set_name,
            servers: HashMap::new(),
            max_election_id: None,
        }
    }

    /// A point-in-time copy of every server and its description.
    fn snapshot(&self) -> Vec<(Server, ServerDescription)> {
        self.servers
            .values()
            .map(|server| (server.clone(), server.description_snapshot()))
            .collect()
    }

    // Applies one updated server description to the membership state
    // machine. Removed servers are collected rather than shut down inline,
    // so no pool or thread teardown happens under the topology lock.
    fn update(
        &mut self,
        host: Host,
        description: ServerDescription,
        state: &Arc<TopologyState>,
        removed: &mut Vec<Server>,
    ) {
        let stype = description.server_type;
        match self.ttype {
            TopologyType::Unknown => {
                match stype {
                    ServerType::Standalone => self.update_unknown_with_standalone(&host, removed),
                    ServerType::Mongos => self.ttype = TopologyType::Sharded,
                    ServerType::RSPrimary => {
                        self.update_rs_from_primary(host, description, state, removed)
                    }
                    ServerType::RSSecondary |
                    ServerType::RSArbiter |
                    ServerType::RSOther => {
                        self.update_rs_without_primary(host, description, state, removed)
                    }
                    _ => (),
                }
            }
            TopologyType::ReplicaSetNoPrimary => {
                match stype {
                    ServerType::Standalone | ServerType::Mongos => {
                        self.remove_server(&host, removed);
                    }
                    ServerType::RSPrimary => {
                        self.update_rs_from_primary(host, description, state, removed)
                    }
                    ServerType::RSSecondary |
                    ServerType::RSArbiter |
                    ServerType::RSOther => {
                        self.update_rs_without_primary(host, description, state, removed)
                    }
                    _ => (),
                }
            }
            TopologyType::ReplicaSetWithPrimary => {
                match stype {
                    ServerType::Standalone | ServerType::Mongos => {
                        self.remove_server(&host, removed);
                        self.check_if_has_primary();
                    }
                    ServerType::RSPrimary => {
                        self.update_rs_from_primary(host, description, state, removed)
                    }
                    ServerType::RSSecondary |
                    ServerType::RSArbiter |
                    ServerType::RSOther => {
                        self.update_rs_with_primary_from_member(host, description, removed)
                    }
                    _ => self.check_if_has_primary(),
                }
            }
            TopologyType::Sharded => {
                match stype {
                    ServerType::Unknown | ServerType::Mongos => (),
                    _ => {
                        self.remove_server(&host, removed);
                    }
                }
            }
            // A single-server topology mirrors its one server; membership
            // never changes.
            TopologyType::Single => (),
        }
    }

    fn remove_server(&mut self, host: &Host, removed: &mut Vec<Server>) {
        if let Some(server) = self.servers.remove(host) {
            debug!("removing {} from the topology", host);
            removed.push(server);
        }
    }

    // Sets the correct replica set topology type.
    fn check_if_has_primary(&mut self) {
        let has_primary = self.servers.values().any(|server| {
            server.description_snapshot().server_type == ServerType::RSPrimary
        });

        self.ttype = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    // Updates an unknown topology with a new standalone server description.
    fn update_unknown_with_standalone(&mut self, host: &Host, removed: &mut Vec<Server>) {
        if !self.servers.contains_key(host) {
            return;
        }

        if self.servers.len() == 1 {
            self.ttype = TopologyType::Single;
        } else {
            self.remove_server(host, removed);
        }
    }

    // Updates a replica set topology with a new primary server description.
    fn update_rs_from_primary(
        &mut self,
        host: Host,
        description: ServerDescription,
        state: &Arc<TopologyState>,
        removed: &mut Vec<Server>,
    ) {
        if !self.servers.contains_key(&host) {
            return;
        }

        if self.set_name.is_empty() {
            self.set_name = description.set_name.clone();
        } else if self.set_name != description.set_name {
            // The member does not belong to the configured or previously
            // discovered set.
            self.remove_server(&host, removed);
            self.check_if_has_primary();
            return;
        }

        if description.election_id.is_some() {
            if let Some(ref max_id) = self.max_election_id {
                if max_id > description.election_id.as_ref().unwrap() {
                    // Stale primary; ignore its claim.
                    if let Some(server) = self.servers.get(&host) {
                        if let Ok(mut locked) = server.description.write() {
                            locked.clear();
                        }
                    }
                    self.check_if_has_primary();
                    return;
                }
            }
            self.max_election_id = description.election_id.clone();
        }

        // Invalidate any other server still claiming to be primary.
        for (member_host, server) in &self.servers {
            if *member_host == host {
                continue;
            }
            if let Ok(mut locked) = server.description.write() {
                if locked.server_type == ServerType::RSPrimary {
                    locked.clear();
                }
            }
        }

        self.add_missing_hosts(&description, state);

        // Remove members the primary does not report.
        let reported = |h: &Host| {
            description.hosts.contains(h) || description.passives.contains(h) ||
                description.arbiters.contains(h)
        };
        let to_remove: Vec<Host> = self.servers
            .keys()
            .filter(|h| **h != host && !reported(h))
            .cloned()
            .collect();
        for host in to_remove {
            self.remove_server(&host, removed);
        }

        self.check_if_has_primary();
    }

    // Updates a replica set topology from a non-primary member report.
    fn update_rs_without_primary(
        &mut self,
        host: Host,
        description: ServerDescription,
        state: &Arc<TopologyState>,
        removed: &mut Vec<Server>,
    ) {
        self.ttype = TopologyType::ReplicaSetNoPrimary;

        if !self.servers.contains_key(&host) {
            return;
        }

        if self.set_name.is_empty() {
            self.set_name = description.set_name.clone();
        } else if self.set_name != description.set_name {
            self.remove_server(&host, removed);
            return;
        }

        self.add_missing_hosts(&description, state);

        if let Some(ref me) = description.me {
            if *me != host {
                self.remove_server(&host, removed);
            }
        }
    }

    // Updates a replica set topology with an updated member description
    // while a primary is known.
    fn update_rs_with_primary_from_member(
        &mut self,
        host: Host,
        description: ServerDescription,
        removed: &mut Vec<Server>,
    ) {
        if !self.servers.contains_key(&host) {
            return;
        }

        if self.set_name != description.set_name {
            self.remove_server(&host, removed);
            self.check_if_has_primary();
            return;
        }

        if let Some(ref me) = description.me {
            if *me != host {
                self.remove_server(&host, removed);
            }
        }

        self.check_if_has_primary();
    }

    // Begins monitoring reported members that are not yet known.
    fn add_missing_hosts(&mut self, description: &ServerDescription, state: &Arc<TopologyState>) {
        let all = description
            .hosts
            .iter()
            .chain(description.passives.iter())
            .chain(description.arbiters.iter());

        for host in all {
            if !self.servers.contains_key(host) {
                debug!("adding {} to the topology", host);
                let server = Server::new(
                    host.clone(),
                    &state.factory,
                    Arc::downgrade(state),
                    state.factory.run_monitors,
                );
                self.servers.insert(host.clone(), server);
            }
        }
    }

    // Servers eligible for the given criteria, before the latency window.
    fn suitable_servers(&self, criteria: &SelectionCriteria) -> Vec<(Server, ServerDescription)> {
        let snapshot = self.snapshot();

        // Against a routing tier every request goes to a router.
        if self.ttype == TopologyType::Sharded {
            return snapshot
                .into_iter()
                .filter(|&(_, ref desc)| desc.server_type == ServerType::Mongos)
                .collect();
        }

        match *criteria {
            SelectionCriteria::Write => {
                snapshot
                    .into_iter()
                    .filter(|&(_, ref desc)| desc.server_type.accepts_writes())
                    .collect()
            }
            SelectionCriteria::Read(ref pref) => Self::filter_by_read_preference(snapshot, pref),
        }
    }

    fn filter_by_read_preference(
        snapshot: Vec<(Server, ServerDescription)>,
        pref: &ReadPreference,
    ) -> Vec<(Server, ServerDescription)> {
        match pref.mode {
            ReadMode::Primary => Self::primaries(snapshot),
            ReadMode::Secondary => Self::tagged_secondaries(snapshot, pref),
            ReadMode::PrimaryPreferred => {
                let primaries = Self::primaries(snapshot.clone());
                if primaries.is_empty() {
                    Self::tagged_secondaries(snapshot, pref)
                } else {
                    primaries
                }
            }
            ReadMode::SecondaryPreferred => {
                let secondaries = Self::tagged_secondaries(snapshot.clone(), pref);
                if secondaries.is_empty() {
                    Self::primaries(snapshot)
                } else {
                    secondaries
                }
            }
            ReadMode::Nearest => {
                let candidates: Vec<_> = snapshot
                    .into_iter()
                    .filter(|&(_, ref desc)| match desc.server_type {
                        ServerType::RSPrimary |
                        ServerType::RSSecondary |
                        ServerType::Standalone |
                        ServerType::Mongos => true,
                        _ => false,
                    })
                    .collect();
                Self::apply_tag_sets(candidates, pref)
            }
        }
    }

    fn primaries(snapshot: Vec<(Server, ServerDescription)>) -> Vec<(Server, ServerDescription)> {
        snapshot
            .into_iter()
            .filter(|&(_, ref desc)| match desc.server_type {
                ServerType::RSPrimary | ServerType::Standalone | ServerType::Mongos => true,
                _ => false,
            })
            .collect()
    }

    fn tagged_secondaries(
        snapshot: Vec<(Server, ServerDescription)>,
        pref: &ReadPreference,
    ) -> Vec<(Server, ServerDescription)> {
        let secondaries: Vec<_> = snapshot
            .into_iter()
            .filter(|&(_, ref desc)| {
                desc.server_type == ServerType::RSSecondary
            })
            .collect();
        Self::apply_tag_sets(secondaries, pref)
    }

    // The first tag set matched by at least one candidate defines the
    // filter; standalones and routers are never tag-filtered.
    fn apply_tag_sets(
        candidates: Vec<(Server, ServerDescription)>,
        pref: &ReadPreference,
    ) -> Vec<(Server, ServerDescription)> {
        if pref.tag_sets.is_empty() {
            return candidates;
        }

        let exempt = |desc: &ServerDescription| match desc.server_type {
            ServerType::Standalone | ServerType::Mongos => true,
            _ => false,
        };

        for tag_set in &pref.tag_sets {
            let matched: Vec<_> = candidates
                .iter()
                .filter(|&&(_, ref desc)| {
                    exempt(desc) || desc.matches_tags(tag_set)
                })
                .cloned()
                .collect();
            if !matched.is_empty() {
                return matched;
            }
        }

        Vec::new()
    }
}

impl TopologyState {
    /// Folds an updated server description into the cluster state and wakes
    /// every thread parked in server selection.
    pub fn apply_update(state: &Arc<TopologyState>, host: Host, description: ServerDescription) {
        let mut removed = Vec::new();
        {
            let mut locked = match state.description.lock() {
                Ok(locked) => locked,
                Err(_) => return,
            };
            locked.update(host, description, state, &mut removed);
        }
        // Pools are closed and monitors stopped only after the topology
        // lock is released; the threads exit on their own.
        for server in removed {
            server.shutdown();
        }
        state.change_signal.notify_all();
    }
}

impl Topology {
    /// Stands up the topology from the seed list.
    ///
    /// The initial type is fixed by the configuration: one seed with no
    /// required set name is a single-server topology, a required set name
    /// forces replica-set monitoring, and anything else starts out unknown.
    pub fn new(seeds: Vec<Host>, factory: ServerFactory) -> Result<Topology> {
        if seeds.is_empty() {
            return Err(Error::ArgumentError(
                "At least one seed host is required.".to_owned(),
            ));
        }

        let set_name = factory
            .options
            .required_replica_set_name
            .clone()
            .unwrap_or_default();

        let ttype = if !set_name.is_empty() {
            TopologyType::ReplicaSetNoPrimary
        } else if seeds.len() == 1 {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        };

        let state = Arc::new(TopologyState {
            description: Mutex::new(TopologyDescription::new(set_name, ttype)),
            change_signal: Condvar::new(),
            closed: AtomicBool::new(false),
            factory: factory,
        });

        {
            let mut locked = state.description.lock()?;
            for host in seeds {
                let server = Server::new(
                    host.clone(),
                    &state.factory,
                    Arc::downgrade(&state),
                    state.factory.run_monitors,
                );
                locked.servers.insert(host, server);
            }
        }

        Ok(Topology { state: state })
    }

    /// Feeds a server description into the state machine; the seam the
    /// monitors publish through.
    pub fn apply_server_description(&self, host: Host, description: ServerDescription) {
        if let Some(server) = self.server(&host) {
            if let Ok(mut locked) = server.description.write() {
                *locked = description.clone();
            }
        }
        TopologyState::apply_update(&self.state, host, description);
    }

    /// The current topology type and per-server descriptions.
    pub fn description_snapshot(&self) -> (TopologyType, Vec<(Host, ServerDescription)>) {
        match self.state.description.lock() {
            Ok(locked) => {
                let servers = locked
                    .servers
                    .iter()
                    .map(|(host, server)| (host.clone(), server.description_snapshot()))
                    .collect();
                (locked.ttype, servers)
            }
            Err(_) => (TopologyType::Unknown, Vec::new()),
        }
    }

    /// Looks up the server currently monitored at `host`.
    pub fn server(&self, host: &Host) -> Option<Server> {
        self.state
            .description
            .lock()
            .ok()
            .and_then(|locked| locked.servers.get(host).cloned())
    }

    /// Selects a server satisfying `criteria`, waiting for the topology to
    /// change for up to the configured `max_wait_time`.
    pub fn select_server(&self, criteria: &SelectionCriteria) -> Result<Server> {
        self.select_server_with_deadline(
            criteria,
            Instant::now() + self.state.factory.options.max_wait_time,
        )
    }

    /// Selects a server satisfying `criteria`, waiting until `deadline`.
    pub fn select_server_with_deadline(
        &self,
        criteria: &SelectionCriteria,
        deadline: Instant,
    ) -> Result<Server> {
        let mut locked = self.state.description.lock()?;

        loop {
            if self.state.closed.load(Ordering::SeqCst) {
                return Err(Error::NoServerAvailable(
                    "the client has been closed".to_owned(),
                ));
            }

            let candidates = locked.suitable_servers(criteria);
            if let Some(server) = pick_within_latency_window(candidates) {
                return Ok(server);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::NoServerAvailable(format!(
                    "no server satisfied {:?} in topology {:?}",
                    criteria,
                    locked.ttype
                )));
            }

            let (relocked, _) = self.state.change_signal.wait_timeout(locked, deadline - now)?;
            locked = relocked;
        }
    }

    /// Asks every monitor to probe immediately.
    pub fn request_update(&self) {
        if let Ok(locked) = self.state.description.lock() {
            for server in locked.servers.values() {
                server.request_update();
            }
        }
    }

    /// Stops monitoring, closes every pool, fails parked selections, and
    /// joins the worker threads.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);

        let servers: Vec<Server> = match self.state.description.lock() {
            Ok(locked) => locked.servers.values().cloned().collect(),
            Err(_) => Vec::new(),
        };

        // Pools and monitors are shut down outside the topology lock.
        for server in &servers {
            server.shutdown();
        }
        self.state.change_signal.notify_all();
        for server in &servers {
            server.join_threads();
        }
    }
}

// Keeps every candidate within LATENCY_WINDOW_MS of the fastest one, then
// picks uniformly at random.
fn pick_within_latency_window(candidates: Vec<(Server, ServerDescription)>) -> Option<Server> {
    if candidates.is_empty() {
        return None;
    }

    let fastest = candidates
        .iter()
        .filter_map(|&(_, ref desc)| desc.round_trip_time)
        .min();

    let eligible: Vec<Server> = match fastest {
        Some(fastest) => {
            candidates
                .into_iter()
                .filter(|&(_, ref desc)| match desc.round_trip_time {
                    Some(rtt) => rtt <= fastest + LATENCY_WINDOW_MS,
                    None => false,
                })
                .map(|(server, _)| server)
                .collect()
        }
        // No candidate has been timed yet; they are all equivalent.
        None => candidates.into_iter().map(|(server, _)| server).collect(),
    };

    let index = rand::thread_rng().gen_range(0, eligible.len());
    eligible.into_iter().nth(index)
}
