//! The driver handle and the per-operation session.
use std::sync::Arc;

use crate::auth::{Authenticator, SaslMechanism};
use crate::common::{ReadMode, ReadPreference, WriteConcern};
use crate::connstring::{self, ConnectionString};
use crate::credential::Credential;
use crate::error::Result;
use crate::options::ClientOptions;
use crate::pool::PooledConnection;
use crate::stream::StreamConnector;
use crate::topology::server::{Server, ServerDescription};
use crate::topology::{SelectionCriteria, ServerFactory, Topology};
use crate::wire_protocol::buffer::BufferPool;
use crate::wire_protocol::operations::MessageLimits;

/// Interfaces with a single server, replica set, or sharded routing tier.
///
/// Cheap to clone; all clones share the same topology, pools, and monitors.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    topology: Topology,
    options: Arc<ClientOptions>,
    buffers: Arc<BufferPool>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Monitors and pools outlive no client; close is idempotent.
        self.topology.close();
    }
}

impl Client {
    /// Creates a client from a connection string URI.
    pub fn with_uri(uri: &str) -> Result<Client> {
        let config = connstring::parse(uri)?;
        let options = ClientOptions::from_connstring(&config)?;
        let credential = Credential::from_connstring(&config)?;
        Client::with_config(&config, options, credential, None)
    }

    /// Creates a client from parsed configuration, optionally wiring in an
    /// externally negotiated SASL mechanism for GSSAPI credentials.
    pub fn with_config(
        config: &ConnectionString,
        options: ClientOptions,
        credential: Option<Credential>,
        external_sasl: Option<Arc<dyn SaslMechanism>>,
    ) -> Result<Client> {
        let options = Arc::new(options);
        let buffers = Arc::new(BufferPool::new());
        let connector = StreamConnector::new(
            Some(options.connect_timeout),
            options.socket_keep_alive,
        );

        let factory = ServerFactory {
            options: options.clone(),
            connector: connector,
            authenticator: Authenticator::new(external_sasl),
            credentials: credential.map(Arc::new).into_iter().collect(),
            buffers: buffers.clone(),
            run_monitors: true,
        };

        let topology = Topology::new(config.hosts.clone(), factory)?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                topology: topology,
                options: options,
                buffers: buffers,
            }),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.inner.buffers
    }

    /// The client-level write concern operations inherit.
    pub fn write_concern(&self) -> &WriteConcern {
        &self.inner.options.write_concern
    }

    /// The client-level read preference operations inherit.
    pub fn read_preference(&self) -> &ReadPreference {
        &self.inner.options.read_preference
    }

    /// Binds a session to a server that accepts writes.
    pub fn write_session(&self) -> Result<Session> {
        self.session(&SelectionCriteria::Write)
    }

    /// Binds a session to a server satisfying the read preference.
    pub fn read_session(&self, read_pref: &ReadPreference) -> Result<Session> {
        self.session(&SelectionCriteria::Read(read_pref.clone()))
    }

    /// Selects a server for `criteria` and binds a session to it.
    pub fn session(&self, criteria: &SelectionCriteria) -> Result<Session> {
        let server = self.inner.topology.select_server(criteria)?;
        let description = server.description_snapshot();

        // Reads addressed to a secondary must announce themselves.
        let slave_ok = match *criteria {
            SelectionCriteria::Read(ref pref) => pref.mode != ReadMode::Primary,
            SelectionCriteria::Write => false,
        };

        Ok(Session {
            server: server,
            description: description,
            slave_ok: slave_ok,
            buffers: self.inner.buffers.clone(),
        })
    }

    /// Shuts down monitoring and pooling; outstanding operations fail.
    pub fn close(&self) {
        self.inner.topology.close();
    }
}

/// A stateless handle binding one operation to the server selected for it.
pub struct Session {
    server: Server,
    description: ServerDescription,
    slave_ok: bool,
    buffers: Arc<BufferPool>,
}

impl Session {
    /// The server this session is bound to.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// The description the server was selected under.
    pub fn description(&self) -> &ServerDescription {
        &self.description
    }

    /// The frame limits outbound messages must honor.
    pub fn limits(&self) -> MessageLimits {
        self.description.message_limits()
    }

    /// Whether queries should carry the slaveOk flag.
    pub fn slave_ok(&self) -> bool {
        self.slave_ok
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Checks a connection out of the bound server's pool.
    pub fn connection(&self) -> Result<PooledConnection> {
        self.server.acquire_connection()
    }
}
