//! Client-wide configuration.
//!
//! `ClientOptions` is an immutable value: it is built in one shot from a
//! parsed connection string (or from `Default`), and every validation runs at
//! construction time so a half-configured value never escapes.
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

use crate::common::{ReadMode, ReadPreference, TagSet, WriteConcern, W};
use crate::connstring::ConnectionString;
use crate::error::Error::ArgumentError;
use crate::error::Result;

/// Options understood by `ClientOptions::from_connstring`; anything else in
/// a URI produces a warning rather than a failure.
const RECOGNIZED_OPTIONS: &[&str] = &[
    "maxpoolsize",
    "minpoolsize",
    "waitqueuemultiple",
    "waitqueuetimeoutms",
    "connecttimeoutms",
    "sockettimeoutms",
    "socketkeepalive",
    "maxidletimems",
    "maxlifetimems",
    "heartbeatfrequencyms",
    "ssl",
    "replicaset",
    "slaveok",
    "readpreference",
    "readpreferencetags",
    "safe",
    "w",
    "wtimeout",
    "wtimeoutms",
    "fsync",
    "j",
    "authmechanism",
    "authsource",
];

/// Typed driver configuration with the documented defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Upper bound on the number of connections a single server's pool may
    /// hold.
    pub max_pool_size: usize,
    /// Number of warm connections maintenance keeps open per server.
    pub min_pool_size: usize,
    /// Upper bound on threads blocked in a pool's checkout at once.
    pub max_wait_queue_size: usize,
    /// How long a checkout or a server selection may block.
    pub max_wait_time: Duration,
    /// Idle age after which a pooled connection is closed; `None` is
    /// unlimited.
    pub max_connection_idle_time: Option<Duration>,
    /// Total age after which a connection is closed; `None` is unlimited.
    pub max_connection_life_time: Option<Duration>,
    pub connect_timeout: Duration,
    /// Read/write timeout on operational sockets; `None` blocks forever.
    pub socket_timeout: Option<Duration>,
    pub socket_keep_alive: bool,
    pub ssl_enabled: bool,
    /// How often each monitor re-probes its server.
    pub heartbeat_frequency: Duration,
    /// Back-off before a monitor retries a failed probe.
    pub heartbeat_connect_retry_frequency: Duration,
    pub heartbeat_connect_timeout: Duration,
    pub heartbeat_socket_timeout: Duration,
    /// Cadence of the pool maintenance task.
    pub maintenance_frequency: Duration,
    pub required_replica_set_name: Option<String>,
    pub write_concern: WriteConcern,
    pub read_preference: ReadPreference,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            max_pool_size: 100,
            min_pool_size: 0,
            max_wait_queue_size: 500,
            max_wait_time: Duration::from_millis(120_000),
            max_connection_idle_time: None,
            max_connection_life_time: None,
            connect_timeout: Duration::from_millis(10_000),
            socket_timeout: None,
            socket_keep_alive: false,
            ssl_enabled: false,
            heartbeat_frequency: Duration::from_millis(5000),
            heartbeat_connect_retry_frequency: Duration::from_millis(10),
            heartbeat_connect_timeout: Duration::from_millis(20_000),
            heartbeat_socket_timeout: Duration::from_millis(20_000),
            maintenance_frequency: Duration::from_secs(60),
            required_replica_set_name: None,
            write_concern: WriteConcern::acknowledged(),
            read_preference: ReadPreference::primary(),
        }
    }
}

impl ClientOptions {
    /// Interprets the keyword options of a parsed connection string.
    ///
    /// Unknown keys are logged with `warn!` and otherwise ignored.
    pub fn from_connstring(config: &ConnectionString) -> Result<ClientOptions> {
        let mut options = ClientOptions::default();

        let conn_options = match config.options {
            Some(ref opts) => opts,
            None => return Ok(options),
        };

        for key in conn_options.options.keys() {
            if !RECOGNIZED_OPTIONS.contains(&&key[..]) {
                warn!("Unknown or unsupported option '{}'", key);
            }
        }

        let mut wait_queue_multiple = 5;

        if let Some(val) = conn_options.get("maxpoolsize") {
            options.max_pool_size = parse_usize("maxPoolSize", val)?;
        }
        if let Some(val) = conn_options.get("minpoolsize") {
            options.min_pool_size = parse_usize("minPoolSize", val)?;
        }
        if let Some(val) = conn_options.get("waitqueuemultiple") {
            wait_queue_multiple = parse_usize("waitQueueMultiple", val)?;
        }
        options.max_wait_queue_size = options.max_pool_size.saturating_mul(wait_queue_multiple);

        if let Some(val) = conn_options.get("waitqueuetimeoutms") {
            options.max_wait_time = Duration::from_millis(parse_u64("waitQueueTimeoutMS", val)?);
        }
        if let Some(val) = conn_options.get("connecttimeoutms") {
            options.connect_timeout = Duration::from_millis(parse_u64("connectTimeoutMS", val)?);
        }
        if let Some(val) = conn_options.get("sockettimeoutms") {
            options.socket_timeout = duration_or_unlimited(parse_u64("socketTimeoutMS", val)?);
        }
        if let Some(val) = conn_options.get("socketkeepalive") {
            options.socket_keep_alive = parse_boolean(val);
        }
        if let Some(val) = conn_options.get("maxidletimems") {
            options.max_connection_idle_time = duration_or_unlimited(
                parse_u64("maxIdleTimeMS", val)?,
            );
        }
        if let Some(val) = conn_options.get("maxlifetimems") {
            options.max_connection_life_time = duration_or_unlimited(
                parse_u64("maxLifeTimeMS", val)?,
            );
        }
        if let Some(val) = conn_options.get("heartbeatfrequencyms") {
            options.heartbeat_frequency =
                Duration::from_millis(parse_u64("heartbeatFrequencyMS", val)?);
        }
        if let Some(val) = conn_options.get("ssl") {
            options.ssl_enabled = parse_boolean(val);
        }
        if let Some(val) = conn_options.get("replicaset") {
            options.required_replica_set_name = Some(val.clone());
        }

        if let Some(write_concern) = build_write_concern(&conn_options.options)? {
            options.write_concern = write_concern;
        }

        if let Some(read_preference) =
            build_read_preference(&conn_options.options, &conn_options.read_pref_tags)?
        {
            options.read_preference = read_preference;
        }

        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(ArgumentError(
                "maxPoolSize must be greater than zero.".to_owned(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(ArgumentError(
                "minPoolSize must not exceed maxPoolSize.".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Boolean grammar of the connection string: trimmed, case-insensitive
/// `1`/`true`/`yes` are true, everything else is false.
pub fn parse_boolean(value: &str) -> bool {
    let trimmed = value.trim().to_lowercase();
    trimmed == "1" || trimmed == "true" || trimmed == "yes"
}

fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        ArgumentError(format!("{} must be a non-negative integer.", name))
    })
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        ArgumentError(format!("{} must be a non-negative integer.", name))
    })
}

fn parse_i32(name: &str, value: &str) -> Result<i32> {
    value.trim().parse().map_err(|_| {
        ArgumentError(format!("{} must be an integer.", name))
    })
}

// The documented `0 = unlimited` convention.
fn duration_or_unlimited(millis: u64) -> Option<Duration> {
    if millis == 0 {
        None
    } else {
        Some(Duration::from_millis(millis))
    }
}

// If any of w/wtimeout/fsync/j appear, they define the write concern; a bare
// `safe` toggles between acknowledged and unacknowledged; otherwise the
// caller keeps its default.
fn build_write_concern(options: &BTreeMap<String, String>) -> Result<Option<WriteConcern>> {
    let w = options.get("w");
    let w_timeout = match options.get("wtimeout").or_else(|| options.get("wtimeoutms")) {
        Some(val) => parse_i32("wtimeoutMS", val)?,
        None => 0,
    };
    let fsync = options.get("fsync").map_or(false, |v| parse_boolean(v));
    let j = options.get("j").map_or(false, |v| parse_boolean(v));

    if w.is_some() || w_timeout != 0 || fsync || j {
        let w = match w {
            Some(val) => {
                match val.trim().parse::<i32>() {
                    Ok(n) => W::Number(n),
                    Err(_) => W::Mode(val.clone()),
                }
            }
            None => W::Number(1),
        };
        return Ok(Some(WriteConcern {
            w: w,
            w_timeout: w_timeout,
            j: j,
            fsync: fsync,
        }));
    }

    match options.get("safe") {
        Some(val) => {
            if parse_boolean(val) {
                Ok(Some(WriteConcern::acknowledged()))
            } else {
                Ok(Some(WriteConcern::unacknowledged()))
            }
        }
        None => Ok(None),
    }
}

// An explicit readPreference wins over slaveOk; slaveOk=true alone maps to
// secondaryPreferred.
fn build_read_preference(
    options: &BTreeMap<String, String>,
    tag_strings: &[String],
) -> Result<Option<ReadPreference>> {
    if let Some(mode_str) = options.get("readpreference") {
        let mode = ReadMode::from_str(mode_str)?;
        let mut tag_sets = Vec::with_capacity(tag_strings.len());
        for tags in tag_strings {
            tag_sets.push(parse_tag_set(tags)?);
        }
        return Ok(Some(ReadPreference::new(mode, Some(tag_sets))));
    }

    match options.get("slaveok") {
        Some(val) if parse_boolean(val) => {
            Ok(Some(ReadPreference::new(ReadMode::SecondaryPreferred, None)))
        }
        _ => Ok(None),
    }
}

// "dc:east,rack:1" → {dc: east, rack: 1}; the empty string is the
// match-anything set.
fn parse_tag_set(value: &str) -> Result<TagSet> {
    let mut tags = TagSet::new();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(tags);
    }

    for pair in trimmed.split(',') {
        let parts: Vec<&str> = pair.split(':').collect();
        if parts.len() != 2 || parts[0].trim().is_empty() {
            return Err(ArgumentError(
                format!("Bad read preference tags: '{}'.", value),
            ));
        }
        tags.insert(parts[0].trim().to_owned(), parts[1].trim().to_owned());
    }

    Ok(tags)
}
