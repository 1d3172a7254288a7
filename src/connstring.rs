//! Connection-string parsing.
//!
//! Translates a `mongodb://` URI into a typed [`ConnectionString`]: the host
//! list, percent-decoded credentials, the namespace from the path, and the
//! raw keyword options that [`crate::options::ClientOptions`] and
//! [`crate::credential::Credential`] interpret.
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Error::ArgumentError;
use crate::error::Result;

pub const DEFAULT_PORT: u16 = 27017;
pub const URI_SCHEME: &str = "mongodb://";

/// Encapsulates the hostname and port of a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    /// The hostname, normalized to lowercase.
    pub host_name: String,
    pub port: u16,
}

impl Host {
    pub fn new(host_name: String, port: u16) -> Host {
        Host {
            host_name: host_name,
            port: port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host_name, self.port)
    }
}

/// The keyword options and read preference tags of a connection string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionOptions {
    /// Lower-cased keys to their last-seen value.
    pub options: BTreeMap<String, String>,
    /// `readPreferenceTags` values, in order of appearance.
    pub read_pref_tags: Vec<String>,
}

impl ConnectionOptions {
    pub fn new(options: BTreeMap<String, String>, read_pref_tags: Vec<String>) -> ConnectionOptions {
        ConnectionOptions {
            options: options,
            read_pref_tags: read_pref_tags,
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.options.get(key)
    }
}

/// Encapsulates information for connecting to a single host, replica set, or
/// sharded routing tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub hosts: Vec<Host>,
    pub string: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub collection: Option<String>,
    pub options: Option<ConnectionOptions>,
}

impl ConnectionString {
    /// Creates a new ConnectionString for a single, unreplicated host.
    pub fn new(host_name: &str, port: u16) -> ConnectionString {
        let host = Host::new(host_name.to_lowercase(), port);
        ConnectionString {
            hosts: vec![host],
            string: None,
            user: None,
            password: None,
            database: None,
            collection: None,
            options: None,
        }
    }

    /// Reserializes the parsed pieces back into URI form.
    ///
    /// Reparsing the result yields an equal `ConnectionString` (modulo the
    /// raw `string` field).
    pub fn to_uri(&self) -> String {
        let mut uri = String::from(URI_SCHEME);

        if let Some(ref user) = self.user {
            uri.push_str(&percent_encode(user));
            if let Some(ref password) = self.password {
                uri.push(':');
                uri.push_str(&percent_encode(password));
            }
            uri.push('@');
        }

        let hosts: Vec<_> = self.hosts.iter().map(|host| host.to_string()).collect();
        uri.push_str(&hosts.join(","));
        uri.push('/');

        if let Some(ref database) = self.database {
            uri.push_str(database);
            if let Some(ref collection) = self.collection {
                uri.push('.');
                uri.push_str(collection);
            }
        }

        let mut pairs = Vec::new();
        if let Some(ref options) = self.options {
            for (key, val) in &options.options {
                pairs.push(format!("{}={}", key, val));
            }
            for tags in &options.read_pref_tags {
                pairs.push(format!("readpreferencetags={}", tags));
            }
        }
        if !pairs.is_empty() {
            uri.push('?');
            uri.push_str(&pairs.join("&"));
        }

        uri
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(&self.to_uri())
    }
}

/// Parses a MongoDB connection string URI as defined by
/// [the manual](https://docs.mongodb.org/manual/reference/connection-string/).
pub fn parse(address: &str) -> Result<ConnectionString> {
    if !address.starts_with(URI_SCHEME) {
        return Err(ArgumentError(
            "MongoDB connection string must start with 'mongodb://'.".to_owned(),
        ));
    }

    // Remove scheme
    let addr = &address[URI_SCHEME.len()..];

    let mut user = None;
    let mut password = None;
    let mut database = None;
    let mut collection = None;
    let mut options = None;

    let (host_str, path_str) = partition(addr, "/");

    if path_str.is_empty() && host_str.contains('?') {
        return Err(ArgumentError(
            "URI contains options without trailing slash".to_owned(),
        ));
    }

    // Split on authentication and hosts
    let hosts = if host_str.contains('@') {
        let (user_info, host_string) = rpartition(host_str, "@");
        let (u, p) = parse_user_info(user_info)?;
        user = Some(u);
        password = p;
        split_hosts(host_string)?
    } else {
        split_hosts(host_str)?
    };

    let mut opts = "";

    // Split on database name, collection, and options
    if !path_str.is_empty() {
        if path_str.starts_with('?') {
            opts = &path_str[1..];
        } else {
            let (namespace, option_str) = partition(path_str, "?");
            let (db, coll) = partition(namespace, ".");
            if !db.is_empty() {
                database = Some(db.to_owned());
            }
            if !coll.is_empty() {
                collection = Some(coll.to_owned());
            }
            opts = option_str;
        }
    }

    if !opts.is_empty() {
        options = Some(split_options(opts)?);
    }

    Ok(ConnectionString {
        hosts: hosts,
        string: Some(address.to_owned()),
        user: user,
        password: password,
        database: database,
        collection: collection,
        options: options,
    })
}

// Parse user information of the form user[:password], percent-decoded.
fn parse_user_info(user_info: &str) -> Result<(String, Option<String>)> {
    if user_info.contains('@') {
        return Err(ArgumentError(
            "'@' characters in a username or password must be escaped according to RFC 2396."
                .to_owned(),
        ));
    }

    let (user, password) = match user_info.find(':') {
        Some(idx) => (&user_info[..idx], Some(percent_decode(&user_info[idx + 1..])?)),
        None => (user_info, None),
    };

    if user.is_empty() {
        return Err(ArgumentError(
            "The empty string is not a valid username.".to_owned(),
        ));
    }

    Ok((percent_decode(user)?, password))
}

// Parses a literal IPv6 host entity of the form [host] or [host]:port.
fn parse_ipv6_literal_host(entity: &str) -> Result<Host> {
    match entity.find(']') {
        Some(_) => {
            match entity.find("]:") {
                Some(idx) => {
                    let port = &entity[idx + 2..];
                    match port.parse::<u16>() {
                        Ok(val) => Ok(Host::new(entity[1..idx].to_lowercase(), val)),
                        Err(_) => Err(ArgumentError("Port must be an integer.".to_owned())),
                    }
                }
                None => {
                    let end = entity.find(']').unwrap();
                    Ok(Host::new(entity[1..end].to_lowercase(), DEFAULT_PORT))
                }
            }
        }
        None => Err(ArgumentError(
            "An IPv6 address must be enclosed in '[' and ']' according to RFC 2732.".to_owned(),
        )),
    }
}

/// Parses a host entity of the form host or host:port.
/// All host names are lowercased.
pub fn parse_host(entity: &str) -> Result<Host> {
    if entity.starts_with('[') {
        // IPv6 host
        parse_ipv6_literal_host(entity)
    } else if entity.contains(':') {
        // Common host:port format
        let (host, port) = partition(entity, ":");
        if port.contains(':') {
            return Err(ArgumentError(
                "Reserved characters such as ':' must be escaped according to RFC 2396. \
                 An IPv6 address literal must be enclosed in '[' and ']' according to RFC 2732."
                    .to_owned(),
            ));
        }
        match port.parse::<u16>() {
            Ok(val) => Ok(Host::new(host.to_lowercase(), val)),
            Err(_) => Err(ArgumentError("Port must be an unsigned integer.".to_owned())),
        }
    } else {
        // Host with no port specified
        Ok(Host::new(entity.to_lowercase(), DEFAULT_PORT))
    }
}

// Splits and parses comma-separated hosts.
fn split_hosts(host_str: &str) -> Result<Vec<Host>> {
    let mut hosts = Vec::new();
    for entity in host_str.split(',') {
        if entity.is_empty() {
            return Err(ArgumentError(
                "Empty host, or extra comma in host list.".to_owned(),
            ));
        }
        hosts.push(parse_host(entity)?);
    }
    Ok(hosts)
}

// Parses the delimited string into options and read preference tags.
// Keys are lower-cased; for repeated scalar keys the last value wins, while
// readPreferenceTags values accumulate in order.
fn parse_options(opts: &str, delim: Option<&str>) -> ConnectionOptions {
    let mut options = BTreeMap::new();
    let mut read_pref_tags = Vec::new();

    let opt_list = match delim {
        Some(delim) => opts.split(delim).collect(),
        None => vec![opts],
    };

    for opt in opt_list {
        let (key, val) = partition(opt, "=");
        if key.is_empty() {
            continue;
        }
        let key = key.to_lowercase();
        if key == "readpreferencetags" {
            read_pref_tags.push(val.to_owned());
        } else {
            options.insert(key, val.to_owned());
        }
    }

    ConnectionOptions::new(options, read_pref_tags)
}

// Determines the option delimiter and offloads parsing to parse_options.
// The semicolon separator is accepted as a deprecated alternative.
fn split_options(opts: &str) -> Result<ConnectionOptions> {
    let and_idx = opts.find('&');
    let semi_idx = opts.find(';');
    let mut delim = None;

    if and_idx.is_some() && semi_idx.is_some() {
        return Err(ArgumentError(
            "Cannot mix '&' and ';' for option separators.".to_owned(),
        ));
    } else if and_idx.is_some() {
        delim = Some("&");
    } else if semi_idx.is_some() {
        delim = Some(";");
    } else if opts.find('=').is_none() {
        return Err(ArgumentError(
            "MongoDB URI options are key=value pairs.".to_owned(),
        ));
    }

    Ok(parse_options(opts, delim))
}

// Decodes %XX escapes as UTF-8 bytes.
fn percent_decode(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return Err(ArgumentError(
                    format!("Incomplete percent escape in '{}'.", value),
                ));
            }
            let hex = value.get(i + 1..i + 3).and_then(
                |h| u8::from_str_radix(h, 16).ok(),
            );
            match hex {
                Some(byte) => decoded.push(byte),
                None => {
                    return Err(ArgumentError(
                        format!("Invalid percent escape in '{}'.", value),
                    ))
                }
            }
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(decoded).map_err(|_| {
        ArgumentError(format!("'{}' does not percent-decode to UTF-8.", value))
    })
}

// Escapes the characters that are structural inside the authority section.
fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b':' | b'@' | b'/' | b'%' | b',' | b'?' => {
                encoded.push_str(&format!("%{:02X}", byte))
            }
            _ => encoded.push(byte as char),
        }
    }
    encoded
}

// Partitions a string around the left-most occurrence of the separator.
fn partition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.find(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}

// Partitions a string around the right-most occurrence of the separator.
fn rpartition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.rfind(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}
