//! Authentication credentials.
use std::collections::BTreeMap;
use std::fmt;

use crate::connstring::ConnectionString;
use crate::error::Result;

/// The authentication mechanisms a credential can request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// The native challenge-response mechanism; the default.
    MongoCr,
    /// SASL PLAIN, for delegating to LDAP.
    Plain,
    /// Kerberos via an externally supplied SASL conversation.
    Gssapi,
    /// TLS client-certificate authentication.
    X509,
    /// A mechanism this driver does not implement. Carried through parsing;
    /// rejected when the handshake dispatches.
    Other(String),
}

impl AuthMechanism {
    /// Maps a mechanism name from a URI onto the typed mechanism.
    pub fn from_name(name: &str) -> AuthMechanism {
        match name {
            "MONGODB-CR" => AuthMechanism::MongoCr,
            "PLAIN" => AuthMechanism::Plain,
            "GSSAPI" => AuthMechanism::Gssapi,
            "MONGODB-X509" => AuthMechanism::X509,
            other => AuthMechanism::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match *self {
            AuthMechanism::MongoCr => "MONGODB-CR",
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::Gssapi => "GSSAPI",
            AuthMechanism::X509 => "MONGODB-X509",
            AuthMechanism::Other(ref name) => name,
        }
    }

    // GSSAPI and X509 prove identity externally; a password in the URI is
    // discarded for them.
    fn uses_password(&self) -> bool {
        match *self {
            AuthMechanism::Gssapi | AuthMechanism::X509 => false,
            _ => true,
        }
    }
}

/// A username, its source database, and the material needed to prove it.
///
/// The password is held as a byte buffer rather than a `String` so it can be
/// zeroed when the credential is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub mechanism: AuthMechanism,
    pub username: String,
    /// The database the credential is defined on.
    pub source: String,
    password: Option<Vec<u8>>,
    pub mechanism_properties: BTreeMap<String, String>,
}

impl Credential {
    pub fn new(
        mechanism: AuthMechanism,
        username: String,
        source: String,
        password: Option<Vec<u8>>,
    ) -> Credential {
        let password = if mechanism.uses_password() {
            password
        } else {
            None
        };

        Credential {
            mechanism: mechanism,
            username: username,
            source: source,
            password: password,
            mechanism_properties: BTreeMap::new(),
        }
    }

    /// Extracts the credential requested by a parsed connection string, if
    /// the string carried a username.
    ///
    /// The source database defaults to the URI database, then to `"admin"`.
    /// Without an `authMechanism` option the mechanism is MONGODB-CR.
    pub fn from_connstring(config: &ConnectionString) -> Result<Option<Credential>> {
        let username = match config.user {
            Some(ref user) => user.clone(),
            None => return Ok(None),
        };

        let mut mechanism = AuthMechanism::MongoCr;
        let mut source = config
            .database
            .clone()
            .unwrap_or_else(|| String::from("admin"));

        if let Some(ref options) = config.options {
            if let Some(name) = options.get("authmechanism") {
                mechanism = AuthMechanism::from_name(name);
            }
            if let Some(db) = options.get("authsource") {
                source = db.clone();
            }
        }

        let password = config.password.as_ref().map(|p| p.as_bytes().to_vec());

        Ok(Some(Credential::new(mechanism, username, source, password)))
    }

    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_ref().map(|p| &p[..])
    }

    /// The password interpreted as UTF-8, as the digest-based handshakes
    /// consume it.
    pub fn password_str(&self) -> Option<&str> {
        self.password.as_ref().and_then(
            |p| std::str::from_utf8(p).ok(),
        )
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        if let Some(ref mut password) = self.password {
            for byte in password.iter_mut() {
                *byte = 0;
            }
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Credential")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("source", &self.source)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
