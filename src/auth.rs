//! Credential handshakes run over a freshly opened connection.
//!
//! Authentication happens before a connection is offered to its pool, on the
//! raw channel. The built-in mechanisms are MONGODB-CR, PLAIN, and
//! MONGODB-X509; externally negotiated mechanisms (GSSAPI) plug in through
//! the [`SaslMechanism`] trait and are driven through the standard
//! saslStart/saslContinue conversation until the server reports completion.
use std::sync::Arc;

use bson::spec::BinarySubtype::Generic;
use bson::Bson;
use bson::{bson, doc};
use crypto::digest::Digest;
use crypto::md5::Md5;
use log::debug;
use rustc_serialize::base64::{FromBase64, ToBase64, STANDARD};

use crate::connection::Connection;
use crate::credential::{AuthMechanism, Credential};
use crate::error::Error::AuthenticationError;
use crate::error::Result;
use crate::wire_protocol::buffer::BufferPool;
use crate::wire_protocol::flags::{OpQueryFlags, OpReplyFlags};
use crate::wire_protocol::operations::{Message, MessageLimits};

/// A pluggable SASL token source for externally negotiated mechanisms.
///
/// The authenticator feeds server challenges in and sends the returned
/// tokens back until the server reports `done: true`.
pub trait SaslMechanism: Send + Sync {
    /// The mechanism name announced in saslStart, e.g. `"GSSAPI"`.
    fn mechanism_name(&self) -> &str;

    /// The token to send with saslStart.
    fn initial_token(&self, credential: &Credential) -> Result<Vec<u8>>;

    /// The token answering a server challenge.
    fn next_token(&self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// Dispatches a credential to the handshake its mechanism requires.
#[derive(Clone, Default)]
pub struct Authenticator {
    external: Option<Arc<dyn SaslMechanism>>,
}

impl Authenticator {
    pub fn new(external: Option<Arc<dyn SaslMechanism>>) -> Authenticator {
        Authenticator { external: external }
    }

    /// Applies every credential in turn; the connection records each one it
    /// has proven. An error leaves the connection unusable for pooling.
    pub fn authenticate_all(
        &self,
        conn: &mut Connection,
        credentials: &[Arc<Credential>],
        buffers: &BufferPool,
    ) -> Result<()> {
        for credential in credentials {
            self.authenticate(conn, credential, buffers)?;
        }
        Ok(())
    }

    pub fn authenticate(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        buffers: &BufferPool,
    ) -> Result<()> {
        match credential.mechanism {
            AuthMechanism::MongoCr => self.mongo_cr(conn, credential, buffers)?,
            AuthMechanism::Plain => self.plain(conn, credential, buffers)?,
            AuthMechanism::X509 => self.x509(conn, credential, buffers)?,
            AuthMechanism::Gssapi => {
                let mechanism = self.external.clone().ok_or_else(|| {
                    AuthenticationError(
                        "no external SASL mechanism registered for GSSAPI".to_owned(),
                    )
                })?;
                self.external_sasl(conn, credential, &*mechanism, buffers)?;
            }
            AuthMechanism::Other(ref name) => {
                return Err(AuthenticationError(
                    format!("unsupported authentication mechanism '{}'", name),
                ))
            }
        }

        debug!(
            "conn#{} authenticated {} against {}",
            conn.id,
            credential.username,
            credential.source
        );
        conn.authenticated_credentials.push(format!(
            "{}.{}",
            credential.source,
            credential.username
        ));
        Ok(())
    }

    // The native challenge-response handshake: fetch a nonce, digest it with
    // the password hash, and present the key.
    fn mongo_cr(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        buffers: &BufferPool,
    ) -> Result<()> {
        let password = credential.password_str().ok_or_else(|| {
            AuthenticationError("MONGODB-CR requires a password".to_owned())
        })?;

        let nonce_response = run_command(conn, &credential.source, doc! { "getnonce": 1 }, buffers)?;
        let nonce = match nonce_response.get("nonce") {
            Some(&Bson::String(ref nonce)) => nonce.to_owned(),
            _ => {
                return Err(AuthenticationError(
                    "getnonce returned no nonce".to_owned(),
                ))
            }
        };

        let inner = md5_hex(&format!("{}:mongo:{}", credential.username, password));
        let key = md5_hex(&format!("{}{}{}", nonce, credential.username, inner));

        let auth_doc = doc! {
            "authenticate": 1,
            "user": (credential.username.clone()),
            "nonce": nonce,
            "key": key,
        };

        run_command(conn, &credential.source, auth_doc, buffers).map(|_| ())
    }

    // One SASL round; the payload is `\0user\0password`, base64-encoded.
    fn plain(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        buffers: &BufferPool,
    ) -> Result<()> {
        let password = credential.password_str().ok_or_else(|| {
            AuthenticationError("PLAIN requires a password".to_owned())
        })?;

        let payload = format!("\u{0}{}\u{0}{}", credential.username, password);
        let start_doc = doc! {
            "saslStart": 1,
            "mechanism": "PLAIN",
            "payload": (payload.as_bytes().to_base64(STANDARD)),
        };

        let response = run_command(conn, &credential.source, start_doc, buffers)?;
        match response.get("done") {
            Some(&Bson::Boolean(true)) => Ok(()),
            _ => Err(AuthenticationError(
                "PLAIN conversation did not complete in one round".to_owned(),
            )),
        }
    }

    // The TLS layer supplies the proof; the command merely names the subject.
    fn x509(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        buffers: &BufferPool,
    ) -> Result<()> {
        let auth_doc = doc! {
            "authenticate": 1,
            "mechanism": "MONGODB-X509",
            "user": (credential.username.clone()),
        };
        run_command(conn, "$external", auth_doc, buffers).map(|_| ())
    }

    // Iterated saslStart/saslContinue conversation with externally produced
    // tokens.
    fn external_sasl(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        mechanism: &dyn SaslMechanism,
        buffers: &BufferPool,
    ) -> Result<()> {
        let token = mechanism.initial_token(credential)?;
        let start_doc = doc! {
            "saslStart": 1,
            "mechanism": (mechanism.mechanism_name()),
            "payload": (Bson::Binary(Generic, token)),
        };

        let mut response = run_command(conn, &credential.source, start_doc, buffers)?;

        loop {
            if let Some(&Bson::Boolean(true)) = response.get("done") {
                return Ok(());
            }

            let conversation_id = match response.get("conversationId") {
                Some(id) => id.clone(),
                None => {
                    return Err(AuthenticationError(
                        "SASL conversation lost its conversationId".to_owned(),
                    ))
                }
            };

            let challenge = extract_payload(&response)?;
            let token = mechanism.next_token(&challenge)?;

            let continue_doc = doc! {
                "saslContinue": 1,
                "conversationId": conversation_id,
                "payload": (Bson::Binary(Generic, token)),
            };
            response = run_command(conn, &credential.source, continue_doc, buffers)?;
        }
    }
}

// Runs one command on `<db>.$cmd` over the raw connection and returns the
// response document if the server reported ok.
fn run_command(
    conn: &mut Connection,
    db: &str,
    command: bson::Document,
    buffers: &BufferPool,
) -> Result<bson::Document> {
    let request_id = conn.next_request_id();
    let message = Message::new_query(
        request_id,
        OpQueryFlags::empty(),
        format!("{}.$cmd", db),
        0,
        -1,
        command,
        None,
        &MessageLimits::default(),
    )?;

    let reply = conn.round_trip(&message, buffers)?;

    let (flags, mut documents) = match reply {
        Message::OpReply {
            flags, documents, ..
        } => (flags, documents),
        _ => {
            return Err(AuthenticationError(
                "authentication command received a non-reply message".to_owned(),
            ))
        }
    };

    if documents.is_empty() {
        return Err(AuthenticationError(
            "authentication command received an empty reply".to_owned(),
        ));
    }
    let response = documents.remove(0);

    let failed = flags.contains(OpReplyFlags::QUERY_FAILURE) ||
        match response.get("ok") {
            Some(&Bson::FloatingPoint(ok)) => ok != 1.0,
            Some(&Bson::I32(ok)) => ok != 1,
            Some(&Bson::I64(ok)) => ok != 1,
            _ => true,
        };

    if failed {
        let message = match response.get("errmsg") {
            Some(&Bson::String(ref msg)) => msg.to_owned(),
            _ => "authentication command failed".to_owned(),
        };
        return Err(AuthenticationError(message));
    }

    Ok(response)
}

// Accepts both binary and base64-string payload encodings from the server.
fn extract_payload(response: &bson::Document) -> Result<Vec<u8>> {
    match response.get("payload") {
        Some(&Bson::Binary(_, ref bytes)) => Ok(bytes.clone()),
        Some(&Bson::String(ref encoded)) => {
            encoded.from_base64().map_err(|_| {
                AuthenticationError("SASL payload was not valid base64".to_owned())
            })
        }
        _ => Err(AuthenticationError(
            "SASL response carried no payload".to_owned(),
        )),
    }
}

fn md5_hex(input: &str) -> String {
    let mut md5 = Md5::new();
    md5.input_str(input);
    md5.result_str()
}
