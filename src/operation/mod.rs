//! Typed operations executed against a bound session.
//!
//! Writes use the legacy framing: the op-code message carries the
//! documents, and an acknowledged write concern chains a getLastError
//! query on the same connection so the reply correlates with the write it
//! confirms.
pub mod find_and_modify;

use bson::Bson;
use bson::{bson, doc};

use crate::client::Session;
use crate::common::WriteConcern;
use crate::connection::Connection;
use crate::cursor::Cursor;
use crate::error::{Error, ErrorCode, Result};
use crate::wire_protocol::flags::{OpDeleteFlags, OpInsertFlags, OpQueryFlags, OpReplyFlags,
                                  OpUpdateFlags};
use crate::wire_protocol::operations::{Message, MessageLimits};

/// A fully qualified collection name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: &str, coll: &str) -> Namespace {
        Namespace {
            db: db.to_owned(),
            coll: coll.to_owned(),
        }
    }

    /// `db.collection`, as it appears on the wire.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }

    fn command_namespace(&self) -> String {
        format!("{}.$cmd", self.db)
    }
}

/// What a write produced: the last getLastError response, if the concern
/// asked for one.
#[derive(Debug)]
pub struct WriteOutcome {
    pub acknowledged: bool,
    pub response: Option<bson::Document>,
}

/// The body of a legacy write message.
#[derive(Debug)]
pub enum WriteBody {
    Insert {
        documents: Vec<bson::Document>,
        continue_on_error: bool,
    },
    Update {
        selector: bson::Document,
        update: bson::Document,
        upsert: bool,
        multi: bool,
    },
    Delete {
        selector: bson::Document,
        single: bool,
    },
}

/// An insert, update, or remove against one namespace under one write
/// concern.
#[derive(Debug)]
pub struct WriteOp {
    pub namespace: Namespace,
    pub body: WriteBody,
    pub write_concern: WriteConcern,
}

impl WriteOp {
    pub fn insert(
        namespace: Namespace,
        documents: Vec<bson::Document>,
        continue_on_error: bool,
        write_concern: WriteConcern,
    ) -> WriteOp {
        WriteOp {
            namespace: namespace,
            body: WriteBody::Insert {
                documents: documents,
                continue_on_error: continue_on_error,
            },
            write_concern: write_concern,
        }
    }

    pub fn update(
        namespace: Namespace,
        selector: bson::Document,
        update: bson::Document,
        upsert: bool,
        multi: bool,
        write_concern: WriteConcern,
    ) -> WriteOp {
        WriteOp {
            namespace: namespace,
            body: WriteBody::Update {
                selector: selector,
                update: update,
                upsert: upsert,
                multi: multi,
            },
            write_concern: write_concern,
        }
    }

    pub fn delete(
        namespace: Namespace,
        selector: bson::Document,
        single: bool,
        write_concern: WriteConcern,
    ) -> WriteOp {
        WriteOp {
            namespace: namespace,
            body: WriteBody::Delete {
                selector: selector,
                single: single,
            },
            write_concern: write_concern,
        }
    }

    /// Runs the write on the session's server.
    ///
    /// Inserts too large for one frame are split by the serializer and sent
    /// as consecutive batches on the same connection, each with its own
    /// acknowledgement round-trip.
    pub fn execute(&self, session: &Session) -> Result<WriteOutcome> {
        let limits = session.limits();
        let mut conn = session.connection()?;
        let acknowledged = self.write_concern.is_acknowledged();
        let mut last_response = None;

        match self.body {
            WriteBody::Insert {
                ref documents,
                continue_on_error,
            } => {
                let flags = if continue_on_error {
                    OpInsertFlags::CONTINUE_ON_ERROR
                } else {
                    OpInsertFlags::empty()
                };

                let mut offset = 0;
                while offset < documents.len() {
                    let request_id = conn.next_request_id();
                    let (message, consumed) = Message::new_insert(
                        request_id,
                        flags,
                        self.namespace.full_name(),
                        &documents[offset..],
                        &limits,
                    )?;

                    conn.send(&message, session.buffers())?;
                    if acknowledged {
                        last_response = Some(self.get_last_error(&mut conn, session, &limits)?);
                    }
                    offset += consumed;
                }
            }
            WriteBody::Update {
                ref selector,
                ref update,
                upsert,
                multi,
            } => {
                let mut flags = OpUpdateFlags::empty();
                if upsert {
                    flags.insert(OpUpdateFlags::UPSERT);
                }
                if multi {
                    flags.insert(OpUpdateFlags::MULTI_UPDATE);
                }

                let request_id = conn.next_request_id();
                let message = Message::new_update(
                    request_id,
                    self.namespace.full_name(),
                    flags,
                    selector.clone(),
                    update.clone(),
                    &limits,
                )?;

                conn.send(&message, session.buffers())?;
                if acknowledged {
                    last_response = Some(self.get_last_error(&mut conn, session, &limits)?);
                }
            }
            WriteBody::Delete {
                ref selector,
                single,
            } => {
                let flags = if single {
                    OpDeleteFlags::SINGLE_REMOVE
                } else {
                    OpDeleteFlags::empty()
                };

                let request_id = conn.next_request_id();
                let message = Message::new_delete(
                    request_id,
                    self.namespace.full_name(),
                    flags,
                    selector.clone(),
                    &limits,
                )?;

                conn.send(&message, session.buffers())?;
                if acknowledged {
                    last_response = Some(self.get_last_error(&mut conn, session, &limits)?);
                }
            }
        }

        Ok(WriteOutcome {
            acknowledged: acknowledged,
            response: last_response,
        })
    }

    // Chains the getLastError query on the connection that carried the
    // write, so the acknowledgement refers to it.
    fn get_last_error(
        &self,
        conn: &mut Connection,
        session: &Session,
        limits: &MessageLimits,
    ) -> Result<bson::Document> {
        let request_id = conn.next_request_id();
        let message = Message::new_query(
            request_id,
            OpQueryFlags::empty(),
            self.namespace.command_namespace(),
            0,
            -1,
            self.write_concern.to_gle_document(),
            None,
            limits,
        )?;

        let reply = conn.round_trip(&message, session.buffers())?;
        let response = single_reply_document(reply)?;
        parse_get_last_error(response)
    }
}

/// A query returning a server-side cursor.
#[derive(Debug)]
pub struct FindOp {
    pub namespace: Namespace,
    pub filter: bson::Document,
    pub projection: Option<bson::Document>,
    pub sort: Option<bson::Document>,
    pub skip: i32,
    /// Client-enforced cap on returned documents; 0 is unlimited.
    pub limit: i32,
    /// Server-side batch size; 0 lets the server decide.
    pub batch_size: i32,
    pub flags: OpQueryFlags,
}

impl FindOp {
    pub fn new(namespace: Namespace, filter: bson::Document) -> FindOp {
        FindOp {
            namespace: namespace,
            filter: filter,
            projection: None,
            sort: None,
            skip: 0,
            limit: 0,
            batch_size: 0,
            flags: OpQueryFlags::empty(),
        }
    }

    /// Runs the query and wraps the first batch in a cursor pinned to the
    /// session's server.
    pub fn execute(self, session: &Session) -> Result<Cursor> {
        let limits = session.limits();

        let mut flags = self.flags;
        if session.slave_ok() {
            flags.insert(OpQueryFlags::SLAVE_OK);
        }

        let query = match self.sort {
            Some(sort) => {
                doc! {
                    "$query": (self.filter),
                    "$orderby": sort,
                }
            }
            None => self.filter,
        };

        let reply = {
            let mut conn = session.connection()?;
            let request_id = conn.next_request_id();
            let message = Message::new_query(
                request_id,
                flags,
                self.namespace.full_name(),
                self.skip,
                self.batch_size,
                query,
                self.projection,
                &limits,
            )?;
            conn.round_trip(&message, session.buffers())?
        };

        Cursor::from_reply(
            session.server().clone(),
            session.buffers().clone(),
            self.namespace.full_name(),
            reply,
            self.batch_size,
            self.limit,
        )
    }
}

/// Issues OP_KILL_CURSORS for the given ids on the session's server.
pub fn kill_cursors(session: &Session, cursor_ids: Vec<i64>) -> Result<()> {
    if cursor_ids.is_empty() {
        return Ok(());
    }
    let mut conn = session.connection()?;
    let request_id = conn.next_request_id();
    let message = Message::new_kill_cursors(request_id, cursor_ids);
    conn.send(&message, session.buffers())
}

/// Runs a command document against `<db>.$cmd` and returns the response if
/// the server reported success.
pub fn run_command(session: &Session, db: &str, command: bson::Document) -> Result<bson::Document> {
    let limits = session.limits();
    let mut conn = session.connection()?;
    let request_id = conn.next_request_id();

    let mut flags = OpQueryFlags::empty();
    if session.slave_ok() {
        flags.insert(OpQueryFlags::SLAVE_OK);
    }

    let message = Message::new_query(
        request_id,
        flags,
        format!("{}.$cmd", db),
        0,
        -1,
        command,
        None,
        &limits,
    )?;

    let reply = conn.round_trip(&message, session.buffers())?;
    let response = single_reply_document(reply)?;

    if !response_is_ok(&response) {
        return Err(Error::from_server_response(&response));
    }

    Ok(response)
}

/// Drops a collection.
///
/// A missing namespace is not an error here: dropping what does not exist
/// is already the desired end state.
pub fn drop_collection(session: &Session, namespace: &Namespace) -> Result<()> {
    let command = doc! { "drop": (namespace.coll.clone()) };
    match run_command(session, &namespace.db, command) {
        Ok(_) => Ok(()),
        Err(Error::OperationError { ref message, .. }) if message == "ns not found" => Ok(()),
        Err(err) => Err(err),
    }
}

// Extracts the single response document of a command-shaped reply.
fn single_reply_document(reply: Message) -> Result<bson::Document> {
    match reply {
        Message::OpReply {
            flags,
            mut documents,
            ..
        } => {
            if flags.contains(OpReplyFlags::QUERY_FAILURE) {
                return Err(match documents.first() {
                    Some(doc) => Error::from_server_response(doc),
                    None => Error::ResponseError(
                        "query failure reply carried no error document".to_owned(),
                    ),
                });
            }
            if documents.is_empty() {
                return Err(Error::ResponseError(
                    "command reply carried no documents".to_owned(),
                ));
            }
            Ok(documents.remove(0))
        }
        _ => Err(Error::ResponseError(
            "expected an OP_REPLY for a command".to_owned(),
        )),
    }
}

fn response_is_ok(response: &bson::Document) -> bool {
    match response.get("ok") {
        Some(&Bson::FloatingPoint(v)) => v == 1.0,
        Some(&Bson::I32(v)) => v == 1,
        Some(&Bson::I64(v)) => v == 1,
        _ => false,
    }
}

// Interprets a getLastError response: write-concern trouble first, then
// write errors, then command-shaped failure.
fn parse_get_last_error(response: bson::Document) -> Result<bson::Document> {
    let code = match response.get("code") {
        Some(&Bson::I32(c)) => c,
        Some(&Bson::I64(c)) => c as i32,
        _ => 0,
    };

    let timed_out = match response.get("wtimeout") {
        Some(&Bson::Boolean(b)) => b,
        _ => false,
    };
    let wnote = match response.get("wnote") {
        Some(&Bson::String(ref s)) => Some(s.clone()),
        _ => None,
    };

    if timed_out || wnote.is_some() {
        let message = wnote.unwrap_or_else(|| {
            match response.get("err") {
                Some(&Bson::String(ref s)) => s.clone(),
                _ => "waiting for replication timed out".to_owned(),
            }
        });
        return Err(Error::WriteConcernError {
            code: code,
            message: message,
            details: response,
        });
    }

    if let Some(&Bson::String(ref err)) = response.get("err") {
        let message = err.clone();
        if ErrorCode::is_duplicate_key(code) {
            return Err(Error::DuplicateKeyError {
                code: code,
                message: message,
            });
        }
        return Err(Error::OperationError {
            message: message,
            code: if code == 0 { None } else { Some(code) },
            response: response,
        });
    }

    if !response_is_ok(&response) {
        return Err(Error::from_server_response(&response));
    }

    Ok(response)
}
