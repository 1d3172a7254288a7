//! Iterable network cursor over query results.
use std::collections::vec_deque::VecDeque;
use std::sync::Arc;

use bson;
use log::debug;

use crate::error::{Error, Result};
use crate::topology::server::Server;
use crate::wire_protocol::buffer::BufferPool;
use crate::wire_protocol::flags::OpReplyFlags;
use crate::wire_protocol::operations::Message;

// Lets the server decide the batch size.
pub const DEFAULT_BATCH_SIZE: i32 = 0;

/// Lazily pulls documents for one query from the server that answered it.
///
/// A cursor is pinned to its origin server: every getMore checks a
/// connection out of that server's pool, and a cursor dropped with a live
/// id schedules a killCursors there, best effort.
pub struct Cursor {
    server: Server,
    buffers: Arc<BufferPool>,
    // The namespace to read from.
    namespace: String,
    // How many documents to fetch at a given time from the server.
    batch_size: i32,
    // Uniquely identifies the server-side cursor; zero means exhausted.
    cursor_id: i64,
    // An upper bound on the total number of documents this cursor returns.
    limit: i32,
    // How many documents have been returned so far.
    count: i32,
    // Documents received from the server but not yet handed to the caller.
    buffer: VecDeque<bson::Document>,
    // Set once killCursors has been issued for this cursor.
    killed: bool,
}

impl Cursor {
    /// Builds a cursor from the server's reply to an OP_QUERY.
    pub(crate) fn from_reply(
        server: Server,
        buffers: Arc<BufferPool>,
        namespace: String,
        reply: Message,
        batch_size: i32,
        limit: i32,
    ) -> Result<Cursor> {
        let (cursor_id, documents) = unpack_reply(reply, 0)?;

        Ok(Cursor {
            server: server,
            buffers: buffers,
            namespace: namespace,
            batch_size: batch_size,
            cursor_id: cursor_id,
            limit: limit,
            count: 0,
            buffer: documents,
            killed: false,
        })
    }

    /// The server-side cursor id; zero once the server reports exhaustion.
    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    // Fetches the next batch over a fresh checkout from the origin server.
    fn get_from_server(&mut self) -> Result<()> {
        let mut conn = self.server.acquire_connection()?;
        let request_id = conn.next_request_id();

        let get_more = Message::new_get_more(
            request_id,
            self.namespace.clone(),
            self.batch_size,
            self.cursor_id,
        );

        let reply = conn.round_trip(&get_more, &self.buffers)?;
        let (cursor_id, documents) = unpack_reply(reply, self.cursor_id)?;
        self.cursor_id = cursor_id;
        self.buffer.extend(documents);
        Ok(())
    }

    /// Closes the server-side cursor without consuming the remainder.
    pub fn kill(&mut self) -> Result<()> {
        if self.killed || self.cursor_id == 0 {
            return Ok(());
        }
        self.killed = true;

        let mut conn = self.server.acquire_connection()?;
        let request_id = conn.next_request_id();
        let message = Message::new_kill_cursors(request_id, vec![self.cursor_id]);
        // OP_KILL_CURSORS has no reply.
        conn.send(&message, &self.buffers)
    }

    /// Attempts to read a specified number of documents from the cursor.
    pub fn next_n(&mut self, n: usize) -> Result<Vec<bson::Document>> {
        self.take(n).collect()
    }

    /// Attempts to read a batch of documents from the cursor.
    pub fn drain_current_batch(&mut self) -> Result<Vec<bson::Document>> {
        if self.buffer.is_empty() && self.cursor_id != 0 {
            self.get_from_server()?;
        }
        Ok(self.buffer.drain(..).collect())
    }

    /// Checks whether there are any more documents for the cursor to return.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.limit > 0 && self.count >= self.limit {
            return Ok(false);
        }
        if self.buffer.is_empty() && self.limit != 1 && self.cursor_id != 0 {
            self.get_from_server()?;
        }
        Ok(!self.buffer.is_empty())
    }
}

impl Iterator for Cursor {
    type Item = Result<bson::Document>;

    fn next(&mut self) -> Option<Result<bson::Document>> {
        match self.has_next() {
            Ok(true) => {
                self.count += 1;
                self.buffer.pop_front().map(Ok)
            }
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if !self.killed && self.cursor_id != 0 {
            if let Err(err) = self.kill() {
                debug!("failed to kill cursor {}: {}", self.cursor_id, err);
            }
        }
    }
}

// Pulls the cursor id and documents out of a reply, translating the error
// flags. `requested_id` names the cursor the request addressed, for the
// CursorNotFound report.
fn unpack_reply(reply: Message, requested_id: i64) -> Result<(i64, VecDeque<bson::Document>)> {
    match reply {
        Message::OpReply {
            flags,
            cursor_id,
            documents,
            ..
        } => {
            if flags.contains(OpReplyFlags::CURSOR_NOT_FOUND) {
                return Err(Error::CursorNotFound(requested_id));
            }
            if flags.contains(OpReplyFlags::QUERY_FAILURE) {
                return Err(match documents.first() {
                    Some(doc) => Error::from_server_response(doc),
                    None => Error::ResponseError(
                        "query failure reply carried no error document".to_owned(),
                    ),
                });
            }
            Ok((cursor_id, documents.into_iter().collect()))
        }
        _ => Err(Error::ResponseError(
            "expected an OP_REPLY for a cursor operation".to_owned(),
        )),
    }
}
