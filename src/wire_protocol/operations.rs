//! Framing and parsing of wire-protocol messages.
use std::io::{Cursor, Read, Write};
use std::mem;

use bson;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error::{ArgumentError, ResponseError};
use crate::error::Result;
use crate::wire_protocol::flags::{OpDeleteFlags, OpInsertFlags, OpQueryFlags, OpReplyFlags,
                                  OpUpdateFlags};
use crate::wire_protocol::header::{Header, OpCode, HEADER_LENGTH};

pub const DEFAULT_MAX_DOCUMENT_SIZE: i32 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: i32 = 48_000_000;
pub const DEFAULT_MAX_WRITE_BATCH_SIZE: usize = 1000;

/// Frame-size limits advertised by the server an outbound message targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_document_size: i32,
    pub max_message_size: i32,
    pub max_write_batch_size: usize,
}

impl Default for MessageLimits {
    fn default() -> MessageLimits {
        MessageLimits {
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
        }
    }
}

impl MessageLimits {
    fn check_document(&self, len: i32) -> Result<()> {
        if len > self.max_document_size {
            return Err(ArgumentError(format!(
                "Document of {} bytes exceeds the server's {}-byte document limit.",
                len,
                self.max_document_size
            )));
        }
        Ok(())
    }

    fn check_message(&self, len: i32) -> Result<()> {
        if len > self.max_message_size {
            return Err(ArgumentError(format!(
                "Message of {} bytes exceeds the server's {}-byte message limit.",
                len,
                self.max_message_size
            )));
        }
        Ok(())
    }
}

trait ByteLength {
    /// Calculates the number of bytes in the serialized version of the struct.
    fn byte_length(&self) -> Result<i32>;
}

impl ByteLength for bson::Document {
    fn byte_length(&self) -> Result<i32> {
        let mut temp_buffer = vec![];
        bson::encode_document(&mut temp_buffer, self)?;
        Ok(temp_buffer.len() as i32)
    }
}

/// Represents a message in the MongoDB Wire Protocol.
#[derive(Debug)]
pub enum Message {
    OpReply {
        header: Header,
        flags: OpReplyFlags,
        cursor_id: i64,
        starting_from: i32,
        number_returned: i32,
        documents: Vec<bson::Document>,
    },
    OpUpdate {
        header: Header,
        // The wire protocol specifies that a 32-bit 0 field goes here
        namespace: String,
        flags: OpUpdateFlags,
        selector: bson::Document,
        update: bson::Document,
    },
    OpInsert {
        header: Header,
        flags: OpInsertFlags,
        namespace: String,
        documents: Vec<bson::Document>,
    },
    OpQuery {
        header: Header,
        flags: OpQueryFlags,
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: bson::Document,
        return_field_selector: Option<bson::Document>,
    },
    OpGetMore {
        header: Header,
        // The wire protocol specifies that a 32-bit 0 field goes here
        namespace: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    OpDelete {
        header: Header,
        // The wire protocol specifies that a 32-bit 0 field goes here
        namespace: String,
        flags: OpDeleteFlags,
        selector: bson::Document,
    },
    OpKillCursors {
        header: Header,
        // The wire protocol specifies that a 32-bit 0 field goes here
        cursor_ids: Vec<i64>,
    },
}

impl Message {
    /// The request id this message carries in its header.
    pub fn request_id(&self) -> i32 {
        self.header().request_id
    }

    pub fn header(&self) -> &Header {
        match *self {
            Message::OpReply { ref header, .. } |
            Message::OpUpdate { ref header, .. } |
            Message::OpInsert { ref header, .. } |
            Message::OpQuery { ref header, .. } |
            Message::OpGetMore { ref header, .. } |
            Message::OpDelete { ref header, .. } |
            Message::OpKillCursors { ref header, .. } => header,
        }
    }

    fn new_reply(
        header: Header,
        flags: i32,
        cursor_id: i64,
        starting_from: i32,
        number_returned: i32,
        documents: Vec<bson::Document>,
    ) -> Message {
        Message::OpReply {
            header: header,
            flags: OpReplyFlags::from_i32(flags),
            cursor_id: cursor_id,
            starting_from: starting_from,
            number_returned: number_returned,
            documents: documents,
        }
    }

    /// Constructs a new message for an update.
    pub fn new_update(
        request_id: i32,
        namespace: String,
        flags: OpUpdateFlags,
        selector: bson::Document,
        update: bson::Document,
        limits: &MessageLimits,
    ) -> Result<Message> {
        // Add an extra byte after the string for null-termination.
        let string_length = namespace.len() as i32 + 1;

        // There are two i32 fields, the wire protocol ZERO and the flags.
        let i32_length = 2 * mem::size_of::<i32>() as i32;

        let selector_length = selector.byte_length()?;
        let update_length = update.byte_length()?;
        limits.check_document(selector_length)?;
        limits.check_document(update_length)?;

        let total_length = HEADER_LENGTH + i32_length + string_length + selector_length +
            update_length;
        limits.check_message(total_length)?;

        let header = Header::new_request(total_length, request_id, OpCode::Update);

        Ok(Message::OpUpdate {
            header: header,
            namespace: namespace,
            flags: flags,
            selector: selector,
            update: update,
        })
    }

    /// Constructs a new message for an insertion out of as many of
    /// `documents` as the target server's limits allow.
    ///
    /// Returns the message and the number of documents it consumed; the
    /// caller continues the batch from that offset. At least one document is
    /// always consumed, so a document within the per-document limit is never
    /// starved by the message limit.
    pub fn new_insert(
        request_id: i32,
        flags: OpInsertFlags,
        namespace: String,
        documents: &[bson::Document],
        limits: &MessageLimits,
    ) -> Result<(Message, usize)> {
        if documents.is_empty() {
            return Err(ArgumentError(
                "No documents provided for insertion.".to_owned(),
            ));
        }

        let flags_length = mem::size_of::<i32>() as i32;
        let string_length = namespace.len() as i32 + 1;

        let mut total_length = HEADER_LENGTH + flags_length + string_length;
        let mut batch = Vec::new();

        for doc in documents {
            let doc_length = doc.byte_length()?;
            limits.check_document(doc_length)?;

            if !batch.is_empty() &&
                (batch.len() >= limits.max_write_batch_size ||
                     total_length + doc_length > limits.max_message_size)
            {
                break;
            }

            total_length += doc_length;
            batch.push(doc.clone());
        }

        let consumed = batch.len();
        let header = Header::new_request(total_length, request_id, OpCode::Insert);

        Ok((
            Message::OpInsert {
                header: header,
                flags: flags,
                namespace: namespace,
                documents: batch,
            },
            consumed,
        ))
    }

    /// Constructs a new message for a query.
    pub fn new_query(
        request_id: i32,
        flags: OpQueryFlags,
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: bson::Document,
        return_field_selector: Option<bson::Document>,
        limits: &MessageLimits,
    ) -> Result<Message> {
        // Three i32 fields: flags, number_to_skip, and number_to_return.
        let i32_length = 3 * mem::size_of::<i32>() as i32;

        // Add an extra byte after the string for null-termination.
        let string_length = namespace.len() as i32 + 1;

        let bson_length = query.byte_length()?;
        limits.check_document(bson_length)?;

        let option_length = match return_field_selector {
            Some(ref doc) => {
                let len = doc.byte_length()?;
                limits.check_document(len)?;
                len
            }
            None => 0,
        };

        let total_length = HEADER_LENGTH + i32_length + string_length + bson_length +
            option_length;
        limits.check_message(total_length)?;

        let header = Header::new_request(total_length, request_id, OpCode::Query);

        Ok(Message::OpQuery {
            header: header,
            flags: flags,
            namespace: namespace,
            number_to_skip: number_to_skip,
            number_to_return: number_to_return,
            query: query,
            return_field_selector: return_field_selector,
        })
    }

    /// Constructs a new "get more" request message.
    pub fn new_get_more(
        request_id: i32,
        namespace: String,
        number_to_return: i32,
        cursor_id: i64,
    ) -> Message {
        // Two i32 fields: the wire protocol ZERO and number_to_return.
        let i32_length = 2 * mem::size_of::<i32>() as i32;
        let string_length = namespace.len() as i32 + 1;
        let i64_length = mem::size_of::<i64>() as i32;

        let total_length = HEADER_LENGTH + i32_length + string_length + i64_length;
        let header = Header::new_request(total_length, request_id, OpCode::GetMore);

        Message::OpGetMore {
            header: header,
            namespace: namespace,
            number_to_return: number_to_return,
            cursor_id: cursor_id,
        }
    }

    /// Constructs a new message for a deletion.
    pub fn new_delete(
        request_id: i32,
        namespace: String,
        flags: OpDeleteFlags,
        selector: bson::Document,
        limits: &MessageLimits,
    ) -> Result<Message> {
        // Two i32 fields: the wire protocol ZERO and the flags.
        let i32_length = 2 * mem::size_of::<i32>() as i32;
        let string_length = namespace.len() as i32 + 1;

        let selector_length = selector.byte_length()?;
        limits.check_document(selector_length)?;

        let total_length = HEADER_LENGTH + i32_length + string_length + selector_length;
        limits.check_message(total_length)?;

        let header = Header::new_request(total_length, request_id, OpCode::Delete);

        Ok(Message::OpDelete {
            header: header,
            namespace: namespace,
            flags: flags,
            selector: selector,
        })
    }

    /// Constructs a new message closing the given server-side cursors.
    pub fn new_kill_cursors(request_id: i32, cursor_ids: Vec<i64>) -> Message {
        // Two i32 fields: the wire protocol ZERO and the cursor count.
        let i32_length = 2 * mem::size_of::<i32>() as i32;
        let ids_length = (mem::size_of::<i64>() * cursor_ids.len()) as i32;

        let total_length = HEADER_LENGTH + i32_length + ids_length;
        let header = Header::new_request(total_length, request_id, OpCode::KillCursors);

        Message::OpKillCursors {
            header: header,
            cursor_ids: cursor_ids,
        }
    }

    fn write_bson_document<W: Write>(buffer: &mut W, bson: &bson::Document) -> Result<()> {
        let mut temp_buffer = vec![];
        bson::encode_document(&mut temp_buffer, bson)?;
        buffer.write_all(&temp_buffer)?;
        Ok(())
    }

    fn write_cstring<W: Write>(buffer: &mut W, string: &str) -> Result<()> {
        buffer.write_all(string.as_bytes())?;
        // Null terminator for the namespace string.
        buffer.write_u8(0)?;
        Ok(())
    }

    fn write_update<W: Write>(
        buffer: &mut W,
        header: &Header,
        namespace: &str,
        flags: OpUpdateFlags,
        selector: &bson::Document,
        update: &bson::Document,
    ) -> Result<()> {
        header.write(buffer)?;
        buffer.write_i32::<LittleEndian>(0)?;
        Message::write_cstring(buffer, namespace)?;
        buffer.write_i32::<LittleEndian>(flags.bits())?;
        Message::write_bson_document(buffer, selector)?;
        Message::write_bson_document(buffer, update)?;
        Ok(())
    }

    fn write_insert<W: Write>(
        buffer: &mut W,
        header: &Header,
        flags: OpInsertFlags,
        namespace: &str,
        documents: &[bson::Document],
    ) -> Result<()> {
        header.write(buffer)?;
        buffer.write_i32::<LittleEndian>(flags.bits())?;
        Message::write_cstring(buffer, namespace)?;
        for doc in documents {
            Message::write_bson_document(buffer, doc)?;
        }
        Ok(())
    }

    fn write_query<W: Write>(
        buffer: &mut W,
        header: &Header,
        flags: OpQueryFlags,
        namespace: &str,
        number_to_skip: i32,
        number_to_return: i32,
        query: &bson::Document,
        return_field_selector: &Option<bson::Document>,
    ) -> Result<()> {
        header.write(buffer)?;
        buffer.write_i32::<LittleEndian>(flags.bits())?;
        Message::write_cstring(buffer, namespace)?;
        buffer.write_i32::<LittleEndian>(number_to_skip)?;
        buffer.write_i32::<LittleEndian>(number_to_return)?;
        Message::write_bson_document(buffer, query)?;
        if let Some(ref doc) = *return_field_selector {
            Message::write_bson_document(buffer, doc)?;
        }
        Ok(())
    }

    fn write_get_more<W: Write>(
        buffer: &mut W,
        header: &Header,
        namespace: &str,
        number_to_return: i32,
        cursor_id: i64,
    ) -> Result<()> {
        header.write(buffer)?;
        buffer.write_i32::<LittleEndian>(0)?;
        Message::write_cstring(buffer, namespace)?;
        buffer.write_i32::<LittleEndian>(number_to_return)?;
        buffer.write_i64::<LittleEndian>(cursor_id)?;
        Ok(())
    }

    fn write_delete<W: Write>(
        buffer: &mut W,
        header: &Header,
        namespace: &str,
        flags: OpDeleteFlags,
        selector: &bson::Document,
    ) -> Result<()> {
        header.write(buffer)?;
        buffer.write_i32::<LittleEndian>(0)?;
        Message::write_cstring(buffer, namespace)?;
        buffer.write_i32::<LittleEndian>(flags.bits())?;
        Message::write_bson_document(buffer, selector)?;
        Ok(())
    }

    fn write_kill_cursors<W: Write>(
        buffer: &mut W,
        header: &Header,
        cursor_ids: &[i64],
    ) -> Result<()> {
        header.write(buffer)?;
        buffer.write_i32::<LittleEndian>(0)?;
        buffer.write_i32::<LittleEndian>(cursor_ids.len() as i32)?;
        for id in cursor_ids {
            buffer.write_i64::<LittleEndian>(*id)?;
        }
        Ok(())
    }

    /// Serializes the message into a buffer.
    pub fn write<W: Write>(&self, buffer: &mut W) -> Result<()> {
        match *self {
            // Only the server sends replies.
            Message::OpReply { .. } => Err(ArgumentError(
                "OP_REPLY should not be sent to the server.".to_owned(),
            )),
            Message::OpUpdate {
                ref header,
                ref namespace,
                flags,
                ref selector,
                ref update,
            } => Message::write_update(buffer, header, namespace, flags, selector, update),
            Message::OpInsert {
                ref header,
                flags,
                ref namespace,
                ref documents,
            } => Message::write_insert(buffer, header, flags, namespace, documents),
            Message::OpQuery {
                ref header,
                flags,
                ref namespace,
                number_to_skip,
                number_to_return,
                ref query,
                ref return_field_selector,
            } => {
                Message::write_query(
                    buffer,
                    header,
                    flags,
                    namespace,
                    number_to_skip,
                    number_to_return,
                    query,
                    return_field_selector,
                )
            }
            Message::OpGetMore {
                ref header,
                ref namespace,
                number_to_return,
                cursor_id,
            } => Message::write_get_more(buffer, header, namespace, number_to_return, cursor_id),
            Message::OpDelete {
                ref header,
                ref namespace,
                flags,
                ref selector,
            } => Message::write_delete(buffer, header, namespace, flags, selector),
            Message::OpKillCursors {
                ref header,
                ref cursor_ids,
            } => Message::write_kill_cursors(buffer, header, cursor_ids),
        }
    }

    fn read_reply<R: Read>(buffer: &mut R, header: Header) -> Result<Message> {
        let body_length = (header.message_length - HEADER_LENGTH) as usize;
        let mut body = vec![0u8; body_length];
        buffer.read_exact(&mut body)?;

        let mut body = Cursor::new(body);
        let flags = body.read_i32::<LittleEndian>()?;
        let cursor_id = body.read_i64::<LittleEndian>()?;
        let starting_from = body.read_i32::<LittleEndian>()?;
        let number_returned = body.read_i32::<LittleEndian>()?;

        let mut documents = Vec::new();
        while (body.position() as usize) < body.get_ref().len() {
            documents.push(bson::decode_document(&mut body)?);
        }

        Ok(Message::new_reply(
            header,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        ))
    }

    /// Reads a reply message from a buffer; any other opcode is a protocol
    /// error.
    pub fn read<R: Read>(buffer: &mut R) -> Result<Message> {
        let header = Header::read(buffer)?;
        match header.op_code {
            OpCode::Reply => Message::read_reply(buffer, header),
            opcode => Err(ResponseError(format!(
                "Expected to read OP_REPLY but instead found {}.",
                opcode
            ))),
        }
    }
}
