//! Message headers.

use std::fmt;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error::ResponseError;
use crate::error::Result;

/// The size of a serialized header: four little-endian i32 fields.
pub const HEADER_LENGTH: i32 = 16;

/// Represents an opcode in the MongoDB Wire Protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    /// Maps integer values to OpCodes; `None` if the integer isn't a valid
    /// opcode.
    pub fn from_i32(i: i32) -> Option<OpCode> {
        match i {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OpCode::Reply => fmt.write_str("OP_REPLY"),
            OpCode::Update => fmt.write_str("OP_UPDATE"),
            OpCode::Insert => fmt.write_str("OP_INSERT"),
            OpCode::Query => fmt.write_str("OP_QUERY"),
            OpCode::GetMore => fmt.write_str("OP_GET_MORE"),
            OpCode::Delete => fmt.write_str("OP_DELETE"),
            OpCode::KillCursors => fmt.write_str("OP_KILL_CURSORS"),
        }
    }
}

/// Represents a header in the MongoDB Wire Protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Header {
    /// The length of the entire message, in bytes.
    pub message_length: i32,
    /// Identifies the request being sent. In a server response this is the
    /// server's own identifier.
    pub request_id: i32,
    /// The `request_id` this message replies to; 0 in client requests.
    pub response_to: i32,
    /// Identifies which type of message is being sent.
    pub op_code: OpCode,
}

impl Header {
    pub fn new(message_length: i32, request_id: i32, response_to: i32, op_code: OpCode) -> Header {
        Header {
            message_length,
            request_id,
            response_to,
            op_code,
        }
    }

    /// Constructs a new Header for a request, with `response_to` set to 0.
    pub fn new_request(message_length: i32, request_id: i32, op_code: OpCode) -> Header {
        Header::new(message_length, request_id, 0, op_code)
    }

    /// Writes the serialized Header to a buffer.
    pub fn write<W: Write>(&self, buffer: &mut W) -> Result<()> {
        buffer.write_i32::<LittleEndian>(self.message_length)?;
        buffer.write_i32::<LittleEndian>(self.request_id)?;
        buffer.write_i32::<LittleEndian>(self.response_to)?;
        buffer.write_i32::<LittleEndian>(self.op_code as i32)?;
        Ok(())
    }

    /// Reads a serialized Header from a buffer.
    pub fn read<R: Read>(buffer: &mut R) -> Result<Header> {
        let message_length = buffer.read_i32::<LittleEndian>()?;
        let request_id = buffer.read_i32::<LittleEndian>()?;
        let response_to = buffer.read_i32::<LittleEndian>()?;
        let op_code_i32 = buffer.read_i32::<LittleEndian>()?;
        let op_code = match OpCode::from_i32(op_code_i32) {
            Some(code) => code,
            None => {
                return Err(ResponseError(
                    format!("Invalid header opcode from server: {}.", op_code_i32),
                ))
            }
        };

        if message_length < HEADER_LENGTH {
            return Err(ResponseError(
                format!("Invalid message length from server: {}.", message_length),
            ));
        }

        Ok(Header::new(message_length, request_id, response_to, op_code))
    }
}
