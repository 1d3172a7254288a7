//! Driver-wide error type and classification of server error codes.
use bson;

use std::{error, fmt, io, sync};

use crate::connstring::Host;

/// Short-hand alias for a `Result` carrying the driver `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Server error codes the driver inspects directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    CommandNotFound = 59,
    DuplicateKey = 11000,
    DuplicateKeyLegacy = 11001,
    DuplicateKeyCapped = 12582,
}

impl ErrorCode {
    /// Reports whether `code` identifies a duplicate-key write failure.
    pub fn is_duplicate_key(code: i32) -> bool {
        code == ErrorCode::DuplicateKey as i32 || code == ErrorCode::DuplicateKeyLegacy as i32 ||
            code == ErrorCode::DuplicateKeyCapped as i32
    }
}

#[derive(Debug)]
pub enum Error {
    /// A malformed URI or an illegal argument to a builder or setting.
    ArgumentError(String),
    /// A credential handshake failed on a connection.
    AuthenticationError(String),
    /// Transport failure on the socket to the given host.
    SocketError(Host, io::Error),
    /// Opening a socket to the host did not complete within the connect timeout.
    SocketOpenTimeout(Host),
    /// A read did not complete within the socket timeout.
    SocketReadTimeout(Host),
    /// A write did not complete within the socket timeout.
    SocketWriteTimeout(Host),
    /// A malformed frame, unexpected opcode, or misdirected reply.
    ResponseError(String),
    /// The pool wait queue is at capacity; the checkout was rejected outright.
    WaitQueueFull(Host),
    /// The checkout deadline elapsed while waiting for an idle connection.
    WaitQueueTimeout(Host),
    /// The pool has been closed; no further checkouts are possible.
    PoolClosed(Host),
    /// Server selection exhausted its deadline.
    NoServerAvailable(String),
    /// The server reported a command failure; carries the raw response.
    OperationError {
        message: String,
        code: Option<i32>,
        response: bson::Document,
    },
    /// The server no longer knows the cursor being iterated.
    CursorNotFound(i64),
    /// A write failed against a unique index.
    DuplicateKeyError { code: i32, message: String },
    /// getLastError acknowledged the write but the write concern was not met.
    WriteConcernError {
        code: i32,
        message: String,
        details: bson::Document,
    },
    /// Encoding a document for the wire failed.
    EncoderError(bson::EncoderError),
    /// Decoding a reply document failed.
    DecoderError(bson::DecoderError),
    /// A lock guarding shared driver state was poisoned.
    PoisonLockError,
    /// An internal invariant was breached.
    InternalError(String),
    /// I/O failure not attributable to a known host.
    IoError(io::Error),
}

impl Error {
    /// Classifies an I/O error raised while reading from `host`.
    pub fn from_read(err: io::Error, host: &Host) -> Error {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::SocketReadTimeout(host.clone())
            }
            _ => Error::SocketError(host.clone(), err),
        }
    }

    /// Classifies an I/O error raised while writing to `host`.
    pub fn from_write(err: io::Error, host: &Host) -> Error {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::SocketWriteTimeout(host.clone())
            }
            _ => Error::SocketError(host.clone(), err),
        }
    }

    /// Builds an `OperationError` out of a server error document.
    ///
    /// Duplicate-key codes are promoted to `DuplicateKeyError` so callers can
    /// match on them without digging through the response.
    pub fn from_server_response(doc: &bson::Document) -> Error {
        let message = doc.get("errmsg")
            .or_else(|| doc.get("err"))
            .or_else(|| doc.get("$err"))
            .and_then(|b| if let bson::Bson::String(ref s) = *b {
                Some(s.clone())
            } else {
                None
            })
            .unwrap_or_else(|| String::from("unknown server error"));

        let code = match doc.get("code") {
            Some(&bson::Bson::I32(c)) => Some(c),
            Some(&bson::Bson::I64(c)) => Some(c as i32),
            _ => None,
        };

        if let Some(c) = code {
            if ErrorCode::is_duplicate_key(c) {
                return Error::DuplicateKeyError {
                    code: c,
                    message: message,
                };
            }
        }

        Error::OperationError {
            message: message,
            code: code,
            response: doc.clone(),
        }
    }

    /// True for errors that must poison the connection they occurred on.
    pub fn is_fatal_to_connection(&self) -> bool {
        match *self {
            Error::SocketError(..) |
            Error::SocketOpenTimeout(_) |
            Error::SocketReadTimeout(_) |
            Error::SocketWriteTimeout(_) |
            Error::ResponseError(_) |
            Error::IoError(_) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<bson::EncoderError> for Error {
    fn from(err: bson::EncoderError) -> Error {
        Error::EncoderError(err)
    }
}

impl From<bson::DecoderError> for Error {
    fn from(err: bson::DecoderError) -> Error {
        Error::DecoderError(err)
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::PoisonLockError
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ArgumentError(ref s) => write!(fmt, "{}", s),
            Error::AuthenticationError(ref s) => write!(fmt, "authentication failed: {}", s),
            Error::SocketError(ref host, ref e) => write!(fmt, "socket error on {}: {}", host, e),
            Error::SocketOpenTimeout(ref host) => write!(fmt, "timed out connecting to {}", host),
            Error::SocketReadTimeout(ref host) => write!(fmt, "timed out reading from {}", host),
            Error::SocketWriteTimeout(ref host) => write!(fmt, "timed out writing to {}", host),
            Error::ResponseError(ref s) => write!(fmt, "{}", s),
            Error::WaitQueueFull(ref host) => {
                write!(fmt, "too many threads waiting for a connection to {}", host)
            }
            Error::WaitQueueTimeout(ref host) => {
                write!(fmt, "timed out waiting for a connection to {}", host)
            }
            Error::PoolClosed(ref host) => {
                write!(fmt, "the connection pool for {} has been closed", host)
            }
            Error::NoServerAvailable(ref s) => write!(fmt, "no server available: {}", s),
            Error::OperationError {
                ref message,
                ref code,
                ..
            } => {
                match *code {
                    Some(c) => write!(fmt, "command failed ({}): {}", c, message),
                    None => write!(fmt, "command failed: {}", message),
                }
            }
            Error::CursorNotFound(id) => write!(fmt, "cursor {} not found on the server", id),
            Error::DuplicateKeyError {
                code,
                ref message,
            } => write!(fmt, "duplicate key ({}): {}", code, message),
            Error::WriteConcernError {
                code,
                ref message,
                ..
            } => write!(fmt, "write concern not satisfied ({}): {}", code, message),
            Error::EncoderError(ref e) => e.fmt(fmt),
            Error::DecoderError(ref e) => e.fmt(fmt),
            Error::PoisonLockError => fmt.write_str("shared driver state lock poisoned"),
            Error::InternalError(ref s) => write!(fmt, "internal driver error: {}", s),
            Error::IoError(ref e) => e.fmt(fmt),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::SocketError(_, ref e) => Some(e),
            Error::EncoderError(ref e) => Some(e),
            Error::DecoderError(ref e) => Some(e),
            Error::IoError(ref e) => Some(e),
            _ => None,
        }
    }
}
