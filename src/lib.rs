//! The cluster and connection core of a synchronous MongoDB client driver.
//!
//! ```no_run
//! # use mongocore::operation::{FindOp, Namespace, WriteOp};
//! # use mongocore::{Client, Result};
//! # use bson::{bson, doc};
//! #
//! # fn run() -> Result<()> {
//! let client = Client::with_uri("mongodb://localhost:27017")?;
//!
//! let namespace = Namespace::new("app", "events");
//! let write = WriteOp::insert(
//!     namespace.clone(),
//!     vec![doc! { "kind": "signup" }],
//!     false,
//!     client.write_concern().clone(),
//! );
//! write.execute(&client.write_session()?)?;
//!
//! let session = client.read_session(client.read_preference())?;
//! for result in FindOp::new(namespace, doc! {}).execute(&session)? {
//!     println!("{}", result?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The crate covers the substrate below a collection API: connection-string
//! parsing, cluster monitoring with server selection, bounded per-server
//! connection pools, legacy op-code framing, and the operation types that
//! compose them. Higher-level document mapping and database facades belong
//! to callers.

pub mod auth;
pub mod client;
pub mod common;
pub mod connection;
pub mod connstring;
pub mod credential;
pub mod cursor;
pub mod error;
pub mod operation;
pub mod options;
pub mod pool;
pub mod stream;
pub mod topology;
pub mod wire_protocol;

pub use crate::client::{Client, Session};
pub use crate::common::{ReadMode, ReadPreference, WriteConcern, W};
pub use crate::credential::{AuthMechanism, Credential};
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::options::ClientOptions;
