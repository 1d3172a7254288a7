//! Read preferences and write concerns shared across the driver.
use std::collections::BTreeMap;
use std::str::FromStr;

use bson::Bson;
use bson::{bson, doc};

use crate::error::{Error, Result};

/// Indicates how a server should be selected during read operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl FromStr for ReadMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "primary" => ReadMode::Primary,
            "primaryPreferred" => ReadMode::PrimaryPreferred,
            "secondary" => ReadMode::Secondary,
            "secondaryPreferred" => ReadMode::SecondaryPreferred,
            "nearest" => ReadMode::Nearest,
            _ => {
                return Err(Error::ArgumentError(
                    format!("Could not convert '{}' to ReadMode.", s),
                ))
            }
        })
    }
}

impl ReadMode {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        }
    }
}

/// A single tag set; a server qualifies when its tags are a superset.
pub type TagSet = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadPreference {
    /// Indicates how a server should be selected during read operations.
    pub mode: ReadMode,
    /// Ordered tag-set list; the first set matching at least one server wins.
    /// An empty set matches any server.
    pub tag_sets: Vec<TagSet>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<TagSet>>) -> ReadPreference {
        ReadPreference {
            mode: mode,
            tag_sets: tag_sets.unwrap_or_else(Vec::new),
        }
    }

    pub fn primary() -> ReadPreference {
        ReadPreference::new(ReadMode::Primary, None)
    }

    pub fn to_document(&self) -> bson::Document {
        let mut doc = doc! { "mode": self.mode.as_str() };
        if !self.tag_sets.is_empty() {
            let sets: Vec<_> = self.tag_sets
                .iter()
                .map(|set| {
                    let mut tags = bson::Document::new();
                    for (key, val) in set.iter() {
                        tags.insert(&key[..], Bson::String(val.to_owned()));
                    }
                    Bson::Document(tags)
                })
                .collect();
            doc.insert("tags", Bson::Array(sets));
        }
        doc
    }
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::primary()
    }
}

/// The replication acknowledgement a write must receive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum W {
    /// Acknowledgement from a fixed number of members; 0 disables the
    /// getLastError round-trip entirely.
    Number(i32),
    /// A named concern such as `"majority"` or a tagged getLastError mode.
    Mode(String),
}

/// Durability contract for a write operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteConcern {
    pub w: W,
    /// Used in conjunction with `w`; propagation timeout in milliseconds.
    pub w_timeout: i32,
    /// Block until the write has been committed to the journal.
    pub j: bool,
    /// Block until the server has synced all data files to disk.
    pub fsync: bool,
}

impl WriteConcern {
    /// The default concern: acknowledged by the primary alone.
    pub fn acknowledged() -> WriteConcern {
        WriteConcern {
            w: W::Number(1),
            w_timeout: 0,
            j: false,
            fsync: false,
        }
    }

    /// Fire-and-forget; no getLastError round-trip is performed.
    pub fn unacknowledged() -> WriteConcern {
        WriteConcern {
            w: W::Number(0),
            ..WriteConcern::acknowledged()
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.w != W::Number(0)
    }

    /// Builds the getLastError command document for this concern.
    pub fn to_gle_document(&self) -> bson::Document {
        let mut doc = doc! { "getLastError": 1 };
        match self.w {
            W::Number(n) => doc.insert("w", Bson::I32(n)),
            W::Mode(ref s) => doc.insert("w", Bson::String(s.to_owned())),
        };
        if self.w_timeout > 0 {
            doc.insert("wtimeout", Bson::I32(self.w_timeout));
        }
        if self.j {
            doc.insert("j", Bson::Boolean(true));
        }
        if self.fsync {
            doc.insert("fsync", Bson::Boolean(true));
        }
        doc
    }
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::acknowledged()
    }
}
