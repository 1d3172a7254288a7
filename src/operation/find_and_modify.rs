//! The findandmodify command family.
//!
//! One shared record carries the state common to all three shapes
//! (filter, sort, projection, returnNew, upsert); the variant determines
//! how the command document is assembled and which inputs are rejected.
//! Validation runs at `build` time, so a half-configured operation never
//! reaches the wire.
use bson::Bson;
use bson::{bson, doc};

use crate::client::Session;
use crate::error::Error::ArgumentError;
use crate::error::Result;

use super::{run_command, Namespace};

/// State shared by every findandmodify variant.
#[derive(Clone, Debug, Default)]
pub struct FindAndModifySpec {
    filter: Option<bson::Document>,
    sort: Option<bson::Document>,
    fields: Option<bson::Document>,
    return_new: bool,
    upsert: bool,
}

impl FindAndModifySpec {
    // Command field order follows the server's documented shape:
    // query, fields, sort, then the behavior flags.
    fn append_to(&self, command: &mut bson::Document) {
        if let Some(ref filter) = self.filter {
            command.insert("query", filter.clone());
        }
        if let Some(ref fields) = self.fields {
            command.insert("fields", fields.clone());
        }
        if let Some(ref sort) = self.sort {
            command.insert("sort", sort.clone());
        }
        if self.return_new {
            command.insert("new", true);
        }
        if self.upsert {
            command.insert("upsert", true);
        }
    }
}

macro_rules! spec_builders {
    () => {
        /// Selects the document to operate on.
        pub fn filter(mut self, filter: bson::Document) -> Self {
            self.spec.filter = Some(filter);
            self
        }

        /// Orders candidates when the filter matches more than one.
        pub fn sort(mut self, sort: bson::Document) -> Self {
            self.spec.sort = Some(sort);
            self
        }

        /// Projects the returned document.
        pub fn fields(mut self, fields: bson::Document) -> Self {
            self.spec.fields = Some(fields);
            self
        }
    };
}

/// findandmodify applying update operators to the matched document.
#[derive(Clone, Debug)]
pub struct FindAndUpdate {
    namespace: Namespace,
    update: bson::Document,
    spec: FindAndModifySpec,
}

impl FindAndUpdate {
    pub fn new(namespace: Namespace, update: bson::Document) -> FindAndUpdate {
        FindAndUpdate {
            namespace: namespace,
            update: update,
            spec: FindAndModifySpec::default(),
        }
    }

    spec_builders!();

    /// Returns the post-update document instead of the original.
    pub fn return_new(mut self, return_new: bool) -> Self {
        self.spec.return_new = return_new;
        self
    }

    /// Inserts the document when the filter matches nothing.
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.spec.upsert = upsert;
        self
    }

    /// Assembles the command document, validating the update.
    pub fn build(&self) -> Result<bson::Document> {
        for key in self.update.keys() {
            if !key.starts_with('$') {
                return Err(ArgumentError(format!(
                    "All top-level keys in a find and update operation must be update \
                     operators (beginning with '$') (Bad Key: '{}')",
                    key
                )));
            }
        }

        let mut command = doc! { "findandmodify": (self.namespace.coll.clone()) };
        self.spec.append_to(&mut command);
        command.insert("update", self.update.clone());
        Ok(command)
    }

    /// Runs the command; returns the document the server selected, if any.
    pub fn execute(&self, session: &Session) -> Result<Option<bson::Document>> {
        execute_command(session, &self.namespace, self.build()?)
    }
}

/// findandmodify replacing the matched document wholesale.
#[derive(Clone, Debug)]
pub struct FindAndReplace {
    namespace: Namespace,
    replacement: bson::Document,
    spec: FindAndModifySpec,
}

impl FindAndReplace {
    pub fn new(namespace: Namespace, replacement: bson::Document) -> FindAndReplace {
        FindAndReplace {
            namespace: namespace,
            replacement: replacement,
            spec: FindAndModifySpec::default(),
        }
    }

    spec_builders!();

    /// Returns the replacement instead of the original.
    pub fn return_new(mut self, return_new: bool) -> Self {
        self.spec.return_new = return_new;
        self
    }

    /// Inserts the replacement when the filter matches nothing.
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.spec.upsert = upsert;
        self
    }

    /// Assembles the command document, rejecting update operators in the
    /// replacement.
    pub fn build(&self) -> Result<bson::Document> {
        for key in self.replacement.keys() {
            if key.starts_with('$') {
                return Err(ArgumentError(format!(
                    "Can't use update operators (beginning with '$') in a find and \
                     replace operation (Bad Key: '{}')",
                    key
                )));
            }
        }

        let mut command = doc! { "findandmodify": (self.namespace.coll.clone()) };
        self.spec.append_to(&mut command);
        command.insert("update", self.replacement.clone());
        Ok(command)
    }

    pub fn execute(&self, session: &Session) -> Result<Option<bson::Document>> {
        execute_command(session, &self.namespace, self.build()?)
    }
}

/// findandmodify removing the matched document.
#[derive(Clone, Debug)]
pub struct FindAndRemove {
    namespace: Namespace,
    spec: FindAndModifySpec,
}

impl FindAndRemove {
    pub fn new(namespace: Namespace) -> FindAndRemove {
        FindAndRemove {
            namespace: namespace,
            spec: FindAndModifySpec::default(),
        }
    }

    spec_builders!();

    /// Recorded but never legal; `build` rejects it.
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.spec.upsert = upsert;
        self
    }

    /// Assembles the command document.
    pub fn build(&self) -> Result<bson::Document> {
        if self.spec.upsert {
            return Err(ArgumentError("Can't upsert a remove".to_owned()));
        }

        let mut command = doc! { "findandmodify": (self.namespace.coll.clone()) };
        self.spec.append_to(&mut command);
        command.insert("remove", true);
        Ok(command)
    }

    pub fn execute(&self, session: &Session) -> Result<Option<bson::Document>> {
        execute_command(session, &self.namespace, self.build()?)
    }
}

fn execute_command(
    session: &Session,
    namespace: &Namespace,
    command: bson::Document,
) -> Result<Option<bson::Document>> {
    let response = run_command(session, &namespace.db, command)?;
    match response.get("value") {
        Some(&Bson::Document(ref doc)) => Ok(Some(doc.clone())),
        _ => Ok(None),
    }
}
