//! Namespace identity (`database.collection`) shared by the cloner and tailer.

use std::fmt;

/// A `database.collection` pair identifying a single collection on either side of the
/// replication pipeline.
///
/// Namespace identity is character-for-character: the cloner and tailer never case-fold a
/// namespace before comparing it against a `Filter` or against each other.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Build a namespace from its database and collection parts.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse a `db.coll` string, splitting on the first `.`.
    ///
    /// Returns `None` if `ns` has no `.` (e.g. a bare database name from a command document).
    pub fn parse(ns: &str) -> Option<Namespace> {
        let (db, coll) = ns.split_once('.')?;
        Some(Namespace::new(db, coll))
    }

    /// The database part.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// The collection part.
    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// Whether this is a `system.*` collection (e.g. `system.indexes`, `system.namespaces`).
    pub fn is_system(&self) -> bool {
        self.coll.starts_with("system.")
    }

    /// Whether this lives in the `local` database, which holds replication internals.
    pub fn is_local(&self) -> bool {
        self.db == "local"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_db_and_collection() {
        let ns = Namespace::parse("foo.bar.baz").unwrap();
        assert_eq!(ns.db(), "foo");
        assert_eq!(ns.coll(), "bar.baz");
    }

    #[test]
    fn rejects_bare_database_names() {
        assert!(Namespace::parse("foo").is_none());
    }

    #[test]
    fn detects_system_and_local() {
        let ns = Namespace::new("db", "system.indexes");
        assert!(ns.is_system());

        let ns = Namespace::new("local", "oplog.rs");
        assert!(ns.is_local());
    }

    #[test]
    fn display_round_trips() {
        let ns = Namespace::new("d", "c");
        assert_eq!(ns.to_string(), "d.c");
    }
}
