//! Namespace filtering (Filter, C1 of `SPEC_FULL.md`).

use crate::namespace::Namespace;

/// Decides whether a namespace is in scope for cloning and tailing.
///
/// `include` is an allow-list of namespaces or bare database names (a database name matches
/// every collection in that database); an empty `include` means "everything". `exclude` is a
/// deny-list of the same shape and always wins over `include`. System namespaces (`system.*`
/// collections and the `local` database) are implicitly excluded regardless of configuration,
/// since they hold driver/replication internals rather than user data.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Filter {
    /// Build a filter from comma-separated-style lists already split into entries.
    ///
    /// Each entry is either a bare database name (`"db"`) or a full namespace (`"db.coll"`).
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Filter { include, exclude }
    }

    /// Whether `ns` is in scope for replication.
    pub fn accept(&self, ns: &Namespace) -> bool {
        if ns.is_local() || ns.is_system() {
            return false;
        }

        if self.matches(&self.exclude, ns) {
            return false;
        }

        self.include.is_empty() || self.matches(&self.include, ns)
    }

    fn matches(&self, entries: &[String], ns: &Namespace) -> bool {
        entries.iter().any(|entry| match entry.split_once('.') {
            Some((db, coll)) => db == ns.db() && coll == ns.coll(),
            None => entry == ns.db(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_include_means_everything() {
        let filter = Filter::default();
        assert!(filter.accept(&Namespace::new("d", "c")));
    }

    #[test]
    fn exclude_beats_include() {
        let filter = Filter::new(vec!["d".into()], vec!["d.c".into()]);
        assert!(!filter.accept(&Namespace::new("d", "c")));
        assert!(filter.accept(&Namespace::new("d", "other")));
    }

    #[test]
    fn include_restricts_to_listed_namespaces() {
        let filter = Filter::new(vec!["d.c".into()], vec![]);
        assert!(filter.accept(&Namespace::new("d", "c")));
        assert!(!filter.accept(&Namespace::new("d", "other")));
    }

    #[test]
    fn system_and_local_always_excluded() {
        let filter = Filter::default();
        assert!(!filter.accept(&Namespace::new("d", "system.indexes")));
        assert!(!filter.accept(&Namespace::new("local", "oplog.rs")));
    }

    #[test]
    fn database_level_include_matches_whole_database() {
        let filter = Filter::new(vec!["d".into()], vec![]);
        assert!(filter.accept(&Namespace::new("d", "a")));
        assert!(filter.accept(&Namespace::new("d", "b")));
        assert!(!filter.accept(&Namespace::new("other", "a")));
    }
}
