use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

/// Which namespace a digest belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestKind {
    Sql,
    Plan,
}

impl DigestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Plan => "plan",
        }
    }
}

#[derive(Debug, Default)]
struct Digests {
    sql: HashMap<String, String>,
    plan: HashMap<String, String>,
}

impl Digests {
    fn map(&self, kind: DigestKind) -> &HashMap<String, String> {
        match kind {
            DigestKind::Sql => &self.sql,
            DigestKind::Plan => &self.plan,
        }
    }

    fn map_mut(&mut self, kind: DigestKind) -> &mut HashMap<String, String> {
        match kind {
            DigestKind::Sql => &mut self.sql,
            DigestKind::Plan => &mut self.plan,
        }
    }
}

/// Maps hex digests to their normalized SQL or plan text.
#[derive(Debug, Default)]
pub struct DigestRegistry {
    inner: Mutex<Digests>,
}

impl DigestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `text` for `digest`, replacing any earlier text.
    pub fn link(&self, kind: DigestKind, digest: impl Into<String>, text: impl Into<String>) {
        self.inner
            .lock()
            .map_mut(kind)
            .insert(digest.into(), text.into());
    }

    /// Copy of the whole namespace, ordered by digest.
    pub fn snapshot(&self, kind: DigestKind) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .map(kind)
            .iter()
            .map(|(digest, text)| (digest.clone(), text.clone()))
            .collect()
    }

    pub fn len(&self, kind: DigestKind) -> usize {
        self.inner.lock().map(kind).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_and_snapshot() {
        let registry = DigestRegistry::new();
        registry.link(DigestKind::Sql, "ab12", "SELECT 1");

        let snap = registry.snapshot(DigestKind::Sql);
        assert_eq!(snap.get("ab12").map(String::as_str), Some("SELECT 1"));
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn test_last_writer_wins() {
        let registry = DigestRegistry::new();
        registry.link(DigestKind::Plan, "ff", "Point_Get");
        registry.link(DigestKind::Plan, "ff", "TableFullScan");

        assert_eq!(registry.len(DigestKind::Plan), 1);
        assert_eq!(
            registry.snapshot(DigestKind::Plan).get("ff").map(String::as_str),
            Some("TableFullScan")
        );
    }

    #[test]
    fn test_namespaces_are_independent() {
        let registry = DigestRegistry::new();
        registry.link(DigestKind::Sql, "ab", "SELECT ?");
        registry.link(DigestKind::Plan, "ab", "IndexLookUp");

        assert_eq!(
            registry.snapshot(DigestKind::Sql).get("ab").map(String::as_str),
            Some("SELECT ?")
        );
        assert_eq!(
            registry.snapshot(DigestKind::Plan).get("ab").map(String::as_str),
            Some("IndexLookUp")
        );
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = DigestRegistry::new();
        registry.link(DigestKind::Sql, "ab", "SELECT 1");
        let snap = registry.snapshot(DigestKind::Sql);
        registry.link(DigestKind::Sql, "cd", "SELECT 2");

        assert_eq!(snap.len(), 1);
        assert_eq!(registry.len(DigestKind::Sql), 2);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(DigestKind::Sql.as_str(), "sql");
        assert_eq!(DigestKind::Plan.as_str(), "plan");
    }
}
