//! Key rewriting from backed-up descriptor ids to freshly allocated ones.

use crate::catalog::descriptor::DescriptorId;
use crate::kv::keys::{Key, Span};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRewrite {
    pub table_id: DescriptorId,
    pub parent_id: DescriptorId,
}

/// Old table id → new table id and parent database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteMap {
    #[serde(with = "as_pairs")]
    pub tables: BTreeMap<DescriptorId, TableRewrite>,
}

/// `[[old_id, rewrite], ...]`. Integer map keys do not survive the buffered
/// deserialization of internally tagged job details.
mod as_pairs {
    use super::{DescriptorId, TableRewrite};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(tables: &BTreeMap<DescriptorId, TableRewrite>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(tables.iter())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<DescriptorId, TableRewrite>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pairs = Vec::<(DescriptorId, TableRewrite)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl RewriteMap {
    pub fn insert(&mut self, old: DescriptorId, rewrite: TableRewrite) {
        self.tables.insert(old, rewrite);
    }

    pub fn get(&self, old: DescriptorId) -> Option<&TableRewrite> {
        self.tables.get(&old)
    }

    pub fn new_id(&self, old: DescriptorId) -> Option<DescriptorId> {
        self.get(old).map(|r| r.table_id)
    }

    pub fn rewrite_key(&self, key: &Key) -> Result<Key> {
        let old = key
            .table_id()
            .ok_or_else(|| EngineError::Internal(format!("key {} has no table prefix", key)))?;
        let new = self
            .new_id(old)
            .ok_or_else(|| EngineError::Internal(format!("no rewrite for table {} (key {})", old, key)))?;
        Ok(key.with_table_id(new))
    }

    /// Rewrites a span inside one table; an end at the table's prefix end maps
    /// to the new table's prefix end.
    pub fn rewrite_span(&self, span: &Span) -> Result<Span> {
        let key = self.rewrite_key(&span.key)?;
        let old = span.key.table_id().unwrap_or_default();
        let end_key = if span.end_key == Span::table(old).end_key {
            Span::table(key.table_id().unwrap_or_default()).end_key
        } else if span.end_key.table_id() == Some(old) {
            self.rewrite_key(&span.end_key)?
        } else {
            return Err(EngineError::Internal(format!("span {} crosses tables", span)));
        };
        Ok(Span::new(key, end_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::keys::index_prefix;

    fn map() -> RewriteMap {
        let mut m = RewriteMap::default();
        m.insert(
            51,
            TableRewrite {
                table_id: 70,
                parent_id: 69,
            },
        );
        m
    }

    #[test]
    fn test_rewrite_key_keeps_suffix() {
        let mut key = index_prefix(51, 2);
        key.0.extend_from_slice(b"abc");
        let rewritten = map().rewrite_key(&key).unwrap();
        assert_eq!(rewritten.table_id(), Some(70));
        assert_eq!(rewritten.index_id(), Some(2));
        assert_eq!(rewritten.suffix(), b"abc");
        assert!(map().rewrite_key(&index_prefix(52, 1)).is_err());
    }

    #[test]
    fn test_rewrite_table_span() {
        assert_eq!(map().rewrite_span(&Span::table(51)).unwrap(), Span::table(70));
        assert_eq!(map().rewrite_span(&Span::index(51, 1)).unwrap(), Span::index(70, 1));
    }
}
