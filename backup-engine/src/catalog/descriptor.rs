//! Schema descriptors: databases, tables and views.

use crate::kv::keys::{IndexId, Span, PRIMARY_INDEX_ID};
use crate::kv::Timestamp;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type DescriptorId = u32;
pub type ColumnId = u32;

pub const SYSTEM_DATABASE_ID: DescriptorId = 1;
pub const SYSTEM_DATABASE_NAME: &str = "system";
pub const ROOT_USER: &str = "root";

/// First id handed out to user-created descriptors.
pub const FIRST_USER_DESCRIPTOR_ID: DescriptorId = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    All,
    Create,
    Drop,
    Grant,
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeDescriptor {
    pub users: BTreeMap<String, BTreeSet<Privilege>>,
}

impl PrivilegeDescriptor {
    /// Root holds every privilege.
    pub fn root_owned() -> Self {
        let mut privileges = Self::default();
        privileges.grant(ROOT_USER, &[Privilege::All]);
        privileges
    }

    /// The system database is readable but not writable, even by root.
    pub fn system() -> Self {
        let mut privileges = Self::default();
        privileges.grant(ROOT_USER, &[Privilege::Grant, Privilege::Select]);
        privileges
    }

    pub fn grant(&mut self, user: &str, privileges: &[Privilege]) {
        self.users
            .entry(user.to_string())
            .or_default()
            .extend(privileges.iter().copied());
    }

    pub fn revoke(&mut self, user: &str, privileges: &[Privilege]) {
        if let Some(held) = self.users.get_mut(user) {
            for p in privileges {
                held.remove(p);
            }
            if held.is_empty() {
                self.users.remove(user);
            }
        }
    }

    pub fn check(&self, user: &str, privilege: Privilege) -> bool {
        self.users
            .get(user)
            .map(|held| held.contains(&Privilege::All) || held.contains(&privilege))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorState {
    Public,
    /// Being added: invisible to name lookups until published.
    Add,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub id: ColumnId,
    pub name: String,
    pub kind: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: IndexId,
    pub name: String,
    pub column_ids: Vec<ColumnId>,
    pub unique: bool,
}

/// Outbound reference: `column_id` values must exist as primary keys of
/// `referenced_table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub column_id: ColumnId,
    pub referenced_table: DescriptorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundForeignKey {
    pub name: String,
    pub origin_table: DescriptorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDescriptor {
    pub query: String,
    pub depends_on: Vec<DescriptorId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    pub id: DescriptorId,
    pub name: String,
    pub privileges: PrivilegeDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub id: DescriptorId,
    pub parent_id: DescriptorId,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_index: IndexDescriptor,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub referenced_by: Vec<InboundForeignKey>,
    /// Table whose primary index this table's rows are interleaved into.
    #[serde(default)]
    pub interleave_parent: Option<DescriptorId>,
    #[serde(default)]
    pub interleaved_by: Vec<DescriptorId>,
    #[serde(default)]
    pub view: Option<ViewDescriptor>,
    #[serde(default)]
    pub depended_on_by: Vec<DescriptorId>,
    pub state: DescriptorState,
    pub privileges: PrivilegeDescriptor,
    pub version: u64,
    pub modification_time: Timestamp,
}

/// Sentinel for a column name that did not resolve; rejected by `validate`.
const UNKNOWN_COLUMN: ColumnId = ColumnId::MAX;

impl TableDescriptor {
    /// Starts a table definition; ids and parent are assigned by the catalog.
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            parent_id: 0,
            name: name.to_string(),
            columns: Vec::new(),
            primary_index: IndexDescriptor {
                id: PRIMARY_INDEX_ID,
                name: "primary".to_string(),
                column_ids: Vec::new(),
                unique: true,
            },
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            referenced_by: Vec::new(),
            interleave_parent: None,
            interleaved_by: Vec::new(),
            view: None,
            depended_on_by: Vec::new(),
            state: DescriptorState::Public,
            privileges: PrivilegeDescriptor::default(),
            version: 1,
            modification_time: Timestamp::ZERO,
        }
    }

    /// A view over `depends_on`; views store no data.
    pub fn new_view(name: &str, query: &str, depends_on: Vec<DescriptorId>) -> Self {
        let mut desc = Self::new(name);
        desc.view = Some(ViewDescriptor {
            query: query.to_string(),
            depends_on,
        });
        desc
    }

    pub fn column(mut self, name: &str, kind: ColumnType, nullable: bool) -> Self {
        let id = self.columns.len() as ColumnId + 1;
        self.columns.push(ColumnDescriptor {
            id,
            name: name.to_string(),
            kind,
            nullable,
        });
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_index.column_ids = self.resolve_columns(columns);
        self
    }

    pub fn index(mut self, name: &str, columns: &[&str], unique: bool) -> Self {
        let id = PRIMARY_INDEX_ID + 1 + self.indexes.len() as IndexId;
        let column_ids = self.resolve_columns(columns);
        self.indexes.push(IndexDescriptor {
            id,
            name: name.to_string(),
            column_ids,
            unique,
        });
        self
    }

    fn resolve_columns(&self, names: &[&str]) -> Vec<ColumnId> {
        names
            .iter()
            .map(|n| self.column_by_name(n).map(|c| c.id).unwrap_or(UNKNOWN_COLUMN))
            .collect()
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of a column in a row.
    pub fn column_position(&self, id: ColumnId) -> Option<usize> {
        self.columns.iter().position(|c| c.id == id)
    }

    pub fn is_view(&self) -> bool {
        self.view.is_some()
    }

    pub fn is_public(&self) -> bool {
        self.state == DescriptorState::Public
    }

    pub fn is_dropped(&self) -> bool {
        self.state == DescriptorState::Drop
    }

    pub fn table_span(&self) -> Span {
        Span::table(self.id)
    }

    /// Key spans holding this table's data; empty for views.
    pub fn index_spans(&self) -> Vec<Span> {
        if self.is_view() {
            return Vec::new();
        }
        std::iter::once(&self.primary_index)
            .chain(self.indexes.iter())
            .map(|idx| Span::index(self.id, idx.id))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_view() {
            return Ok(());
        }
        if self.columns.is_empty() {
            return Err(EngineError::Catalog(format!("table \"{}\" has no columns", self.name)));
        }
        if self.primary_index.column_ids.is_empty() {
            return Err(EngineError::Catalog(format!(
                "table \"{}\" has no primary key",
                self.name
            )));
        }
        for idx in std::iter::once(&self.primary_index).chain(self.indexes.iter()) {
            if idx.column_ids.iter().any(|id| self.column_position(*id).is_none()) {
                return Err(EngineError::Catalog(format!(
                    "index \"{}\" on table \"{}\" references an unknown column",
                    idx.name, self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Descriptor {
    Database(DatabaseDescriptor),
    Table(TableDescriptor),
}

impl Descriptor {
    pub fn id(&self) -> DescriptorId {
        match self {
            Descriptor::Database(db) => db.id,
            Descriptor::Table(t) => t.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Descriptor::Database(db) => &db.name,
            Descriptor::Table(t) => &t.name,
        }
    }

    pub fn as_table(&self) -> Option<&TableDescriptor> {
        match self {
            Descriptor::Table(t) => Some(t),
            Descriptor::Database(_) => None,
        }
    }

    pub fn as_database(&self) -> Option<&DatabaseDescriptor> {
        match self {
            Descriptor::Database(db) => Some(db),
            Descriptor::Table(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> TableDescriptor {
        TableDescriptor::new("bank")
            .column("id", ColumnType::Int, false)
            .column("balance", ColumnType::Int, true)
            .column("payload", ColumnType::String, true)
            .primary_key(&["id"])
            .index("balance_idx", &["balance"], false)
    }

    #[test]
    fn test_builder_assigns_ids() {
        let t = bank();
        assert_eq!(t.columns[1].id, 2);
        assert_eq!(t.primary_index.column_ids, vec![1]);
        assert_eq!(t.indexes[0].id, 2);
        assert_eq!(t.indexes[0].column_ids, vec![2]);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_unknown_column_rejected() {
        let t = bank().index("bad", &["nope"], false);
        assert!(matches!(t.validate(), Err(EngineError::Catalog(_))));
        let t = TableDescriptor::new("nopk").column("a", ColumnType::Int, false);
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_views_have_no_spans() {
        let v = TableDescriptor::new_view("v", "SELECT 1", vec![51]);
        assert!(v.is_view());
        assert!(v.index_spans().is_empty());
        assert!(v.validate().is_ok());

        let mut t = bank();
        t.id = 51;
        assert_eq!(t.index_spans().len(), 2);
    }

    #[test]
    fn test_privileges() {
        let mut p = PrivilegeDescriptor::root_owned();
        assert!(p.check(ROOT_USER, Privilege::Create));
        p.grant("maxroach", &[Privilege::Select]);
        assert!(p.check("maxroach", Privilege::Select));
        assert!(!p.check("maxroach", Privilege::Insert));
        p.revoke("maxroach", &[Privilege::Select]);
        assert!(!p.users.contains_key("maxroach"));
        assert!(!PrivilegeDescriptor::system().check(ROOT_USER, Privilege::Create));
    }

    #[test]
    fn test_descriptor_serde_tagging() {
        let d = Descriptor::Database(DatabaseDescriptor {
            id: 50,
            name: "data".into(),
            privileges: PrivilegeDescriptor::root_owned(),
        });
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["kind"], "database");
        let back: Descriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }
}
