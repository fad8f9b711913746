//! Dependency resolution for RESTORE.
//!
//! Tables reference each other through interleaving, foreign keys and view
//! definitions. The selected set must be closed under the references that
//! cannot be dropped; the rest are pruned from the restored descriptors.

use super::rewrite::{RewriteMap, TableRewrite};
use crate::backup::manifest::BackupManifest;
use crate::backup::Target;
use crate::catalog::descriptor::{
    DatabaseDescriptor, DescriptorId, DescriptorState, Privilege, PrivilegeDescriptor, TableDescriptor,
};
use crate::catalog::Catalog;
use crate::kv::Span;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Restore table targets into this database instead of their own.
    #[serde(default)]
    pub into_db: Option<String>,
    #[serde(default)]
    pub skip_missing_foreign_keys: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    InterleaveParent,
    ForeignKey,
    ViewDependency,
}

/// `from` depends on `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: DescriptorId,
    pub to: DescriptorId,
    pub kind: EdgeKind,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn from_tables<'a>(tables: impl IntoIterator<Item = &'a TableDescriptor>) -> Self {
        let mut edges = Vec::new();
        for t in tables {
            if let Some(parent) = t.interleave_parent {
                edges.push(Edge {
                    from: t.id,
                    to: parent,
                    kind: EdgeKind::InterleaveParent,
                });
            }
            for fk in &t.foreign_keys {
                edges.push(Edge {
                    from: t.id,
                    to: fk.referenced_table,
                    kind: EdgeKind::ForeignKey,
                });
            }
            if let Some(view) = &t.view {
                for dep in &view.depends_on {
                    edges.push(Edge {
                        from: t.id,
                        to: *dep,
                        kind: EdgeKind::ViewDependency,
                    });
                }
            }
        }
        Self { edges }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Checks that `selected` can be restored on its own.
    pub fn check_closure(
        &self,
        selected: &BTreeSet<DescriptorId>,
        skip_missing_foreign_keys: bool,
        name: impl Fn(DescriptorId) -> String,
    ) -> Result<()> {
        for edge in &self.edges {
            let from_in = selected.contains(&edge.from);
            let to_in = selected.contains(&edge.to);
            match edge.kind {
                EdgeKind::InterleaveParent if from_in && !to_in => {
                    return Err(EngineError::WithoutInterleaveParent {
                        table: name(edge.from),
                        parent: name(edge.to),
                    })
                }
                EdgeKind::InterleaveParent if to_in && !from_in => {
                    return Err(EngineError::WithoutInterleaveChild {
                        table: name(edge.to),
                        child: name(edge.from),
                    })
                }
                EdgeKind::ForeignKey if from_in && !to_in && !skip_missing_foreign_keys => {
                    return Err(EngineError::MissingForeignKeyTarget {
                        table: name(edge.from),
                        referenced: name(edge.to),
                    })
                }
                EdgeKind::ForeignKey if to_in && !from_in && !skip_missing_foreign_keys => {
                    return Err(EngineError::MissingForeignKeyOrigin {
                        table: name(edge.to),
                        origin: name(edge.from),
                    })
                }
                EdgeKind::ViewDependency if from_in && !to_in => {
                    return Err(EngineError::ViewMissingDependency {
                        view: name(edge.from),
                        referenced: name(edge.to),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Orders `selected` so interleave parents and view dependencies come first.
    pub fn creation_order(&self, selected: &BTreeSet<DescriptorId>) -> Vec<DescriptorId> {
        let ordering: Vec<&Edge> = self
            .edges
            .iter()
            .filter(|e| e.kind != EdgeKind::ForeignKey)
            .filter(|e| selected.contains(&e.from) && selected.contains(&e.to))
            .collect();
        let mut pending: BTreeMap<DescriptorId, usize> = selected.iter().map(|id| (*id, 0)).collect();
        for e in &ordering {
            if let Some(n) = pending.get_mut(&e.from) {
                *n += 1;
            }
        }
        let mut order = Vec::with_capacity(selected.len());
        while !pending.is_empty() {
            let ready: Vec<DescriptorId> = pending.iter().filter(|(_, n)| **n == 0).map(|(id, _)| *id).collect();
            // Only a malformed backup has a cycle here; emit the rest as is.
            let batch = if ready.is_empty() {
                pending.keys().copied().collect()
            } else {
                ready
            };
            for id in batch {
                pending.remove(&id);
                for e in ordering.iter().filter(|e| e.to == id) {
                    if let Some(n) = pending.get_mut(&e.from) {
                        *n = n.saturating_sub(1);
                    }
                }
                order.push(id);
            }
        }
        order
    }
}

/// Descriptors and key rewrites for one restore, fixed before the job starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestorePlan {
    /// Databases the restore creates.
    pub databases: Vec<DatabaseDescriptor>,
    /// Rewritten tables in creation order, offline until published.
    pub tables: Vec<TableDescriptor>,
    pub rewrites: RewriteMap,
    /// Spans of the restored tables in the backup's key space.
    pub source_spans: Vec<Span>,
}

impl RestorePlan {
    pub fn table_ids(&self) -> Vec<DescriptorId> {
        self.tables.iter().map(|t| t.id).collect()
    }

    pub fn database_ids(&self) -> Vec<DescriptorId> {
        self.databases.iter().map(|db| db.id).collect()
    }
}

/// Where one selected table goes.
struct Destination {
    database: String,
    /// Whether the restore creates the database.
    create: bool,
}

/// Resolves targets against `manifest`, validates the selection and the
/// destination, and allocates new descriptor ids.
pub fn plan_restore(
    manifest: &BackupManifest,
    targets: &[Target],
    options: &RestoreOptions,
    catalog: &dyn Catalog,
    user: &str,
) -> Result<RestorePlan> {
    let mut selected: BTreeMap<DescriptorId, Destination> = BTreeMap::new();

    for target in targets {
        match target {
            Target::Database { name } => {
                if options.into_db.is_some() {
                    return Err(EngineError::IntoDbWithDatabase);
                }
                let db = manifest
                    .database_named(name)
                    .ok_or_else(|| EngineError::DatabaseNotFound(name.clone()))?;
                if !manifest.complete_dbs.contains(&db.id) {
                    return Err(EngineError::DatabaseFromTableBackup(name.clone()));
                }
                for t in manifest.tables().filter(|t| t.parent_id == db.id) {
                    selected.insert(
                        t.id,
                        Destination {
                            database: name.clone(),
                            create: true,
                        },
                    );
                }
            }
            Target::AllTables { database } => {
                let db = manifest
                    .database_named(database)
                    .ok_or_else(|| EngineError::DatabaseNotFound(database.clone()))?;
                if !manifest.complete_dbs.contains(&db.id) {
                    return Err(EngineError::WildcardFromTableBackup(database.clone()));
                }
                let dest = options.into_db.clone().unwrap_or_else(|| database.clone());
                for t in manifest.tables().filter(|t| t.parent_id == db.id) {
                    selected.insert(
                        t.id,
                        Destination {
                            database: dest.clone(),
                            create: false,
                        },
                    );
                }
            }
            Target::Table { database, table } => {
                let db = manifest.database_named(database);
                let found = db.and_then(|db| manifest.tables().find(|t| t.parent_id == db.id && &t.name == table));
                let t = found.ok_or_else(|| EngineError::TableNotFound(table.clone()))?;
                let dest = options.into_db.clone().unwrap_or_else(|| database.clone());
                selected.insert(
                    t.id,
                    Destination {
                        database: dest,
                        create: false,
                    },
                );
            }
        }
    }

    let ids: BTreeSet<DescriptorId> = selected.keys().copied().collect();
    let graph = DependencyGraph::from_tables(manifest.tables());
    let name_of = |id: DescriptorId| {
        manifest
            .table(id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| format!("[{}]", id))
    };
    graph.check_closure(&ids, options.skip_missing_foreign_keys, name_of)?;

    // Destination databases.
    let mut databases: BTreeMap<String, DatabaseDescriptor> = BTreeMap::new();
    let mut created = Vec::new();
    for dest in selected.values() {
        if databases.contains_key(&dest.database) {
            continue;
        }
        let db = if dest.create {
            if catalog.database_by_name(&dest.database).is_some() {
                return Err(EngineError::DatabaseExists(dest.database.clone()));
            }
            let db = DatabaseDescriptor {
                id: catalog.allocate_id(),
                name: dest.database.clone(),
                privileges: PrivilegeDescriptor::root_owned(),
            };
            created.push(db.clone());
            db
        } else {
            let db = catalog
                .database_by_name(&dest.database)
                .ok_or_else(|| EngineError::DatabaseMissing(dest.database.clone()))?;
            if !db.privileges.check(user, Privilege::Create) {
                return Err(EngineError::PermissionDenied(format!(
                    "user {} does not have CREATE privilege on database {}",
                    user, db.name
                )));
            }
            db
        };
        databases.insert(dest.database.clone(), db);
    }

    // New ids and name collisions.
    let mut rewrites = RewriteMap::default();
    let mut names_taken: BTreeSet<(DescriptorId, String)> = BTreeSet::new();
    for (old_id, dest) in &selected {
        let table = manifest
            .table(*old_id)
            .ok_or_else(|| EngineError::Internal(format!("descriptor {} vanished from manifest", old_id)))?;
        let db = &databases[&dest.database];
        if !dest.create && catalog.table_by_name(db.id, &table.name).is_some() {
            return Err(EngineError::TableExists(table.name.clone()));
        }
        if !names_taken.insert((db.id, table.name.clone())) {
            return Err(EngineError::TableExists(table.name.clone()));
        }
        rewrites.insert(
            *old_id,
            TableRewrite {
                table_id: catalog.allocate_id(),
                parent_id: db.id,
            },
        );
    }

    let mut tables = Vec::with_capacity(ids.len());
    let mut source_spans = Vec::new();
    for old_id in graph.creation_order(&ids) {
        let (Some(table), Some(rewrite)) = (manifest.table(old_id), rewrites.get(old_id)) else {
            continue;
        };
        if !table.is_view() {
            source_spans.push(table.table_span());
        }
        let db = databases
            .values()
            .find(|db| db.id == rewrite.parent_id)
            .ok_or_else(|| EngineError::Internal(format!("no destination for table {}", table.name)))?;
        tables.push(rewrite_descriptor(table, rewrite, &rewrites, &db.privileges));
    }
    source_spans.sort();

    Ok(RestorePlan {
        databases: created,
        tables,
        rewrites,
        source_spans,
    })
}

/// Copies `table` under its new id, pruning references outside the restore.
fn rewrite_descriptor(
    table: &TableDescriptor,
    rewrite: &TableRewrite,
    rewrites: &RewriteMap,
    privileges: &PrivilegeDescriptor,
) -> TableDescriptor {
    let mut t = table.clone();
    t.id = rewrite.table_id;
    t.parent_id = rewrite.parent_id;
    t.state = DescriptorState::Add;
    t.privileges = privileges.clone();
    t.version = 1;

    t.foreign_keys.retain_mut(|fk| match rewrites.new_id(fk.referenced_table) {
        Some(id) => {
            fk.referenced_table = id;
            true
        }
        None => false,
    });
    t.referenced_by.retain_mut(|fk| match rewrites.new_id(fk.origin_table) {
        Some(id) => {
            fk.origin_table = id;
            true
        }
        None => false,
    });
    t.interleave_parent = t.interleave_parent.and_then(|p| rewrites.new_id(p));
    t.interleaved_by = t.interleaved_by.iter().filter_map(|c| rewrites.new_id(*c)).collect();
    t.depended_on_by = t.depended_on_by.iter().filter_map(|v| rewrites.new_id(*v)).collect();
    if let Some(view) = t.view.as_mut() {
        view.depends_on = view.depends_on.iter().filter_map(|d| rewrites.new_id(*d)).collect();
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::descriptor::{ColumnType, Descriptor, ForeignKey, InboundForeignKey};
    use crate::catalog::MemCatalog;
    use crate::kv::Timestamp;
    use uuid::Uuid;

    fn table(id: DescriptorId, name: &str) -> TableDescriptor {
        let mut t = TableDescriptor::new(name)
            .column("id", ColumnType::Int, false)
            .column("ref", ColumnType::Int, true)
            .primary_key(&["id"]);
        t.id = id;
        t.parent_id = 10;
        t
    }

    /// store(11) <- orders(12) via FK, parent(13) <- child(14) interleaved,
    /// view(15) over store.
    fn manifest(complete: bool) -> BackupManifest {
        let mut store = table(11, "store");
        let mut orders = table(12, "orders");
        orders.foreign_keys.push(ForeignKey {
            name: "fk".into(),
            column_id: 2,
            referenced_table: 11,
        });
        store.referenced_by.push(InboundForeignKey {
            name: "fk".into(),
            origin_table: 12,
        });
        let mut parent = table(13, "parent");
        let mut child = table(14, "child");
        child.interleave_parent = Some(13);
        parent.interleaved_by.push(14);
        let mut view = TableDescriptor::new_view("v", "SELECT * FROM store", vec![11]);
        view.id = 15;
        view.parent_id = 10;
        store.depended_on_by.push(15);

        let mut descriptors = vec![Descriptor::Database(DatabaseDescriptor {
            id: 10,
            name: "data".into(),
            privileges: PrivilegeDescriptor::root_owned(),
        })];
        descriptors.extend([store, orders, parent, child, view].into_iter().map(Descriptor::Table));
        let mut m = BackupManifest::new(Uuid::new_v4(), Timestamp::ZERO, Timestamp::new(10, 0), vec![], descriptors);
        if complete {
            m.complete_dbs.push(10);
        }
        m.completed = true;
        m
    }

    fn t(table: &str) -> Target {
        Target::Table {
            database: "data".into(),
            table: table.into(),
        }
    }

    fn catalog() -> MemCatalog {
        let c = MemCatalog::new();
        c.create_database_named("data").unwrap();
        c
    }

    #[test]
    fn test_interleave_requires_both_sides() {
        let m = manifest(true);
        let c = catalog();
        let opts = RestoreOptions::default();
        let err = plan_restore(&m, &[t("child")], &opts, &c, "root").unwrap_err();
        assert!(err.to_string().contains("without interleave parent"), "{}", err);
        let err = plan_restore(&m, &[t("parent")], &opts, &c, "root").unwrap_err();
        assert!(err.to_string().contains("without interleave child"), "{}", err);
        let plan = plan_restore(&m, &[t("child"), t("parent")], &opts, &c, "root").unwrap();
        let child = plan.tables.iter().find(|t| t.name == "child").unwrap();
        assert_eq!(child.interleave_parent, Some(plan.tables[0].id));
        assert_eq!(plan.tables[0].name, "parent");
    }

    #[test]
    fn test_foreign_keys_need_both_sides_unless_skipped() {
        let m = manifest(true);
        let c = catalog();
        let err = plan_restore(&m, &[t("orders")], &RestoreOptions::default(), &c, "root").unwrap_err();
        assert_eq!(err.kind(), "missing_foreign_key_target");

        let skip = RestoreOptions {
            skip_missing_foreign_keys: true,
            ..Default::default()
        };
        let plan = plan_restore(&m, &[t("orders")], &skip, &c, "root").unwrap();
        assert!(plan.tables[0].foreign_keys.is_empty());
        assert_eq!(plan.tables[0].state, DescriptorState::Add);
    }

    #[test]
    fn test_view_requires_dependency() {
        let m = manifest(true);
        let c = catalog();
        let skip = RestoreOptions {
            skip_missing_foreign_keys: true,
            ..Default::default()
        };
        let err = plan_restore(&m, &[t("v")], &skip, &c, "root").unwrap_err();
        assert!(err.to_string().contains("without restoring referenced table"));

        let plan = plan_restore(&m, &[t("v"), t("store")], &skip, &c, "root").unwrap();
        let names: Vec<&str> = plan.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["store", "v"]);
        let store_id = plan.tables[0].id;
        assert_eq!(plan.tables[1].view.as_ref().unwrap().depends_on, vec![store_id]);
        assert_eq!(plan.source_spans, vec![Span::table(11)]);
    }

    #[test]
    fn test_database_targets() {
        let c = catalog();
        let err = plan_restore(
            &manifest(false),
            &[Target::Database { name: "data".into() }],
            &RestoreOptions::default(),
            &c,
            "root",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot RESTORE DATABASE from a backup of individual tables"));

        let err = plan_restore(
            &manifest(false),
            &[Target::AllTables { database: "data".into() }],
            &RestoreOptions::default(),
            &c,
            "root",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot RESTORE data.* from a backup of individual tables"));

        let err = plan_restore(
            &manifest(true),
            &[Target::Database { name: "data".into() }],
            &RestoreOptions::default(),
            &c,
            "root",
        )
        .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let into = RestoreOptions {
            into_db: Some("other".into()),
            ..Default::default()
        };
        let err = plan_restore(&manifest(true), &[Target::Database { name: "data".into() }], &into, &c, "root")
            .unwrap_err();
        assert_eq!(err.kind(), "into_db_with_database");

        let fresh = MemCatalog::new();
        let plan = plan_restore(
            &manifest(true),
            &[Target::Database { name: "data".into() }],
            &RestoreOptions::default(),
            &fresh,
            "root",
        )
        .unwrap();
        assert_eq!(plan.databases.len(), 1);
        assert_eq!(plan.tables.len(), 5);
        let parent_pos = plan.tables.iter().position(|t| t.name == "parent").unwrap();
        let child_pos = plan.tables.iter().position(|t| t.name == "child").unwrap();
        assert!(parent_pos < child_pos);
    }

    #[test]
    fn test_destination_checks() {
        let m = manifest(true);
        let skip = RestoreOptions {
            skip_missing_foreign_keys: true,
            ..Default::default()
        };
        let err = plan_restore(&m, &[t("store")], &skip, &MemCatalog::new(), "root").unwrap_err();
        assert!(err.to_string().contains("a database named \"data\" needs to exist"));

        let c = catalog();
        c.create_table_in("data", table(0, "store")).unwrap();
        let err = plan_restore(&m, &[t("store")], &skip, &c, "root").unwrap_err();
        assert_eq!(err.kind(), "table_exists");

        let into_system = RestoreOptions {
            into_db: Some("system".into()),
            skip_missing_foreign_keys: true,
        };
        let err = plan_restore(&m, &[t("orders")], &into_system, &c, "root").unwrap_err();
        assert!(err
            .to_string()
            .contains("user root does not have CREATE privilege on database system"));

        let err = plan_restore(&m, &[t("missing")], &skip, &c, "root").unwrap_err();
        assert_eq!(err.to_string(), "table \"missing\" does not exist");
    }
}
