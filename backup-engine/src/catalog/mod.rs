//! Schema catalog contract and the in-memory catalog.

pub mod descriptor;
pub mod rowenc;

use crate::utils::errors::{EngineError, Result};
use descriptor::{
    DatabaseDescriptor, DescriptorId, DescriptorState, ForeignKey, InboundForeignKey, Privilege,
    PrivilegeDescriptor, TableDescriptor, FIRST_USER_DESCRIPTOR_ID, ROOT_USER, SYSTEM_DATABASE_ID,
    SYSTEM_DATABASE_NAME,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Descriptor lookups and schema changes the engine relies on.
///
/// Name lookups only see public descriptors; id lookups see every state.
pub trait Catalog: Send + Sync {
    fn allocate_id(&self) -> DescriptorId;

    fn database_by_name(&self, name: &str) -> Option<DatabaseDescriptor>;

    fn database_by_id(&self, id: DescriptorId) -> Option<DatabaseDescriptor>;

    fn table_by_id(&self, id: DescriptorId) -> Option<TableDescriptor>;

    fn table_by_name(&self, database_id: DescriptorId, name: &str) -> Option<TableDescriptor>;

    fn tables_in_database(&self, database_id: DescriptorId) -> Vec<TableDescriptor>;

    fn create_database(&self, desc: DatabaseDescriptor) -> Result<()>;

    fn drop_database(&self, id: DescriptorId) -> Result<()>;

    /// Inserts or replaces a table descriptor by id.
    fn write_table(&self, desc: TableDescriptor) -> Result<()>;

    fn set_table_state(&self, ids: &[DescriptorId], state: DescriptorState) -> Result<()>;

    fn is_admin(&self, user: &str) -> bool;
}

#[derive(Default)]
struct CatalogState {
    databases: BTreeMap<DescriptorId, DatabaseDescriptor>,
    tables: BTreeMap<DescriptorId, TableDescriptor>,
    /// user name → admin flag
    users: BTreeMap<String, bool>,
}

impl CatalogState {
    fn database_named(&self, name: &str) -> Result<&DatabaseDescriptor> {
        self.databases
            .values()
            .find(|db| db.name == name)
            .ok_or_else(|| EngineError::DatabaseNotFound(name.to_string()))
    }

    fn public_table_id(&self, database_id: DescriptorId, name: &str) -> Option<DescriptorId> {
        self.tables
            .values()
            .find(|t| t.parent_id == database_id && t.name == name && t.is_public())
            .map(|t| t.id)
    }

    fn table_id(&self, database: &str, table: &str) -> Result<DescriptorId> {
        let db_id = self.database_named(database)?.id;
        self.public_table_id(db_id, table)
            .ok_or_else(|| EngineError::TableNotFound(format!("{}.{}", database, table)))
    }

    fn table_mut(&mut self, id: DescriptorId) -> Result<&mut TableDescriptor> {
        self.tables
            .get_mut(&id)
            .ok_or_else(|| EngineError::Catalog(format!("descriptor {} not found", id)))
    }

    fn bump(&mut self, id: DescriptorId) {
        if let Some(t) = self.tables.get_mut(&id) {
            t.version += 1;
        }
    }

    /// Strips references other tables hold to `id`.
    fn detach(&mut self, id: DescriptorId) {
        for t in self.tables.values_mut().filter(|t| t.id != id) {
            t.referenced_by.retain(|fk| fk.origin_table != id);
            t.foreign_keys.retain(|fk| fk.referenced_table != id);
            t.interleaved_by.retain(|c| *c != id);
            t.depended_on_by.retain(|v| *v != id);
        }
    }

    /// Points every reference to `old` at `new`.
    fn redirect(&mut self, old: DescriptorId, new: DescriptorId) {
        let swap = |id: &mut DescriptorId| {
            if *id == old {
                *id = new;
            }
        };
        for t in self.tables.values_mut() {
            t.foreign_keys.iter_mut().for_each(|fk| swap(&mut fk.referenced_table));
            t.referenced_by.iter_mut().for_each(|fk| swap(&mut fk.origin_table));
            t.interleaved_by.iter_mut().for_each(swap);
            t.depended_on_by.iter_mut().for_each(swap);
            if let Some(parent) = t.interleave_parent.as_mut() {
                swap(parent);
            }
            if let Some(view) = t.view.as_mut() {
                view.depends_on.iter_mut().for_each(swap);
            }
        }
    }
}

/// In-process catalog. Starts with the `system` database and the `root` user.
pub struct MemCatalog {
    state: RwLock<CatalogState>,
    next_id: AtomicU32,
}

impl MemCatalog {
    pub fn new() -> Self {
        let mut state = CatalogState::default();
        state.databases.insert(
            SYSTEM_DATABASE_ID,
            DatabaseDescriptor {
                id: SYSTEM_DATABASE_ID,
                name: SYSTEM_DATABASE_NAME.to_string(),
                privileges: PrivilegeDescriptor::system(),
            },
        );
        state.users.insert(ROOT_USER.to_string(), true);
        Self {
            state: RwLock::new(state),
            next_id: AtomicU32::new(FIRST_USER_DESCRIPTOR_ID),
        }
    }

    pub fn create_user(&self, name: &str, admin: bool) {
        self.state.write().users.insert(name.to_string(), admin);
    }

    pub fn create_database_named(&self, name: &str) -> Result<DescriptorId> {
        let id = self.allocate_id();
        self.create_database(DatabaseDescriptor {
            id,
            name: name.to_string(),
            privileges: PrivilegeDescriptor::root_owned(),
        })?;
        Ok(id)
    }

    pub fn grant_database(&self, database: &str, user: &str, privileges: &[Privilege]) -> Result<()> {
        let mut state = self.state.write();
        let id = state.database_named(database)?.id;
        if let Some(db) = state.databases.get_mut(&id) {
            db.privileges.grant(user, privileges);
        }
        Ok(())
    }

    pub fn grant_table(&self, database: &str, table: &str, user: &str, privileges: &[Privilege]) -> Result<()> {
        let mut state = self.state.write();
        let id = state.table_id(database, table)?;
        state.table_mut(id)?.privileges.grant(user, privileges);
        state.bump(id);
        Ok(())
    }

    /// Creates a public table; it inherits the database's privileges.
    pub fn create_table_in(&self, database: &str, desc: TableDescriptor) -> Result<TableDescriptor> {
        desc.validate()?;
        let id = self.allocate_id();
        let mut state = self.state.write();
        let db = state.database_named(database)?.clone();
        if state.public_table_id(db.id, &desc.name).is_some() {
            return Err(EngineError::TableExists(desc.name));
        }
        let mut desc = desc;
        desc.id = id;
        desc.parent_id = db.id;
        desc.privileges = db.privileges.clone();
        desc.state = DescriptorState::Public;
        state.tables.insert(id, desc.clone());
        Ok(desc)
    }

    /// Creates a view over tables of the same database.
    pub fn create_view_in(
        &self,
        database: &str,
        name: &str,
        query: &str,
        depends_on: &[&str],
    ) -> Result<TableDescriptor> {
        let deps = {
            let state = self.state.read();
            depends_on
                .iter()
                .map(|t| state.table_id(database, t))
                .collect::<Result<Vec<_>>>()?
        };
        let view = self.create_table_in(database, TableDescriptor::new_view(name, query, deps.clone()))?;
        let mut state = self.state.write();
        for dep in deps {
            state.table_mut(dep)?.depended_on_by.push(view.id);
            state.bump(dep);
        }
        Ok(view)
    }

    /// `table.column` references the single-column primary key of `referenced`.
    pub fn add_foreign_key(&self, database: &str, table: &str, column: &str, referenced: &str) -> Result<()> {
        let mut state = self.state.write();
        let origin_id = state.table_id(database, table)?;
        let target_id = state.table_id(database, referenced)?;
        let column_id = state
            .table_mut(origin_id)?
            .column_by_name(column)
            .map(|c| c.id)
            .ok_or_else(|| EngineError::Catalog(format!("column \"{}\" does not exist", column)))?;
        if state.table_mut(target_id)?.primary_index.column_ids.len() != 1 {
            return Err(EngineError::Catalog(format!(
                "foreign key target \"{}\" must have a single-column primary key",
                referenced
            )));
        }
        let name = format!("fk_{}_ref_{}", column, referenced);
        state.table_mut(origin_id)?.foreign_keys.push(ForeignKey {
            name: name.clone(),
            column_id,
            referenced_table: target_id,
        });
        state.table_mut(target_id)?.referenced_by.push(InboundForeignKey {
            name,
            origin_table: origin_id,
        });
        state.bump(origin_id);
        state.bump(target_id);
        Ok(())
    }

    /// Records `child` as interleaved into `parent`'s primary index.
    pub fn interleave(&self, database: &str, child: &str, parent: &str) -> Result<()> {
        let mut state = self.state.write();
        let child_id = state.table_id(database, child)?;
        let parent_id = state.table_id(database, parent)?;
        state.table_mut(child_id)?.interleave_parent = Some(parent_id);
        state.table_mut(parent_id)?.interleaved_by.push(child_id);
        state.bump(child_id);
        state.bump(parent_id);
        Ok(())
    }

    pub fn drop_table(&self, database: &str, table: &str) -> Result<()> {
        let mut state = self.state.write();
        let id = state.table_id(database, table)?;
        state.detach(id);
        let t = state.table_mut(id)?;
        t.state = DescriptorState::Drop;
        t.version += 1;
        Ok(())
    }

    /// Replaces the table with an empty copy under a fresh id.
    pub fn truncate_table(&self, database: &str, table: &str) -> Result<DescriptorId> {
        let new_id = self.allocate_id();
        let mut state = self.state.write();
        let old_id = state.table_id(database, table)?;
        let old = state.table_mut(old_id)?;
        let mut replacement = old.clone();
        old.state = DescriptorState::Drop;
        old.version += 1;
        replacement.id = new_id;
        replacement.version = 1;
        state.tables.insert(new_id, replacement);
        state.redirect(old_id, new_id);
        Ok(new_id)
    }

    pub fn table(&self, database: &str, table: &str) -> Option<TableDescriptor> {
        let state = self.state.read();
        let id = state.table_id(database, table).ok()?;
        state.tables.get(&id).cloned()
    }

    /// Every table with `name`, in any state.
    pub fn tables_named(&self, name: &str) -> Vec<TableDescriptor> {
        self.state
            .read()
            .tables
            .values()
            .filter(|t| t.name == name)
            .cloned()
            .collect()
    }
}

impl Default for MemCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for MemCatalog {
    fn allocate_id(&self) -> DescriptorId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn database_by_name(&self, name: &str) -> Option<DatabaseDescriptor> {
        self.state.read().database_named(name).ok().cloned()
    }

    fn database_by_id(&self, id: DescriptorId) -> Option<DatabaseDescriptor> {
        self.state.read().databases.get(&id).cloned()
    }

    fn table_by_id(&self, id: DescriptorId) -> Option<TableDescriptor> {
        self.state.read().tables.get(&id).cloned()
    }

    fn table_by_name(&self, database_id: DescriptorId, name: &str) -> Option<TableDescriptor> {
        let state = self.state.read();
        let id = state.public_table_id(database_id, name)?;
        state.tables.get(&id).cloned()
    }

    fn tables_in_database(&self, database_id: DescriptorId) -> Vec<TableDescriptor> {
        self.state
            .read()
            .tables
            .values()
            .filter(|t| t.parent_id == database_id && t.is_public())
            .cloned()
            .collect()
    }

    fn create_database(&self, desc: DatabaseDescriptor) -> Result<()> {
        let mut state = self.state.write();
        if state.databases.values().any(|db| db.name == desc.name) {
            return Err(EngineError::DatabaseExists(desc.name));
        }
        if state.databases.contains_key(&desc.id) {
            return Err(EngineError::Catalog(format!("descriptor id {} already in use", desc.id)));
        }
        state.databases.insert(desc.id, desc);
        Ok(())
    }

    fn drop_database(&self, id: DescriptorId) -> Result<()> {
        let mut state = self.state.write();
        if state.tables.values().any(|t| t.parent_id == id && t.is_public()) {
            return Err(EngineError::Catalog(format!(
                "database {} still contains public tables",
                id
            )));
        }
        state.databases.remove(&id);
        Ok(())
    }

    fn write_table(&self, desc: TableDescriptor) -> Result<()> {
        let mut state = self.state.write();
        if !state.databases.contains_key(&desc.parent_id) {
            return Err(EngineError::Catalog(format!(
                "parent database {} of \"{}\" does not exist",
                desc.parent_id, desc.name
            )));
        }
        state.tables.insert(desc.id, desc);
        Ok(())
    }

    fn set_table_state(&self, ids: &[DescriptorId], new_state: DescriptorState) -> Result<()> {
        let mut state = self.state.write();
        for id in ids {
            let t = state.table_mut(*id)?;
            t.state = new_state;
            t.version += 1;
        }
        Ok(())
    }

    fn is_admin(&self, user: &str) -> bool {
        self.state.read().users.get(user).copied().unwrap_or(false)
    }
}
