//! Integrity checks on restored data before it is published.

use crate::catalog::descriptor::TableDescriptor;
use crate::catalog::rowenc::{self, Datum};
use crate::catalog::Catalog;
use crate::kv::{KvStore, Span, Timestamp};
use crate::utils::errors::{EngineError, Result};
use std::collections::HashMap;
use tracing::debug;

/// Every non-null foreign key value must exist in the referenced table.
pub async fn validate_foreign_keys(kv: &dyn KvStore, tables: &[TableDescriptor], at: Timestamp) -> Result<()> {
    let by_id: HashMap<_, _> = tables.iter().map(|t| (t.id, t)).collect();
    for table in tables.iter().filter(|t| !t.foreign_keys.is_empty()) {
        let rows = kv.scan(&Span::index(table.id, table.primary_index.id), at).await?;
        debug!("Validating {} foreign key(s) over {} row(s) of {}", table.foreign_keys.len(), rows.len(), table.name);
        for (_, value) in rows {
            let row = rowenc::decode_row(table, &value)?;
            for fk in &table.foreign_keys {
                let Some(pos) = table.column_position(fk.column_id) else {
                    continue;
                };
                let datum = &row[pos];
                if *datum == Datum::Null {
                    continue;
                }
                let key = rowenc::primary_key_for(fk.referenced_table, std::slice::from_ref(datum));
                if kv.get(&key, at).await?.is_none() {
                    let referenced = by_id
                        .get(&fk.referenced_table)
                        .map(|t| t.name.clone())
                        .unwrap_or_else(|| fk.referenced_table.to_string());
                    return Err(EngineError::ForeignKeyViolation {
                        table: table.name.clone(),
                        detail: format!("{:?} not present in table \"{}\" ({})", datum, referenced, fk.name),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Every view must depend only on tables that exist.
pub fn validate_views(catalog: &dyn Catalog, tables: &[TableDescriptor]) -> Result<()> {
    for view in tables.iter().filter(|t| t.is_view()) {
        let deps = view.view.as_ref().map(|v| v.depends_on.as_slice()).unwrap_or_default();
        for dep in deps {
            let exists = tables.iter().any(|t| t.id == *dep) || catalog.table_by_id(*dep).is_some_and(|t| t.is_public());
            if !exists {
                return Err(EngineError::ViewMissingDependency {
                    view: view.name.clone(),
                    referenced: dep.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::descriptor::{ColumnType, ForeignKey};
    use crate::catalog::MemCatalog;
    use crate::kv::memory::MemKv;

    fn tables() -> (TableDescriptor, TableDescriptor) {
        let mut store = TableDescriptor::new("store")
            .column("id", ColumnType::Int, false)
            .primary_key(&["id"]);
        store.id = 60;
        let mut orders = TableDescriptor::new("orders")
            .column("id", ColumnType::Int, false)
            .column("store_id", ColumnType::Int, true)
            .primary_key(&["id"]);
        orders.id = 61;
        orders.foreign_keys.push(ForeignKey {
            name: "fk_store".into(),
            column_id: 2,
            referenced_table: 60,
        });
        (store, orders)
    }

    #[tokio::test]
    async fn test_dangling_reference_detected() {
        let kv = MemKv::new();
        let (store, orders) = tables();
        kv.upsert_rows(&store, &[vec![Datum::Int(1)]]).unwrap();
        kv.upsert_rows(
            &orders,
            &[vec![Datum::Int(1), Datum::Int(1)], vec![Datum::Int(2), Datum::Null]],
        )
        .unwrap();
        let all = vec![store.clone(), orders.clone()];
        validate_foreign_keys(&kv, &all, kv.now()).await.unwrap();

        kv.upsert_rows(&orders, &[vec![Datum::Int(3), Datum::Int(7)]]).unwrap();
        let err = validate_foreign_keys(&kv, &all, kv.now()).await.unwrap_err();
        assert_eq!(err.kind(), "foreign_key_violation");
    }

    #[test]
    fn test_view_dependencies() {
        let catalog = MemCatalog::new();
        let (store, _) = tables();
        let mut view = TableDescriptor::new_view("v", "SELECT 1", vec![60]);
        view.id = 62;
        validate_views(&catalog, &[store, view.clone()]).unwrap();
        assert!(validate_views(&catalog, &[view]).is_err());
    }
}
