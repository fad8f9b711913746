//! SHOW BACKUP: per-table summary of one backup.

use super::manifest::BackupManifest;
use crate::kv::{EntryCounts, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowBackupRow {
    pub database: String,
    pub table: String,
    /// Absent for a full backup.
    pub start_time: Option<Timestamp>,
    pub end_time: Timestamp,
    pub size_bytes: u64,
    pub rows: u64,
}

pub fn show_backup(manifest: &BackupManifest) -> Vec<ShowBackupRow> {
    let start_time = (!manifest.is_full()).then_some(manifest.start_time);
    manifest
        .tables()
        .map(|table| {
            let span = table.table_span();
            let mut counts = EntryCounts::default();
            for file in manifest.files.iter().filter(|f| span.contains(&f.span)) {
                counts.add(&file.counts);
            }
            ShowBackupRow {
                database: manifest
                    .database(table.parent_id)
                    .map(|db| db.name.clone())
                    .unwrap_or_default(),
                table: table.name.clone(),
                start_time,
                end_time: manifest.end_time,
                size_bytes: counts.data_size,
                rows: counts.rows,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::manifest::{Compression, ManifestFile};
    use crate::catalog::descriptor::{ColumnType, DatabaseDescriptor, Descriptor, PrivilegeDescriptor, TableDescriptor};
    use crate::kv::Span;
    use uuid::Uuid;

    fn manifest(names: &[(u32, &str)]) -> BackupManifest {
        let db = DatabaseDescriptor {
            id: 50,
            name: "data".into(),
            privileges: PrivilegeDescriptor::root_owned(),
        };
        let mut descriptors = vec![Descriptor::Database(db)];
        for (id, name) in names {
            let mut t = TableDescriptor::new(name)
                .column("id", ColumnType::Int, false)
                .primary_key(&["id"]);
            t.id = *id;
            t.parent_id = 50;
            descriptors.push(Descriptor::Table(t));
        }
        let spans = names.iter().map(|(id, _)| Span::table(*id)).collect();
        BackupManifest::new(Uuid::new_v4(), Timestamp::ZERO, Timestamp::new(9, 0), spans, descriptors)
    }

    fn file(path: &str, span: Span, rows: u64) -> ManifestFile {
        ManifestFile {
            path: path.into(),
            span,
            start_time: Timestamp::ZERO,
            end_time: Timestamp::new(9, 0),
            checksum: 1,
            counts: EntryCounts {
                data_size: rows * 10,
                rows,
                index_entries: 0,
            },
            compression: Compression::None,
        }
    }

    #[test]
    fn test_adjacent_tables_counted_separately() {
        let mut m = manifest(&[(51, "bank"), (52, "audit")]);
        let bank = Span::table(51);
        let mid = bank.key.next();
        m.append_file(file("a.sst", Span::new(bank.key.clone(), mid.clone()), 25)).unwrap();
        m.append_file(file("b.sst", Span::new(mid, bank.end_key.clone()), 5)).unwrap();
        m.append_file(file("c.sst", Span::table(52), 3)).unwrap();

        let rows = show_backup(&m);
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].table.as_str(), rows[0].rows, rows[0].size_bytes), ("bank", 30, 300));
        assert_eq!((rows[1].table.as_str(), rows[1].rows, rows[1].size_bytes), ("audit", 3, 30));
        assert_eq!(rows[0].start_time, None);
    }

    #[test]
    fn test_rows_per_table() {
        let db = DatabaseDescriptor {
            id: 50,
            name: "data".into(),
            privileges: PrivilegeDescriptor::root_owned(),
        };
        let mut tables = Vec::new();
        for (id, name) in [(51, "bank"), (52, "empty")] {
            let mut t = TableDescriptor::new(name)
                .column("id", ColumnType::Int, false)
                .primary_key(&["id"]);
            t.id = id;
            t.parent_id = 50;
            tables.push(t);
        }
        let mut descriptors = vec![Descriptor::Database(db)];
        descriptors.extend(tables.into_iter().map(Descriptor::Table));
        let mut m = BackupManifest::new(
            Uuid::new_v4(),
            Timestamp::new(5, 0),
            Timestamp::new(9, 0),
            vec![Span::table(51), Span::table(52)],
            descriptors,
        );
        m.append_file(ManifestFile {
            path: "a.sst".into(),
            span: Span::table(51),
            start_time: m.start_time,
            end_time: m.end_time,
            checksum: 1,
            counts: EntryCounts {
                data_size: 300,
                rows: 10,
                index_entries: 10,
            },
            compression: Compression::None,
        })
        .unwrap();

        let rows = show_backup(&m);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].database, "data");
        assert_eq!(rows[0].rows, 10);
        assert_eq!(rows[0].size_bytes, 300);
        assert_eq!(rows[0].start_time, Some(Timestamp::new(5, 0)));
        assert_eq!(rows[1].table, "empty");
        assert_eq!(rows[1].rows, 0);
    }
}
