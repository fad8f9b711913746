mod common;

use backup_engine::backup::manifest::{read_backup, BACKUP_CHECKPOINT_NAME, BACKUP_MANIFEST_NAME};
use backup_engine::catalog::descriptor::DescriptorState;
use backup_engine::catalog::rowenc::Datum;
use backup_engine::catalog::Catalog;
use backup_engine::jobs::JobStatus;
use backup_engine::kv::KvStore;
use backup_engine::restore::RestoreOptions;
use common::*;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[tokio::test]
async fn full_backup_restores_rows_and_indexes() {
    let source = TestCluster::new();
    let bank = source.create_bank(200);

    let handle = source.service.backup("root", backup_stmt(&["DATABASE data"], "full")).await.unwrap();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, JobStatus::Succeeded);
    assert_eq!(result.counts.rows, 200);
    assert_eq!(result.counts.index_entries, 200);

    let dir = source.dir_of("full");
    let files = files_in(&dir);
    assert!(files.contains(&BACKUP_MANIFEST_NAME.to_string()));
    assert!(!files.contains(&BACKUP_CHECKPOINT_NAME.to_string()));
    assert!(files.iter().filter(|f| f.ends_with(".sst")).count() >= 2);

    let record = source.record(result.job_id).await;
    assert_eq!(record.progress, 1.0);
    assert!(record.lease.is_none());

    let target = source.sharing_storage();
    let handle = target.service.restore("root", restore_stmt(&["DATABASE data"], &["full"])).await.unwrap();
    let restored = handle.wait().await.unwrap();
    assert_eq!(restored.counts.rows, 200);

    assert_eq!(target.rows("data", "bank"), source.rows("data", "bank"));
    let restored_bank = target.catalog.table("data", "bank").unwrap();
    assert_eq!(restored_bank.state, DescriptorState::Public);
    assert_eq!(
        target.kv.count_index_entries(&restored_bank, 2, target.kv.now()),
        source.kv.count_index_entries(&bank, 2, source.kv.now())
    );
}

#[tokio::test]
async fn backup_refuses_existing_destination() {
    let cluster = TestCluster::new();
    cluster.create_bank(20);
    let stmt = backup_stmt(&["data.bank"], "once");
    cluster.service.backup("root", stmt.clone()).await.unwrap().wait().await.unwrap();

    let err = cluster.service.backup("root", stmt).await.err().unwrap();
    assert_eq!(err.kind(), "destination_exists");
    assert_eq!(cluster.service.jobs(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn restore_refuses_to_overwrite() {
    let cluster = TestCluster::new();
    cluster.create_bank(20);
    cluster
        .service
        .backup("root", backup_stmt(&["DATABASE data"], "b"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let err = cluster.service.restore("root", restore_stmt(&["DATABASE data"], &["b"])).await.err().unwrap();
    assert_eq!(err.to_string(), "database \"data\" already exists");

    let err = cluster.service.restore("root", restore_stmt(&["data.bank"], &["b"])).await.err().unwrap();
    assert_eq!(err.to_string(), "relation \"bank\" already exists");
}

#[tokio::test]
async fn restore_into_another_database() {
    let cluster = TestCluster::new();
    cluster.create_bank(50);
    cluster
        .service
        .backup("root", backup_stmt(&["data.bank"], "b"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let mut stmt = restore_stmt(&["data.bank"], &["b"]);
    stmt.options = RestoreOptions {
        into_db: Some("restored".into()),
        skip_missing_foreign_keys: false,
    };
    let err = cluster.service.restore("root", stmt.clone()).await.err().unwrap();
    assert_eq!(err.to_string(), "a database named \"restored\" needs to exist to RESTORE into it");

    cluster.catalog.create_database_named("restored").unwrap();
    cluster.service.restore("root", stmt).await.unwrap().wait().await.unwrap();
    assert_eq!(cluster.rows("restored", "bank"), cluster.rows("data", "bank"));

    let mut into_db_with_database = restore_stmt(&["DATABASE data"], &["b"]);
    into_db_with_database.options.into_db = Some("restored".into());
    let err = cluster.service.restore("root", into_db_with_database).await.err().unwrap();
    assert_eq!(err.kind(), "into_db_with_database");
}

#[tokio::test]
async fn table_backup_cannot_restore_database() {
    let source = TestCluster::new();
    source.create_bank(10);
    source
        .service
        .backup("root", backup_stmt(&["data.bank"], "tables"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let target = source.sharing_storage();
    let err = target.service.restore("root", restore_stmt(&["DATABASE data"], &["tables"])).await.err().unwrap();
    assert!(err
        .to_string()
        .starts_with("cannot RESTORE DATABASE from a backup of individual tables"));

    target.catalog.create_database_named("data").unwrap();
    let err = target.service.restore("root", restore_stmt(&["data.*"], &["tables"])).await.err().unwrap();
    assert_eq!(err.to_string(), "cannot RESTORE data.* from a backup of individual tables");
}

#[tokio::test]
async fn corrupted_file_fails_restore_and_cleans_up() {
    let source = TestCluster::new();
    source.create_bank(100);
    source
        .service
        .backup("root", backup_stmt(&["DATABASE data"], "b"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let dir = source.dir_of("b");
    let sst = files_in(&dir).into_iter().find(|f| f.ends_with(".sst")).unwrap();
    let path = dir.join(&sst);
    let mut data = std::fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    std::fs::write(&path, data).unwrap();

    let target = source.sharing_storage();
    let handle = target.service.restore("root", restore_stmt(&["DATABASE data"], &["b"])).await.unwrap();
    let job_id = handle.job_id;
    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind(), "checksum_mismatch");
    assert!(err.to_string().contains(&sst));

    let record = target.record(job_id).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().starts_with("checksum mismatch"));
    assert!(target.catalog.database_by_name("data").is_none());
    assert!(target
        .catalog
        .tables_named("bank")
        .iter()
        .all(|t| t.state == DescriptorState::Drop));
}

#[tokio::test]
async fn missing_file_is_distinct_from_corruption() {
    let source = TestCluster::new();
    source.create_bank(40);
    source
        .service
        .backup("root", backup_stmt(&["DATABASE data"], "b"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let dir = source.dir_of("b");
    let sst = files_in(&dir).into_iter().find(|f| f.ends_with(".sst")).unwrap();
    std::fs::remove_file(dir.join(&sst)).unwrap();

    let target = source.sharing_storage();
    let err = target
        .service
        .restore("root", restore_stmt(&["DATABASE data"], &["b"]))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "file_not_found");
    assert!(err.to_string().ends_with("no such file"));
}

#[tokio::test]
async fn show_backup_summarizes_tables() {
    let cluster = TestCluster::new();
    cluster.create_bank(30);
    cluster.create_simple("audit", &[1, 2, 3]);
    cluster
        .service
        .backup("root", backup_stmt(&["DATABASE data"], "b"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let rows = cluster.service.show_backup(&uri("b")).await.unwrap();
    let summary: Vec<(String, String, u64)> = rows
        .iter()
        .map(|r| (r.database.clone(), r.table.clone(), r.rows))
        .collect();
    assert!(summary.contains(&("data".into(), "bank".into(), 30)));
    assert!(summary.contains(&("data".into(), "audit".into(), 3)));
    assert!(rows.iter().all(|r| r.start_time.is_none() && r.size_bytes > 0));

    let storage = cluster.storage.open(&uri("b")).unwrap();
    let manifest = read_backup(storage.as_ref()).await.unwrap();
    assert!(manifest.completed);
    assert_eq!(manifest.entry_counts.rows, 33);
}

#[tokio::test]
async fn only_admins_back_up_and_paths_stay_inside_extern_dir() {
    let cluster = TestCluster::new();
    cluster.create_bank(5);
    cluster.catalog.create_user("testuser", false);

    let err = cluster.service.backup("testuser", backup_stmt(&["data.bank"], "b")).await.err().unwrap();
    assert_eq!(err.to_string(), "only root is allowed to BACKUP");
    let err = cluster.service.restore("testuser", restore_stmt(&["data.bank"], &["b"])).await.err().unwrap();
    assert_eq!(err.to_string(), "only root is allowed to RESTORE");

    let err = cluster
        .service
        .backup("root", backup_stmt(&["data.bank"], "../escape"))
        .await
        .err()
        .unwrap();
    assert!(err
        .to_string()
        .starts_with("local file access to paths outside of external-io-dir is not allowed"));
}

#[tokio::test]
async fn restore_needs_create_on_destination() {
    let cluster = TestCluster::new();
    cluster.create_bank(5);
    cluster
        .service
        .backup("root", backup_stmt(&["data.bank"], "b"))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let mut stmt = restore_stmt(&["data.bank"], &["b"]);
    stmt.options.into_db = Some("system".into());
    let err = cluster.service.restore("root", stmt).await.err().unwrap();
    assert_eq!(err.to_string(), "user root does not have CREATE privilege on database system");
}

#[tokio::test]
async fn memory_storage_round_trip() {
    let cluster = TestCluster::new();
    cluster.create_bank(25);
    let mut stmt = backup_stmt(&["DATABASE data"], "unused");
    stmt.uri = "mem://bucket/backups/1".into();
    cluster.service.backup("root", stmt).await.unwrap().wait().await.unwrap();

    cluster.catalog.create_database_named("copy").unwrap();
    let mut restore = restore_stmt(&["data.bank"], &[]);
    restore.uris = vec!["mem://bucket/backups/1".into()];
    restore.options.into_db = Some("copy".into());
    cluster.service.restore("root", restore).await.unwrap().wait().await.unwrap();
    assert_eq!(cluster.rows("copy", "bank"), cluster.rows("data", "bank"));
}

#[tokio::test]
async fn writes_during_backup_are_not_captured() {
    let source = TestCluster::new();
    let bank = source.create_bank(100);
    let gate = Arc::new(Semaphore::new(0));
    source.kv.set_response_gate(Some(gate.clone()));

    let handle = source.service.backup("root", backup_stmt(&["DATABASE data"], "b")).await.unwrap();
    wait_for("first export request", || source.kv.export_requests() >= 1).await;

    source.kv.upsert_rows(&bank, &bank_rows(0, 50, 777)).unwrap();
    source.kv.upsert_rows(&bank, &bank_rows(100, 120, 1)).unwrap();
    let deleted: Vec<Vec<Datum>> = (90..100).map(|i| vec![Datum::Int(i)]).collect();
    source.kv.delete_rows(&bank, &deleted).unwrap();
    gate.add_permits(1000);
    handle.wait().await.unwrap();

    let manifest = read_backup(source.storage.open(&uri("b")).unwrap().as_ref()).await.unwrap();
    let snapshot = source.rows_at("data", "bank", manifest.end_time);
    assert_eq!(snapshot.len(), 100);
    assert_ne!(snapshot, source.rows("data", "bank"));

    let target = source.sharing_storage();
    target
        .service
        .restore("root", restore_stmt(&["DATABASE data"], &["b"]))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(target.rows("data", "bank"), snapshot);
}

#[tokio::test]
async fn concurrent_jobs_on_different_tables() {
    let cluster = TestCluster::new();
    cluster.create_bank(60);
    cluster.create_simple("audit", &[1, 2, 3, 4]);

    let (bank_backup, audit_backup) = tokio::join!(
        cluster.service.backup("root", backup_stmt(&["data.bank"], "bank")),
        cluster.service.backup("root", backup_stmt(&["data.audit"], "audit")),
    );
    let (bank_done, audit_done) = tokio::join!(bank_backup.unwrap().wait(), audit_backup.unwrap().wait());
    assert_eq!(bank_done.unwrap().counts.rows, 60);
    assert_eq!(audit_done.unwrap().counts.rows, 4);

    cluster.catalog.create_database_named("restored").unwrap();
    let into = |table: &str, from: &str| {
        let mut stmt = restore_stmt(&[table], &[from]);
        stmt.options = RestoreOptions {
            into_db: Some("restored".into()),
            skip_missing_foreign_keys: false,
        };
        stmt
    };
    let (bank_restore, audit_restore) = tokio::join!(
        cluster.service.restore("root", into("data.bank", "bank")),
        cluster.service.restore("root", into("data.audit", "audit")),
    );
    let (bank_done, audit_done) = tokio::join!(bank_restore.unwrap().wait(), audit_restore.unwrap().wait());
    assert_eq!(bank_done.unwrap().status, JobStatus::Succeeded);
    assert_eq!(audit_done.unwrap().status, JobStatus::Succeeded);

    assert_eq!(cluster.rows("restored", "bank"), cluster.rows("data", "bank"));
    assert_eq!(cluster.rows("restored", "audit"), cluster.rows("data", "audit"));
}
