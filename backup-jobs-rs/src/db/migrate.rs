use crate::db::connection::DbPool;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL CHECK(kind IN ('backup','restore')),
  status TEXT NOT NULL CHECK(status IN ('pending','running','paused','cancel-requested','succeeded','failed','canceled')),
  progress REAL NOT NULL DEFAULT 0 CHECK(progress >= 0 AND progress <= 1),
  details TEXT NOT NULL,
  lease_node_id INTEGER,
  lease_instance_id TEXT,
  lease_expires_at TEXT,
  error TEXT,
  username TEXT NOT NULL,
  description TEXT NOT NULL,
  descriptor_ids TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  modified_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
"#;

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
