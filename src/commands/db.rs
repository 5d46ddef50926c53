use crate::error::SyncResult;
use crate::models::document::ProfileDocument;
use crate::models::snapshot::{CompletionSnapshot, IncompleteFieldReport};
use crate::models::stage::SignupStage;
use crate::models::sync_state::SyncState;
use rusqlite::{params, Connection, OptionalExtension, Result};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const DB_SCHEMA_VERSION: i64 = 2;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;

    let mut version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        apply_migration_1(conn)?;
        version = 1;
        conn.pragma_update(None, "user_version", version)?;
    }

    if version < 2 {
        apply_migration_2(conn)?;
        version = 2;
        conn.pragma_update(None, "user_version", version)?;
    }

    if version > DB_SCHEMA_VERSION {
        // Written by a newer build; keep reading the columns we know.
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profile_documents (
            user_id TEXT PRIMARY KEY,
            document_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS progress_state (
            user_id TEXT PRIMARY KEY,
            ratio REAL,
            is_complete INTEGER,
            incomplete_json TEXT,
            computed_at INTEGER,
            stage_tag TEXT NOT NULL DEFAULT 'initial',
            updated_at INTEGER NOT NULL DEFAULT 0
        );
        ",
    )
}

fn apply_migration_2(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "progress_state", "last_local_write_at INTEGER")?;
    add_column_if_missing(conn, "progress_state", "last_observed_remote_change_at INTEGER")?;

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_profile_documents_updated_at ON profile_documents(updated_at);",
    )
}

fn add_column_if_missing(conn: &Connection, table: &str, column_def: &str) -> Result<()> {
    let column_name = column_def
        .split_whitespace()
        .next()
        .unwrap_or(column_def)
        .to_string();

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|res| res.ok())
        .any(|name| name == column_name);

    if !exists {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column_def}"), [])?;
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedProgress {
    pub snapshot: Option<CompletionSnapshot>,
    pub stage: SignupStage,
    pub last_local_write_at: Option<i64>,
    pub last_observed_remote_change_at: Option<i64>,
}

pub struct LocalCache {
    conn: Mutex<Connection>,
}

impl LocalCache {
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn load_document(&self, user_id: &str) -> SyncResult<Option<ProfileDocument>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT document_json FROM profile_documents WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => match serde_json::from_str::<ProfileDocument>(&json) {
                Ok(doc) => Ok(Some(doc)),
                Err(e) => {
                    log::warn!("discarding unreadable cached document for {user_id}: {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn store_document(&self, user_id: &str, document: &ProfileDocument) -> SyncResult<()> {
        let json = serde_json::to_string(document)?;
        let now = chrono::Utc::now().timestamp_millis();
        self.conn().execute(
            "INSERT INTO profile_documents (user_id, document_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                document_json = excluded.document_json,
                updated_at = excluded.updated_at",
            params![user_id, json, now],
        )?;
        Ok(())
    }

    pub fn load_progress(&self, user_id: &str) -> SyncResult<Option<CachedProgress>> {
        let progress = self
            .conn()
            .query_row(
                "SELECT ratio, is_complete, incomplete_json, computed_at, stage_tag,
                        last_local_write_at, last_observed_remote_change_at
                 FROM progress_state WHERE user_id = ?1",
                params![user_id],
                |row| {
                    let ratio: Option<f64> = row.get(0)?;
                    let is_complete: Option<i64> = row.get(1)?;
                    let incomplete_json: Option<String> = row.get(2)?;
                    let computed_at: Option<i64> = row.get(3)?;
                    let stage_tag: String = row.get(4)?;

                    let snapshot = match (ratio, computed_at) {
                        (Some(ratio), Some(computed_at)) => Some(CompletionSnapshot {
                            ratio: ratio.clamp(0.0, 1.0),
                            incomplete_fields: parse_incomplete(incomplete_json.as_deref()),
                            is_complete: is_complete.unwrap_or(0) != 0,
                            computed_at,
                        }),
                        _ => None,
                    };

                    Ok(CachedProgress {
                        snapshot,
                        stage: SignupStage::from_tag(&stage_tag),
                        last_local_write_at: row.get(5)?,
                        last_observed_remote_change_at: row.get(6)?,
                    })
                },
            )
            .optional()?;

        Ok(progress)
    }

    pub fn store_snapshot(&self, user_id: &str, snapshot: &CompletionSnapshot) -> SyncResult<()> {
        let incomplete_json = serde_json::to_string(&snapshot.incomplete_fields)?;
        let now = chrono::Utc::now().timestamp_millis();
        self.conn().execute(
            "INSERT INTO progress_state (user_id, ratio, is_complete, incomplete_json, computed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                ratio = excluded.ratio,
                is_complete = excluded.is_complete,
                incomplete_json = excluded.incomplete_json,
                computed_at = excluded.computed_at,
                updated_at = excluded.updated_at",
            params![
                user_id,
                snapshot.ratio,
                snapshot.is_complete as i64,
                incomplete_json,
                snapshot.computed_at,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn store_stage(&self, user_id: &str, stage: SignupStage) -> SyncResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn().execute(
            "INSERT INTO progress_state (user_id, stage_tag, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                stage_tag = excluded.stage_tag,
                updated_at = excluded.updated_at",
            params![user_id, stage.as_tag(), now],
        )?;
        Ok(())
    }

    pub fn store_sync_timestamps(&self, user_id: &str, state: &SyncState) -> SyncResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn().execute(
            "INSERT INTO progress_state (user_id, last_local_write_at, last_observed_remote_change_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                last_local_write_at = excluded.last_local_write_at,
                last_observed_remote_change_at = excluded.last_observed_remote_change_at,
                updated_at = excluded.updated_at",
            params![
                user_id,
                state.last_local_write_at,
                state.last_observed_remote_change_at,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn clear_user(&self, user_id: &str) -> SyncResult<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM profile_documents WHERE user_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM progress_state WHERE user_id = ?1", params![user_id])?;
        tx.commit()?;
        Ok(())
    }
}

fn parse_incomplete(raw: Option<&str>) -> Vec<IncompleteFieldReport> {
    raw.and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_snapshot() -> CompletionSnapshot {
        CompletionSnapshot {
            ratio: 0.5,
            incomplete_fields: vec![IncompleteFieldReport {
                field: "bio".to_string(),
                display_name: "bio".to_string(),
                human_message: "Write a short bio".to_string(),
                required_weight: 1,
                current_weight: 0,
            }],
            is_complete: false,
            computed_at: 1_000,
        }
    }

    #[test]
    fn schema_initializes_with_expected_version() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        initialize_schema(&conn).expect("schema init");
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("schema version");
        assert_eq!(version, DB_SCHEMA_VERSION);
    }

    #[test]
    fn migration_adds_timestamp_columns_to_v1_table() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        apply_migration_1(&conn).expect("v1 schema");
        conn.pragma_update(None, "user_version", 1).expect("set version");

        initialize_schema(&conn).expect("migrate");

        let mut stmt = conn.prepare("PRAGMA table_info(progress_state)").unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert!(columns.contains(&"last_local_write_at".to_string()));
        assert!(columns.contains(&"last_observed_remote_change_at".to_string()));
    }

    #[test]
    fn document_and_progress_survive_a_reload() {
        let cache = LocalCache::open_in_memory().expect("cache");
        let doc = ProfileDocument::new().with("firstName", json!("Ana"));

        cache.store_document("u1", &doc).unwrap();
        cache.store_snapshot("u1", &sample_snapshot()).unwrap();
        cache.store_stage("u1", SignupStage::Photos).unwrap();
        cache
            .store_sync_timestamps(
                "u1",
                &SyncState {
                    last_local_write_at: Some(10),
                    last_observed_remote_change_at: Some(20),
                    write_in_flight: true,
                },
            )
            .unwrap();

        assert_eq!(cache.load_document("u1").unwrap(), Some(doc));
        let progress = cache.load_progress("u1").unwrap().expect("progress row");
        assert_eq!(progress.snapshot, Some(sample_snapshot()));
        assert_eq!(progress.stage, SignupStage::Photos);
        assert_eq!(progress.last_local_write_at, Some(10));
        assert_eq!(progress.last_observed_remote_change_at, Some(20));
    }

    #[test]
    fn stage_without_snapshot_loads_with_no_snapshot() {
        let cache = LocalCache::open_in_memory().expect("cache");
        cache.store_stage("u1", SignupStage::Name).unwrap();

        let progress = cache.load_progress("u1").unwrap().expect("progress row");
        assert_eq!(progress.snapshot, None);
        assert_eq!(progress.stage, SignupStage::Name);
    }

    #[test]
    fn corrupt_stage_tag_loads_as_initial() {
        let cache = LocalCache::open_in_memory().expect("cache");
        cache.store_stage("u1", SignupStage::Bio).unwrap();
        cache
            .conn()
            .execute("UPDATE progress_state SET stage_tag = 'b!o' WHERE user_id = 'u1'", [])
            .unwrap();

        let progress = cache.load_progress("u1").unwrap().unwrap();
        assert_eq!(progress.stage, SignupStage::Initial);
    }

    #[test]
    fn clear_user_removes_only_that_user() {
        let cache = LocalCache::open_in_memory().expect("cache");
        let doc = ProfileDocument::new().with("bio", json!("hi"));
        cache.store_document("u1", &doc).unwrap();
        cache.store_document("u2", &doc).unwrap();
        cache.store_stage("u1", SignupStage::Bio).unwrap();

        cache.clear_user("u1").unwrap();

        assert_eq!(cache.load_document("u1").unwrap(), None);
        assert_eq!(cache.load_progress("u1").unwrap(), None);
        assert!(cache.load_document("u2").unwrap().is_some());
    }

    #[test]
    fn open_on_disk_creates_parent_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("cache.db");
        let cache = LocalCache::open(&path).expect("open cache");
        cache.store_stage("u1", SignupStage::Name).unwrap();
        assert!(path.exists());
    }
}
