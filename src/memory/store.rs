use super::{Importance, Memory, MemoryCategory, MemoryFilter, MemoryPatch, MemorySort, NewMemory};
use crate::error::StoreError;
use crate::ledger::ConversationTurn;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Catalog capacity; creating past it evicts the oldest low-importance
/// memory first.
const MAX_MEMORIES: usize = 1_000;

/// SQLite-backed durable memory catalog.
///
/// Rows whose JSON columns fail to parse are filtered out with a warning
/// rather than failing the whole query; the catalog keeps serving the
/// rest.
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;

             CREATE TABLE IF NOT EXISTS memories (
                 id             TEXT PRIMARY KEY,
                 title          TEXT NOT NULL,
                 content        TEXT NOT NULL,
                 character_id   TEXT NOT NULL,
                 character_name TEXT NOT NULL,
                 conversation   TEXT NOT NULL,
                 category       TEXT NOT NULL,
                 tags           TEXT NOT NULL,
                 importance     TEXT NOT NULL,
                 created_at     TEXT NOT NULL,
                 updated_at     TEXT NOT NULL,
                 last_accessed  TEXT,
                 access_count   INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_memories_character ON memories(character_id);
             CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── CRUD ─────────────────────────────────────────────────────────

    pub fn create(&self, fields: NewMemory) -> Result<String, StoreError> {
        let conn = self.lock();
        Self::evict_if_full(&conn)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conversation = serde_json::to_string(&fields.conversation)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let tags =
            serde_json::to_string(&fields.tags).map_err(|e| StoreError::Query(e.to_string()))?;

        conn.execute(
            "INSERT INTO memories (
                 id, title, content, character_id, character_name, conversation,
                 category, tags, importance, created_at, updated_at, last_accessed, access_count
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, 0)",
            params![
                id,
                fields.title,
                fields.content,
                fields.character_id,
                fields.character_name,
                conversation,
                fields.category.to_string(),
                tags,
                fields.importance.to_string(),
                now,
                now,
            ],
        )?;
        tracing::info!(memory_id = %id, title = %fields.title, "saved conversation memory");
        Ok(id)
    }

    /// Fetch one memory, bumping its access counter.
    pub fn get(&self, id: &str) -> Result<Option<Memory>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM memories WHERE id = ?1"),
                [id],
                |row| Ok(map_row(row)),
            )
            .optional()?;

        let Some(mapped) = row else { return Ok(None) };
        let Some(mut memory) = mapped else {
            // Malformed row: skip it, as the load contract requires.
            return Ok(None);
        };

        let accessed = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE memories SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
            params![accessed, id],
        )?;
        memory.access_count += 1;
        memory.last_accessed = Some(accessed);
        Ok(Some(memory))
    }

    /// Apply a partial edit. The conversation snapshot is immutable and
    /// has no corresponding patch field. Returns false when `id` is
    /// unknown.
    pub fn update(&self, id: &str, patch: MemoryPatch) -> Result<bool, StoreError> {
        let tags = patch
            .tags
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let changed = self.lock().execute(
            "UPDATE memories SET
                 title      = COALESCE(?1, title),
                 content    = COALESCE(?2, content),
                 category   = COALESCE(?3, category),
                 tags       = COALESCE(?4, tags),
                 importance = COALESCE(?5, importance),
                 updated_at = ?6
             WHERE id = ?7",
            params![
                patch.title,
                patch.content,
                patch.category.map(|c| c.to_string()),
                tags,
                patch.importance.map(|i| i.to_string()),
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self
            .lock()
            .execute("DELETE FROM memories WHERE id = ?1", [id])?;
        if changed > 0 {
            tracing::info!(memory_id = %id, "deleted conversation memory");
        }
        Ok(changed > 0)
    }

    // ── Query ────────────────────────────────────────────────────────

    /// All memories, sorted by a whitelisted key.
    pub fn list_all(&self, sort_by: MemorySort, descending: bool) -> Result<Vec<Memory>, StoreError> {
        let order = if descending { "DESC" } else { "ASC" };
        let sql =
            format!("SELECT {COLUMNS} FROM memories ORDER BY {} {order}", sort_by.column());
        self.collect_rows(&sql, [])
    }

    /// Filtered search; equality filters run in SQL, the keyword scan
    /// runs over the decoded rows so it can see tag text.
    pub fn search(&self, filter: &MemoryFilter) -> Result<Vec<Memory>, StoreError> {
        let mut sql = format!("SELECT {COLUMNS} FROM memories WHERE 1=1");
        let mut args: Vec<String> = Vec::new();

        if let Some(character_id) = &filter.character_id {
            sql.push_str(&format!(" AND character_id = ?{}", args.len() + 1));
            args.push(character_id.clone());
        }
        if let Some(category) = filter.category {
            sql.push_str(&format!(" AND category = ?{}", args.len() + 1));
            args.push(category.to_string());
        }
        if let Some(importance) = filter.importance {
            sql.push_str(&format!(" AND importance = ?{}", args.len() + 1));
            args.push(importance.to_string());
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut memories =
            self.collect_rows(&sql, rusqlite::params_from_iter(args.iter()))?;

        if let Some(keyword) = filter.keyword.as_deref().map(str::to_lowercase) {
            memories.retain(|memory| {
                memory.title.to_lowercase().contains(&keyword)
                    || memory.content.to_lowercase().contains(&keyword)
                    || memory.character_name.to_lowercase().contains(&keyword)
                    || memory
                        .tags
                        .iter()
                        .any(|tag| tag.to_lowercase().contains(&keyword))
            });
        }
        Ok(memories)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 =
            self.lock()
                .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn collect_rows<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Memory>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| Ok(map_row(row)))?;
        let mut memories = Vec::new();
        for row in rows {
            if let Some(memory) = row? {
                memories.push(memory);
            }
        }
        Ok(memories)
    }

    /// Keep the catalog under its cap by dropping the oldest
    /// low-importance memory; if none exists the oldest overall goes.
    fn evict_if_full(conn: &Connection) -> Result<(), StoreError> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        if count < MAX_MEMORIES as i64 {
            return Ok(());
        }

        let victim: Option<(String, String)> = conn
            .query_row(
                "SELECT id, title FROM memories WHERE importance = 'low'
                 ORDER BY created_at ASC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let victim = match victim {
            Some(v) => Some(v),
            None => conn
                .query_row(
                    "SELECT id, title FROM memories ORDER BY created_at ASC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
        };

        if let Some((id, title)) = victim {
            conn.execute("DELETE FROM memories WHERE id = ?1", [&id])?;
            tracing::warn!(memory_id = %id, %title, "memory catalog full, evicted oldest entry");
        }
        Ok(())
    }
}

const COLUMNS: &str = "id, title, content, character_id, character_name, conversation, \
                       category, tags, importance, created_at, updated_at, last_accessed, \
                       access_count";

/// Decode one row; `None` marks a malformed row the caller should skip.
fn map_row(row: &Row<'_>) -> Option<Memory> {
    let id: String = row.get(0).ok()?;
    let conversation_raw: String = row.get(5).ok()?;
    let category_raw: String = row.get(6).ok()?;
    let tags_raw: String = row.get(7).ok()?;
    let importance_raw: String = row.get(8).ok()?;

    let conversation: Vec<ConversationTurn> = match serde_json::from_str(&conversation_raw) {
        Ok(turns) => turns,
        Err(error) => {
            tracing::warn!(memory_id = %id, %error, "skipping memory with malformed conversation");
            return None;
        }
    };
    let tags: Vec<String> = match serde_json::from_str(&tags_raw) {
        Ok(tags) => tags,
        Err(error) => {
            tracing::warn!(memory_id = %id, %error, "skipping memory with malformed tags");
            return None;
        }
    };
    let Ok(category) = MemoryCategory::from_str(&category_raw) else {
        tracing::warn!(memory_id = %id, category = %category_raw, "skipping memory with unknown category");
        return None;
    };
    let Ok(importance) = Importance::from_str(&importance_raw) else {
        tracing::warn!(memory_id = %id, importance = %importance_raw, "skipping memory with unknown importance");
        return None;
    };

    Some(Memory {
        id,
        title: row.get(1).ok()?,
        content: row.get(2).ok()?,
        character_id: row.get(3).ok()?,
        character_name: row.get(4).ok()?,
        conversation,
        category,
        tags,
        importance,
        created_at: row.get(9).ok()?,
        updated_at: row.get(10).ok()?,
        last_accessed: row.get(11).ok()?,
        access_count: row.get::<_, i64>(12).ok().and_then(|n| u64::try_from(n).ok())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Speaker;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SqliteMemoryStore {
        SqliteMemoryStore::open(&dir.path().join("kotoba.db")).unwrap()
    }

    fn sample(title: &str) -> NewMemory {
        NewMemory {
            title: title.into(),
            content: "content".into(),
            character_id: "takeshi".into(),
            character_name: "Takeshi".into(),
            conversation: vec![
                ConversationTurn::new(Speaker::User, "saved question"),
                ConversationTurn::new(Speaker::Assistant, "saved answer"),
            ],
            category: MemoryCategory::TechNote,
            tags: vec!["rust".into(), "sqlite".into()],
            importance: Importance::Medium,
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(sample("First")).unwrap();

        let memory = store.get(&id).unwrap().unwrap();
        assert_eq!(memory.title, "First");
        assert_eq!(memory.conversation.len(), 2);
        assert_eq!(memory.tags, vec!["rust", "sqlite"]);
        assert_eq!(memory.category, MemoryCategory::TechNote);
    }

    #[test]
    fn get_increments_access_counter_every_time() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(sample("Counted")).unwrap();

        assert_eq!(store.get(&id).unwrap().unwrap().access_count, 1);
        assert_eq!(store.get(&id).unwrap().unwrap().access_count, 2);
        assert!(store.get(&id).unwrap().unwrap().last_accessed.is_some());
    }

    #[test]
    fn get_unknown_id_is_none() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn update_touches_metadata_but_not_the_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(sample("Before")).unwrap();

        let changed = store
            .update(
                &id,
                MemoryPatch {
                    title: Some("After".into()),
                    importance: Some(Importance::High),
                    ..MemoryPatch::default()
                },
            )
            .unwrap();
        assert!(changed);

        let memory = store.get(&id).unwrap().unwrap();
        assert_eq!(memory.title, "After");
        assert_eq!(memory.importance, Importance::High);
        // Untouched fields survive.
        assert_eq!(memory.content, "content");
        assert_eq!(memory.conversation.len(), 2);
    }

    #[test]
    fn update_unknown_id_returns_false() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(!store.update("missing", MemoryPatch::default()).unwrap());
    }

    #[test]
    fn delete_removes_the_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.create(sample("Doomed")).unwrap();
        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn keyword_search_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .create(NewMemory {
                title: "Python tips".into(),
                ..sample("ignored")
            })
            .unwrap();
        store.create(sample("Unrelated")).unwrap();

        let hits = store
            .search(&MemoryFilter {
                keyword: Some("python".into()),
                ..MemoryFilter::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Python tips");
    }

    #[test]
    fn keyword_search_sees_tag_text() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create(sample("Tagged")).unwrap();

        let hits = store
            .search(&MemoryFilter {
                keyword: Some("SQLITE".into()),
                ..MemoryFilter::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn filters_are_anded() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create(sample("Match")).unwrap();
        store
            .create(NewMemory {
                importance: Importance::High,
                ..sample("Wrong importance")
            })
            .unwrap();

        let hits = store
            .search(&MemoryFilter {
                character_id: Some("takeshi".into()),
                category: Some(MemoryCategory::TechNote),
                importance: Some(Importance::Medium),
                keyword: None,
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Match");
    }

    #[test]
    fn list_all_sorts_by_requested_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create(sample("Alpha")).unwrap();
        store.create(sample("Beta")).unwrap();

        let by_title = store.list_all(MemorySort::Title, false).unwrap();
        assert_eq!(by_title[0].title, "Alpha");
        let by_title_desc = store.list_all(MemorySort::Title, true).unwrap();
        assert_eq!(by_title_desc[0].title, "Beta");
    }

    #[test]
    fn malformed_rows_are_filtered_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let good = store.create(sample("Good")).unwrap();
        let bad = store.create(sample("Bad")).unwrap();
        store
            .lock()
            .execute(
                "UPDATE memories SET conversation = 'not json' WHERE id = ?1",
                [&bad],
            )
            .unwrap();

        let all = store.list_all(MemorySort::CreatedAt, true).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, good);
        assert!(store.get(&bad).unwrap().is_none());
    }

    #[test]
    fn catalog_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kotoba.db");
        let id = {
            let store = SqliteMemoryStore::open(&path).unwrap();
            store.create(sample("Persistent")).unwrap()
        };
        let store = SqliteMemoryStore::open(&path).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().title, "Persistent");
    }
}
