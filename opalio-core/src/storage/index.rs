use crate::error::Result;
use crate::object::Metadata;
use crate::object_id::ObjectId;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

/// One row of the local object index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub object_id: ObjectId,
    pub object_type: String,
    pub size: u64,
    pub created_time: i64,
    pub seconds_to_live: i64,
    pub metadata: Metadata,
}

/// SQLite index over the objects hosted by this node. Payload bytes live
/// in files; the index answers existence, size accounting, and metadata
/// queries without touching them.
pub struct ObjectIndex {
    db_path: PathBuf,
}

impl ObjectIndex {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        let index = Self { db_path };
        index.init_schema()?;
        Ok(index)
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                object_id TEXT PRIMARY KEY,
                object_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_time INTEGER NOT NULL,
                seconds_to_live INTEGER NOT NULL,
                metadata TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_objects_type ON objects(object_type)",
            [],
        )?;

        Ok(())
    }

    pub fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        let conn = self.conn()?;
        let metadata = serde_json::to_string(&entry.metadata)?;
        conn.execute(
            "INSERT OR REPLACE INTO objects
             (object_id, object_type, size, created_time, seconds_to_live, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.object_id.to_string(),
                entry.object_type,
                entry.size as i64,
                entry.created_time,
                entry.seconds_to_live,
                metadata,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, object_id: ObjectId) -> Result<Option<IndexEntry>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT object_type, size, created_time, seconds_to_live, metadata
                 FROM objects WHERE object_id = ?1",
                params![object_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((object_type, size, created_time, seconds_to_live, metadata)) => {
                Ok(Some(IndexEntry {
                    object_id,
                    object_type,
                    size: size as u64,
                    created_time,
                    seconds_to_live,
                    metadata: serde_json::from_str(&metadata)?,
                }))
            }
        }
    }

    /// Remove the row; returns whether it existed.
    pub fn delete(&self, object_id: ObjectId) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM objects WHERE object_id = ?1",
            params![object_id.to_string()],
        )?;
        Ok(removed > 0)
    }

    pub fn contains(&self, object_id: ObjectId) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM objects WHERE object_id = ?1",
            params![object_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Bytes consumed by all indexed objects, the basis of capacity
    /// accounting at startup.
    pub fn total_size(&self) -> Result<u64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM objects",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }
}
