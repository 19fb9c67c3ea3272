use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use super::{encode_seq_id, placeholders, CatalogRead, IN_CLAUSE_CHUNK};
use crate::config::ConfigValue;
use crate::error::Result;

/// Exclusive write transaction on the catalog.
///
/// The lock is taken when the handle is constructed. Dropping the handle
/// without calling [`ExclusiveTx::commit`] rolls every write back.
pub struct ExclusiveTx<'c> {
    tx: Transaction<'c>,
    writes: u64,
}

impl<'c> ExclusiveTx<'c> {
    pub(super) fn begin(conn: &'c mut Connection) -> Result<Self> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        debug!("maint.catalog.lock_acquired");
        Ok(Self { tx, writes: 0 })
    }

    /// Number of rows written so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Inserts or replaces one typed configuration row of a segment.
    pub fn upsert_segment_config(
        &mut self,
        segment_id: &str,
        key: &str,
        value: &ConfigValue,
    ) -> Result<()> {
        let (s, i, f) = match value {
            ConfigValue::Str(v) => (Some(v.as_str()), None, None),
            ConfigValue::Int(v) => (None, Some(*v), None),
            ConfigValue::Float(v) => (None, None, Some(*v)),
        };
        self.tx.execute(
            "INSERT INTO segment_metadata (segment_id, key, str_value, int_value, float_value, bool_value) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL) \
             ON CONFLICT(segment_id, key) DO UPDATE SET \
             str_value = excluded.str_value, int_value = excluded.int_value, \
             float_value = excluded.float_value, bool_value = NULL",
            params![segment_id, key, s, i, f],
        )?;
        self.writes += 1;
        Ok(())
    }

    /// Deletes the WAL rows of a topic strictly below `watermark`.
    pub fn delete_wal_below(&mut self, topic: &str, watermark: i64) -> Result<u64> {
        let deleted = self.tx.execute(
            "DELETE FROM embeddings_queue WHERE topic = ?1 AND seq_id < ?2",
            params![topic, watermark],
        )? as u64;
        self.writes += deleted;
        Ok(deleted)
    }

    /// Deletes the WAL rows of a topic whose sequence id is in `seq_ids`, in
    /// statements of at most `batch_size` ids.
    pub fn delete_wal_in(&mut self, topic: &str, seq_ids: &[i64], batch_size: usize) -> Result<u64> {
        let batch = batch_size.clamp(1, IN_CLAUSE_CHUNK * 10);
        let mut deleted = 0u64;
        for chunk in seq_ids.chunks(batch) {
            let sql = format!(
                "DELETE FROM embeddings_queue WHERE topic = ? AND seq_id IN ({})",
                placeholders(chunk.len())
            );
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
            values.push(&topic);
            values.extend(chunk.iter().map(|v| v as &dyn rusqlite::ToSql));
            deleted += self.tx.execute(&sql, values.as_slice())? as u64;
        }
        self.writes += deleted;
        Ok(deleted)
    }

    /// Records the highest sequence id a segment has incorporated.
    pub fn set_max_seq_id(&mut self, segment_id: &str, seq_id: i64) -> Result<()> {
        self.tx.execute(
            "INSERT INTO max_seq_id (segment_id, seq_id) VALUES (?1, ?2) \
             ON CONFLICT(segment_id) DO UPDATE SET seq_id = excluded.seq_id",
            params![segment_id, encode_seq_id(seq_id)],
        )?;
        self.writes += 1;
        Ok(())
    }

    /// Sets `automatically_purge` in the retention configuration, creating the
    /// row when the store predates it.
    pub fn set_automatically_purge(&mut self, enabled: bool) -> Result<()> {
        let updated = self.tx.execute(
            "UPDATE embeddings_queue_config \
             SET config_json_str = json_set(COALESCE(config_json_str, '{}'), '$.automatically_purge', json(?1))",
            params![if enabled { "true" } else { "false" }],
        )?;
        if updated == 0 {
            let body = serde_json::json!({
                "automatically_purge": enabled,
                "_type": "EmbeddingsQueueConfigurationInternal",
            });
            self.tx.execute(
                "INSERT INTO embeddings_queue_config (id, config_json_str) VALUES (1, ?1)",
                params![body.to_string()],
            )?;
        }
        self.writes += 1;
        Ok(())
    }

    /// Commits every write and releases the lock.
    pub fn commit(self) -> Result<()> {
        let writes = self.writes;
        self.tx.commit()?;
        info!(writes, "maint.catalog.committed");
        Ok(())
    }

    /// Discards every write and releases the lock.
    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        debug!("maint.catalog.rolled_back");
        Ok(())
    }
}

impl CatalogRead for ExclusiveTx<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }
}
