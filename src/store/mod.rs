//! # Result Store
//!
//! Content-addressed persistent results, keyed by NodeId.
//!
//! ## Architecture
//!
//! ```text
//! put(node_id, value)
//!     ↓ encode (voxpod/1)
//! In-memory layer (read-your-writes, metadata persisted="pending")
//!     ↓ writer queue
//! Writer thread → SQLite file (metadata persisted=true)
//! ```
//!
//! `get` after `put` in the same process always sees the value through the
//! in-memory layer, before the persistent write completes. Duplicate puts
//! with identical content are discarded; distinct content under one id is
//! a hash-collision indicator and fails with `ConflictingContent`. Results
//! are never evicted.

use crate::hash::hash_sequence_item;
use crate::ir::NodeId;
use crate::pod::{
    self, DecodedValue, EncodedValue, PodError, SEQUENCE_PREVIEW_LEN,
};
use crate::value::{LazySequence, SeqIter, SequenceValue, ValueError, VoxValue};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Pod(#[from] PodError),

    #[error("conflicting content for node {0} (hash collision or codec drift)")]
    ConflictingContent(NodeId),

    #[error("store is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One persisted result. Immutable once written.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub node_id: NodeId,
    pub vox_type: String,
    pub payload_json: JsonValue,
    pub payload_bin: Option<Vec<u8>>,
    pub metadata: JsonValue,
    pub created_at: String,
}

impl ResultRecord {
    fn from_encoded(node_id: &str, encoded: EncodedValue, mut metadata: JsonValue) -> Self {
        if !metadata.is_object() {
            metadata = json!({});
        }
        ResultRecord {
            node_id: node_id.to_string(),
            vox_type: encoded.vox_type,
            payload_json: encoded.payload_json,
            payload_bin: encoded.payload_bin,
            metadata,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Same stored content (ignores metadata and timestamps).
    fn same_content(&self, other: &ResultRecord) -> bool {
        self.vox_type == other.vox_type
            && self.payload_json == other.payload_json
            && self.payload_bin == other.payload_bin
    }
}

// ============================================================================
// SQLite backend
// ============================================================================

/// Persistent backend: one SQLite file holding the `results` table.
pub struct SqliteResultsDatabase {
    conn: Mutex<Connection>,
}

impl SqliteResultsDatabase {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::initialize(conn)
    }

    /// Private in-memory database, for tests and ephemeral sessions.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS results (
                node_id TEXT PRIMARY KEY,
                vox_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                payload_bin BLOB NULL,
                metadata_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(SqliteResultsDatabase {
            conn: Mutex::new(conn),
        })
    }

    pub fn has(&self, node_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT 1 FROM results WHERE node_id = ?1")?;
        Ok(stmt.exists(params![node_id])?)
    }

    pub fn get_record(&self, node_id: &str) -> StoreResult<Option<ResultRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT vox_type, payload_json, payload_bin, metadata_json, created_at
             FROM results WHERE node_id = ?1",
        )?;
        let record = stmt
            .query_row(params![node_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()?;
        match record {
            None => Ok(None),
            Some((vox_type, payload_json, payload_bin, metadata_json, created_at)) => {
                Ok(Some(ResultRecord {
                    node_id: node_id.to_string(),
                    vox_type,
                    payload_json: serde_json::from_str(&payload_json)?,
                    payload_bin,
                    metadata: serde_json::from_str(&metadata_json)?,
                    created_at,
                }))
            }
        }
    }

    /// First write wins; a re-insert of the same id is a no-op.
    pub fn put_record(&self, record: &ResultRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO results
             (node_id, vox_type, payload_json, payload_bin, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![
            record.node_id,
            record.vox_type,
            serde_json::to_string(&record.payload_json)?,
            record.payload_bin,
            serde_json::to_string(&record.metadata)?,
            record.created_at,
        ])?;
        Ok(())
    }

    pub fn count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// ============================================================================
// Materialisation store (in-memory front + async writer)
// ============================================================================

enum WriteJob {
    Persist(ResultRecord),
    Flush(Sender<()>),
}

struct StoreShared {
    backend: SqliteResultsDatabase,
    memory: dashmap::DashMap<NodeId, ResultRecord>,
}

/// Content-addressed store with asynchronous write-behind persistence.
pub struct MaterializationStore {
    shared: Arc<StoreShared>,
    sender: Mutex<Option<Sender<WriteJob>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    me: std::sync::Weak<MaterializationStore>,
}

impl MaterializationStore {
    pub fn new(backend: SqliteResultsDatabase) -> Arc<Self> {
        let shared = Arc::new(StoreShared {
            backend,
            memory: dashmap::DashMap::new(),
        });
        let (sender, receiver) = unbounded::<WriteJob>();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("voxlogica-store-writer".to_string())
            .spawn(move || writer_loop(&worker_shared, &receiver))
            .expect("spawn store writer thread");
        Arc::new_cyclic(|me| MaterializationStore {
            shared,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            me: me.clone(),
        })
    }

    /// Owning handle to this store. Valid whenever a method runs, since
    /// callers always hold an Arc.
    fn handle(&self) -> Arc<MaterializationStore> {
        self.me.upgrade().expect("store accessed through Arc")
    }

    /// Open a store over a database file.
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Arc<Self>> {
        Ok(Self::new(SqliteResultsDatabase::open(db_path)?))
    }

    /// Synchronous presence check: in-memory layer first, then persistent.
    pub fn has(&self, node_id: &str) -> bool {
        if self.shared.memory.contains_key(node_id) {
            return true;
        }
        self.shared.backend.has(node_id).unwrap_or(false)
    }

    /// Synchronous lookup, read-your-writes.
    pub fn get(&self, node_id: &str) -> Option<ResultRecord> {
        if let Some(record) = self.shared.memory.get(node_id) {
            return Some(record.clone());
        }
        match self.shared.backend.get_record(node_id) {
            Ok(Some(record)) => {
                // Read-through cache.
                self.shared
                    .memory
                    .entry(node_id.to_string())
                    .or_insert_with(|| record.clone());
                Some(record)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::error!(node_id, error = %err, "store read failed");
                None
            }
        }
    }

    /// Metadata of a stored record.
    pub fn metadata(&self, node_id: &str) -> Option<JsonValue> {
        self.get(node_id).map(|record| record.metadata)
    }

    /// Enqueue a value for persistence and make it visible immediately.
    /// Returns as soon as the encoded envelope is queued for the writer.
    pub fn put(&self, node_id: &str, value: &VoxValue, metadata: JsonValue) -> StoreResult<()> {
        let encoded = pod::encode_for_storage(value)?;
        self.put_encoded(node_id, encoded, metadata)
    }

    /// Persist one element of a sequence under its derived id.
    pub fn put_element(
        &self,
        parent_id: &str,
        index: usize,
        value: &VoxValue,
    ) -> StoreResult<NodeId> {
        let element_id = hash_sequence_item(parent_id, index);
        self.put(
            &element_id,
            value,
            json!({"sequence_parent": parent_id, "index": index}),
        )?;
        Ok(element_id)
    }

    /// Persist a sequence parent envelope once its length is known.
    pub fn put_sequence_envelope(
        &self,
        parent_id: &str,
        length: usize,
        preview: &[VoxValue],
    ) -> StoreResult<()> {
        let encoded = pod::encode_sequence_envelope(length, preview);
        self.put_encoded(parent_id, encoded, json!({}))
    }

    fn put_encoded(
        &self,
        node_id: &str,
        encoded: EncodedValue,
        mut metadata: JsonValue,
    ) -> StoreResult<()> {
        if let Some(map) = metadata.as_object_mut() {
            map.insert("persisted".to_string(), json!("pending"));
        } else {
            metadata = json!({"persisted": "pending"});
        }
        let record = ResultRecord::from_encoded(node_id, encoded, metadata);

        // Idempotence: equal content is discarded, unequal content means
        // the content-addressing broke down.
        if let Some(existing) = self.get(node_id) {
            if existing.same_content(&record) {
                return Ok(());
            }
            return Err(StoreError::ConflictingContent(node_id.to_string()));
        }

        self.shared
            .memory
            .insert(node_id.to_string(), record.clone());
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(WriteJob::Persist(record)).is_err() {
                    return Err(StoreError::Closed);
                }
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }

    /// Block until the writer has drained, or the timeout expires
    /// (returns false; never raises).
    pub fn flush(&self, timeout: Duration) -> bool {
        let ack_receiver = {
            let sender = self.sender.lock();
            let Some(sender) = sender.as_ref() else {
                return true;
            };
            let (ack_sender, ack_receiver) = bounded(1);
            if sender.send(WriteJob::Flush(ack_sender)).is_err() {
                return true;
            }
            ack_receiver
        };
        ack_receiver.recv_timeout(timeout).is_ok()
    }

    /// Flush and stop the writer.
    pub fn close(&self) {
        self.flush(Duration::from_secs(30));
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    /// Decode a stored record into a runtime value. Sequence envelopes
    /// reconstruct lazily from their element records.
    pub fn get_value(&self, node_id: &str) -> StoreResult<Option<VoxValue>> {
        let Some(record) = self.get(node_id) else {
            return Ok(None);
        };
        let decoded = pod::decode_runtime_value(
            &record.vox_type,
            &record.payload_json,
            record.payload_bin.as_deref(),
        )?;
        match decoded {
            DecodedValue::Value(value) => Ok(Some(value)),
            DecodedValue::Sequence { length } => Ok(Some(VoxValue::Sequence(
                SequenceValue::new(Arc::new(StoredSequence {
                    store: self.handle(),
                    parent_id: node_id.to_string(),
                    length,
                })),
            ))),
        }
    }

    /// Materialize and persist a whole sequence: elements under their
    /// derived ids, then the parent envelope.
    pub fn put_sequence(
        &self,
        parent_id: &str,
        sequence: &SequenceValue,
    ) -> StoreResult<Vec<VoxValue>> {
        let items = sequence
            .materialize()
            .map_err(|err| StoreError::Pod(PodError::Malformed {
                vox_type: "sequence".to_string(),
                message: err.to_string(),
            }))?;
        for (index, item) in items.iter().enumerate() {
            self.put_element(parent_id, index, item)?;
        }
        let preview: Vec<VoxValue> = items.iter().take(SEQUENCE_PREVIEW_LEN).cloned().collect();
        self.put_sequence_envelope(parent_id, items.len(), &preview)?;
        Ok(items)
    }
}

impl Drop for MaterializationStore {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn writer_loop(shared: &Arc<StoreShared>, receiver: &Receiver<WriteJob>) {
    while let Ok(job) = receiver.recv() {
        match job {
            WriteJob::Persist(record) => {
                let node_id = record.node_id.clone();
                match shared.backend.put_record(&record) {
                    Ok(()) => {
                        if let Some(mut entry) = shared.memory.get_mut(&node_id) {
                            if let Some(map) = entry.metadata.as_object_mut() {
                                map.insert("persisted".to_string(), json!(true));
                            }
                        }
                    }
                    Err(err) => {
                        // The in-memory value stays usable; durability is
                        // only lost for this record.
                        tracing::error!(node_id = %node_id, error = %err, "persist failed");
                    }
                }
            }
            WriteJob::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// Lazy view over a persisted sequence: elements resolve through their
/// `sequence-item-ref` records on demand.
pub struct StoredSequence {
    store: Arc<MaterializationStore>,
    parent_id: NodeId,
    length: usize,
}

impl LazySequence for StoredSequence {
    fn iter_from(&self, offset: usize) -> SeqIter<'_> {
        let store = Arc::clone(&self.store);
        let parent_id = self.parent_id.clone();
        let length = self.length;
        Box::new((offset..length).map(move |index| {
            let element_id = hash_sequence_item(&parent_id, index);
            match store.get_value(&element_id) {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(ValueError::Eval(format!(
                    "missing element record {index} of sequence {parent_id}"
                ))),
                Err(err) => Err(ValueError::Eval(err.to_string())),
            }
        }))
    }

    fn known_len(&self) -> Option<usize> {
        Some(self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Arc<MaterializationStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MaterializationStore::open(dir.path().join("results.db")).expect("open");
        (dir, store)
    }

    #[test]
    fn test_read_your_writes_before_flush() {
        let (_dir, store) = temp_store();
        store
            .put("node-a", &VoxValue::Integer(123), json!({"source": "runtime"}))
            .expect("put");
        let meta = store.metadata("node-a").expect("metadata");
        assert_eq!(meta["source"], "runtime");
        assert!(meta["persisted"] == json!("pending") || meta["persisted"] == json!(true));
        assert!(store.has("node-a"));
    }

    #[test]
    fn test_flush_persists_to_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("results.db");
        {
            let store = MaterializationStore::open(&path).expect("open");
            store
                .put("node-async", &VoxValue::Integer(123), json!({}))
                .expect("put");
            assert!(store.flush(Duration::from_secs(5)));
            store.close();
        }
        let backend = SqliteResultsDatabase::open(&path).expect("reopen");
        assert!(backend.has("node-async").expect("has"));
    }

    #[test]
    fn test_duplicate_put_is_idempotent() {
        let (_dir, store) = temp_store();
        store
            .put("dup", &VoxValue::Integer(7), json!({}))
            .expect("first put");
        store
            .put("dup", &VoxValue::Integer(7), json!({}))
            .expect("second identical put");
    }

    #[test]
    fn test_conflicting_content_detected() {
        let (_dir, store) = temp_store();
        store
            .put("clash", &VoxValue::Integer(7), json!({}))
            .expect("first put");
        let err = store
            .put("clash", &VoxValue::Integer(8), json!({}))
            .expect_err("conflict");
        assert!(matches!(err, StoreError::ConflictingContent(_)));
    }

    #[test]
    fn test_cross_process_reread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("results.db");
        {
            let store = MaterializationStore::open(&path).expect("open");
            store
                .put("persisted", &VoxValue::Text("kept".to_string()), json!({}))
                .expect("put");
            store.close();
        }
        // A fresh store over the same file sees the record.
        let store = MaterializationStore::open(&path).expect("reopen");
        let value = store.get_value("persisted").expect("get").expect("present");
        assert_eq!(value, VoxValue::Text("kept".to_string()));
    }

    #[test]
    fn test_sequence_roundtrip_through_element_records() {
        let (_dir, store) = temp_store();
        let sequence = SequenceValue::materialized(vec![
            VoxValue::Integer(1),
            VoxValue::Integer(2),
            VoxValue::Integer(3),
        ]);
        store.put_sequence("seq-parent", &sequence).expect("put");

        let value = store
            .get_value("seq-parent")
            .expect("get")
            .expect("present");
        let seq = value.as_sequence().expect("sequence");
        assert_eq!(seq.known_len(), Some(3));
        assert_eq!(
            seq.take(10).expect("take"),
            vec![
                VoxValue::Integer(1),
                VoxValue::Integer(2),
                VoxValue::Integer(3)
            ]
        );
    }

    #[test]
    fn test_flush_timeout_returns_false_without_raising() {
        let (_dir, store) = temp_store();
        // Zero timeout races the writer; either outcome must be a clean
        // boolean.
        let _ = store.flush(Duration::from_millis(0));
    }

    #[test]
    fn test_get_missing_returns_none() {
        let (_dir, store) = temp_store();
        assert!(store.get("absent").is_none());
        assert!(!store.has("absent"));
    }
}
