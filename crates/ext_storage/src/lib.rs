//! Per-origin brightness storage.
//!
//! Mirrors the extension storage area: a flat map from origin to
//! [`OriginState`], with change notifications for every write that actually
//! changes a value. [`SqliteStorage`] persists at
//! `<data_dir>/.dimmer/<app-identifier>/storage.db`; [`MemoryStorage`] backs tests.

use async_trait::async_trait;
use ext_brightness::BrightnessValue;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

// ============================================================================
// Error Types with Structured Codes
// ============================================================================

/// Error codes for storage operations (8100-8109)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StorageErrorCode {
    /// Generic storage error
    Generic = 8100,
    /// Serialization error
    SerializationError = 8102,
    /// Deserialization error
    DeserializationError = 8103,
    /// Database error
    DatabaseError = 8104,
    /// Invalid key
    InvalidKey = 8106,
    /// Connection failed
    ConnectionFailed = 8108,
}

/// Custom error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("[{code}] Storage error: {message}")]
    Generic { code: u32, message: String },

    #[error("[{code}] Serialization error: {message}")]
    SerializationError { code: u32, message: String },

    #[error("[{code}] Deserialization error: {message}")]
    DeserializationError { code: u32, message: String },

    #[error("[{code}] Database error: {message}")]
    DatabaseError { code: u32, message: String },

    #[error("[{code}] Invalid key: {message}")]
    InvalidKey { code: u32, message: String },

    #[error("[{code}] Connection failed: {message}")]
    ConnectionFailed { code: u32, message: String },
}

impl StorageError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            code: StorageErrorCode::Generic as u32,
            message: message.into(),
        }
    }

    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::SerializationError {
            code: StorageErrorCode::SerializationError as u32,
            message: message.into(),
        }
    }

    pub fn deserialization_error(message: impl Into<String>) -> Self {
        Self::DeserializationError {
            code: StorageErrorCode::DeserializationError as u32,
            message: message.into(),
        }
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::DatabaseError {
            code: StorageErrorCode::DatabaseError as u32,
            message: message.into(),
        }
    }

    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            code: StorageErrorCode::InvalidKey as u32,
            message: message.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            code: StorageErrorCode::ConnectionFailed as u32,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::database_error(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization_error(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::generic(e.to_string())
    }
}

// ============================================================================
// State Types
// ============================================================================

/// Stored settings for one origin. Missing fields take the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginState {
    pub disabled: bool,
    pub value: BrightnessValue,
}

impl Default for OriginState {
    /// `{disabled: true, value: 100}`: what an origin without an entry reads as.
    fn default() -> Self {
        Self {
            disabled: true,
            value: BrightnessValue::MAX,
        }
    }
}

/// One entry of an `onChanged` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<OriginState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<OriginState>,
}

/// Changes keyed by origin.
pub type StorageChanges = HashMap<String, StorageChange>;

// ============================================================================
// Storage Area
// ============================================================================

/// `get` / `set` / `remove` / `onChanged` contract shared by every backend.
#[async_trait(?Send)]
pub trait StorageArea {
    /// State for `origin`, or [`OriginState::default`] when nothing is stored.
    async fn get(&self, origin: &str) -> Result<OriginState, StorageError>;

    async fn get_all(&self) -> Result<BTreeMap<String, OriginState>, StorageError>;

    async fn set(&self, entries: BTreeMap<String, OriginState>) -> Result<(), StorageError>;

    /// Returns true if an entry was removed.
    async fn remove(&self, origin: &str) -> Result<bool, StorageError>;

    /// `onChanged.addListener`: one batch per write that changed something.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StorageChanges>;
}

/// Fan-out of change batches to every live subscriber.
#[derive(Debug, Default)]
struct ChangeNotifier {
    listeners: RefCell<Vec<mpsc::UnboundedSender<StorageChanges>>>,
}

impl ChangeNotifier {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StorageChanges> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.borrow_mut().push(tx);
        rx
    }

    fn emit(&self, changes: StorageChanges) {
        if changes.is_empty() {
            return;
        }
        debug!(origins = changes.len(), "storage.changed");
        self.listeners
            .borrow_mut()
            .retain(|tx| tx.send(changes.clone()).is_ok());
    }
}

fn validate_key(origin: &str) -> Result<(), StorageError> {
    if origin.is_empty() {
        return Err(StorageError::invalid_key("Key cannot be empty"));
    }
    Ok(())
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RefCell<BTreeMap<String, OriginState>>,
    notifier: ChangeNotifier,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (String, OriginState)>) -> Self {
        Self {
            entries: RefCell::new(entries.into_iter().collect()),
            notifier: ChangeNotifier::default(),
        }
    }
}

#[async_trait(?Send)]
impl StorageArea for MemoryStorage {
    async fn get(&self, origin: &str) -> Result<OriginState, StorageError> {
        debug!(key = %origin, "storage.get");
        Ok(self
            .entries
            .borrow()
            .get(origin)
            .copied()
            .unwrap_or_default())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, OriginState>, StorageError> {
        Ok(self.entries.borrow().clone())
    }

    async fn set(&self, entries: BTreeMap<String, OriginState>) -> Result<(), StorageError> {
        debug!(count = entries.len(), "storage.set");
        for key in entries.keys() {
            validate_key(key)?;
        }

        let mut changes = StorageChanges::new();
        {
            let mut stored = self.entries.borrow_mut();
            for (origin, state) in entries {
                let old_value = stored.insert(origin.clone(), state);
                if old_value != Some(state) {
                    changes.insert(
                        origin,
                        StorageChange {
                            new_value: Some(state),
                            old_value,
                        },
                    );
                }
            }
        }
        self.notifier.emit(changes);
        Ok(())
    }

    async fn remove(&self, origin: &str) -> Result<bool, StorageError> {
        debug!(key = %origin, "storage.delete");
        let removed = self.entries.borrow_mut().remove(origin);
        if let Some(old_value) = removed {
            self.notifier.emit(StorageChanges::from([(
                origin.to_string(),
                StorageChange {
                    new_value: None,
                    old_value: Some(old_value),
                },
            )]));
        }
        Ok(removed.is_some())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StorageChanges> {
        self.notifier.subscribe()
    }
}

// ============================================================================
// SQLite backend
// ============================================================================

/// SQLite-backed storage sharing the `kv_store` layout: one row per origin,
/// value stored as JSON.
pub struct SqliteStorage {
    db_path: Option<PathBuf>,
    connection: Arc<Mutex<Connection>>,
    notifier: ChangeNotifier,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("db_path", &self.db_path)
            .finish()
    }
}

fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            created_at INTEGER DEFAULT (strftime('%s', 'now')),
            updated_at INTEGER DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;
    Ok(())
}

fn read_entry(conn: &Connection, origin: &str) -> Result<Option<OriginState>, StorageError> {
    let result: Result<String, rusqlite::Error> = conn.query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        [origin],
        |row| row.get(0),
    );

    match result {
        Ok(value_str) => serde_json::from_str(&value_str)
            .map(Some)
            .map_err(|e| StorageError::deserialization_error(format!("{origin}: {e}"))),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StorageError::from(e)),
    }
}

impl SqliteStorage {
    /// `<data_dir>/.dimmer/<app_identifier>/storage.db`
    pub fn default_path(app_identifier: &str) -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dimmer")
            .join(app_identifier)
            .join("storage.db")
    }

    /// Open (creating if needed) the database at `db_path`.
    pub async fn open(db_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let db_path = db_path.into();
        if let Some(dir) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let path = db_path.clone();
        let connection = tokio::task::spawn_blocking(move || -> Result<Connection, StorageError> {
            let conn = Connection::open(&path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::connection_failed(e.to_string()))??;

        debug!(path = %db_path.display(), "storage.open");
        Ok(Self {
            db_path: Some(db_path),
            connection: Arc::new(Mutex::new(connection)),
            notifier: ChangeNotifier::default(),
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            db_path: None,
            connection: Arc::new(Mutex::new(conn)),
            notifier: ChangeNotifier::default(),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

#[async_trait(?Send)]
impl StorageArea for SqliteStorage {
    async fn get(&self, origin: &str) -> Result<OriginState, StorageError> {
        debug!(key = %origin, "storage.get");
        let conn = self.connection.lock().await;
        Ok(read_entry(&conn, origin)?.unwrap_or_default())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, OriginState>, StorageError> {
        debug!("storage.get_all");
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT key, value FROM kv_store ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut result = BTreeMap::new();
        for row in rows {
            let (key, value_str) = row?;
            let state = serde_json::from_str(&value_str)
                .map_err(|e| StorageError::deserialization_error(format!("{key}: {e}")))?;
            result.insert(key, state);
        }
        Ok(result)
    }

    async fn set(&self, entries: BTreeMap<String, OriginState>) -> Result<(), StorageError> {
        debug!(count = entries.len(), "storage.set");
        if entries.is_empty() {
            return Ok(());
        }
        for key in entries.keys() {
            validate_key(key)?;
        }

        let mut changes = StorageChanges::new();
        {
            let mut conn = self.connection.lock().await;
            // Use transaction for atomicity
            let tx = conn.transaction()?;
            for (origin, state) in entries {
                let old_value = read_entry(&tx, &origin)?;
                if old_value == Some(state) {
                    continue;
                }
                let value_str = serde_json::to_string(&state)?;
                tx.execute(
                    "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, strftime('%s', 'now'))
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = strftime('%s', 'now')",
                    rusqlite::params![origin, value_str],
                )?;
                changes.insert(
                    origin,
                    StorageChange {
                        new_value: Some(state),
                        old_value,
                    },
                );
            }
            tx.commit()?;
        }

        self.notifier.emit(changes);
        Ok(())
    }

    async fn remove(&self, origin: &str) -> Result<bool, StorageError> {
        debug!(key = %origin, "storage.delete");
        let old_value = {
            let conn = self.connection.lock().await;
            let old_value = read_entry(&conn, origin)?;
            conn.execute("DELETE FROM kv_store WHERE key = ?", [origin])?;
            old_value
        };

        if let Some(old_value) = old_value {
            self.notifier.emit(StorageChanges::from([(
                origin.to_string(),
                StorageChange {
                    new_value: None,
                    old_value: Some(old_value),
                },
            )]));
        }
        Ok(old_value.is_some())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StorageChanges> {
        self.notifier.subscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn state(disabled: bool, value: f64) -> OriginState {
        OriginState {
            disabled,
            value: BrightnessValue::new(value),
        }
    }

    fn entry(origin: &str, disabled: bool, value: f64) -> BTreeMap<String, OriginState> {
        BTreeMap::from([(origin.to_string(), state(disabled, value))])
    }

    async fn exercise_backend(storage: &dyn StorageArea) {
        let mut changes = storage.subscribe();

        assert_eq!(storage.get("example.com").await.unwrap(), OriginState::default());

        storage.set(entry("example.com", false, 40.0)).await.unwrap();
        assert_eq!(storage.get("example.com").await.unwrap(), state(false, 40.0));
        let batch = changes.try_recv().unwrap();
        assert_eq!(
            batch["example.com"],
            StorageChange {
                new_value: Some(state(false, 40.0)),
                old_value: None,
            }
        );

        // rewriting the same value notifies nobody
        storage.set(entry("example.com", false, 40.0)).await.unwrap();
        assert!(changes.try_recv().is_err());

        storage.set(entry("example.com", true, 40.0)).await.unwrap();
        let batch = changes.try_recv().unwrap();
        assert_eq!(batch["example.com"].old_value, Some(state(false, 40.0)));

        storage.set(entry("other.org", false, 75.0)).await.unwrap();
        changes.try_recv().unwrap();
        let all = storage.get_all().await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["example.com", "other.org"]);

        assert!(storage.remove("example.com").await.unwrap());
        let batch = changes.try_recv().unwrap();
        assert_eq!(batch["example.com"].new_value, None);
        assert!(!storage.remove("example.com").await.unwrap());
        assert!(changes.try_recv().is_err());
        assert_eq!(storage.get("example.com").await.unwrap(), OriginState::default());

        let err = storage.set(entry("", false, 10.0)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey { .. }));
    }

    #[test]
    fn test_error_codes() {
        let err = StorageError::invalid_key("empty");
        match err {
            StorageError::InvalidKey { code, message } => {
                assert_eq!(code, StorageErrorCode::InvalidKey as u32);
                assert!(message.contains("empty"));
            }
            _ => panic!("Wrong error type"),
        }
        assert_eq!(StorageErrorCode::Generic as u32, 8100);
        assert_eq!(StorageErrorCode::ConnectionFailed as u32, 8108);
    }

    #[test]
    fn test_origin_state_layout() {
        assert_eq!(OriginState::default(), state(true, 100.0));

        let json = serde_json::to_value(state(false, 40.0)).unwrap();
        assert_eq!(json, serde_json::json!({"disabled": false, "value": 40.0}));

        let partial: OriginState = serde_json::from_str(r#"{"disabled": false}"#).unwrap();
        assert_eq!(partial, state(false, 100.0));

        let change: StorageChange =
            serde_json::from_str(r#"{"newValue": {"disabled": false, "value": 30}}"#).unwrap();
        assert_eq!(change.new_value, Some(state(false, 30.0)));
        assert_eq!(change.old_value, None);
    }

    #[tokio::test]
    async fn test_memory_storage() {
        exercise_backend(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_storage_in_memory() {
        exercise_backend(&SqliteStorage::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sqlite_storage_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.db");

        {
            let storage = SqliteStorage::open(&path).await.unwrap();
            assert_eq!(storage.db_path(), Some(path.as_path()));
            storage.set(entry("example.com", false, 55.0)).await.unwrap();
        }

        let storage = SqliteStorage::open(&path).await.unwrap();
        assert_eq!(storage.get("example.com").await.unwrap(), state(false, 55.0));
    }

    #[test]
    fn test_default_path() {
        let path = SqliteStorage::default_path("chrome-dimmer");
        assert!(path.ends_with(".dimmer/chrome-dimmer/storage.db"));
    }
}
