//! SQLite-backed combination table.
//!
//! Rows are keyed by their build-time uid. The run phase only ever touches
//! `scores`, `extra_values`, `exception` and `to_run`, one row per transaction.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs2::FileExt;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::combo::{CombinationRow, CombinationTable, ExtraValues, ScoreMap, Uid};

/// Pause between attempts when SQLite reports the database busy or locked.
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Float serialization policy
// =============================================================================

/// How floats inside the JSON score columns are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatFormat {
    /// Shortest text that parses back to the same value.
    Shortest,
    /// Fixed number of significant digits; 17 is enough to round-trip any f64.
    Significant(u8),
}

impl Default for FloatFormat {
    fn default() -> Self {
        Self::Significant(17)
    }
}

impl FloatFormat {
    /// JSON text for one value. Non-finite values become `null`.
    pub fn format(self, value: f64) -> String {
        if !value.is_finite() {
            return "null".to_string();
        }
        match self {
            Self::Shortest => serde_json::Number::from_f64(value)
                .map(|n| n.to_string())
                .unwrap_or_else(|| "null".to_string()),
            Self::Significant(digits) => {
                let decimals = usize::from(digits.max(1)) - 1;
                format!("{value:.decimals$e}")
            }
        }
    }

    pub fn encode<'a, I>(self, entries: I) -> String
    where
        I: IntoIterator<Item = (&'a str, Option<f64>)>,
    {
        let body: Vec<String> = entries
            .into_iter()
            .map(|(key, value)| {
                let key = serde_json::Value::String(key.to_string());
                let value = value.map_or_else(|| "null".to_string(), |v| self.format(v));
                format!("{key}: {value}")
            })
            .collect();
        format!("{{{}}}", body.join(", "))
    }

    pub fn encode_scores(self, scores: &ScoreMap) -> String {
        self.encode(scores.iter().map(|(k, v)| (k.as_str(), Some(*v))))
    }

    pub fn encode_extras(self, extras: &ExtraValues) -> String {
        self.encode(extras.iter().map(|(k, v)| (k.as_str(), *v)))
    }
}

/// Parses a score map; `null` entries come back as NaN.
pub fn decode_scores(text: &str) -> Result<ScoreMap, serde_json::Error> {
    let raw: BTreeMap<String, Option<f64>> = serde_json::from_str(text)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
        .collect())
}

pub fn decode_extras(text: &str) -> Result<ExtraValues, serde_json::Error> {
    serde_json::from_str(text)
}

// =============================================================================
// Types
// =============================================================================

/// Result of scoring one combination, as written back to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreRecord {
    Scored {
        scores: ScoreMap,
        extra_values: ExtraValues,
    },
    Failed {
        exception: String,
    },
}

/// Directory and parameters needed to score an original e-model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEModel {
    pub original_emodel: String,
    pub emodel_dir: PathBuf,
    pub params: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub total: usize,
    pub exemplars: usize,
    pub pending: usize,
    pub scored: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("store closed")]
    Closed,
    #[error("combination {0} was already scored")]
    DoubleExecution(Uid),
    #[error("combination {0} not found")]
    NotFound(Uid),
    #[error("store already holds {0} combinations; refusing to overwrite")]
    NotEmpty(usize),
    #[error("no combination table at {}; run `prepare` first", .0.display())]
    Missing(PathBuf),
    #[error("store {} is locked by another process", .0.display())]
    Locked(PathBuf),
}

// =============================================================================
// Store
// =============================================================================

const SCHEMA: &str = "PRAGMA journal_mode=WAL;\
     PRAGMA synchronous=NORMAL;\
     PRAGMA busy_timeout=5000;\
     CREATE TABLE IF NOT EXISTS scores (\
       uid INTEGER PRIMARY KEY,\
       layer TEXT,\
       fullmtype TEXT,\
       mtype TEXT,\
       msubtype TEXT,\
       etype TEXT,\
       morph_name TEXT NOT NULL,\
       morph_ext TEXT NOT NULL,\
       morph_dir TEXT NOT NULL,\
       emodel TEXT NOT NULL,\
       original_emodel TEXT NOT NULL,\
       scores TEXT,\
       opt_scores TEXT,\
       extra_values TEXT,\
       exception TEXT,\
       to_run INTEGER NOT NULL,\
       is_exemplar INTEGER NOT NULL,\
       is_repaired INTEGER NOT NULL,\
       is_original INTEGER NOT NULL\
     );\
     CREATE TABLE IF NOT EXISTS emodels (\
       original_emodel TEXT PRIMARY KEY,\
       emodel_dir TEXT NOT NULL,\
       params TEXT NOT NULL\
     );\
     CREATE INDEX IF NOT EXISTS idx_scores_to_run ON scores(to_run);\
     CREATE INDEX IF NOT EXISTS idx_scores_emodel ON scores(emodel);";

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const ROW_COLUMNS: &str = "uid, layer, fullmtype, mtype, msubtype, etype, morph_name, morph_ext, \
     morph_dir, emodel, original_emodel, scores, opt_scores, extra_values, exception, \
     to_run, is_exemplar, is_repaired, is_original";

#[derive(Clone)]
pub struct ComboStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    /// Gate concurrent spawn_blocking calls so only one blocking thread waits on the mutex.
    sem: Arc<Semaphore>,
    floats: FloatFormat,
}

impl ComboStore {
    pub fn open(path: impl AsRef<Path>, floats: FloatFormat) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(path, conn, floats))
    }

    /// Opens a store some earlier `prepare` created. Never creates the file or the schema.
    pub fn open_existing(path: impl AsRef<Path>, floats: FloatFormat) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(StoreError::Missing(path));
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let has_table: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'scores')",
            [],
            |row| row.get(0),
        )?;
        if !has_table {
            return Err(StoreError::Missing(path));
        }
        Ok(Self::from_connection(path, conn, floats))
    }

    fn from_connection(path: PathBuf, conn: Connection, floats: FloatFormat) -> Self {
        Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
            floats,
        }
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("MECOMBO_SCORES_DB") {
            return PathBuf::from(path);
        }
        PathBuf::from("scores.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn float_format(&self) -> FloatFormat {
        self.floats
    }

    /// Advisory lock next to the database; fails fast if another runner holds it.
    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        StoreLock::new(&self.path)
    }

    /// Recovers from mutex poisoning; the SQLite connection is still usable.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError>,
    {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection, FloatFormat) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        tokio::task::spawn_blocking(move || store.with_conn(|conn| f(conn, store.floats)))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Table construction
    // -------------------------------------------------------------------------

    /// Persists a freshly built table. An existing table is only replaced when
    /// `replace` is set.
    pub async fn write_table(
        &self,
        table: &CombinationTable,
        replace: bool,
    ) -> Result<(), StoreError> {
        let rows = table.rows().to_vec();
        self.blocking(move |conn, floats| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: i64 = tx.query_row("SELECT COUNT(*) FROM scores", [], |row| row.get(0))?;
            if existing > 0 {
                if !replace {
                    return Err(StoreError::NotEmpty(existing as usize));
                }
                tx.execute("DELETE FROM scores", [])?;
            }
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO scores ({ROW_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                ))?;
                for row in &rows {
                    stmt.execute(params![
                        row.uid,
                        row.layer,
                        row.fullmtype,
                        row.mtype,
                        row.msubtype,
                        row.etype,
                        row.morph_name,
                        row.morph_ext,
                        row.morph_dir.to_string_lossy().into_owned(),
                        row.emodel,
                        row.original_emodel,
                        row.scores.as_ref().map(|s| floats.encode_scores(s)),
                        row.opt_scores.as_ref().map(|s| floats.encode_scores(s)),
                        row.extra_values.as_ref().map(|s| floats.encode_extras(s)),
                        row.exception,
                        row.to_run,
                        row.is_exemplar,
                        row.is_repaired,
                        row.is_original,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn write_emodels(&self, emodels: Vec<PersistedEModel>) -> Result<(), StoreError> {
        self.blocking(move |conn, floats| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM emodels", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO emodels (original_emodel, emodel_dir, params) VALUES (?1, ?2, ?3)",
                )?;
                for emodel in &emodels {
                    let params = floats.encode(emodel.params.iter().map(|(k, v)| (k.as_str(), Some(*v))));
                    stmt.execute(params![
                        emodel.original_emodel,
                        emodel.emodel_dir.to_string_lossy().into_owned(),
                        params
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn read_table(&self) -> Result<Vec<CombinationRow>, StoreError> {
        self.query_rows("").await
    }

    /// Rows still marked `to_run`, in uid order.
    pub async fn pending(&self) -> Result<Vec<CombinationRow>, StoreError> {
        self.query_rows("WHERE to_run = 1").await
    }

    async fn query_rows(&self, filter: &'static str) -> Result<Vec<CombinationRow>, StoreError> {
        self.blocking(move |conn, _| {
            let mut stmt =
                conn.prepare(&format!("SELECT {ROW_COLUMNS} FROM scores {filter} ORDER BY uid"))?;
            let raw = stmt
                .query_map([], row_to_raw)?
                .collect::<Result<Vec<_>, _>>()?;
            raw.into_iter().map(RawRow::decode).collect()
        })
        .await
    }

    pub async fn read_emodels(&self) -> Result<BTreeMap<String, PersistedEModel>, StoreError> {
        self.blocking(|conn, _| {
            let mut stmt =
                conn.prepare("SELECT original_emodel, emodel_dir, params FROM emodels")?;
            let raw = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let mut emodels = BTreeMap::new();
            for (original_emodel, emodel_dir, params) in raw {
                let params = decode_scores(&params)?;
                emodels.insert(
                    original_emodel.clone(),
                    PersistedEModel {
                        original_emodel,
                        emodel_dir: PathBuf::from(emodel_dir),
                        params,
                    },
                );
            }
            Ok(emodels)
        })
        .await
    }

    pub async fn status(&self) -> Result<StoreStatus, StoreError> {
        self.blocking(|conn, _| {
            let status = conn.query_row(
                "SELECT COUNT(*),\
                        COALESCE(SUM(is_exemplar), 0),\
                        COALESCE(SUM(to_run), 0),\
                        COALESCE(SUM(CASE WHEN to_run = 0 AND scores IS NOT NULL THEN 1 ELSE 0 END), 0),\
                        COALESCE(SUM(CASE WHEN to_run = 0 AND exception IS NOT NULL THEN 1 ELSE 0 END), 0)\
                 FROM scores",
                [],
                |row| {
                    Ok(StoreStatus {
                        total: row.get::<_, i64>(0)? as usize,
                        exemplars: row.get::<_, i64>(1)? as usize,
                        pending: row.get::<_, i64>(2)? as usize,
                        scored: row.get::<_, i64>(3)? as usize,
                        failed: row.get::<_, i64>(4)? as usize,
                    })
                },
            )?;
            Ok(status)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Write-back
    // -------------------------------------------------------------------------

    /// Stores the outcome for `uid` exactly once.
    ///
    /// Fails with [`StoreError::DoubleExecution`] if the row is no longer `to_run`,
    /// leaving it untouched. Busy/locked errors are retried until the write lands.
    pub async fn save_scores(&self, uid: Uid, record: ScoreRecord) -> Result<(), StoreError> {
        self.blocking(move |conn, floats| loop {
            match save_scores_once(conn, uid, &record, floats) {
                Err(StoreError::Sqlite(e)) if is_busy(&e) => {
                    debug!(uid, "store busy, retrying write");
                    std::thread::sleep(BUSY_RETRY_INTERVAL);
                }
                other => return other,
            }
        })
        .await
    }

    /// One JSON object per row, in uid order.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let rows = self.read_table().await?;
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        for row in &rows {
            let line = serde_json::to_string(row)?;
            writeln!(file, "{line}")?;
        }
        file.flush()?;
        Ok(rows.len())
    }
}

fn save_scores_once(
    conn: &mut Connection,
    uid: Uid,
    record: &ScoreRecord,
    floats: FloatFormat,
) -> Result<(), StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let to_run: Option<bool> = tx
        .query_row("SELECT to_run FROM scores WHERE uid = ?1", params![uid], |row| {
            row.get::<_, bool>(0)
        })
        .optional()?;
    match to_run {
        None => return Err(StoreError::NotFound(uid)),
        Some(false) => return Err(StoreError::DoubleExecution(uid)),
        Some(true) => {}
    }

    let (scores, extra_values, exception) = match record {
        ScoreRecord::Scored {
            scores,
            extra_values,
        } => (
            Some(floats.encode_scores(scores)),
            Some(floats.encode_extras(extra_values)),
            None,
        ),
        ScoreRecord::Failed { exception } => (None, None, Some(exception.as_str())),
    };
    tx.execute(
        "UPDATE scores SET scores = ?1, extra_values = ?2, exception = ?3, to_run = 0 \
         WHERE uid = ?4",
        params![scores, extra_values, exception, uid],
    )?;
    tx.commit()?;
    Ok(())
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

struct RawRow {
    uid: Uid,
    layer: Option<String>,
    fullmtype: Option<String>,
    mtype: Option<String>,
    msubtype: Option<String>,
    etype: Option<String>,
    morph_name: String,
    morph_ext: String,
    morph_dir: String,
    emodel: String,
    original_emodel: String,
    scores: Option<String>,
    opt_scores: Option<String>,
    extra_values: Option<String>,
    exception: Option<String>,
    to_run: bool,
    is_exemplar: bool,
    is_repaired: bool,
    is_original: bool,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        uid: row.get(0)?,
        layer: row.get(1)?,
        fullmtype: row.get(2)?,
        mtype: row.get(3)?,
        msubtype: row.get(4)?,
        etype: row.get(5)?,
        morph_name: row.get(6)?,
        morph_ext: row.get(7)?,
        morph_dir: row.get(8)?,
        emodel: row.get(9)?,
        original_emodel: row.get(10)?,
        scores: row.get(11)?,
        opt_scores: row.get(12)?,
        extra_values: row.get(13)?,
        exception: row.get(14)?,
        to_run: row.get(15)?,
        is_exemplar: row.get(16)?,
        is_repaired: row.get(17)?,
        is_original: row.get(18)?,
    })
}

impl RawRow {
    fn decode(self) -> Result<CombinationRow, StoreError> {
        Ok(CombinationRow {
            uid: self.uid,
            layer: self.layer,
            fullmtype: self.fullmtype,
            mtype: self.mtype,
            msubtype: self.msubtype,
            etype: self.etype,
            morph_name: self.morph_name,
            morph_ext: self.morph_ext,
            morph_dir: PathBuf::from(self.morph_dir),
            emodel: self.emodel,
            original_emodel: self.original_emodel,
            scores: self.scores.as_deref().map(decode_scores).transpose()?,
            opt_scores: self.opt_scores.as_deref().map(decode_scores).transpose()?,
            extra_values: self.extra_values.as_deref().map(decode_extras).transpose()?,
            exception: self.exception,
            to_run: self.to_run,
            is_exemplar: self.is_exemplar,
            is_repaired: self.is_repaired,
            is_original: self.is_original,
        })
    }
}

#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn new(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(db_path.to_path_buf()))?;
        Ok(Self { _file: file })
    }
}
