//! Snapshot store
//!
//! A snapshot is the fold of many live journal nodes into one SQL script: rows
//! are batch-inserted into an in-memory SQLite table, the whole database is
//! dumped to a script, and the script is zlib-compressed into a sequenced
//! `/history` node. The status path and the CSV exporter replay that script
//! into a fresh in-memory database and query it.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Map, Value};
use thiserror::Error;

pub const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS journal (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    date           DATETIME DEFAULT CURRENT_TIMESTAMP,
    authuser_id    VARCHAR(64)   NOT NULL,
    user_id        VARCHAR(64)   NOT NULL,
    as_role        VARCHAR(16)   NULL,
    request_id     VARCHAR(36)   NOT NULL,
    transaction_id VARCHAR(36)   NOT NULL,
    step           VARCHAR(16)   NOT NULL,
    host           VARCHAR(254)  NOT NULL,
    resource       VARCHAR(64)   NOT NULL,
    resourcegroup  VARCHAR(64)   NOT NULL,
    verb           VARCHAR(64)   NOT NULL,
    resourcepk     VARCHAR(128)  NULL,
    payload        TEXT          NULL,
    cm             VARCHAR(20)   NULL
)";

const INSERT_ROW: &str = "\
INSERT INTO journal (
    host, authuser_id, user_id, date,
    request_id, transaction_id,
    step, as_role,
    resourcegroup, resource, verb, resourcepk,
    payload, cm
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

const SELECT_BY_KEY: &str = "\
SELECT host, authuser_id, user_id, date,
       request_id, transaction_id, step, as_role,
       resourcegroup, resource, verb, resourcepk, payload, cm
FROM journal WHERE request_id = ?1 AND step = ?2";

const SELECT_ALL: &str = "\
SELECT host, authuser_id, user_id, date,
       request_id, transaction_id, step, as_role,
       resourcegroup, resource, verb, resourcepk, payload, cm
FROM journal";

/// Column names of [`SELECT_BY_KEY`]/[`SELECT_ALL`], in result order.
const ROW_COLUMNS: [&str; 14] = [
    "host",
    "authuser_id",
    "user_id",
    "date",
    "request_id",
    "transaction_id",
    "step",
    "as_role",
    "resourcegroup",
    "resource",
    "verb",
    "resourcepk",
    "payload",
    "cm",
];

/// Table column order used when dumping bare `INSERT INTO journal VALUES`.
const DUMP_SELECT: &str = "\
SELECT id, date, authuser_id, user_id, as_role, request_id, transaction_id,
       step, host, resource, resourcegroup, verb, resourcepk, payload, cm
FROM journal";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("compression error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot script is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One journal record flattened into the snapshot column set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRow {
    pub host: Option<String>,
    pub authuser_id: Option<String>,
    pub user_id: Option<String>,
    pub date: Option<String>,
    pub request_id: Option<String>,
    pub transaction_id: Option<String>,
    pub step: Option<String>,
    pub as_role: Option<String>,
    pub resourcegroup: Option<String>,
    pub resource: Option<String>,
    pub verb: Option<String>,
    pub resourcepk: Option<String>,
    pub payload: String,
    pub cm: Option<String>,
}

impl JournalRow {
    /// Flatten a decoded record into column values. The payload is carried as
    /// JSON text (`null` when absent); everything else is taken by key, with
    /// non-string scalars rendered to text.
    pub fn from_record(msg: &Value) -> Result<Self, SnapshotError> {
        let payload = serde_json::to_string(msg.get("payload").unwrap_or(&Value::Null))?;
        Ok(JournalRow {
            host: text_field(msg, "host"),
            authuser_id: text_field(msg, "authuser_id"),
            user_id: text_field(msg, "user_id"),
            date: text_field(msg, "date"),
            request_id: text_field(msg, "request_id"),
            transaction_id: text_field(msg, "transaction_id"),
            step: text_field(msg, "step"),
            as_role: text_field(msg, "role"),
            resourcegroup: text_field(msg, "resourcegroup"),
            resource: text_field(msg, "resource"),
            verb: text_field(msg, "verb"),
            resourcepk: text_field(msg, "resourcepk"),
            payload,
            cm: text_field(msg, "cm"),
        })
    }
}

fn text_field(msg: &Value, key: &str) -> Option<String> {
    match msg.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Insert `rows` into a fresh in-memory database and dump it to a SQL script.
///
/// Any insert failure (a NOT NULL column missing from a record, a malformed
/// value) fails the whole build; the caller abandons the snapshot and the
/// live nodes stay put for the next cycle.
pub fn build_script(rows: &[JournalRow]) -> Result<String, SnapshotError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(CREATE_TABLE)?;
    {
        let mut stmt = conn.prepare(INSERT_ROW)?;
        for row in rows {
            stmt.execute(rusqlite::params![
                row.host,
                row.authuser_id,
                row.user_id,
                row.date,
                row.request_id,
                row.transaction_id,
                row.step,
                row.as_role,
                row.resourcegroup,
                row.resource,
                row.verb,
                row.resourcepk,
                row.payload,
                row.cm,
            ])?;
        }
    }
    dump_script(&conn)
}

fn dump_script(conn: &Connection) -> Result<String, SnapshotError> {
    let mut out = String::from("BEGIN TRANSACTION;\n");
    out.push_str(CREATE_TABLE);
    out.push_str(";\n");
    let mut stmt = conn.prepare(DUMP_SELECT)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        out.push_str("INSERT INTO journal VALUES(");
        for i in 0..15 {
            if i > 0 {
                out.push(',');
            }
            push_sql_literal(&mut out, row.get_ref(i)?);
        }
        out.push_str(");\n");
    }
    out.push_str("COMMIT;\n");
    Ok(out)
}

fn push_sql_literal(out: &mut String, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => out.push_str("NULL"),
        ValueRef::Integer(i) => out.push_str(&i.to_string()),
        ValueRef::Real(f) => out.push_str(&f.to_string()),
        ValueRef::Text(t) => {
            out.push('\'');
            out.push_str(&String::from_utf8_lossy(t).replace('\'', "''"));
            out.push('\'');
        }
        ValueRef::Blob(b) => {
            out.push_str("X'");
            for byte in b {
                out.push_str(&format!("{byte:02x}"));
            }
            out.push('\'');
        }
    }
}

/// Replay a snapshot script into a fresh in-memory database.
pub fn load_script(script: &str) -> Result<Connection, SnapshotError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(script)?;
    Ok(conn)
}

/// Look up the row for `(request_id, step)`, as a column-name → value map.
pub fn query_step(
    conn: &Connection,
    txid: &str,
    step: &str,
) -> Result<Option<Map<String, Value>>, SnapshotError> {
    let mut stmt = conn.prepare(SELECT_BY_KEY)?;
    let mut rows = stmt.query(rusqlite::params![txid, step])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_map(row)?)),
        None => Ok(None),
    }
}

/// Every row in the snapshot, in insertion order.
pub fn all_rows(conn: &Connection) -> Result<Vec<Map<String, Value>>, SnapshotError> {
    let mut stmt = conn.prepare(SELECT_ALL)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_map(row)?);
    }
    Ok(out)
}

fn row_to_map(row: &rusqlite::Row<'_>) -> Result<Map<String, Value>, SnapshotError> {
    let mut map = Map::new();
    for (i, column) in ROW_COLUMNS.iter().enumerate() {
        let value = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::from(n),
            ValueRef::Real(f) => Value::from(f),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        };
        map.insert((*column).to_string(), value);
    }
    Ok(map)
}

/// zlib-compress a snapshot script for upload.
pub fn compress_script(script: &str) -> Result<Vec<u8>, SnapshotError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(script.as_bytes())?;
    Ok(encoder.finish()?)
}

/// Decompress a snapshot blob back to its script.
pub fn decompress_script(blob: &[u8]) -> Result<String, SnapshotError> {
    let mut decoder = ZlibDecoder::new(blob);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    Ok(String::from_utf8(bytes)?)
}
