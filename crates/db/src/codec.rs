//! Column encoding helpers.
//!
//! UUIDs and timestamps are stored as TEXT and JSON documents as TEXT.
//! Timestamps use a fixed-width RFC3339 form so SQL string comparison
//! matches chronological order.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

/// Encode a timestamp for storage.
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_err(col: &str, msg: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: col.to_owned(),
        source: msg.into(),
    }
}

fn parse_ts(col: &str, raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| decode_err(col, format!("invalid timestamp '{raw}': {e}")))
}

fn parse_json(col: &str, raw: &str) -> Result<Value, sqlx::Error> {
    serde_json::from_str(raw).map_err(|e| decode_err(col, format!("invalid json: {e}")))
}

pub(crate) fn uuid(row: &SqliteRow, col: &str) -> Result<Uuid, sqlx::Error> {
    let raw: String = row.try_get(col)?;
    Uuid::parse_str(&raw).map_err(|e| decode_err(col, format!("invalid uuid '{raw}': {e}")))
}

pub(crate) fn ts(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let raw: String = row.try_get(col)?;
    parse_ts(col, &raw)
}

pub(crate) fn opt_ts(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let raw: Option<String> = row.try_get(col)?;
    raw.as_deref().map(|r| parse_ts(col, r)).transpose()
}

pub(crate) fn json(row: &SqliteRow, col: &str) -> Result<Value, sqlx::Error> {
    let raw: String = row.try_get(col)?;
    parse_json(col, &raw)
}

pub(crate) fn opt_json(row: &SqliteRow, col: &str) -> Result<Option<Value>, sqlx::Error> {
    let raw: Option<String> = row.try_get(col)?;
    raw.as_deref().map(|r| parse_json(col, r)).transpose()
}

pub(crate) fn parsed<T>(row: &SqliteRow, col: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(col)?;
    raw.parse().map_err(|e| decode_err(col, e))
}

pub(crate) fn count(row: &SqliteRow, col: &str) -> Result<u32, sqlx::Error> {
    let raw: i64 = row.try_get(col)?;
    u32::try_from(raw).map_err(|_| decode_err(col, format!("out of range: {raw}")))
}
