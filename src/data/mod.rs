pub mod ledger;
pub mod normalizer;
pub mod report;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// One NAV observation for one instrument on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub instrument_id: i64,
    pub instrument_name: String,
    pub identifier_primary: String,
    pub identifier_secondary: Option<String>,
    pub price: Option<f64>,
    #[serde(deserialize_with = "deserialize_iso_date")]
    pub date: NaiveDate,
}

/// Ledger dates are always written as `YYYY-MM-DD`. Anything else, including
/// a date cut short by a torn write, is rejected rather than reinterpreted.
fn deserialize_iso_date<'de, D>(deserializer: D) -> std::result::Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.len() != 10 {
        return Err(serde::de::Error::custom(format!("malformed date {:?}", raw)));
    }
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|err| serde::de::Error::custom(format!("malformed date {:?}: {}", raw, err)))
}

impl Observation {
    pub fn new(instrument_id: i64, name: &str, identifier: &str, price: f64, date: NaiveDate) -> Self {
        Self {
            instrument_id,
            instrument_name: name.to_string(),
            identifier_primary: identifier.to_string(),
            identifier_secondary: None,
            price: Some(price),
            date,
        }
    }
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Ledger storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Missing required column: {0}")]
    MissingColumn(String),
    #[error("Corrupt cursor file {path}: {value:?}")]
    CorruptCursor { path: PathBuf, value: String },
}

pub type Result<T> = std::result::Result<T, DataError>;
