use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::{Anchor, MetricSpec, ReturnKind, SINCE_INCEPTION_CAGR};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Delimiter must be a single ASCII character other than a quote or newline, got {0:?}")]
    InvalidDelimiter(String),
    #[error("Horizon {name} must be a positive number of days, got {days}")]
    NonPositiveHorizon { name: String, days: i64 },
    #[error("Metric name {0} is defined more than once")]
    DuplicateMetric(String),
    #[error("Reference offset must not be negative, got {0}")]
    NegativeOffset(i64),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub instrument_id: String,
    pub instrument_name: String,
    pub identifier_primary: String,
    pub identifier_secondary: String,
    pub price: String,
    pub date: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            instrument_id: "Scheme Code".to_string(),
            instrument_name: "Scheme Name".to_string(),
            identifier_primary: "ISIN Div Payout/ ISIN Growth".to_string(),
            identifier_secondary: "ISIN Div Reinvestment".to_string(),
            price: "Net Asset Value".to_string(),
            date: "Date".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub ledger_dir: PathBuf,
    pub returns_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            ledger_dir: PathBuf::from("historical_nav"),
            returns_dir: PathBuf::from("daily_returns"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Horizon {
    pub name: String,
    pub days: i64,
}

impl Horizon {
    fn new(name: &str, days: i64) -> Self {
        Self {
            name: name.to_string(),
            days,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonSettings {
    pub simple: Vec<Horizon>,
    pub cagr: Vec<Horizon>,
}

impl Default for HorizonSettings {
    fn default() -> Self {
        Self {
            simple: vec![
                Horizon::new("return_1m", 30),
                Horizon::new("return_3m", 3 * 30),
                Horizon::new("return_6m", 6 * 30),
                Horizon::new("return_1y", 365),
                Horizon::new("return_3y", 3 * 365),
                Horizon::new("return_5y", 5 * 365),
            ],
            cagr: vec![
                Horizon::new("return_1y_cagr", 365),
                Horizon::new("return_3y_cagr", 3 * 365),
                Horizon::new("return_5y_cagr", 5 * 365),
                Horizon::new("return_10y_cagr", 10 * 365),
            ],
        }
    }
}

impl HorizonSettings {
    /// Expand the configured horizons into the full, ordered metric list.
    /// Year-to-date and since-inception metrics are always present.
    pub fn metric_specs(&self) -> Vec<MetricSpec> {
        let mut specs: Vec<MetricSpec> = self
            .simple
            .iter()
            .map(|h| MetricSpec::new(&h.name, Anchor::Days(h.days), ReturnKind::Simple))
            .collect();
        specs.push(MetricSpec::new(
            "return_ytd",
            Anchor::YearToDate,
            ReturnKind::Simple,
        ));
        specs.push(MetricSpec::new(
            "return_ytd_cagr",
            Anchor::YearToDate,
            ReturnKind::Cagr,
        ));
        specs.extend(
            self.cagr
                .iter()
                .map(|h| MetricSpec::new(&h.name, Anchor::Days(h.days), ReturnKind::Cagr)),
        );
        specs.push(MetricSpec::new(
            "return_since_inception",
            Anchor::SinceInception,
            ReturnKind::Simple,
        ));
        specs.push(MetricSpec::new(
            SINCE_INCEPTION_CAGR,
            Anchor::SinceInception,
            ReturnKind::Cagr,
        ));
        specs
    }

    pub fn validate(&self) -> Result<()> {
        for horizon in self.simple.iter().chain(self.cagr.iter()) {
            if horizon.days <= 0 {
                return Err(ConfigError::NonPositiveHorizon {
                    name: horizon.name.clone(),
                    days: horizon.days,
                });
            }
        }

        let mut seen = HashSet::new();
        for spec in self.metric_specs() {
            if !seen.insert(spec.name.clone()) {
                return Err(ConfigError::DuplicateMetric(spec.name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub delimiter: String,
    pub reference_offset_days: i64,
    pub na_sentinels: Vec<String>,
    pub columns: ColumnNames,
    pub paths: PathSettings,
    pub horizons: HorizonSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delimiter: ";".to_string(),
            reference_offset_days: 0,
            na_sentinels: vec!["N.A.".to_string()],
            columns: ColumnNames::default(),
            paths: PathSettings::default(),
            horizons: HorizonSettings::default(),
        }
    }
}

impl Config {
    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.delimiter_byte()?;
        if self.reference_offset_days < 0 {
            return Err(ConfigError::NegativeOffset(self.reference_offset_days));
        }
        self.horizons.validate()
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        match self.delimiter.as_bytes() {
            [b] if b.is_ascii() && !matches!(b, b'"' | b'\n' | b'\r') => Ok(*b),
            _ => Err(ConfigError::InvalidDelimiter(self.delimiter.clone())),
        }
    }
}
