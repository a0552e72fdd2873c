use super::{DataError, Observation, Result};
use crate::config::{self, ColumnNames, Config};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use std::fs::{self, File};
use std::io::Read;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Extensions of the vendor dump files picked up from a directory.
const DUMP_EXTENSIONS: [&str; 2] = ["txt", "csv"];

/// Formats seen across daily and historical vendor dumps.
const DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%d-%b-%Y",
    "%d-%B-%Y",
    "%d-%m-%Y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%d %b %Y",
];

/// Tolerant date parser. Accepts the formats above, with or without a
/// trailing time component.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let try_formats =
        |s: &str| DATE_FORMATS.iter().find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok());

    try_formats(raw).or_else(|| raw.split_whitespace().next().and_then(try_formats))
}

/// Delimiter, column names and "not available" markers for one input layout.
#[derive(Debug, Clone)]
pub struct BatchSchema {
    pub delimiter: u8,
    pub columns: ColumnNames,
    pub na_sentinels: Vec<String>,
}

impl BatchSchema {
    pub fn from_config(config: &Config) -> config::Result<Self> {
        Ok(Self {
            delimiter: config.delimiter_byte()?,
            columns: config.columns.clone(),
            na_sentinels: config.na_sentinels.clone(),
        })
    }
}

impl Default for BatchSchema {
    fn default() -> Self {
        Self {
            delimiter: b';',
            columns: ColumnNames::default(),
            na_sentinels: vec!["N.A.".to_string()],
        }
    }
}

/// Rows dropped from a batch, by reason.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RejectCounts {
    pub bad_identifier: usize,
    pub bad_price: usize,
    pub missing_price: usize,
    pub bad_date: usize,
    pub malformed: usize,
}

impl RejectCounts {
    pub fn total(&self) -> usize {
        self.bad_identifier + self.bad_price + self.missing_price + self.bad_date + self.malformed
    }
}

impl AddAssign for RejectCounts {
    fn add_assign(&mut self, other: Self) {
        self.bad_identifier += other.bad_identifier;
        self.bad_price += other.bad_price;
        self.missing_price += other.missing_price;
        self.bad_date += other.bad_date;
        self.malformed += other.malformed;
    }
}

#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub observations: Vec<Observation>,
    pub rejected: RejectCounts,
}

impl NormalizedBatch {
    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.observations.iter().map(|obs| obs.date).max()
    }
}

struct ColumnIndex {
    instrument_id: usize,
    instrument_name: usize,
    identifier_primary: usize,
    identifier_secondary: usize,
    price: usize,
    date: usize,
}

enum RowDefect {
    Identifier,
    Price,
    MissingPrice,
    Date,
}

pub struct Normalizer {
    schema: BatchSchema,
}

impl Normalizer {
    pub fn new(schema: BatchSchema) -> Self {
        Self { schema }
    }

    pub fn normalize_path<P: AsRef<Path>>(&self, path: P) -> Result<NormalizedBatch> {
        let file = File::open(path.as_ref())?;
        let batch = self.normalize_reader(file)?;
        info!(
            path = %path.as_ref().display(),
            observations = batch.observations.len(),
            rejected = batch.rejected.total(),
            "normalized batch"
        );
        Ok(batch)
    }

    /// Normalize several dumps into one batch. Directories contribute their
    /// `.txt` and `.csv` files in name order.
    pub fn normalize_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<NormalizedBatch> {
        let mut merged = NormalizedBatch::default();
        for path in paths {
            let path = path.as_ref();
            let files = if path.is_dir() {
                dump_files(path)?
            } else {
                vec![path.to_path_buf()]
            };
            for file in files {
                let batch = self.normalize_path(&file)?;
                merged.observations.extend(batch.observations);
                merged.rejected += batch.rejected;
            }
        }
        Ok(merged)
    }

    /// Parse one raw batch. Row-level defects are counted, never raised;
    /// only an unreadable source or a header missing a required column fails.
    pub fn normalize_reader<R: Read>(&self, reader: R) -> Result<NormalizedBatch> {
        let mut rdr = ReaderBuilder::new()
            .delimiter(self.schema.delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        let index = self.resolve_columns(&headers)?;

        let mut batch = NormalizedBatch::default();
        for result in rdr.records() {
            let record = match result {
                Ok(record) => record,
                Err(err) if err.is_io_error() => return Err(DataError::Csv(err)),
                Err(err) => {
                    warn!(error = %err, "skipping malformed row");
                    batch.rejected.malformed += 1;
                    continue;
                }
            };

            match self.parse_row(&record, &index) {
                Ok(observation) => batch.observations.push(observation),
                Err(RowDefect::Identifier) => batch.rejected.bad_identifier += 1,
                Err(RowDefect::Price) => batch.rejected.bad_price += 1,
                Err(RowDefect::MissingPrice) => batch.rejected.missing_price += 1,
                Err(RowDefect::Date) => batch.rejected.bad_date += 1,
            }
        }

        if batch.rejected.total() > 0 {
            warn!(
                bad_identifier = batch.rejected.bad_identifier,
                bad_price = batch.rejected.bad_price,
                missing_price = batch.rejected.missing_price,
                bad_date = batch.rejected.bad_date,
                malformed = batch.rejected.malformed,
                "dropped rows from batch"
            );
        }
        Ok(batch)
    }

    fn resolve_columns(&self, headers: &StringRecord) -> Result<ColumnIndex> {
        // Vendor headers drift in spacing and case between daily and historical dumps.
        let canonical = |s: &str| -> String {
            s.chars()
                .filter(|c| !c.is_whitespace())
                .flat_map(char::to_lowercase)
                .collect()
        };
        let header_keys: Vec<String> = headers.iter().map(canonical).collect();
        let find = |name: &str| -> Result<usize> {
            let key = canonical(name);
            header_keys
                .iter()
                .position(|header| *header == key)
                .ok_or_else(|| DataError::MissingColumn(name.to_string()))
        };

        let columns = &self.schema.columns;
        Ok(ColumnIndex {
            instrument_id: find(&columns.instrument_id)?,
            instrument_name: find(&columns.instrument_name)?,
            identifier_primary: find(&columns.identifier_primary)?,
            identifier_secondary: find(&columns.identifier_secondary)?,
            price: find(&columns.price)?,
            date: find(&columns.date)?,
        })
    }

    fn parse_row(
        &self,
        record: &StringRecord,
        index: &ColumnIndex,
    ) -> std::result::Result<Observation, RowDefect> {
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();

        let raw_id = field(index.instrument_id);
        if raw_id.is_empty() || !raw_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(RowDefect::Identifier);
        }
        let instrument_id: i64 = raw_id.parse().map_err(|_| RowDefect::Identifier)?;

        let price = self.parse_price(field(index.price))?;

        let date = parse_date(field(index.date)).ok_or(RowDefect::Date)?;

        let secondary = clean_identifier(field(index.identifier_secondary));
        Ok(Observation {
            instrument_id,
            instrument_name: field(index.instrument_name).to_string(),
            identifier_primary: clean_identifier(field(index.identifier_primary)),
            identifier_secondary: (!secondary.is_empty()).then_some(secondary),
            price: Some(price),
            date,
        })
    }

    fn parse_price(&self, raw: &str) -> std::result::Result<f64, RowDefect> {
        if raw.is_empty() || self.schema.na_sentinels.iter().any(|na| na == raw) {
            return Err(RowDefect::MissingPrice);
        }
        match raw.parse::<f64>() {
            Ok(price) if price.is_finite() && price >= 0.0 => Ok(price),
            _ => Err(RowDefect::Price),
        }
    }
}

/// Vendors mark an absent identifier variant with a dash.
fn clean_identifier(raw: &str) -> String {
    if raw == "-" {
        String::new()
    } else {
        raw.to_string()
    }
}

fn dump_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_dump = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| DUMP_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
            .unwrap_or(false);
        if path.is_file() && is_dump {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAILY: &str = "\
Scheme Code;ISIN Div Payout/ ISIN Growth;ISIN Div Reinvestment;Scheme Name;Net Asset Value;Date

Open Ended Schemes(Debt Scheme - Banking and PSU Fund)

Aditya Birla Sun Life Mutual Fund

119551;INF209KA12Z1;INF209KA13Z9;Aditya Birla Sun Life Banking & PSU Debt Fund - DIRECT - IDCW;105.8165;27-Jun-2025
119552;INF209K01YM2;-;Aditya Birla Sun Life Banking & PSU Debt Fund - Growth;N.A.;27-Jun-2025
119553;INF209K01YN0;-;Some Fund - Regular;abc;27-Jun-2025
12x554;INF209K01YO8;-;Bad Code Fund;10.0;27-Jun-2025
119555;INF209K01YP5;-;Bad Date Fund;10.0;not a date
";

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 6, 27).unwrap();
        assert_eq!(parse_date("2025-06-27"), Some(expected));
        assert_eq!(parse_date("27-Jun-2025"), Some(expected));
        assert_eq!(parse_date("27-JUN-2025"), Some(expected));
        assert_eq!(parse_date("27/06/2025"), Some(expected));
        assert_eq!(parse_date("2025-06-27 00:00:00"), Some(expected));
        assert_eq!(parse_date("31-Feb-2025"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_normalize_daily_dump() {
        let normalizer = Normalizer::new(BatchSchema::default());
        let batch = normalizer.normalize_reader(DAILY.as_bytes()).unwrap();

        assert_eq!(batch.observations.len(), 1);
        let obs = &batch.observations[0];
        assert_eq!(obs.instrument_id, 119551);
        assert_eq!(obs.identifier_primary, "INF209KA12Z1");
        assert_eq!(obs.identifier_secondary.as_deref(), Some("INF209KA13Z9"));
        assert_eq!(obs.price, Some(105.8165));
        assert_eq!(obs.date, NaiveDate::from_ymd_opt(2025, 6, 27).unwrap());

        // Section headings count as bad identifiers alongside the real defect.
        assert_eq!(batch.rejected.bad_identifier, 3);
        assert_eq!(batch.rejected.missing_price, 1);
        assert_eq!(batch.rejected.bad_price, 1);
        assert_eq!(batch.rejected.bad_date, 1);
    }

    #[test]
    fn test_dash_identifier_becomes_absent() {
        let data = "Scheme Code;Scheme Name;ISIN Div Payout/ISIN Growth;ISIN Div Reinvestment;Net Asset Value;Repurchase Price;Sale Price;Date\n\
                    100;Fund;-;-;12.5;;;02-Jan-2024\n";
        let batch = Normalizer::new(BatchSchema::default())
            .normalize_reader(data.as_bytes())
            .unwrap();
        assert_eq!(batch.observations.len(), 1);
        assert_eq!(batch.observations[0].identifier_primary, "");
        assert_eq!(batch.observations[0].identifier_secondary, None);
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let data = "Scheme Code;Scheme Name;Date\n1;A;2024-01-02\n";
        let result = Normalizer::new(BatchSchema::default()).normalize_reader(data.as_bytes());
        assert!(matches!(result, Err(DataError::MissingColumn(_))));
    }

    #[test]
    fn test_normalize_directory_of_dumps() {
        let header = "Scheme Code;Scheme Name;ISIN Div Payout/ISIN Growth;ISIN Div Reinvestment;Net Asset Value;Repurchase Price;Sale Price;Date\n";
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("nav_2024-01.txt"),
            format!("{header}100;Fund;INF100;-;10.0;;;02-Jan-2024\n101;Bad;INF101;-;abc;;;02-Jan-2024\n"),
        )
        .unwrap();
        fs::write(
            dir.path().join("nav_2024-02.csv"),
            format!("{header}100;Fund;INF100;-;11.0;;;01-Feb-2024\n"),
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "not a dump").unwrap();

        let extra = dir.path().join("extra");
        fs::create_dir(&extra).unwrap();
        let single = extra.join("nav_2024-03.txt");
        fs::write(&single, format!("{header}100;Fund;INF100;-;12.0;;;01-Mar-2024\n")).unwrap();

        let batch = Normalizer::new(BatchSchema::default())
            .normalize_paths(&[dir.path().to_path_buf(), single])
            .unwrap();
        let prices: Vec<Option<f64>> = batch.observations.iter().map(|obs| obs.price).collect();
        assert_eq!(prices, vec![Some(10.0), Some(11.0), Some(12.0)]);
        assert_eq!(batch.rejected.bad_price, 1);
        assert_eq!(batch.latest_date(), NaiveDate::from_ymd_opt(2024, 3, 1));
    }
}
