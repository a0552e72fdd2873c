use super::normalizer::NormalizedBatch;
use super::{DataError, Observation, Result};
use chrono::{Duration, NaiveDate};
use csv::{ReaderBuilder, WriterBuilder};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LOG_FILE: &str = "nav_time_series.csv";
pub const CURSOR_FILE: &str = "last_updated.txt";

/// The vendor labels end-of-day data with the next calendar day.
pub const BUSINESS_DAY_LAG_DAYS: i64 = 1;

const HEADER: [&str; 6] = [
    "instrument_id",
    "instrument_name",
    "identifier_primary",
    "identifier_secondary",
    "price",
    "date",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub applied: bool,
    pub rows_written: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub business_date: NaiveDate,
    pub commit: CommitOutcome,
    /// Observations dropped because they were not dated on the business date.
    pub stale: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStatus {
    pub cursor: Option<NaiveDate>,
    pub rows: usize,
}

/// Canonical ledger contents plus the number of unreadable lines skipped.
#[derive(Debug, Default)]
pub struct LedgerContents {
    pub observations: Vec<Observation>,
    pub skipped: usize,
}

/// Append-only NAV history with a persisted commit cursor.
///
/// The log is only ever appended to. The cursor holds the date of the last
/// committed batch and is written after the batch data is synced, so it never
/// runs ahead of the log.
#[derive(Debug, Clone)]
pub struct NavLedger {
    log_path: PathBuf,
    cursor_path: PathBuf,
    delimiter: u8,
}

impl NavLedger {
    pub fn open(dir: impl AsRef<Path>, delimiter: u8) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| DataError::Storage {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            log_path: dir.join(LOG_FILE),
            cursor_path: dir.join(CURSOR_FILE),
            delimiter,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn cursor(&self) -> Result<Option<NaiveDate>> {
        let contents = match fs::read_to_string(&self.cursor_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.storage_error(&self.cursor_path, source)),
        };
        let value = contents.trim();
        if value.is_empty() {
            return Ok(None);
        }
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| DataError::CorruptCursor {
                path: self.cursor_path.clone(),
                value: value.to_string(),
            })
    }

    /// Append one batch. Re-committing the cursor's date is a no-op. Older
    /// batches are appended but never move the cursor backwards.
    pub fn commit(
        &self,
        batch_date: NaiveDate,
        observations: &[Observation],
    ) -> Result<CommitOutcome> {
        let cursor = self.cursor()?;
        if cursor == Some(batch_date) {
            info!(%batch_date, "batch already committed, skipping");
            return Ok(CommitOutcome {
                applied: false,
                rows_written: 0,
            });
        }

        let rows_written = self.append(observations)?;
        match cursor {
            Some(current) if current > batch_date => {
                info!(%batch_date, cursor = %current, "backfilled batch, cursor unchanged");
            }
            _ => self.write_cursor(batch_date)?,
        }

        if rows_written == 0 {
            info!(%batch_date, "nothing to store for batch");
        } else {
            info!(%batch_date, rows_written, "committed batch");
        }
        Ok(CommitOutcome {
            applied: true,
            rows_written,
        })
    }

    /// Commit a vendor snapshot. Only observations dated on the business
    /// date (the day before the snapshot date) are recorded; the cursor
    /// tracks the snapshot date itself.
    pub fn ingest_snapshot(
        &self,
        snapshot_date: NaiveDate,
        batch: &NormalizedBatch,
    ) -> Result<SnapshotOutcome> {
        let business_date = snapshot_date - Duration::days(BUSINESS_DAY_LAG_DAYS);
        let kept: Vec<Observation> = batch
            .observations
            .iter()
            .filter(|obs| obs.date == business_date)
            .cloned()
            .collect();
        let stale = batch.observations.len() - kept.len();
        if stale > 0 {
            warn!(%snapshot_date, %business_date, stale, "dropped observations outside business date");
        }

        let commit = self.commit(snapshot_date, &kept)?;
        Ok(SnapshotOutcome {
            business_date,
            commit,
            stale,
        })
    }

    /// Lazily stream the raw log in write order, skipping corrupt lines.
    pub fn records(&self) -> Result<LedgerRecords> {
        let file = match File::open(&self.log_path) {
            Ok(file) => Some(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(self.storage_error(&self.log_path, source)),
        };
        let inner = match file {
            Some(file) => {
                let mut rdr = ReaderBuilder::new()
                    .delimiter(self.delimiter)
                    .has_headers(true)
                    .flexible(true)
                    .from_reader(file);
                // The deserializing iterator swallows header errors; surface them here.
                rdr.headers()
                    .map_err(|err| self.storage_error(&self.log_path, err.into()))?;
                Some(rdr.into_deserialize())
            }
            None => None,
        };
        Ok(LedgerRecords {
            inner,
            path: self.log_path.clone(),
            skipped: 0,
        })
    }

    /// Canonical history: one observation per (instrument, date), the last
    /// write winning, ordered by date and then write order.
    pub fn read_all(&self) -> Result<LedgerContents> {
        let mut records = self.records()?;
        let mut observations: Vec<Observation> = Vec::new();
        let mut position: HashMap<(i64, NaiveDate), usize> = HashMap::new();

        for result in records.by_ref() {
            let observation = result?;
            let key = (observation.instrument_id, observation.date);
            match position.get(&key) {
                Some(&idx) => {
                    debug!(instrument_id = key.0, date = %key.1, "duplicate observation, keeping last");
                    observations[idx] = observation;
                }
                None => {
                    position.insert(key, observations.len());
                    observations.push(observation);
                }
            }
        }

        observations.sort_by_key(|obs| obs.date);
        let skipped = records.skipped();
        if skipped > 0 {
            warn!(skipped, "skipped unreadable ledger lines");
        }
        Ok(LedgerContents {
            observations,
            skipped,
        })
    }

    pub fn status(&self) -> Result<LedgerStatus> {
        let mut rows = 0;
        for result in self.records()? {
            result?;
            rows += 1;
        }
        Ok(LedgerStatus {
            cursor: self.cursor()?,
            rows,
        })
    }

    fn append(&self, observations: &[Observation]) -> Result<usize> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| self.storage_error(&self.log_path, source))?;

        let len = file
            .metadata()
            .map_err(|source| self.storage_error(&self.log_path, source))?
            .len();

        // Never glue a new record onto a partial trailing line.
        let needs_newline = len > 0
            && !ends_with_newline(&mut file, len)
                .map_err(|source| self.storage_error(&self.log_path, source))?;

        let mut buffer: Vec<u8> = Vec::new();
        if needs_newline {
            buffer.push(b'\n');
        }

        {
            let mut writer = WriterBuilder::new()
                .delimiter(self.delimiter)
                .has_headers(false)
                .from_writer(&mut buffer);
            if len == 0 {
                writer.write_record(HEADER)?;
            }
            for observation in observations {
                writer.serialize(observation)?;
            }
            writer.flush()?;
        }

        file.write_all(&buffer)
            .and_then(|_| file.sync_all())
            .map_err(|source| self.storage_error(&self.log_path, source))?;
        Ok(observations.len())
    }

    fn write_cursor(&self, date: NaiveDate) -> Result<()> {
        let tmp = self.cursor_path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(date.format("%Y-%m-%d").to_string().as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.cursor_path)
        };
        write().map_err(|source| self.storage_error(&self.cursor_path, source))
    }

    fn storage_error(&self, path: &Path, source: std::io::Error) -> DataError {
        DataError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Iterator over the raw log. Lines that fail to parse are counted in
/// `skipped`; only I/O failures are surfaced, as storage errors.
pub struct LedgerRecords {
    inner: Option<csv::DeserializeRecordsIntoIter<File, Observation>>,
    path: PathBuf,
    skipped: usize,
}

impl LedgerRecords {
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for LedgerRecords {
    type Item = Result<Observation>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        loop {
            match inner.next()? {
                Ok(observation) => return Some(Ok(observation)),
                Err(err) if err.is_io_error() => {
                    return Some(Err(DataError::Storage {
                        path: self.path.clone(),
                        source: err.into(),
                    }))
                }
                Err(err) => {
                    debug!(error = %err, "skipping corrupt ledger line");
                    self.skipped += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_commit_is_idempotent() {
        let dir = tempdir().unwrap();
        let ledger = NavLedger::open(dir.path(), b';').unwrap();
        let obs = vec![Observation::new(1, "A", "INF000000001", 100.0, date(2024, 1, 2))];

        let first = ledger.commit(date(2024, 1, 2), &obs).unwrap();
        assert!(first.applied);
        assert_eq!(first.rows_written, 1);
        let bytes_after_first = fs::read(ledger.log_path()).unwrap();

        let second = ledger.commit(date(2024, 1, 2), &obs).unwrap();
        assert!(!second.applied);
        assert_eq!(second.rows_written, 0);
        assert_eq!(fs::read(ledger.log_path()).unwrap(), bytes_after_first);
    }

    #[test]
    fn test_cursor_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let ledger = NavLedger::open(dir.path(), b';').unwrap();
            assert_eq!(ledger.cursor().unwrap(), None);
            ledger.commit(date(2024, 3, 5), &[]).unwrap();
        }
        let reopened = NavLedger::open(dir.path(), b';').unwrap();
        assert_eq!(reopened.cursor().unwrap(), Some(date(2024, 3, 5)));
        assert!(!reopened.commit(date(2024, 3, 5), &[]).unwrap().applied);
    }

    #[test]
    fn test_header_written_once_and_secondary_round_trips() {
        let dir = tempdir().unwrap();
        let ledger = NavLedger::open(dir.path(), b';').unwrap();
        let mut with_secondary = Observation::new(1, "A", "INF1", 10.0, date(2024, 1, 1));
        with_secondary.identifier_secondary = Some("INF2".to_string());

        ledger.commit(date(2024, 1, 1), &[with_secondary.clone()]).unwrap();
        ledger
            .commit(date(2024, 1, 2), &[Observation::new(1, "A", "INF1", 11.0, date(2024, 1, 2))])
            .unwrap();

        let text = fs::read_to_string(ledger.log_path()).unwrap();
        assert_eq!(text.matches("instrument_id").count(), 1);

        let contents = ledger.read_all().unwrap();
        assert_eq!(contents.observations.len(), 2);
        assert_eq!(contents.observations[0], with_secondary);
        assert_eq!(contents.observations[1].identifier_secondary, None);
    }

    #[test]
    fn test_duplicates_keep_last_write() {
        let dir = tempdir().unwrap();
        let ledger = NavLedger::open(dir.path(), b';').unwrap();
        ledger
            .commit(date(2024, 1, 3), &[Observation::new(7, "old", "X", 10.0, date(2024, 1, 2))])
            .unwrap();
        ledger
            .commit(date(2024, 1, 4), &[Observation::new(7, "new", "X", 12.0, date(2024, 1, 2))])
            .unwrap();

        let contents = ledger.read_all().unwrap();
        assert_eq!(contents.observations.len(), 1);
        assert_eq!(contents.observations[0].price, Some(12.0));
        assert_eq!(contents.observations[0].instrument_name, "new");
        assert_eq!(ledger.status().unwrap().rows, 2);
    }

    #[test]
    fn test_partial_trailing_line_is_skipped() {
        let dir = tempdir().unwrap();
        let ledger = NavLedger::open(dir.path(), b';').unwrap();
        ledger
            .commit(date(2024, 1, 2), &[Observation::new(1, "A", "X", 10.0, date(2024, 1, 2))])
            .unwrap();

        // Simulate a crash that left half a record without a newline.
        let mut file = OpenOptions::new().append(true).open(ledger.log_path()).unwrap();
        file.write_all(b"2;Trunc;Y;;1").unwrap();
        drop(file);

        ledger
            .commit(date(2024, 1, 3), &[Observation::new(1, "A", "X", 11.0, date(2024, 1, 3))])
            .unwrap();

        let contents = ledger.read_all().unwrap();
        assert_eq!(contents.skipped, 1);
        assert_eq!(contents.observations.len(), 2);
        assert!(contents.observations.iter().all(|obs| obs.instrument_id == 1));
    }

    #[test]
    fn test_record_cut_inside_date_is_skipped() {
        let dir = tempdir().unwrap();
        let ledger = NavLedger::open(dir.path(), b';').unwrap();
        ledger
            .commit(date(2024, 1, 2), &[Observation::new(1, "A", "X", 10.0, date(2024, 1, 2))])
            .unwrap();

        // "2024-01-31" torn to "2024-01-3" must not read back as January 3rd.
        let mut file = OpenOptions::new().append(true).open(ledger.log_path()).unwrap();
        file.write_all(b"2;B;Y;;55.5;2024-01-3").unwrap();
        drop(file);

        ledger
            .commit(date(2024, 2, 1), &[Observation::new(1, "A", "X", 11.0, date(2024, 2, 1))])
            .unwrap();

        let contents = ledger.read_all().unwrap();
        assert_eq!(contents.skipped, 1);
        let dates: Vec<NaiveDate> = contents.observations.iter().map(|obs| obs.date).collect();
        assert_eq!(dates, vec![date(2024, 1, 2), date(2024, 2, 1)]);
        assert!(contents.observations.iter().all(|obs| obs.instrument_id == 1));
    }

    #[test]
    fn test_unreadable_log_is_a_storage_error() {
        let dir = tempdir().unwrap();
        let ledger = NavLedger::open(dir.path(), b';').unwrap();
        fs::create_dir(ledger.log_path()).unwrap();

        assert!(matches!(ledger.read_all(), Err(DataError::Storage { .. })));
        assert!(matches!(ledger.status(), Err(DataError::Storage { .. })));
    }

    #[test]
    fn test_older_batch_does_not_rewind_cursor() {
        let dir = tempdir().unwrap();
        let ledger = NavLedger::open(dir.path(), b';').unwrap();
        let latest = [Observation::new(1, "A", "X", 11.0, date(2024, 2, 1))];
        ledger.commit(date(2024, 2, 2), &latest).unwrap();

        let history = [Observation::new(1, "A", "X", 10.0, date(2024, 1, 16))];
        let backfill = ledger.commit(date(2024, 1, 16), &history).unwrap();
        assert!(backfill.applied);
        assert_eq!(ledger.cursor().unwrap(), Some(date(2024, 2, 2)));

        assert!(!ledger.commit(date(2024, 2, 2), &latest).unwrap().applied);
        assert_eq!(ledger.status().unwrap().rows, 2);
    }

    #[test]
    fn test_snapshot_keeps_only_business_date() {
        let dir = tempdir().unwrap();
        let ledger = NavLedger::open(dir.path(), b';').unwrap();
        let batch = NormalizedBatch {
            observations: vec![
                Observation::new(1, "A", "X", 10.0, date(2025, 6, 29)),
                Observation::new(2, "B", "Y", 20.0, date(2025, 6, 27)),
            ],
            ..Default::default()
        };

        let outcome = ledger.ingest_snapshot(date(2025, 6, 30), &batch).unwrap();
        assert_eq!(outcome.business_date, date(2025, 6, 29));
        assert_eq!(outcome.stale, 1);
        assert_eq!(outcome.commit.rows_written, 1);
        assert_eq!(ledger.cursor().unwrap(), Some(date(2025, 6, 30)));

        let again = ledger.ingest_snapshot(date(2025, 6, 30), &batch).unwrap();
        assert!(!again.commit.applied);
    }

    #[test]
    fn test_corrupt_cursor_is_an_error() {
        let dir = tempdir().unwrap();
        let ledger = NavLedger::open(dir.path(), b';').unwrap();
        fs::write(dir.path().join(CURSOR_FILE), "yesterday").unwrap();
        assert!(matches!(
            ledger.cursor(),
            Err(DataError::CorruptCursor { .. })
        ));
    }
}
