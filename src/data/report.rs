use super::Result;
use crate::analysis::returns::ReturnReport;
use csv::WriterBuilder;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const LEADING_COLUMNS: [&str; 4] = [
    "identifier_primary",
    "identifier_secondary",
    "instrument_id",
    "instrument_name",
];

/// File name used for a report computed as of `report.reference_date`.
pub fn report_path(dir: impl AsRef<Path>, report: &ReturnReport) -> PathBuf {
    dir.as_ref()
        .join(format!("returns_as_on {}.csv", report.reference_date.format("%Y-%m-%d")))
}

/// Write the report as a delimited table. Null metrics become empty fields.
pub fn write_report_to<W: Write>(writer: W, report: &ReturnReport, delimiter: u8) -> Result<()> {
    let mut wtr = WriterBuilder::new().delimiter(delimiter).from_writer(writer);

    let header: Vec<&str> = LEADING_COLUMNS
        .iter()
        .copied()
        .chain(report.metric_names.iter().map(String::as_str))
        .collect();
    wtr.write_record(&header)?;

    for record in &report.records {
        let mut row = vec![
            record.identifier_primary.clone(),
            record.identifier_secondary.clone().unwrap_or_default(),
            record.instrument_id.to_string(),
            record.instrument_name.clone(),
        ];
        row.extend(report.metric_names.iter().map(|name| {
            record
                .get(name)
                .map(|value| value.to_string())
                .unwrap_or_default()
        }));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_report(path: impl AsRef<Path>, report: &ReturnReport, delimiter: u8) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)?;
    write_report_to(file, report, delimiter)?;
    info!(path = %path.display(), rows = report.records.len(), "wrote returns report");
    Ok(())
}
