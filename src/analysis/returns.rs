use super::alignment::NavGrid;
use crate::config::{self, HorizonSettings};
use crate::types::{Anchor, MetricSpec, ReturnKind, SINCE_INCEPTION_CAGR};
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info};

pub const ROUND_DECIMALS: i32 = 6;
const DAYS_PER_YEAR: f64 = 365.0;

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Percentage change from `past` to `latest`.
pub fn simple_return(latest: f64, past: f64) -> Option<f64> {
    if past <= 0.0 {
        return None;
    }
    let value = (latest / past - 1.0) * 100.0;
    value.is_finite().then(|| round_to(value, ROUND_DECIMALS))
}

/// Annualized percentage growth from `past` to `latest` over `years`.
/// Zero or negative elapsed time yields `None`.
pub fn cagr(latest: f64, past: f64, years: f64) -> Option<f64> {
    if past <= 0.0 || years <= 0.0 {
        return None;
    }
    let value = ((latest / past).powf(1.0 / years) - 1.0) * 100.0;
    value.is_finite().then(|| round_to(value, ROUND_DECIMALS))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnRecord {
    pub instrument_id: i64,
    pub identifier_primary: String,
    pub identifier_secondary: Option<String>,
    pub instrument_name: String,
    pub metrics: Vec<Metric>,
}

impl ReturnRecord {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|metric| metric.name == name)
            .and_then(|metric| metric.value)
    }
}

#[derive(Debug, Clone)]
pub struct ReturnReport {
    pub reference_date: NaiveDate,
    pub metric_names: Vec<String>,
    pub records: Vec<ReturnRecord>,
    /// Instruments removed because they shared a primary identifier.
    pub ambiguous_dropped: usize,
}

/// Anchor of one metric resolved against the grid's date index.
struct ResolvedAnchor {
    date: NaiveDate,
    row: Option<usize>,
}

/// One instrument's column in the grid with its first observation date and
/// its price as of the reference date.
struct InstrumentSeries<'a> {
    grid: &'a NavGrid,
    column: usize,
    first: NaiveDate,
    latest: f64,
}

pub struct ReturnCalculator {
    metrics: Vec<MetricSpec>,
}

impl ReturnCalculator {
    pub fn new(settings: &HorizonSettings) -> config::Result<Self> {
        settings.validate()?;
        Ok(Self {
            metrics: settings.metric_specs(),
        })
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.iter().map(|spec| spec.name.clone()).collect()
    }

    /// Compute every configured metric for every instrument as of
    /// `reference_date`.
    pub fn compute(&self, grid: &NavGrid, reference_date: NaiveDate) -> ReturnReport {
        let latest_row = grid.row_as_of(reference_date);

        // Fixed anchors are shared by all instruments; resolve them once.
        let common: Vec<Option<ResolvedAnchor>> = self
            .metrics
            .iter()
            .map(|spec| {
                spec.anchor.common_date(reference_date).map(|date| ResolvedAnchor {
                    date,
                    row: grid.row_as_of(date),
                })
            })
            .collect();

        let mut records = Vec::with_capacity(grid.instruments().len());
        for (column, &instrument_id) in grid.instruments().iter().enumerate() {
            let Some(meta) = grid.metadata(instrument_id) else {
                continue;
            };
            let latest = latest_row.and_then(|row| grid.value_at(row, column));
            let series = grid
                .first_observation_at(column)
                .zip(latest)
                .map(|(first, latest)| InstrumentSeries {
                    grid,
                    column,
                    first,
                    latest,
                });

            let metrics = self
                .metrics
                .iter()
                .zip(&common)
                .map(|(spec, anchor)| Metric {
                    name: spec.name.clone(),
                    value: series.as_ref().and_then(|series| {
                        self.metric_value(series, spec, anchor.as_ref(), reference_date)
                    }),
                })
                .collect();

            records.push(ReturnRecord {
                instrument_id,
                identifier_primary: meta.identifier_primary.clone(),
                identifier_secondary: meta.identifier_secondary.clone(),
                instrument_name: meta.instrument_name.clone(),
                metrics,
            });
        }

        let before = records.len();
        let records = drop_ambiguous(records);
        let ambiguous_dropped = before - records.len();
        let records = sort_by_since_inception(records);

        info!(
            %reference_date,
            instruments = records.len(),
            ambiguous_dropped,
            "computed returns"
        );
        ReturnReport {
            reference_date,
            metric_names: self.metric_names(),
            records,
            ambiguous_dropped,
        }
    }

    fn metric_value(
        &self,
        series: &InstrumentSeries<'_>,
        spec: &MetricSpec,
        common: Option<&ResolvedAnchor>,
        reference_date: NaiveDate,
    ) -> Option<f64> {
        let InstrumentSeries {
            grid,
            column,
            first,
            latest,
        } = *series;
        let (anchor_date, anchor_row) = match (spec.anchor, common) {
            (Anchor::SinceInception, _) => (first, grid.row_as_of(first)),
            (_, Some(resolved)) => (resolved.date, resolved.row),
            (_, None) => return None,
        };
        // Not enough history to look back this far.
        if anchor_date < first {
            return None;
        }
        let past = grid.value_at(anchor_row?, column)?;

        let value = match spec.kind {
            ReturnKind::Simple => simple_return(latest, past),
            ReturnKind::Cagr => {
                let days = match spec.anchor {
                    Anchor::Days(days) => days,
                    Anchor::YearToDate | Anchor::SinceInception => {
                        (reference_date - anchor_date).num_days()
                    }
                };
                cagr(latest, past, days as f64 / DAYS_PER_YEAR)
            }
        };
        if value.is_none() {
            debug!(column, metric = %spec.name, past, latest, "metric undefined");
        }
        value
    }
}

/// Remove every record whose primary identifier is shared with another.
fn drop_ambiguous(records: Vec<ReturnRecord>) -> Vec<ReturnRecord> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for record in &records {
        *counts.entry(record.identifier_primary.clone()).or_default() += 1;
    }
    records
        .into_iter()
        .filter(|record| {
            let unique = counts[&record.identifier_primary] == 1;
            if !unique {
                debug!(
                    instrument_id = record.instrument_id,
                    identifier = %record.identifier_primary,
                    "dropping ambiguous identifier"
                );
            }
            unique
        })
        .collect()
}

/// Descending since-inception CAGR, nulls last, ties by instrument id.
fn sort_by_since_inception(mut records: Vec<ReturnRecord>) -> Vec<ReturnRecord> {
    records.sort_by(|a, b| {
        let order = match (a.get(SINCE_INCEPTION_CAGR), b.get(SINCE_INCEPTION_CAGR)) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        order.then(a.instrument_id.cmp(&b.instrument_id))
    });
    records
}
