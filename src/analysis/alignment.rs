use crate::data::Observation;
use chrono::NaiveDate;
use ndarray::Array2;
use std::collections::{BTreeSet, HashMap};

/// Descriptive fields from an instrument's most recent observation.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentMeta {
    pub instrument_name: String,
    pub identifier_primary: String,
    pub identifier_secondary: Option<String>,
    pub as_of: NaiveDate,
}

impl From<&Observation> for InstrumentMeta {
    fn from(obs: &Observation) -> Self {
        Self {
            instrument_name: obs.instrument_name.clone(),
            identifier_primary: obs.identifier_primary.clone(),
            identifier_secondary: obs.identifier_secondary.clone(),
            as_of: obs.date,
        }
    }
}

/// Dense date x instrument price grid, forward-filled per instrument.
///
/// Rows are the distinct observation dates in ascending order, columns the
/// distinct instrument ids in ascending order. A cell is `None` only before
/// the instrument's first priced observation.
#[derive(Debug, Clone)]
pub struct NavGrid {
    dates: Vec<NaiveDate>,
    instruments: Vec<i64>,
    columns: HashMap<i64, usize>,
    prices: Array2<Option<f64>>,
    first_observed: Vec<Option<NaiveDate>>,
    metadata: Vec<Option<InstrumentMeta>>,
}

pub fn build_grid(observations: &[Observation]) -> NavGrid {
    NavGrid::from_observations(observations)
}

impl NavGrid {
    /// Pivot observations into the grid. Several prices for the same
    /// (date, instrument) are averaged.
    pub fn from_observations(observations: &[Observation]) -> Self {
        let dates: Vec<NaiveDate> = observations
            .iter()
            .map(|obs| obs.date)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let instruments: Vec<i64> = observations
            .iter()
            .map(|obs| obs.instrument_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let rows: HashMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        let columns: HashMap<i64, usize> = instruments
            .iter()
            .enumerate()
            .map(|(j, id)| (*id, j))
            .collect();

        let shape = (dates.len(), instruments.len());
        let mut sums = Array2::<f64>::zeros(shape);
        let mut counts = Array2::<u32>::zeros(shape);
        let mut metadata: Vec<Option<InstrumentMeta>> = vec![None; instruments.len()];

        for obs in observations {
            let (i, j) = (rows[&obs.date], columns[&obs.instrument_id]);
            if let Some(price) = obs.price {
                sums[[i, j]] += price;
                counts[[i, j]] += 1;
            }
            // Later dates win; on the same date the later row wins.
            let newer = match &metadata[j] {
                Some(meta) => obs.date >= meta.as_of,
                None => true,
            };
            if newer {
                metadata[j] = Some(InstrumentMeta::from(obs));
            }
        }

        let mut prices = Array2::from_elem(shape, None);
        let mut first_observed = vec![None; instruments.len()];
        for (j, mut column) in prices.columns_mut().into_iter().enumerate() {
            let mut last_seen: Option<f64> = None;
            for i in 0..dates.len() {
                if counts[[i, j]] > 0 {
                    last_seen = Some(sums[[i, j]] / counts[[i, j]] as f64);
                    first_observed[j].get_or_insert(dates[i]);
                }
                column[i] = last_seen;
            }
        }

        Self {
            dates,
            instruments,
            columns,
            prices,
            first_observed,
            metadata,
        }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn instruments(&self) -> &[i64] {
        &self.instruments
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() || self.instruments.is_empty()
    }

    pub fn column(&self, instrument_id: i64) -> Option<usize> {
        self.columns.get(&instrument_id).copied()
    }

    /// Index of the latest row dated on or before `date`. Dates past the last
    /// row resolve to the last row, holding its prices flat.
    pub fn row_as_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.partition_point(|d| *d <= date).checked_sub(1)
    }

    pub fn value_at(&self, row: usize, column: usize) -> Option<f64> {
        self.prices.get((row, column)).copied().flatten()
    }

    /// Price of an instrument as of `date`: never interpolated, never taken
    /// from a later observation.
    pub fn value_as_of(&self, instrument_id: i64, date: NaiveDate) -> Option<f64> {
        let column = self.column(instrument_id)?;
        let row = self.row_as_of(date)?;
        self.value_at(row, column)
    }

    pub fn first_observation(&self, instrument_id: i64) -> Option<NaiveDate> {
        self.column(instrument_id)
            .and_then(|j| self.first_observed[j])
    }

    pub fn first_observation_at(&self, column: usize) -> Option<NaiveDate> {
        self.first_observed.get(column).copied().flatten()
    }

    pub fn metadata(&self, instrument_id: i64) -> Option<&InstrumentMeta> {
        self.column(instrument_id)
            .and_then(|j| self.metadata[j].as_ref())
    }
}
