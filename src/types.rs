use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

pub const SINCE_INCEPTION_CAGR: &str = "return_since_inception_cagr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    Simple,
    Cagr,
}

/// Where a metric measures its past price from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Fixed lookback of `n` calendar days before the reference date.
    Days(i64),
    /// January 1 of the reference date's year.
    YearToDate,
    /// The instrument's first non-null observation.
    SinceInception,
}

impl Anchor {
    /// Anchor date shared by every instrument, or `None` for since-inception
    /// which is resolved per instrument.
    pub fn common_date(&self, reference_date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Anchor::Days(days) => reference_date.checked_sub_signed(Duration::days(*days)),
            Anchor::YearToDate => NaiveDate::from_ymd_opt(reference_date.year(), 1, 1),
            Anchor::SinceInception => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub name: String,
    pub anchor: Anchor,
    pub kind: ReturnKind,
}

impl MetricSpec {
    pub fn new(name: impl Into<String>, anchor: Anchor, kind: ReturnKind) -> Self {
        Self {
            name: name.into(),
            anchor,
            kind,
        }
    }
}
