use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::types::SeriesKey;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One closed kline. Prices are always finite.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    label: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl Candle {
    /// Build a candle from the interval open time (epoch ms) and its prices.
    ///
    /// The label is the open time rendered as `HH:MM:SS` in UTC.
    pub fn new(open_time_ms: i64, open: f64, high: f64, low: f64, close: f64) -> Result<Self, IngestError> {
        for (name, value) in [("open", open), ("high", high), ("low", low), ("close", close)] {
            if !value.is_finite() {
                return Err(IngestError::MalformedMessage(format!(
                    "{name} is not a finite number: {value}"
                )));
            }
        }
        let label = DateTime::from_timestamp_millis(open_time_ms)
            .ok_or_else(|| {
                IngestError::MalformedMessage(format!("open time out of range: {open_time_ms}"))
            })?
            .format("%H:%M:%S")
            .to_string();

        Ok(Self {
            label,
            open,
            high,
            low,
            close,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn open(&self) -> f64 {
        self.open
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn close(&self) -> f64 {
        self.close
    }
}

/// Append-only OHLC series stored as parallel columns.
///
/// Every column has the same length at all times; the fields are private so
/// the only way to grow a series is [`Series::push`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Series {
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    labels: Vec<String>,
}

/// On-disk shape of a series. `labels` is optional: records written without
/// it get index labels on load.
#[derive(Debug, Deserialize)]
pub struct SeriesRecord {
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a decoded record and turn it into a series.
    ///
    /// Fails when the price columns (or the labels, if present) disagree in
    /// length.
    pub fn from_record(record: SeriesRecord) -> Result<Self, String> {
        let n = record.open.len();
        for (name, len) in [
            ("high", record.high.len()),
            ("low", record.low.len()),
            ("close", record.close.len()),
        ] {
            if len != n {
                return Err(format!("column {name} has {len} entries, open has {n}"));
            }
        }

        let labels = match record.labels {
            Some(labels) if labels.len() == n => labels,
            Some(labels) => {
                return Err(format!("labels has {} entries, open has {n}", labels.len()));
            }
            None => (1..=n).map(|i| i.to_string()).collect(),
        };

        Ok(Self {
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            labels,
        })
    }

    pub fn push(&mut self, candle: &Candle) {
        self.open.push(candle.open);
        self.high.push(candle.high);
        self.low.push(candle.low);
        self.close.push(candle.close);
        self.labels.push(candle.label.clone());
        debug_assert!(self.is_aligned());
    }

    /// Append every candle of `other`, in order.
    pub fn extend(&mut self, other: &Series) {
        self.open.extend_from_slice(&other.open);
        self.high.extend_from_slice(&other.high);
        self.low.extend_from_slice(&other.low);
        self.close.extend_from_slice(&other.close);
        self.labels.extend(other.labels.iter().cloned());
        debug_assert!(self.is_aligned());
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn opens(&self) -> &[f64] {
        &self.open
    }

    pub fn highs(&self) -> &[f64] {
        &self.high
    }

    pub fn lows(&self) -> &[f64] {
        &self.low
    }

    pub fn closes(&self) -> &[f64] {
        &self.close
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn last_close(&self) -> Option<f64> {
        self.close.last().copied()
    }

    fn is_aligned(&self) -> bool {
        let n = self.open.len();
        self.high.len() == n && self.low.len() == n && self.close.len() == n && self.labels.len() == n
    }
}

// ---------------------------------------------------------------------------
// CandleAccumulator: the active series for the selected key
// ---------------------------------------------------------------------------

/// Holds the series for whichever key is currently selected.
pub struct CandleAccumulator {
    key: SeriesKey,
    series: Series,
}

impl CandleAccumulator {
    pub fn new(key: SeriesKey, series: Series) -> Self {
        Self { key, series }
    }

    /// Swap in a different key and its series wholesale.
    pub fn reset(&mut self, key: SeriesKey, series: Series) {
        self.key = key;
        self.series = series;
    }

    /// Append a closed candle and return the resulting series.
    pub fn append(&mut self, candle: &Candle) -> &Series {
        self.series.push(candle);
        &self.series
    }

    /// Put `stored` in front of the candles collected so far. Used once the
    /// stored record for the active key becomes readable after a failed load.
    pub fn rebase(&mut self, mut stored: Series) {
        stored.extend(&self.series);
        self.series = stored;
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn series(&self) -> &Series {
        &self.series
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
