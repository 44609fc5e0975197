// =============================================================================
// Shared types used across the kline recorder
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Kline resolutions the recorder knows how to subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl Default for Resolution {
    fn default() -> Self {
        Self::OneMinute
    }
}

impl Resolution {
    pub const ALL: [Resolution; 6] = [
        Self::OneMinute,
        Self::ThreeMinutes,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
    ];

    /// The token Binance uses in stream names (`1m`, `5m`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Resolution {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == token)
            .ok_or_else(|| IngestError::InvalidSelection(format!("unsupported resolution: {s:?}")))
    }
}

/// Normalize a user-supplied instrument symbol to the lowercase stream form.
///
/// `" ETHUSDT "` becomes `"ethusdt"`. Empty input and anything that is not
/// ASCII alphanumeric is rejected.
pub fn normalize_instrument(symbol: &str) -> Result<String, IngestError> {
    let lower = symbol.trim().to_lowercase();
    if lower.is_empty() {
        return Err(IngestError::InvalidSelection("empty instrument symbol".into()));
    }
    if !lower.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(IngestError::InvalidSelection(format!(
            "instrument symbol must be alphanumeric: {symbol:?}"
        )));
    }
    Ok(lower)
}

/// Composite identity of one accumulated series: `(instrument, resolution)`.
///
/// Used both as the persistence key and as the subscription identity.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    instrument: String,
    resolution: Resolution,
}

impl Default for SeriesKey {
    fn default() -> Self {
        Self {
            instrument: "ethusdt".to_string(),
            resolution: Resolution::OneMinute,
        }
    }
}

impl SeriesKey {
    pub fn new(instrument: &str, resolution: Resolution) -> Result<Self, IngestError> {
        Ok(Self {
            instrument: normalize_instrument(instrument)?,
            resolution,
        })
    }

    /// Parse both halves from raw selection strings.
    #[cfg(test)]
    pub fn parse(instrument: &str, resolution: &str) -> Result<Self, IngestError> {
        Self::new(instrument, resolution.parse()?)
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn with_instrument(&self, instrument: &str) -> Result<Self, IngestError> {
        Self::new(instrument, self.resolution)
    }

    pub fn with_resolution(&self, resolution: Resolution) -> Self {
        Self {
            instrument: self.instrument.clone(),
            resolution,
        }
    }

    /// Stream name in the feed's addressing scheme: `ethusdt@kline_1m`.
    pub fn stream_name(&self) -> String {
        format!("{}@kline_{}", self.instrument, self.resolution)
    }

    /// Token used as the persistence entry name: `ethusdt_1m`.
    pub fn storage_name(&self) -> String {
        format!("{}_{}", self.instrument, self.resolution)
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument, self.resolution)
    }
}
