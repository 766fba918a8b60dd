//! Brightness values and the code that writes them into a page.
//!
//! - [`BrightnessValue`] / [`RgbColor`]: the percentage and its grey background colour
//! - [`BrightnessApplicator`]: per-element `filter: brightness(..)` writer
//! - [`DocumentBrightness`]: background colour state machine for `<body>` and `<main>`
//! - [`DarkModeDetector`]: pluggable probes that opt a page out of background changes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod applicator;
mod document;
mod theme;

pub use applicator::{apply_brightness, should_update, BrightnessApplicator, FILTER_PROPERTIES};
pub use document::{BrightnessState, DocumentBrightness, TRANSITION_DURATION};
pub use theme::{
    ColorModeAttribute, DarkModeDetector, DarkModeProbe, DarkModeStrategy, DarkReaderMarker,
    PrefersColorScheme,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BrightnessError {
    #[error("Invalid brightness value: {0:?}")]
    InvalidValue(String),
}

// ============================================================================
// Values
// ============================================================================

/// Percentage in `[0, 100]`; 100 means no dimming.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct BrightnessValue(f64);

impl BrightnessValue {
    pub const MIN: Self = Self(0.0);
    pub const MAX: Self = Self(100.0);

    /// Clamp into range. NaN is treated as "no dimming".
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self::MAX;
        }
        let clamped = value.clamp(0.0, 100.0);
        // normalise -0.0 so it formats as "0"
        Self(if clamped == 0.0 { 0.0 } else { clamped })
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// True at 100%, the state equivalent to "nothing stored".
    pub fn is_identity(self) -> bool {
        self.0 >= 100.0
    }

    /// `brightness(<value>%)`
    pub fn filter(self) -> String {
        format!("brightness({self}%)")
    }

    pub fn rgb(self) -> RgbColor {
        RgbColor::from(self)
    }

    /// One decimal place, as shown next to the popup slider.
    pub fn to_display_string(self) -> String {
        format!("{:.1}", self.0)
    }
}

impl Default for BrightnessValue {
    fn default() -> Self {
        Self::MAX
    }
}

impl From<f64> for BrightnessValue {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<BrightnessValue> for f64 {
    fn from(value: BrightnessValue) -> Self {
        value.0
    }
}

impl FromStr for BrightnessValue {
    type Err = BrightnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| !v.is_nan())
            .map(Self::new)
            .ok_or_else(|| BrightnessError::InvalidValue(s.to_string()))
    }
}

impl fmt::Display for BrightnessValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Grey `rgb(v,v,v)` with `v = round(2.55 * brightness)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RgbColor(u8);

impl RgbColor {
    pub fn channel(self) -> u8 {
        self.0
    }
}

impl From<BrightnessValue> for RgbColor {
    fn from(value: BrightnessValue) -> Self {
        Self((2.55 * value.get()).round() as u8)
    }
}

impl fmt::Display for RgbColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rgb({0},{0},{0})", self.0)
    }
}

/// `rgb(v,v,v)` string for a brightness percentage.
pub fn rgb_color(value: BrightnessValue) -> String {
    RgbColor::from(value).to_string()
}

/// `SET_BRIGHTNESS` payload: the percentage and its precomputed background colour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Brightness {
    pub number_val: BrightnessValue,
    pub rgb_val: String,
}

impl Brightness {
    pub fn from_value(value: BrightnessValue) -> Self {
        Self {
            number_val: value,
            rgb_val: rgb_color(value),
        }
    }
}

impl From<BrightnessValue> for Brightness {
    fn from(value: BrightnessValue) -> Self {
        Self::from_value(value)
    }
}

// ============================================================================
// Tests
// ============================================================================
