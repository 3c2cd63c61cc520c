//! IELTS band scores and assessment criteria.
//!
//! Bands run from 0.0 to 9.0 in half-band steps. Internally a band is held as a
//! count of half-bands so arithmetic and comparison are exact.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DomainError, DomainResult};

/// A band score in `0.0..=9.0`, always a multiple of 0.5.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BandScore(u8);

impl BandScore {
    pub const MIN: BandScore = BandScore(0);
    pub const MAX: BandScore = BandScore(18);

    /// Build from a count of half-bands (`0..=18`).
    pub fn from_halves(halves: u8) -> DomainResult<Self> {
        if halves > Self::MAX.0 {
            return Err(DomainError::validation(format!(
                "band out of range: {}",
                f64::from(halves) / 2.0
            )));
        }
        Ok(Self(halves))
    }

    /// Build from a decimal band. Rejects anything that is not an exact
    /// half-band step within range.
    pub fn from_f64(value: f64) -> DomainResult<Self> {
        if !value.is_finite() {
            return Err(DomainError::validation("band must be a finite number"));
        }
        let doubled = value * 2.0;
        if doubled.fract() != 0.0 {
            return Err(DomainError::validation(format!(
                "band must be a multiple of 0.5: {value}"
            )));
        }
        if !(0.0..=f64::from(Self::MAX.0)).contains(&doubled) {
            return Err(DomainError::validation(format!("band out of range: {value}")));
        }
        Ok(Self(doubled as u8))
    }

    pub fn halves(self) -> u8 {
        self.0
    }

    pub fn value(self) -> f64 {
        f64::from(self.0) / 2.0
    }

    /// Shift by a number of half-bands, saturating at the scale bounds.
    pub fn offset(self, halves: i8) -> Self {
        let shifted = i16::from(self.0) + i16::from(halves);
        Self(shifted.clamp(0, i16::from(Self::MAX.0)) as u8)
    }

    /// Overall band from criterion bands: the arithmetic mean rounded to the
    /// nearest half-band, with exact quarters rounding up (6.25 → 6.5,
    /// 6.75 → 7.0).
    ///
    /// Returns `None` for an empty input.
    pub fn overall<I>(scores: I) -> Option<Self>
    where
        I: IntoIterator<Item = BandScore>,
    {
        let (sum, n) = scores
            .into_iter()
            .fold((0u32, 0u32), |(sum, n), s| (sum + u32::from(s.0), n + 1));
        if n == 0 {
            return None;
        }
        // mean in halves is sum/n; round half up: floor(sum/n + 1/2)
        let rounded = (2 * sum + n) / (2 * n);
        Some(Self(rounded as u8))
    }
}

impl core::fmt::Display for BandScore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:.1}", self.value())
    }
}

impl Serialize for BandScore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.value())
    }
}

impl<'de> Deserialize<'de> for BandScore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = f64::deserialize(deserializer)?;
        BandScore::from_f64(raw).map_err(serde::de::Error::custom)
    }
}

/// The four IELTS writing assessment criteria.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    TaskResponse,
    CoherenceCohesion,
    LexicalResource,
    GrammaticalRange,
}

impl Criterion {
    pub const ALL: [Criterion; 4] = [
        Criterion::TaskResponse,
        Criterion::CoherenceCohesion,
        Criterion::LexicalResource,
        Criterion::GrammaticalRange,
    ];

    /// Stable machine name (matches the serialized form).
    pub fn key(self) -> &'static str {
        match self {
            Criterion::TaskResponse => "task_response",
            Criterion::CoherenceCohesion => "coherence_cohesion",
            Criterion::LexicalResource => "lexical_resource",
            Criterion::GrammaticalRange => "grammatical_range",
        }
    }

    /// Examiner-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Criterion::TaskResponse => "Task Response",
            Criterion::CoherenceCohesion => "Coherence & Cohesion",
            Criterion::LexicalResource => "Lexical Resource",
            Criterion::GrammaticalRange => "Grammatical Range & Accuracy",
        }
    }
}

impl core::fmt::Display for Criterion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.key())
    }
}
