use std::fmt;

use bytes::Bytes;
use iox_time::Time;
use serde::{Deserialize, Serialize};

/// Precision a datapoint was written with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Second,
    Millisecond,
    Microsecond,
    #[default]
    Nanosecond,
}

impl TimeUnit {
    pub(crate) fn as_u8(&self) -> u8 {
        match self {
            Self::Second => 1,
            Self::Millisecond => 2,
            Self::Microsecond => 3,
            Self::Nanosecond => 4,
        }
    }

    /// Nanoseconds in one tick of the unit.
    pub(crate) fn nanos(&self) -> i64 {
        match self {
            Self::Second => 1_000_000_000,
            Self::Millisecond => 1_000_000,
            Self::Microsecond => 1_000,
            Self::Nanosecond => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Second),
            2 => Some(Self::Millisecond),
            3 => Some(Self::Microsecond),
            4 => Some(Self::Nanosecond),
            _ => None,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Second => write!(f, "s"),
            Self::Millisecond => write!(f, "ms"),
            Self::Microsecond => write!(f, "us"),
            Self::Nanosecond => write!(f, "ns"),
        }
    }
}

/// A single value of a series.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub timestamp: Time,
    pub value: f64,
    pub unit: TimeUnit,
    /// Opaque bytes stored alongside the value, empty when absent.
    pub annotation: Bytes,
}

impl Datapoint {
    pub fn new(timestamp: Time, value: f64) -> Self {
        Self {
            timestamp,
            value,
            unit: TimeUnit::default(),
            annotation: Bytes::new(),
        }
    }

    pub fn with_unit(self, unit: TimeUnit) -> Self {
        Self { unit, ..self }
    }

    pub fn with_annotation(self, annotation: impl Into<Bytes>) -> Self {
        Self {
            annotation: annotation.into(),
            ..self
        }
    }
}
