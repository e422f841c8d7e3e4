//! Consistency levels and the rules deciding when a replicated operation is complete.
//!
//! Writes use [`ConsistencyLevel`], reads use [`ReadConsistencyLevel`] and establishing the
//! initial connections to a cluster uses [`ConnectConsistencyLevel`]. All of them parse from and
//! display as their snake_case names, e.g. `majority` or `unstrict_all`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Consistency required for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    One,
    Majority,
    All,
}

impl ConsistencyLevel {
    pub const ALL_LEVELS: [Self; 3] = [Self::One, Self::Majority, Self::All];

    fn as_str(&self) -> &'static str {
        match self {
            Self::One => "one",
            Self::Majority => "majority",
            Self::All => "all",
        }
    }
}

/// Consistency required for reads.
///
/// The `Unstrict*` levels wait for the same number of replicas as their strict counterparts
/// but succeed as long as a single replica responded successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConsistencyLevel {
    None,
    One,
    UnstrictMajority,
    Majority,
    UnstrictAll,
    All,
}

impl ReadConsistencyLevel {
    pub const ALL_LEVELS: [Self; 6] = [
        Self::None,
        Self::One,
        Self::UnstrictMajority,
        Self::Majority,
        Self::UnstrictAll,
        Self::All,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::One => "one",
            Self::UnstrictMajority => "unstrict_majority",
            Self::Majority => "majority",
            Self::UnstrictAll => "unstrict_all",
            Self::All => "all",
        }
    }
}

/// Consistency required before a session is considered connected to the cluster.
///
/// `Any` first tries for `All` and steps down a level each time the connect timeout elapses,
/// eventually succeeding without any connections at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectConsistencyLevel {
    Any,
    None,
    One,
    Majority,
    All,
}

impl ConnectConsistencyLevel {
    pub const ALL_LEVELS: [Self; 5] = [Self::Any, Self::None, Self::One, Self::Majority, Self::All];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::None => "none",
            Self::One => "one",
            Self::Majority => "majority",
            Self::All => "all",
        }
    }

    /// The next weaker level tried by [`ConnectConsistencyLevel::Any`].
    pub fn lower(&self) -> Self {
        match self {
            Self::All => Self::Majority,
            Self::Majority => Self::One,
            Self::One | Self::None | Self::Any => Self::None,
        }
    }
}

macro_rules! impl_level_str {
    ($t:ty, $kind:literal) => {
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL_LEVELS
                    .into_iter()
                    .find(|l| l.as_str() == s)
                    .ok_or_else(|| Error::InvalidConsistencyLevel {
                        kind: $kind,
                        value: s.to_string(),
                        valid: Self::ALL_LEVELS
                            .iter()
                            .map(|l| format!("'{}'", l.as_str()))
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
            }
        }
    };
}

impl_level_str!(ConsistencyLevel, "write");
impl_level_str!(ReadConsistencyLevel, "read");
impl_level_str!(ConnectConsistencyLevel, "connect");

/// Whether a write that reached `num_peers` replicas with `num_success` successes satisfies
/// `level`.
pub fn write_consistency_achieved(
    level: ConsistencyLevel,
    majority: usize,
    num_peers: usize,
    num_success: usize,
) -> bool {
    match level {
        ConsistencyLevel::All => num_success == num_peers,
        ConsistencyLevel::Majority => num_success >= majority,
        ConsistencyLevel::One => num_success > 0,
    }
}

/// Whether a read with `remaining` outstanding replicas and `success` successes can stop
/// waiting.
pub fn read_consistency_termination(
    level: ReadConsistencyLevel,
    majority: usize,
    remaining: usize,
    success: usize,
) -> bool {
    let done_all = remaining == 0;
    match level {
        ReadConsistencyLevel::One | ReadConsistencyLevel::None => success > 0 || done_all,
        ReadConsistencyLevel::Majority | ReadConsistencyLevel::UnstrictMajority => {
            success >= majority || done_all
        }
        ReadConsistencyLevel::All | ReadConsistencyLevel::UnstrictAll => done_all,
    }
}

/// Whether a read that reached `num_peers` replicas with `num_success` successes satisfies
/// `level`.
pub fn read_consistency_achieved(
    level: ReadConsistencyLevel,
    majority: usize,
    num_peers: usize,
    num_success: usize,
) -> bool {
    match level {
        ReadConsistencyLevel::All => num_success == num_peers,
        ReadConsistencyLevel::Majority => num_success >= majority,
        ReadConsistencyLevel::One
        | ReadConsistencyLevel::UnstrictMajority
        | ReadConsistencyLevel::UnstrictAll => num_success > 0,
        ReadConsistencyLevel::None => true,
    }
}

/// How many replica results a read needs to decode to satisfy `level`.
pub fn num_desired_for_read_consistency(
    level: ReadConsistencyLevel,
    num_replicas: usize,
    majority: usize,
) -> usize {
    match level {
        ReadConsistencyLevel::All | ReadConsistencyLevel::UnstrictAll => num_replicas,
        ReadConsistencyLevel::Majority | ReadConsistencyLevel::UnstrictMajority => majority,
        ReadConsistencyLevel::One => 1,
        ReadConsistencyLevel::None => 0,
    }
}
