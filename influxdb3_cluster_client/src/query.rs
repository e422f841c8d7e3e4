//! Index queries and the options that bound them.

use std::fmt;

use bytes::Bytes;
use iox_time::Time;

use crate::{Error, Result};

/// A query over the tags of indexed series.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Matches every series.
    All,
    /// Tag `field` equals `value`.
    Term { field: Bytes, value: Bytes },
    /// Tag `field` matches the regular expression `pattern`.
    Regexp { field: Bytes, pattern: String },
    /// Tag `field` is present.
    Field { field: Bytes },
    Negation(Box<Query>),
    Conjunction(Vec<Query>),
    Disjunction(Vec<Query>),
}

impl Query {
    pub fn term(field: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn regexp(field: impl Into<Bytes>, pattern: impl Into<String>) -> Self {
        Self::Regexp {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    /// Reject queries a storage node would refuse to plan.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::All => Ok(()),
            Self::Term { field, .. } | Self::Field { field } if field.is_empty() => Err(
                Error::InvalidQuery(format!("{self} has an empty field name")),
            ),
            Self::Term { .. } | Self::Field { .. } => Ok(()),
            Self::Regexp { field, pattern } => {
                if field.is_empty() || pattern.is_empty() {
                    return Err(Error::InvalidQuery(format!(
                        "{self} has an empty field name or pattern"
                    )));
                }
                Ok(())
            }
            Self::Negation(inner) => inner.validate(),
            Self::Conjunction(queries) | Self::Disjunction(queries) => {
                if queries.is_empty() {
                    return Err(Error::InvalidQuery(format!("{self} has no sub-queries")));
                }
                queries.iter().try_for_each(Query::validate)
            }
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, name: &str, queries: &[Query]) -> fmt::Result {
            write!(f, "{name}(")?;
            for (i, q) in queries.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{q}")?;
            }
            f.write_str(")")
        }

        match self {
            Self::All => f.write_str("all()"),
            Self::Term { field, value } => write!(
                f,
                "term({}, {})",
                String::from_utf8_lossy(field),
                String::from_utf8_lossy(value)
            ),
            Self::Regexp { field, pattern } => {
                write!(f, "regexp({}, {pattern})", String::from_utf8_lossy(field))
            }
            Self::Field { field } => write!(f, "field({})", String::from_utf8_lossy(field)),
            Self::Negation(inner) => write!(f, "negation({inner})"),
            Self::Conjunction(queries) => join(f, "conjunction", queries),
            Self::Disjunction(queries) => join(f, "disjunction", queries),
        }
    }
}

/// Bounds applied to an index query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub start: Time,
    pub end: Time,
    /// Maximum number of series returned, unbounded when `None`.
    pub series_limit: Option<usize>,
    /// Maximum number of index documents each node scans, unbounded when `None`.
    pub docs_limit: Option<usize>,
    /// Fail instead of returning partial results when a limit is hit.
    pub require_exhaustive: bool,
}

impl QueryOptions {
    pub fn new(start: Time, end: Time) -> Self {
        Self {
            start,
            end,
            series_limit: None,
            docs_limit: None,
            require_exhaustive: false,
        }
    }

    pub fn with_series_limit(self, limit: usize) -> Self {
        Self {
            series_limit: Some(limit),
            ..self
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(Error::InvalidQuery(format!(
                "query start {:?} is after end {:?}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// What an aggregate query returns for each matching tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AggregateQueryType {
    TagNamesOnly,
    #[default]
    TagNamesAndValues,
}

/// Options for an aggregate query over tag names and values.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOptions {
    pub query_options: QueryOptions,
    /// Restrict results to these tag names, every tag when empty.
    pub field_filter: Vec<Bytes>,
    pub aggregate_type: AggregateQueryType,
}

impl AggregateOptions {
    pub fn new(query_options: QueryOptions) -> Self {
        Self {
            query_options,
            field_filter: vec![],
            aggregate_type: AggregateQueryType::default(),
        }
    }
}

/// Describes how complete the result of an index query is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResponseMetadata {
    /// Every matching series was returned.
    pub exhaustive: bool,
    /// Number of response elements received from the cluster.
    pub responses: usize,
    /// Approximate bytes received from the cluster.
    pub estimate_total_bytes: usize,
}
