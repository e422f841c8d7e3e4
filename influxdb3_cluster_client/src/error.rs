//! Errors returned by the client, along with the predicates used to classify them.
//!
//! Errors are cheap to clone because a failed batch RPC fails every operation in the batch with
//! the same error.

use std::fmt;

use influxdb3_cluster_topology::ShardState;

use crate::rpc::RpcError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal server error: {0}")]
    InternalServer(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("host not available: {0}")]
    HostNotAvailable(Box<Error>),

    #[error("connection pool has no connections")]
    NoConnections,

    #[error("connection pool closed")]
    ConnectionPoolClosed,

    #[error("session has no host queue for host: {host}")]
    NoHostQueueForHost { host: String },

    #[error("host operation queue not open for host: {host}")]
    QueueNotOpen { host: String },

    #[error("host operation queue did not receive response for given fetch for host: {host}")]
    QueueFetchNoResponse { host: String },

    #[error("shard {shard} in host {host} not available ({state})")]
    ShardNotAvailable {
        shard: u32,
        host: String,
        state: ShardState,
    },

    #[error("error {action} host {host}: {source}")]
    Host {
        action: &'static str,
        host: String,
        source: Box<Error>,
    },

    #[error("{0}")]
    ConsistencyResult(ConsistencyResultError),

    #[error(
        "unable to satisfy consistency requirements: shards={shards}, err={}",
        ErrorList(.errors)
    )]
    UnsatisfiedConsistency {
        shards: usize,
        hosts_enqueued: usize,
        hosts_responded: usize,
        errors: Vec<Error>,
    },

    #[error("values are out of order from inner iterator")]
    OutOfOrderIterator,

    #[error("unable to decode segment: {0}")]
    SegmentDecode(String),

    #[error("unable to encode tags: {0}")]
    TagEncode(String),

    #[error("unable to decode tags: {0}")]
    TagDecode(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(
        "query exceeded limit ({limit}) and require exhaustive is set, \
         returned {returned} results"
    )]
    ResourceExhausted { limit: usize, returned: usize },

    #[error("session not in open state")]
    SessionNotOpen,

    #[error("session not in initial state")]
    SessionNotInitial,

    #[error("timed out establishing min connections to cluster")]
    ClusterConnectTimeout,

    #[error("topology error: {0}")]
    Topology(#[from] influxdb3_cluster_topology::Error),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("[invariant violated] {0}")]
    Invariant(String),

    #[error("invalid params: {0}")]
    InvalidParams(Box<Error>),

    #[error("{0}")]
    NonRetryable(Box<Error>),

    #[error("{}", ErrorList(.0))]
    Multi(Vec<Error>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Mark `err` as not worth retrying.
    pub fn non_retryable(err: Self) -> Self {
        match err {
            Self::NonRetryable(_) => err,
            other => Self::NonRetryable(Box::new(other)),
        }
    }

    /// Mark a bad request as invalid params that must not be retried, leaving other errors as
    /// they are.
    pub(crate) fn classify_bad_request(err: Self) -> Self {
        if err.is_bad_request() {
            Self::non_retryable(Self::InvalidParams(Box::new(err)))
        } else {
            err
        }
    }

    /// Build the result of an operation fanned out to replicas that did not meet its
    /// consistency level.
    ///
    /// If any replica rejected the request as bad the whole error is non-retryable.
    pub(crate) fn consistency_result(
        level: impl fmt::Display,
        enqueued: usize,
        responded: usize,
        success: usize,
        errors: Vec<Error>,
    ) -> Self {
        let bad_request = errors.iter().any(Error::is_bad_request);
        let err = Self::ConsistencyResult(ConsistencyResultError {
            level: level.to_string(),
            enqueued,
            responded,
            success,
            errors,
        });
        if bad_request {
            Self::non_retryable(err)
        } else {
            err
        }
    }

    /// The error with classification and renaming wrappers removed.
    fn unwrapped(&self) -> &Self {
        match self {
            Self::NonRetryable(inner) | Self::InvalidParams(inner) => inner.unwrapped(),
            Self::Host { source, .. } => source.unwrapped(),
            other => other,
        }
    }

    pub fn is_bad_request(&self) -> bool {
        match self {
            Self::BadRequest(_) | Self::InvalidParams(_) => true,
            Self::NonRetryable(inner) | Self::Host { source: inner, .. } => inner.is_bad_request(),
            Self::ConsistencyResult(e) => e.errors.iter().any(Error::is_bad_request),
            Self::UnsatisfiedConsistency { errors, .. } => errors.iter().any(Error::is_bad_request),
            _ => false,
        }
    }

    pub fn is_non_retryable(&self) -> bool {
        match self {
            Self::NonRetryable(_) | Self::HostNotAvailable(_) => true,
            Self::InvalidParams(inner) | Self::Host { source: inner, .. } => {
                inner.is_non_retryable()
            }
            _ => false,
        }
    }

    pub fn is_host_not_available(&self) -> bool {
        matches!(self.unwrapped(), Self::HostNotAvailable(_))
    }

    pub fn is_consistency_result_error(&self) -> bool {
        matches!(
            self.unwrapped(),
            Self::ConsistencyResult(_) | Self::UnsatisfiedConsistency { .. }
        )
    }

    /// Replicas that responded, for consistency results; zero otherwise.
    pub fn num_responded(&self) -> usize {
        match self.unwrapped() {
            Self::ConsistencyResult(e) => e.responded,
            Self::UnsatisfiedConsistency {
                hosts_responded, ..
            } => *hosts_responded,
            _ => 0,
        }
    }

    /// Replicas that succeeded, for consistency results; zero otherwise.
    pub fn num_success(&self) -> usize {
        match self.unwrapped() {
            Self::ConsistencyResult(e) => e.success,
            Self::UnsatisfiedConsistency {
                hosts_responded,
                errors,
                ..
            } => hosts_responded.saturating_sub(errors.len()),
            _ => 0,
        }
    }

    /// Replicas that failed, for consistency results; zero otherwise.
    pub fn num_error(&self) -> usize {
        match self.unwrapped() {
            Self::ConsistencyResult(e) => e.errors.len(),
            Self::UnsatisfiedConsistency { errors, .. } => errors.len(),
            _ => 0,
        }
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::BadRequest(msg) => Self::BadRequest(msg),
            RpcError::Internal(msg) => Self::InternalServer(msg),
            RpcError::Timeout => Self::Timeout,
            RpcError::Transport(msg) => Self::Transport(msg),
            RpcError::WriteBatchErrors(errs) => {
                Self::Multi(errs.into_iter().map(|e| e.error.into()).collect())
            }
        }
    }
}

/// An operation fanned out to replicas did not meet its consistency level.
#[derive(Debug, Clone)]
pub struct ConsistencyResultError {
    level: String,
    enqueued: usize,
    responded: usize,
    success: usize,
    errors: Vec<Error>,
}

impl ConsistencyResultError {
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }
}

impl fmt::Display for ConsistencyResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to meet consistency level {} with {}/{} success, {} nodes responded, errors: {}",
            self.level,
            self.success,
            self.enqueued,
            self.responded,
            ErrorList(&self.errors)
        )
    }
}

struct ErrorList<'a>(&'a [Error]);

impl fmt::Display for ErrorList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{err}")?;
        }
        f.write_str("]")
    }
}
