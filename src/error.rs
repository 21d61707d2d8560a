//! Structured error taxonomy. Each domain gets its own enum so call sites can
//! match on `retryable()` without string-sniffing, the way the HTTP/rate-limit
//! layers need to decide whether to back off or give up.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum HttpError {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("connection to {0} failed")]
    ConnectionFailed(String),
    #[error("{0} returned 404")]
    NotFound(String),
    #[error("{0} returned 403")]
    Forbidden(String),
    #[error("{url} rate limited, retry after {retry_after_secs:?}s")]
    RateLimited {
        url: String,
        retry_after_secs: Option<u64>,
    },
    #[error("{0} returned server error {1}")]
    ServerError(String, u16),
    #[error("{0} returned an unparseable response: {1}")]
    BadResponse(String, String),
}

impl HttpError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            HttpError::Timeout(_)
                | HttpError::ConnectionFailed(_)
                | HttpError::RateLimited { .. }
                | HttpError::ServerError(_, _)
        )
    }
}

#[derive(Debug, Error, Clone)]
pub enum EsiError {
    #[error("esi http error: {0}")]
    Api(#[from] HttpError),
    #[error("esi entity not found: {0}")]
    NotFound(String),
    #[error("esi forbidden: {0}")]
    Forbidden(String),
    #[error("esi server error")]
    ServerError,
    #[error("esi endpoint not implemented: {0}")]
    NotImplemented(String),
}

impl EsiError {
    pub fn retryable(&self) -> bool {
        match self {
            EsiError::Api(e) => e.retryable(),
            EsiError::ServerError => true,
            EsiError::NotFound(_) | EsiError::Forbidden(_) | EsiError::NotImplemented(_) => false,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum ZkbError {
    #[error("zkb http error: {0}")]
    Api(#[from] HttpError),
    #[error("zkb returned an unparseable response")]
    BadResponse,
}

impl ZkbError {
    pub fn retryable(&self) -> bool {
        match self {
            ZkbError::Api(e) => e.retryable(),
            ZkbError::BadResponse => false,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,
    #[error("loader timed out")]
    LoaderTimeout,
    #[error("failed to write cache entry")]
    WriteFailed,
}

impl CacheError {
    pub fn retryable(&self) -> bool {
        matches!(self, CacheError::LoaderTimeout)
    }
}

#[derive(Debug, Error, Clone)]
pub enum ParseError {
    #[error("invalid killmail format: {0}")]
    InvalidFormat(String),
    #[error("missing required field: {0}")]
    MissingField(String),
}

#[derive(Debug, Error, Clone)]
pub enum EnrichError {
    #[error("enrichment only partially succeeded")]
    Partial,
    #[error("enrichment task timed out")]
    Timeout,
}

#[derive(Debug, Error, Clone)]
pub enum RedisQError {
    #[error("redisq poll failed: {0}")]
    PollError(String),
}

#[derive(Debug, Error, Clone)]
pub enum RateLimitError {
    #[error("request timed out waiting in queue")]
    QueueTimeout,
    #[error("circuit is open for {0}")]
    CircuitOpen(String),
}

impl RateLimitError {
    pub fn retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Error, Clone)]
pub enum ValidationError {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("value out of range: {0}")]
    OutOfRange(String),
    #[error("too many items: {0}")]
    TooManyItems(String),
}
