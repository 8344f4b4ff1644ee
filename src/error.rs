// Error taxonomy: transport outcomes normalized once at the HTTP boundary, transfer-level failures on top.

use reqwest::header::HeaderMap;

use crate::config::{RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER};

/// Rate-limit details reported by the server alongside a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub reset_ms: u64,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
}

impl RateLimitInfo {
    /// Read the rate-limit headers. `None` unless the reset header is a positive integer.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let reset_ms = read(RATE_LIMIT_RESET_HEADER).filter(|ms| *ms > 0)?;
        Some(Self {
            reset_ms,
            limit: read(RATE_LIMIT_LIMIT_HEADER),
            remaining: read(RATE_LIMIT_REMAINING_HEADER),
        })
    }
}

/// Outcome of a failed call against the SDK boundary or a shard URL.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("rate limited, retry in {} ms", .0.reset_ms)]
    RateLimited(RateLimitInfo),

    #[error("signed url expired")]
    Expired,

    #[error("request aborted")]
    Aborted,

    #[error("{0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Normalize a non-success HTTP status and its headers.
    pub fn from_status(status: u16, headers: &HeaderMap, message: impl Into<String>) -> Self {
        match status {
            429 => match RateLimitInfo::from_headers(headers) {
                Some(info) => Self::RateLimited(info),
                None => Self::Status {
                    status,
                    message: message.into(),
                },
            },
            403 => Self::Expired,
            _ => Self::Status {
                status,
                message: message.into(),
            },
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Failure of a whole-file transfer or one of its steps.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("rate limited, retry in {} ms", .0.reset_ms)]
    RateLimited(RateLimitInfo),

    #[error("transfer aborted")]
    Aborted,

    #[error("upload link expired")]
    Expired,

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unsupported file format version {0:?}")]
    UnsupportedVersion(Option<u32>),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for TransferError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::RateLimited(info) => Self::RateLimited(info),
            TransportError::Expired => Self::Expired,
            TransportError::Aborted => Self::Aborted,
            TransportError::Network(msg) => Self::Network(msg),
            TransportError::Status { status, message } => Self::Status { status, message },
            TransportError::Protocol(msg) => Self::Protocol(msg),
        }
    }
}

impl TransferError {
    /// Collapse a shard PUT failure into aborted / expired / network / unknown.
    pub fn from_upload(e: TransportError) -> Self {
        match e {
            TransportError::Aborted => Self::Aborted,
            TransportError::Expired => Self::Expired,
            TransportError::Network(msg) => Self::Network(msg),
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Errors that can tell the retry wrapper to wait and try again.
pub trait RateLimitSignal {
    fn rate_limit(&self) -> Option<RateLimitInfo>;
}

impl RateLimitSignal for TransportError {
    fn rate_limit(&self) -> Option<RateLimitInfo> {
        match self {
            Self::RateLimited(info) => Some(*info),
            _ => None,
        }
    }
}

impl RateLimitSignal for TransferError {
    fn rate_limit(&self) -> Option<RateLimitInfo> {
        match self {
            Self::RateLimited(info) => Some(*info),
            _ => None,
        }
    }
}
