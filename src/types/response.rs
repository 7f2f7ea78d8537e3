//! Cached result states and transport responses

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Transport metadata carried by terminal results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
}

impl ResponseMeta {
    pub fn new(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            status_text: Some(status_text.into()),
        }
    }
}

/// The state of one cache entry as seen by observers.
///
/// Legal transitions are `Stale -> Loading -> Success | Error` and
/// `Success | Error -> Stale` (TTL expiry or invalidation).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueryResult {
    #[default]
    Stale,
    Loading,
    Success {
        data: Value,
        #[serde(flatten)]
        meta: ResponseMeta,
    },
    Error {
        error: Value,
        #[serde(flatten)]
        meta: ResponseMeta,
    },
}

impl QueryResult {
    /// Successful result without transport metadata.
    pub fn success(data: impl Into<Value>) -> Self {
        QueryResult::Success {
            data: data.into(),
            meta: ResponseMeta::default(),
        }
    }

    /// Failed result without transport metadata.
    pub fn failure(error: impl Into<Value>) -> Self {
        QueryResult::Error {
            error: error.into(),
            meta: ResponseMeta::default(),
        }
    }

    pub fn status(&self) -> QueryStatus {
        match self {
            QueryResult::Stale => QueryStatus::Stale,
            QueryResult::Loading => QueryStatus::Loading,
            QueryResult::Success { .. } => QueryStatus::Success,
            QueryResult::Error { .. } => QueryStatus::Error,
        }
    }

    /// `Success` or `Error`.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, QueryResult::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            QueryResult::Success { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Value> {
        match self {
            QueryResult::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn meta(&self) -> Option<&ResponseMeta> {
        match self {
            QueryResult::Success { meta, .. } | QueryResult::Error { meta, .. } => Some(meta),
            _ => None,
        }
    }

    /// Deserialize the success payload into `T`.
    ///
    /// Returns `Ok(None)` when the result is not `Success`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.data() {
            Some(data) => Ok(Some(T::deserialize(data)?)),
            None => Ok(None),
        }
    }
}

/// Discriminant of [`QueryResult`], used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Stale,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Stale => "stale",
            QueryStatus::Loading => "loading",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Error)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one transport call.
///
/// `Failure` is an application-level failure (e.g. a non-2xx status). It is
/// retried by the fetch executor. Faults of the transport itself are reported
/// as `Err(CacheError::Transport)` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success { data: Value, meta: ResponseMeta },
    Failure { error: Value, meta: ResponseMeta },
}

impl Response {
    pub fn success(data: impl Into<Value>) -> Self {
        Response::Success {
            data: data.into(),
            meta: ResponseMeta::default(),
        }
    }

    pub fn failure(error: impl Into<Value>) -> Self {
        Response::Failure {
            error: error.into(),
            meta: ResponseMeta::default(),
        }
    }

    /// Attach transport status metadata.
    pub fn with_status(mut self, status: u16, status_text: impl Into<String>) -> Self {
        match &mut self {
            Response::Success { meta, .. } | Response::Failure { meta, .. } => {
                *meta = ResponseMeta::new(status, status_text);
            }
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }

    /// Convert into the terminal result stored in the cache.
    pub fn into_result(self) -> QueryResult {
        match self {
            Response::Success { data, meta } => QueryResult::Success { data, meta },
            Response::Failure { error, meta } => QueryResult::Error { error, meta },
        }
    }
}
