//! Errors reported by the token cache

use std::{error::Error as StdError, sync::Arc};

use thiserror::Error;

/// The token could not be cached because no usable expiry could be read from it
#[derive(Clone, Debug, Error)]
#[error("token is malformed: {reason}")]
pub struct MalformedToken {
    reason: &'static str,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl MalformedToken {
    /// Reports a token as malformed for the given reason
    pub fn new(reason: &'static str) -> Self {
        Self {
            reason,
            source: None,
        }
    }

    /// Reports a token as malformed because of an underlying error
    pub fn with_source(reason: &'static str, source: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            reason,
            source: Some(Arc::new(source)),
        }
    }

    /// A short description of what was wrong with the token
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// The task driving a fetch ended before it produced an outcome
#[derive(Clone, Copy, Debug, Error)]
#[error("token fetch ended without producing a result")]
pub struct FetchAbandoned {
    _p: (),
}

pub(crate) const fn fetch_abandoned() -> FetchAbandoned {
    FetchAbandoned { _p: () }
}

/// An error obtaining a token from the cache
///
/// Every caller waiting on the same fetch receives a clone of the same error.
#[derive(Clone, Debug, Error)]
pub enum TokenError {
    /// The token source handed back a token without a usable expiry
    #[error(transparent)]
    Malformed(#[from] MalformedToken),
    /// The token source failed to produce a token
    #[error("token source failed to produce a token")]
    Fetch(#[source] Arc<dyn StdError + Send + Sync + 'static>),
    /// The cache has been disposed and will not hand out any more tokens
    #[error("cannot get a token after the cache has been disposed")]
    Disposed,
}

impl TokenError {
    pub(crate) fn fetch(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Fetch(Arc::new(source))
    }

    /// Whether this error came from a disposed cache
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed)
    }
}

impl From<FetchAbandoned> for TokenError {
    fn from(err: FetchAbandoned) -> Self {
        Self::fetch(err)
    }
}
