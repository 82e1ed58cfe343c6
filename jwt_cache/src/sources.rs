//! Token sources

use crate::AccessToken;
use async_trait::async_trait;
use std::{error, fmt, future::Future};

/// An asynchronous source for tokens
///
/// This is the only place the cache obtains tokens from. A source may be asked
/// for a token while a previous request is still outstanding, so it is called
/// through a shared reference.
#[async_trait]
pub trait AsyncTokenSource: Send + Sync {
    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a fresh token from the issuer
    async fn request_token(&self) -> Result<AccessToken, Self::Error>;
}

/// A token source backed by an asynchronous function
///
/// Constructed with [`from_fn`].
pub struct FnTokenSource<F> {
    f: F,
}

/// Uses an asynchronous function returning raw token strings as a token source
///
/// ```
/// use jwt_cache::sources;
///
/// let source = sources::from_fn(|| async {
///     Ok::<_, std::io::Error>(String::from("header.payload.signature"))
/// });
/// # drop(source);
/// ```
pub fn from_fn<F, Fut, T, E>(f: F) -> FnTokenSource<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Into<AccessToken> + Send + 'static,
    E: error::Error + Send + Sync + 'static,
{
    FnTokenSource { f }
}

impl<F> fmt::Debug for FnTokenSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnTokenSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, T, E> AsyncTokenSource for FnTokenSource<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Into<AccessToken> + Send + 'static,
    E: error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn request_token(&self) -> Result<AccessToken, Self::Error> {
        (self.f)().await.map(Into::into)
    }
}
