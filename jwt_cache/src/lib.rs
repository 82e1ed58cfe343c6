//! Single-flight caching and eager background refresh of short-lived tokens
//!
//! Services that call other services with bearer tokens usually obtain those
//! tokens from an issuer that is slow, rate limited, or both. This crate sits
//! between the many tasks that need a token and the one function that knows how
//! to get one, and makes sure that:
//!
//! * a token is reused for as long as it has at least a minimum validity left;
//! * concurrent requests that find the cache stale share a single fetch, and
//!   all of them see its outcome;
//! * optionally, a replacement is fetched in the background shortly before the
//!   cached token would go stale, so requests rarely wait on the issuer.
//!
//! The expiry of each token is read from the token itself, by default from the
//! `exp` claim of a JWT. Signatures are not checked.
//!
//! ```
//! use jwt_cache::{sources, CacheConfig, TokenCache};
//! use jwt_cache_clock::DurationMillis;
//!
//! # async fn fetch_from_issuer() -> Result<String, std::io::Error> {
//! #     unimplemented!()
//! # }
//! # async fn run() -> Result<(), jwt_cache::TokenError> {
//! let config = CacheConfig::default()
//!     .with_minimum_validity(DurationMillis::from_secs(5))
//!     .with_eager_refresh(DurationMillis::from_secs(30));
//!
//! let cache = TokenCache::new(sources::from_fn(fetch_from_issuer), config);
//!
//! let token = cache.get_token().await?;
//! tracing::info!(token = format_args!("{:#?}", token), "got a token");
//!
//! cache.dispose();
//! # Ok(())
//! # }
//! ```
//!
//! # Failure handling
//!
//! A failed fetch is reported to every caller waiting on it, and the next call
//! starts over. There are no retries or backoff; if those are wanted, they
//! belong in the token source. Failures of background refreshes are logged and
//! can be observed with [`TokenCacheBuilder::on_refresh_error`], but never
//! reach a caller of [`TokenCache::get_token`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod cache;
mod config;
pub mod error;
pub mod expiry;
mod refresh;
pub mod sources;
mod tokens;

pub use braids::*;
pub use cache::{TokenCache, TokenCacheBuilder};
pub use config::CacheConfig;
pub use error::TokenError;
pub use tokens::CachedToken;
