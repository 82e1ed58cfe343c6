use jwt_cache_clock::{DurationMillis, UnixTimeMillis};

use crate::{AccessToken, AccessTokenRef};

/// A token together with the moment it stops being usable
///
/// Once constructed a cached token never changes; refreshing the cache
/// installs a new value instead.
#[derive(Debug)]
pub struct CachedToken {
    token: AccessToken,
    expiry: UnixTimeMillis,
}

impl CachedToken {
    /// Pairs a token with its expiry
    pub fn new(token: AccessToken, expiry: UnixTimeMillis) -> Self {
        Self { token, expiry }
    }

    /// Gets the cached access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.token
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTimeMillis {
        self.expiry
    }

    /// Gets how much longer the token would be valid as of the provided time
    #[inline]
    pub fn remaining_validity_at(&self, time: UnixTimeMillis) -> DurationMillis {
        self.expiry - time
    }

    /// Whether the token still has at least `minimum_validity` left at `time`
    #[inline]
    pub fn is_usable_at(&self, time: UnixTimeMillis, minimum_validity: DurationMillis) -> bool {
        time.signed_millis_until(self.expiry) >= i128::from(minimum_validity.0)
    }

    /// Milliseconds from `time` until the token would first fail a validity check
    /// requiring `minimum_validity`, brought forward by `lead`
    ///
    /// Negative when that moment has already passed.
    pub(crate) fn millis_until_refresh(
        &self,
        time: UnixTimeMillis,
        minimum_validity: DurationMillis,
        lead: DurationMillis,
    ) -> i128 {
        time.signed_millis_until(self.expiry) - i128::from(minimum_validity.0) - i128::from(lead.0)
    }
}
