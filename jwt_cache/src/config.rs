use jwt_cache_clock::DurationMillis;
use serde::Deserialize;

/// Configuration for how long cached tokens are served and when they are refreshed
///
/// Can be deserialized from an application's own configuration, with any
/// omitted field taking its default:
///
/// ```
/// # fn main() -> Result<(), serde_json::Error> {
/// let config: jwt_cache::CacheConfig =
///     serde_json::from_str(r#"{ "eager_refresh_ms": 30000 }"#)?;
/// assert_eq!(config.minimum_validity().0, 1_000);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(rename = "eager_refresh_ms")]
    eager_refresh: DurationMillis,
    #[serde(rename = "minimum_validity_ms")]
    minimum_validity: DurationMillis,
}

impl Default for CacheConfig {
    /// Default cache configuration
    ///
    /// Eager refresh is disabled, and a token must have at least one second of
    /// validity left to be handed out.
    fn default() -> Self {
        Self {
            eager_refresh: DurationMillis::ZERO,
            minimum_validity: DurationMillis(1_000),
        }
    }
}

impl CacheConfig {
    /// Sets how long before a token would stop being served that a replacement
    /// should be fetched in the background
    ///
    /// A zero duration disables background refreshes entirely.
    pub fn with_eager_refresh(mut self, eager_refresh: DurationMillis) -> Self {
        self.eager_refresh = eager_refresh;
        self
    }

    /// Sets the minimum remaining lifetime a cached token must have to be served
    pub fn with_minimum_validity(mut self, minimum_validity: DurationMillis) -> Self {
        self.minimum_validity = minimum_validity;
        self
    }

    /// Lead time for background refreshes
    #[inline]
    pub fn eager_refresh(&self) -> DurationMillis {
        self.eager_refresh
    }

    /// Minimum remaining lifetime for a token to be served from the cache
    #[inline]
    pub fn minimum_validity(&self) -> DurationMillis {
        self.minimum_validity
    }

    /// Whether tokens are refreshed in the background
    #[inline]
    pub fn eager_refresh_enabled(&self) -> bool {
        !self.eager_refresh.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::Result;

    #[test]
    fn defaults_disable_eager_refresh() {
        let config = CacheConfig::default();
        assert!(!config.eager_refresh_enabled());
        assert_eq!(config.minimum_validity(), DurationMillis(1_000));
    }

    #[test]
    fn deserializes_with_defaults() -> Result<()> {
        let config: CacheConfig = serde_json::from_str(r#"{ "minimum_validity_ms": 100 }"#)?;
        assert_eq!(
            config,
            CacheConfig::default().with_minimum_validity(DurationMillis(100))
        );

        let config: CacheConfig =
            serde_json::from_str(r#"{ "eager_refresh_ms": 500, "minimum_validity_ms": 100 }"#)?;
        assert!(config.eager_refresh_enabled());
        assert_eq!(config.eager_refresh(), DurationMillis(500));
        Ok(())
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = serde_json::from_str::<CacheConfig>(r#"{ "eager_refresh": 500 }"#);
        assert!(result.is_err());
    }
}
