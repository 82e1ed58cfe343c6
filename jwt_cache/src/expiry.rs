//! Reading expiry times out of tokens
//!
//! The cache treats tokens as opaque strings. The only thing it needs to know
//! about a token is when it expires, which an [`ExpiryExtractor`] determines.
//! [`JwtExpiry`] reads the registered `exp` claim from a JWT's payload without
//! validating the signature.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use jwt_cache_clock::UnixTimeMillis;
use serde_json::{Map, Value};

use crate::{error::MalformedToken, AccessTokenRef};

/// Determines when a token expires
pub trait ExpiryExtractor: Send + Sync {
    /// Extracts the expiry from `token`, failing if the token carries none
    fn expiry(&self, token: &AccessTokenRef) -> Result<UnixTimeMillis, MalformedToken>;
}

impl<F> ExpiryExtractor for F
where
    F: Fn(&AccessTokenRef) -> Result<UnixTimeMillis, MalformedToken> + Send + Sync,
{
    #[inline]
    fn expiry(&self, token: &AccessTokenRef) -> Result<UnixTimeMillis, MalformedToken> {
        self(token)
    }
}

/// Payloads are URL-safe base64, and some issuers still pad them
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Reads the `exp` claim of an unverified JWT
///
/// `exp` must be a JSON number of seconds since the Unix epoch. Fractional
/// seconds are kept to millisecond precision.
#[derive(Clone, Copy, Debug, Default)]
pub struct JwtExpiry;

impl JwtExpiry {
    /// Decodes the claims of a compact-serialized JWT without verifying it
    pub fn claims(token: &str) -> Result<Map<String, Value>, MalformedToken> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(MalformedToken::new("expected three dot-separated segments")),
        };

        let raw = PAYLOAD_ENGINE
            .decode(payload)
            .map_err(|e| MalformedToken::with_source("payload is not valid base64url", e))?;

        match serde_json::from_slice(&raw) {
            Ok(Value::Object(claims)) => Ok(claims),
            Ok(_) => Err(MalformedToken::new("payload is not a JSON object")),
            Err(e) => Err(MalformedToken::with_source("payload is not valid JSON", e)),
        }
    }
}

impl ExpiryExtractor for JwtExpiry {
    fn expiry(&self, token: &AccessTokenRef) -> Result<UnixTimeMillis, MalformedToken> {
        let claims = Self::claims(token.as_str())?;

        let exp = claims
            .get("exp")
            .ok_or_else(|| MalformedToken::new("missing `exp` claim"))?
            .as_f64()
            .ok_or_else(|| MalformedToken::new("`exp` claim is not a number"))?;

        // Float casts saturate, so an `exp` before the epoch lands on the epoch
        // and the token is simply already expired.
        Ok(UnixTimeMillis((exp * 1000.0) as u64))
    }
}
