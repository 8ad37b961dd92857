use credence_clock::{DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{
    RefreshTokenValue, RefreshTokenValueRef, TokenType, TokenTypeRef, TokenValue, TokenValueRef,
};

/// An access token as issued by the authority
///
/// Tokens are immutable; a refreshed token replaces the previous one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessToken {
    value: TokenValue,
    token_type: TokenType,
    expires_at: UnixTime,
}

impl AccessToken {
    /// Constructs a new access token
    pub fn new(value: TokenValue, token_type: TokenType, expires_at: UnixTime) -> Self {
        Self {
            value,
            token_type,
            expires_at,
        }
    }

    /// The token's value
    #[inline]
    pub fn value(&self) -> &TokenValueRef {
        &self.value
    }

    /// The token's type, as reported by the authority
    #[inline]
    pub fn token_type(&self) -> &TokenTypeRef {
        &self.token_type
    }

    /// When the token expires
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// Whether the token is still valid as of `now`
    #[inline]
    pub fn is_valid_at(&self, now: UnixTime) -> bool {
        now < self.expires_at
    }

    /// How much longer the token would be valid as of `now`
    #[inline]
    pub fn until_expired_at(&self, now: UnixTime) -> DurationSecs {
        self.expires_at - now
    }

    /// The value of an `Authorization` header carrying this token
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value.as_str())
    }
}

/// A refresh token held alongside the access token it was issued with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshToken {
    value: RefreshTokenValue,
    expires_at: Option<UnixTime>,
}

impl RefreshToken {
    /// Constructs a new refresh token
    pub fn new(value: RefreshTokenValue, expires_at: Option<UnixTime>) -> Self {
        Self { value, expires_at }
    }

    /// The token's value
    #[inline]
    pub fn value(&self) -> &RefreshTokenValueRef {
        &self.value
    }

    /// When the token expires, if the authority said so
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.expires_at
    }

    /// Whether the token can still be exchanged as of `now`
    #[inline]
    pub fn is_valid_at(&self, now: UnixTime) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_header_uses_bearer_scheme() {
        let token = AccessToken::new(
            TokenValue::from_static("abc"),
            TokenType::from_static("bearer"),
            UnixTime(100),
        );
        assert_eq!(token.authorization_header(), "Bearer abc");
    }

    #[test]
    fn refresh_tokens_without_expiry_never_expire() {
        let token = RefreshToken::new(RefreshTokenValue::from_static("r"), None);
        assert!(token.is_valid_at(UnixTime(u64::MAX)));

        let token = RefreshToken::new(RefreshTokenValue::from_static("r"), Some(UnixTime(10)));
        assert!(token.is_valid_at(UnixTime(9)));
        assert!(!token.is_valid_at(UnixTime(10)));
    }

    #[test]
    fn access_token_debug_hides_value() {
        let token = AccessToken::new(
            TokenValue::from_static("very-secret"),
            TokenType::from_static("Bearer"),
            UnixTime(100),
        );
        assert!(!format!("{:?}", token).contains("very-secret"));
    }
}
