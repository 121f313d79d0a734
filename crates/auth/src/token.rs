use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// OAuth token held in the session, never persisted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Liveness of a stored token, as a value rather than an error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Usable as is.
    Live,
    /// Past `expires_at` but refreshable.
    Expired,
    /// Past `expires_at` with no refresh token, or structurally unusable.
    Invalid,
}

impl OAuthToken {
    pub fn new(
        provider: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in_secs: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            provider: provider.into(),
            access_token: access_token.into(),
            refresh_token,
            expires_at: expires_in_secs.map(|s| now + Duration::seconds(s)),
        }
    }

    /// Deterministically classify the token at `now`.
    pub fn state(&self, now: DateTime<Utc>) -> TokenState {
        if self.access_token.is_empty() {
            return TokenState::Invalid;
        }
        match self.expires_at {
            Some(at) if at <= now => match self.refresh_token.as_deref() {
                Some(rt) if !rt.is_empty() => TokenState::Expired,
                _ => TokenState::Invalid,
            },
            _ => TokenState::Live,
        }
    }
}

impl core::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("provider", &self.provider)
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_liveness() {
        let now = Utc::now();
        let live = OAuthToken::new("github", "at", None, Some(3600), now);
        assert_eq!(live.state(now), TokenState::Live);

        let no_expiry = OAuthToken::new("github", "at", None, None, now);
        assert_eq!(no_expiry.state(now + Duration::days(365)), TokenState::Live);

        let refreshable = OAuthToken::new("google", "at", Some("rt".into()), Some(60), now);
        assert_eq!(refreshable.state(now + Duration::seconds(61)), TokenState::Expired);

        let dead = OAuthToken::new("google", "at", None, Some(60), now);
        assert_eq!(dead.state(now + Duration::seconds(61)), TokenState::Invalid);

        let empty = OAuthToken::new("google", "", None, None, now);
        assert_eq!(empty.state(now), TokenState::Invalid);
    }

    #[test]
    fn debug_redacts_tokens() {
        let t = OAuthToken::new("github", "very-secret", Some("r".into()), None, Utc::now());
        let dbg = format!("{t:?}");
        assert!(!dbg.contains("very-secret"));
    }
}
