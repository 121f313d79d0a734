//! OAuth login.
//!
//! The flow is split in two halves:
//!
//! - [`OAuthFlow`] (async) talks to the provider: it builds the authorize URL
//!   with a random `state`, exchanges the callback code for a token, stores
//!   the token in the session, fetches the user-info document and refreshes
//!   expired tokens.
//! - [`OAuthProvider`] (sync, an [`AuthProvider`]) turns the extracted
//!   [`OAuthUserInfo`] into a local user: whitelist check, lookup, optional
//!   auto-registration, bookkeeping.
//!
//! A refresh replaces the session token; the previous token is not revoked
//! at the provider.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use secrecy::ExposeSecret;
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use gatehouse_auth::{AuthType, OAuthProviderConfig, OAuthToken, TokenState};
use gatehouse_core::{SecurityError, SecurityResult, User};

use super::{
    AuthProvider, AutoRegister, Credentials, OAuthUserInfo, ProviderError, auto_register,
    find_by_username_or_email, log_failed, record_login,
};
use crate::session::{OAUTH_STATE_KEY, Session, random_hex};
use crate::store::SecurityStore;

// ─────────────────────────────────────────────────────────────────────────────
// Remote
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP side of an OAuth provider.
#[async_trait]
pub trait OAuthRemote: Send + Sync {
    async fn exchange_code(
        &self,
        provider: &OAuthProviderConfig,
        code: &str,
        redirect_uri: &str,
    ) -> Result<JsonValue, ProviderError>;

    async fn refresh(
        &self,
        provider: &OAuthProviderConfig,
        refresh_token: &str,
    ) -> Result<JsonValue, ProviderError>;

    async fn user_info(
        &self,
        provider: &OAuthProviderConfig,
        access_token: &str,
    ) -> Result<JsonValue, ProviderError>;
}

/// [`OAuthRemote`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestOAuthRemote {
    client: reqwest::Client,
}

impl ReqwestOAuthRemote {
    pub fn new(timeout: Duration) -> SecurityResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SecurityError::provider(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

pub(super) fn classify(operation: &str, err: reqwest::Error) -> ProviderError {
    if err.is_connect() || err.is_timeout() {
        ProviderError::Transient(format!("{operation}: {err}"))
    } else {
        ProviderError::Fatal(format!("{operation}: {err}"))
    }
}

async fn read_json(operation: &str, resp: reqwest::Response) -> Result<JsonValue, ProviderError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let msg = format!("{operation} returned {status}: {body}");
        return Err(if status.is_server_error() {
            ProviderError::Transient(msg)
        } else {
            ProviderError::Fatal(msg)
        });
    }
    resp.json()
        .await
        .map_err(|e| ProviderError::Fatal(format!("{operation} response parse failed: {e}")))
}

/// User-info endpoint: explicit `userinfo_url`, else the provider's default
/// path under `api_base_url`.
fn userinfo_endpoint(provider: &OAuthProviderConfig) -> Result<String, ProviderError> {
    if let Some(url) = &provider.remote_app.userinfo_url {
        return Ok(url.clone());
    }
    let base = provider.remote_app.api_base_url.as_deref().ok_or_else(|| {
        ProviderError::Fatal(format!(
            "oauth provider '{}' has neither userinfo_url nor api_base_url",
            provider.name
        ))
    })?;
    let path = match provider.name.as_str() {
        "github" => "user",
        "google" => "userinfo",
        "linkedin" => "me",
        "twitter" => "account/verify_credentials.json",
        "azure" => "me",
        _ => "userinfo",
    };
    Ok(format!("{}/{path}", base.trim_end_matches('/')))
}

#[async_trait]
impl OAuthRemote for ReqwestOAuthRemote {
    async fn exchange_code(
        &self,
        provider: &OAuthProviderConfig,
        code: &str,
        redirect_uri: &str,
    ) -> Result<JsonValue, ProviderError> {
        let app = &provider.remote_app;
        let resp = self
            .client
            .post(&app.access_token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", app.client_id.as_str()),
                ("client_secret", app.client_secret.expose_secret()),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| classify("token exchange", e))?;
        read_json("token exchange", resp).await
    }

    async fn refresh(
        &self,
        provider: &OAuthProviderConfig,
        refresh_token: &str,
    ) -> Result<JsonValue, ProviderError> {
        let app = &provider.remote_app;
        let resp = self
            .client
            .post(&app.access_token_url)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", app.client_id.as_str()),
                ("client_secret", app.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| classify("token refresh", e))?;
        read_json("token refresh", resp).await
    }

    async fn user_info(
        &self,
        provider: &OAuthProviderConfig,
        access_token: &str,
    ) -> Result<JsonValue, ProviderError> {
        let url = userinfo_endpoint(provider)?;
        let resp = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| classify("userinfo fetch", e))?;
        read_json("userinfo fetch", resp).await
    }
}

pub(super) async fn retry_once_async<T, F, Fut>(operation: &str, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match op().await {
        Err(ProviderError::Transient(reason)) => {
            warn!(operation, %reason, "transient provider failure, retrying once");
            op().await
        }
        other => other,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token and user-info extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Token endpoint response, read with the provider's configured key names.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    pub fn from_json(provider: &OAuthProviderConfig, raw: &JsonValue) -> Result<Self, ProviderError> {
        let access_token = raw
            .get(&provider.token_key)
            .and_then(JsonValue::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ProviderError::Fatal(format!("missing '{}' in token response", provider.token_key))
            })?
            .to_string();
        let refresh_token = raw
            .get(&provider.token_secret)
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let expires_in = raw.get("expires_in").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        });
        Ok(Self {
            access_token,
            refresh_token,
            expires_in,
        })
    }

    pub fn into_token(self, provider: &str, now: DateTime<Utc>) -> OAuthToken {
        OAuthToken::new(
            provider,
            self.access_token,
            self.refresh_token,
            self.expires_in,
            now,
        )
    }
}

fn text(raw: &JsonValue, key: &str) -> Option<String> {
    match raw.get(key)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn split_name(name: Option<String>) -> (Option<String>, Option<String>) {
    match name {
        Some(full) => match full.split_once(' ') {
            Some((first, last)) => (Some(first.to_string()), Some(last.to_string())),
            None => (Some(full), None),
        },
        None => (None, None),
    }
}

/// Map a provider's user-info document to local user attributes.
///
/// Known providers get their own field mapping and a `<provider>_` username
/// prefix; anything else goes through a generic OpenID-Connect style mapping.
pub fn extract_user_info(provider: &str, raw: &JsonValue) -> Result<OAuthUserInfo, ProviderError> {
    let missing = |field: &str| {
        ProviderError::Fatal(format!("{provider} user info has no '{field}'"))
    };
    let info = match provider {
        "github" => {
            let login = text(raw, "login").ok_or_else(|| missing("login"))?;
            let (first_name, last_name) = split_name(text(raw, "name"));
            OAuthUserInfo {
                username: format!("github_{login}"),
                email: text(raw, "email"),
                first_name,
                last_name,
            }
        }
        "google" => OAuthUserInfo {
            username: format!("google_{}", text(raw, "id").ok_or_else(|| missing("id"))?),
            email: text(raw, "email"),
            first_name: text(raw, "given_name"),
            last_name: text(raw, "family_name"),
        },
        "linkedin" => OAuthUserInfo {
            username: format!("linkedin_{}", text(raw, "id").ok_or_else(|| missing("id"))?),
            email: text(raw, "email"),
            first_name: text(raw, "localizedFirstName"),
            last_name: text(raw, "localizedLastName"),
        },
        "twitter" => {
            let screen_name = text(raw, "screen_name").ok_or_else(|| missing("screen_name"))?;
            let (first_name, last_name) = split_name(text(raw, "name"));
            OAuthUserInfo {
                username: format!("twitter_{screen_name}"),
                email: text(raw, "email"),
                first_name,
                last_name,
            }
        }
        "azure" => OAuthUserInfo {
            username: format!("azure_{}", text(raw, "id").ok_or_else(|| missing("id"))?),
            email: text(raw, "mail").or_else(|| text(raw, "userPrincipalName")),
            first_name: text(raw, "givenName"),
            last_name: text(raw, "surname"),
        },
        other => {
            let id = ["preferred_username", "username", "login", "sub", "id"]
                .iter()
                .find_map(|k| text(raw, k))
                .ok_or_else(|| missing("sub"))?;
            OAuthUserInfo {
                username: format!("{other}_{id}"),
                email: text(raw, "email"),
                first_name: text(raw, "given_name").or_else(|| text(raw, "first_name")),
                last_name: text(raw, "family_name").or_else(|| text(raw, "last_name")),
            }
        }
    };
    Ok(info)
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow
// ─────────────────────────────────────────────────────────────────────────────

/// Async half of the OAuth login: everything that talks to the provider.
#[derive(Clone)]
pub struct OAuthFlow {
    remote: Arc<dyn OAuthRemote>,
    providers: Vec<OAuthProviderConfig>,
    base_url: String,
}

impl OAuthFlow {
    pub fn new(
        remote: Arc<dyn OAuthRemote>,
        providers: Vec<OAuthProviderConfig>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            providers,
            base_url: base_url.into(),
        }
    }

    fn provider(&self, name: &str) -> SecurityResult<&OAuthProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SecurityError::not_found(format!("oauth provider '{name}'")))
    }

    pub fn redirect_uri(&self, provider: &str) -> String {
        format!(
            "{}/oauth-authorized/{provider}",
            self.base_url.trim_end_matches('/')
        )
    }

    /// Authorize URL for `provider`; stores a fresh `state` in the session.
    pub fn authorize_url(&self, session: &mut Session, provider: &str) -> SecurityResult<String> {
        let config = self.provider(provider)?;
        let state = random_hex(16);
        session.insert(OAUTH_STATE_KEY, &state)?;
        let app = &config.remote_app;
        let redirect_uri = self.redirect_uri(provider);
        let mut url = Url::parse_with_params(
            &app.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", app.client_id.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| SecurityError::config(format!("oauth provider '{provider}' authorize_url: {e}")))?;
        if let Some(scope) = &app.scope {
            url.query_pairs_mut().append_pair("scope", scope);
        }
        Ok(url.into())
    }

    /// Handle the provider's redirect back: verify `state`, exchange `code`,
    /// store the token, and extract the user info.
    #[instrument(skip(self, session, code, state))]
    pub async fn callback(
        &self,
        session: &mut Session,
        provider: &str,
        code: &str,
        state: &str,
    ) -> SecurityResult<OAuthUserInfo> {
        let config = self.provider(provider)?;
        let expected: Option<String> = session.get(OAUTH_STATE_KEY);
        session.remove(OAUTH_STATE_KEY);
        if expected.as_deref() != Some(state) {
            warn!(provider, "oauth state mismatch");
            return Err(SecurityError::AuthFailed);
        }

        let redirect_uri = self.redirect_uri(provider);
        let raw = retry_once_async("oauth_token_exchange", || {
            self.remote.exchange_code(config, code, &redirect_uri)
        })
        .await?;
        let token = TokenResponse::from_json(config, &raw)?.into_token(provider, Utc::now());
        session.set_oauth_token(&token)?;

        let raw_info = retry_once_async("oauth_user_info", || {
            self.remote.user_info(config, &token.access_token)
        })
        .await?;
        Ok(extract_user_info(provider, &raw_info)?)
    }

    /// Make the session's token usable, refreshing it when expired.
    ///
    /// A token that cannot be refreshed logs the session out and reports
    /// [`TokenState::Invalid`].
    pub async fn ensure_fresh(
        &self,
        session: &mut Session,
        now: DateTime<Utc>,
    ) -> SecurityResult<TokenState> {
        let Some(token) = session.oauth_token() else {
            return Ok(TokenState::Invalid);
        };
        match token.state(now) {
            TokenState::Live => Ok(TokenState::Live),
            TokenState::Invalid => {
                session.logout();
                Ok(TokenState::Invalid)
            }
            TokenState::Expired => {
                let refreshed = match (self.provider(&token.provider), token.refresh_token.as_deref()) {
                    (Ok(config), Some(rt)) => {
                        retry_once_async("oauth_refresh", || self.remote.refresh(config, rt))
                            .await
                            .and_then(|raw| TokenResponse::from_json(config, &raw))
                    }
                    _ => Err(ProviderError::Fatal("token cannot be refreshed".into())),
                };
                match refreshed {
                    Ok(mut fresh) => {
                        if fresh.refresh_token.is_none() {
                            fresh.refresh_token = token.refresh_token.clone();
                        }
                        session.set_oauth_token(&fresh.into_token(&token.provider, now))?;
                        info!(provider = %token.provider, "oauth token refreshed");
                        Ok(TokenState::Live)
                    }
                    Err(err) => {
                        warn!(provider = %token.provider, error = %err, "oauth refresh failed");
                        session.logout();
                        Ok(TokenState::Invalid)
                    }
                }
            }
        }
    }
}

impl core::fmt::Debug for OAuthFlow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OAuthFlow")
            .field("providers", &self.providers.len())
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Sync half of the OAuth login: resolves extracted user info to a user.
#[derive(Debug, Clone)]
pub struct OAuthProvider {
    providers: Vec<OAuthProviderConfig>,
    register: Option<AutoRegister>,
}

impl OAuthProvider {
    pub fn new(providers: Vec<OAuthProviderConfig>, register: Option<AutoRegister>) -> Self {
        Self {
            providers,
            register,
        }
    }
}

impl AuthProvider for OAuthProvider {
    fn auth_type(&self) -> AuthType {
        AuthType::OAuth
    }

    #[instrument(skip_all, fields(username = %credentials.identifier()))]
    fn authenticate(
        &self,
        store: &dyn SecurityStore,
        credentials: &Credentials,
    ) -> SecurityResult<Option<User>> {
        let Credentials::OAuth { provider, info } = credentials else {
            return Ok(None);
        };
        let Some(config) = self.providers.iter().find(|p| &p.name == provider) else {
            log_failed(&info.username, "unknown oauth provider");
            return Ok(None);
        };
        if !config.email_allowed(info.email.as_deref()) {
            log_failed(&info.username, "email not in whitelist");
            return Ok(None);
        }
        if info.username.is_empty() {
            return Ok(None);
        }

        let mut user = find_by_username_or_email(store, &info.username)?;
        if user.is_none() {
            if let Some(email) = info.email.as_deref().filter(|e| !e.is_empty()) {
                user = find_by_username_or_email(store, email)?;
            }
        }
        let user = match (user, &self.register) {
            (Some(user), _) if user.active => user,
            (Some(_), _) => {
                log_failed(&info.username, "inactive user");
                return Ok(None);
            }
            (None, Some(register)) => {
                let email = info
                    .email
                    .clone()
                    .unwrap_or_else(|| format!("{}@email.notfound", info.username));
                auto_register(
                    store,
                    register,
                    &info.username,
                    info.first_name.as_deref().unwrap_or(""),
                    info.last_name.as_deref().unwrap_or(""),
                    &email,
                )?
            }
            (None, None) => {
                log_failed(&info.username, "unknown user");
                return Ok(None);
            }
        };
        record_login(store, user).map(Some)
    }
}
