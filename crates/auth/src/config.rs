//! TOML configuration for the security core.
//!
//! Keys are the upper-case names the host application already uses
//! (`AUTH_TYPE`, `AUTH_LDAP_SERVER`, `OAUTH_PROVIDERS`, ...).

use std::path::Path;

use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;

use gatehouse_core::{SecurityError, SecurityResult};

use crate::roles::{DEFAULT_ADMIN_ROLE, DEFAULT_PUBLIC_ROLE};

/// Which authentication provider is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum AuthType {
    #[default]
    #[serde(rename = "DB")]
    Db,
    #[serde(rename = "LDAP")]
    Ldap,
    #[serde(rename = "OID")]
    OpenId,
    #[serde(rename = "REMOTE_USER")]
    RemoteUser,
    #[serde(rename = "OAUTH")]
    OAuth,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Db => "DB",
            Self::Ldap => "LDAP",
            Self::OpenId => "OID",
            Self::RemoteUser => "REMOTE_USER",
            Self::OAuth => "OAUTH",
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(rename = "AUTH_TYPE", default)]
    pub auth_type: AuthType,

    #[serde(rename = "AUTH_ROLE_ADMIN", default = "default_admin_role")]
    pub role_admin: String,

    #[serde(rename = "AUTH_ROLE_PUBLIC", default = "default_public_role")]
    pub role_public: String,

    #[serde(rename = "AUTH_USER_REGISTRATION", default)]
    pub user_registration: bool,

    /// Falls back to the public role when unset.
    #[serde(rename = "AUTH_USER_REGISTRATION_ROLE", default)]
    pub user_registration_role: Option<String>,

    #[serde(flatten)]
    pub ldap: LdapConfig,

    #[serde(rename = "AUTH_REMOTE_USER_HEADER", default = "default_remote_user_header")]
    pub remote_user_header: String,

    #[serde(rename = "OAUTH_PROVIDERS", default)]
    pub oauth_providers: Vec<OAuthProviderConfig>,

    #[serde(rename = "OPENID_PROVIDERS", default)]
    pub openid_providers: Vec<OpenIdProviderConfig>,

    #[serde(rename = "SECRET_KEY")]
    pub secret_key: SecretString,

    #[serde(rename = "PREVIOUS_SECRET_KEY", default)]
    pub previous_secret_key: Option<SecretString>,

    /// Base URL used to build activation links and OAuth redirect URIs.
    #[serde(rename = "APP_BASE_URL", default = "default_base_url")]
    pub app_base_url: String,

    #[serde(rename = "LOGIN_URL", default = "default_login_url")]
    pub login_url: String,

    #[serde(rename = "MAIL_DEFAULT_SENDER", default = "default_mail_sender")]
    pub mail_default_sender: String,
}

/// LDAP settings; only consulted when `AUTH_TYPE = "LDAP"`.
#[derive(Debug, Clone, Deserialize)]
pub struct LdapConfig {
    #[serde(rename = "AUTH_LDAP_SERVER", default)]
    pub server: Option<String>,

    #[serde(rename = "AUTH_LDAP_USE_TLS", default)]
    pub use_tls: bool,

    #[serde(rename = "AUTH_LDAP_SEARCH", default)]
    pub search: String,

    /// Indirect-bind service account; empty means direct bind.
    #[serde(rename = "AUTH_LDAP_BIND_USER", default)]
    pub bind_user: String,

    #[serde(rename = "AUTH_LDAP_BIND_PASSWORD", default)]
    pub bind_password: Option<SecretString>,

    #[serde(rename = "AUTH_LDAP_APPEND_DOMAIN", default)]
    pub append_domain: String,

    /// Template with a single `%s` replaced by the username.
    #[serde(rename = "AUTH_LDAP_USERNAME_FORMAT", default)]
    pub username_format: String,

    #[serde(rename = "AUTH_LDAP_UID_FIELD", default = "default_uid_field")]
    pub uid_field: String,

    #[serde(rename = "AUTH_LDAP_FIRSTNAME_FIELD", default = "default_firstname_field")]
    pub firstname_field: String,

    #[serde(rename = "AUTH_LDAP_LASTNAME_FIELD", default = "default_lastname_field")]
    pub lastname_field: String,

    #[serde(rename = "AUTH_LDAP_EMAIL_FIELD", default = "default_email_field")]
    pub email_field: String,

    #[serde(rename = "AUTH_LDAP_ALLOW_SELF_SIGNED", default)]
    pub allow_self_signed: bool,

    #[serde(rename = "AUTH_LDAP_TIMEOUT_SECS", default = "default_ldap_timeout")]
    pub timeout_secs: u64,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            server: None,
            use_tls: false,
            search: String::new(),
            bind_user: String::new(),
            bind_password: None,
            append_domain: String::new(),
            username_format: String::new(),
            uid_field: default_uid_field(),
            firstname_field: default_firstname_field(),
            lastname_field: default_lastname_field(),
            email_field: default_email_field(),
            allow_self_signed: false,
            timeout_secs: default_ldap_timeout(),
        }
    }
}

/// One `OAUTH_PROVIDERS` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthProviderConfig {
    pub name: String,

    #[serde(default)]
    pub icon: Option<String>,

    /// Key of the access token in the token endpoint response.
    #[serde(default = "default_token_key")]
    pub token_key: String,

    /// Key of the refresh token in the token endpoint response.
    #[serde(default = "default_token_secret")]
    pub token_secret: String,

    /// Email regexes; when non-empty, a login must match at least one.
    #[serde(default)]
    pub whitelist: EmailWhitelist,

    pub remote_app: RemoteAppConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAppConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub authorize_url: String,
    pub access_token_url: String,
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Overrides the provider's default user-info endpoint.
    #[serde(default)]
    pub userinfo_url: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl OAuthProviderConfig {
    /// True when no whitelist is configured or `email` matches one pattern.
    pub fn email_allowed(&self, email: Option<&str>) -> bool {
        self.whitelist.allows(email)
    }
}

/// Email patterns compiled once, when the configuration is read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct EmailWhitelist {
    patterns: Vec<Regex>,
}

impl EmailWhitelist {
    pub fn new<I, S>(patterns: I) -> SecurityResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(p).map_err(|e| {
                    SecurityError::config(format!("invalid whitelist pattern '{p}': {e}"))
                })
            })
            .collect::<SecurityResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn allows(&self, email: Option<&str>) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        email.is_some_and(|email| self.patterns.iter().any(|re| re.is_match(email)))
    }
}

impl TryFrom<Vec<String>> for EmailWhitelist {
    type Error = SecurityError;

    fn try_from(patterns: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(patterns)
    }
}

/// One `OPENID_PROVIDERS` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenIdProviderConfig {
    pub name: String,
    pub url: String,
}

fn default_admin_role() -> String {
    DEFAULT_ADMIN_ROLE.to_string()
}

fn default_public_role() -> String {
    DEFAULT_PUBLIC_ROLE.to_string()
}

fn default_remote_user_header() -> String {
    "REMOTE_USER".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_login_url() -> String {
    "/login/".to_string()
}

fn default_mail_sender() -> String {
    "no-reply@localhost".to_string()
}

fn default_uid_field() -> String {
    "uid".to_string()
}

fn default_firstname_field() -> String {
    "givenName".to_string()
}

fn default_lastname_field() -> String {
    "sn".to_string()
}

fn default_email_field() -> String {
    "mail".to_string()
}

fn default_ldap_timeout() -> u64 {
    10
}

fn default_token_key() -> String {
    "access_token".to_string()
}

fn default_token_secret() -> String {
    "refresh_token".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auth_type: AuthType::default(),
            role_admin: default_admin_role(),
            role_public: default_public_role(),
            user_registration: false,
            user_registration_role: None,
            ldap: LdapConfig::default(),
            remote_user_header: default_remote_user_header(),
            oauth_providers: Vec::new(),
            openid_providers: Vec::new(),
            secret_key: SecretString::from(String::new()),
            previous_secret_key: None,
            app_base_url: default_base_url(),
            login_url: default_login_url(),
            mail_default_sender: default_mail_sender(),
        }
    }
}

impl SecurityConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> SecurityResult<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| SecurityError::config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn load(path: &Path) -> SecurityResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SecurityError::config(format!("Cannot read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> SecurityResult<()> {
        use secrecy::ExposeSecret;

        if self.secret_key.expose_secret().is_empty() {
            return Err(SecurityError::config("SECRET_KEY must not be empty"));
        }
        if self.role_admin.trim().is_empty() || self.role_public.trim().is_empty() {
            return Err(SecurityError::config(
                "AUTH_ROLE_ADMIN and AUTH_ROLE_PUBLIC must not be empty",
            ));
        }
        if self.role_admin == self.role_public {
            return Err(SecurityError::config(
                "AUTH_ROLE_ADMIN and AUTH_ROLE_PUBLIC must differ",
            ));
        }
        match self.auth_type {
            AuthType::Ldap if self.ldap.server.as_deref().is_none_or(str::is_empty) => {
                return Err(SecurityError::config(
                    "No AUTH_LDAP_SERVER defined on config with AUTH_LDAP authentication type.",
                ));
            }
            AuthType::OAuth if self.oauth_providers.is_empty() => {
                return Err(SecurityError::config(
                    "AUTH_TYPE = OAUTH requires at least one OAUTH_PROVIDERS entry",
                ));
            }
            AuthType::OpenId if self.openid_providers.is_empty() => {
                return Err(SecurityError::config(
                    "AUTH_TYPE = OID requires at least one OPENID_PROVIDERS entry",
                ));
            }
            _ => {}
        }
        for provider in &self.oauth_providers {
            if provider.name.is_empty() {
                return Err(SecurityError::config("OAUTH_PROVIDERS entry without a name"));
            }
        }
        if self.app_base_url.is_empty() {
            return Err(SecurityError::config("APP_BASE_URL must not be empty"));
        }
        Ok(())
    }

    /// Role granted to self-registered and auto-registered users.
    pub fn registration_role(&self) -> &str {
        self.user_registration_role
            .as_deref()
            .unwrap_or(&self.role_public)
    }

    pub fn oauth_provider(&self, name: &str) -> Option<&OAuthProviderConfig> {
        self.oauth_providers.iter().find(|p| p.name == name)
    }

    pub fn openid_provider(&self, name: &str) -> Option<&OpenIdProviderConfig> {
        self.openid_providers.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const OAUTH_TOML: &str = r#"
AUTH_TYPE = "OAUTH"
AUTH_USER_REGISTRATION = true
AUTH_USER_REGISTRATION_ROLE = "Gamma"
SECRET_KEY = "change-me"

[[OAUTH_PROVIDERS]]
name = "google"
whitelist = ['@example\.com$']

[OAUTH_PROVIDERS.remote_app]
client_id = "cid"
client_secret = "csecret"
authorize_url = "https://accounts.google.com/o/oauth2/auth"
access_token_url = "https://accounts.google.com/o/oauth2/token"
api_base_url = "https://www.googleapis.com/oauth2/v2/"
scope = "email profile"
"#;

    #[test]
    fn parse_defaults() {
        let config = SecurityConfig::parse(r#"SECRET_KEY = "k""#)
            .unwrap_or_else(|e| panic!("parse failed: {e}"));
        assert_eq!(config.auth_type, AuthType::Db);
        assert_eq!(config.role_admin, "Admin");
        assert_eq!(config.role_public, "Public");
        assert!(!config.user_registration);
        assert_eq!(config.registration_role(), "Public");
        assert_eq!(config.ldap.uid_field, "uid");
        assert_eq!(config.ldap.firstname_field, "givenName");
        assert_eq!(config.ldap.lastname_field, "sn");
        assert_eq!(config.ldap.email_field, "mail");
        assert_eq!(config.ldap.timeout_secs, 10);
        assert_eq!(config.remote_user_header, "REMOTE_USER");
        assert_eq!(config.login_url, "/login/");
    }

    #[test]
    fn parse_oauth_providers() {
        let config = SecurityConfig::parse(OAUTH_TOML).unwrap();
        assert_eq!(config.registration_role(), "Gamma");
        let google = config.oauth_provider("google").unwrap();
        assert_eq!(google.token_key, "access_token");
        assert_eq!(google.token_secret, "refresh_token");
        assert_eq!(google.remote_app.client_secret.expose_secret(), "csecret");
        assert!(google.email_allowed(Some("a@example.com")));
        assert!(!google.email_allowed(Some("a@evil.com")));
        assert!(!google.email_allowed(None));
    }

    #[test]
    fn whitelist_matches_any_compiled_pattern() {
        let open = EmailWhitelist::default();
        assert!(open.allows(None));

        let list = EmailWhitelist::new([r"@example\.com$", r"^ops@"]).unwrap();
        assert!(list.allows(Some("ops@partner.org")));
        assert!(list.allows(Some("a@example.com")));
        assert!(!list.allows(Some("a@example.com.evil")));
        assert!(!list.allows(None));

        assert!(matches!(
            EmailWhitelist::new(["@example\\.com$", "[a-"]),
            Err(SecurityError::Config(_))
        ));
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let config = SecurityConfig::parse(OAUTH_TOML).unwrap();
        let dbg = format!("{config:?}");
        assert!(!dbg.contains("change-me"));
        assert!(!dbg.contains("csecret"));
    }

    #[test]
    fn rejects_invalid_configs() {
        assert!(SecurityConfig::parse("AUTH_TYPE = \"DB\"").is_err());
        assert!(SecurityConfig::parse("SECRET_KEY = \"\"").is_err());

        let ldap = SecurityConfig::parse("AUTH_TYPE = \"LDAP\"\nSECRET_KEY = \"k\"").unwrap_err();
        assert!(ldap.to_string().contains("AUTH_LDAP_SERVER"));

        let oauth = SecurityConfig::parse("AUTH_TYPE = \"OAUTH\"\nSECRET_KEY = \"k\"").unwrap_err();
        assert!(matches!(oauth, SecurityError::Config(_)));

        let bad_regex = OAUTH_TOML.replace(r"'@example\.com$'", "'(unclosed'");
        let err = SecurityConfig::parse(&bad_regex).unwrap_err();
        assert!(err.to_string().contains("invalid whitelist pattern '(unclosed'"));
    }

    #[test]
    fn ldap_keys_flatten() {
        let config = SecurityConfig::parse(
            r#"
AUTH_TYPE = "LDAP"
SECRET_KEY = "k"
AUTH_LDAP_SERVER = "ldap://ldap.example.com"
AUTH_LDAP_SEARCH = "ou=people,dc=example,dc=com"
AUTH_LDAP_BIND_USER = "cn=svc,dc=example,dc=com"
AUTH_LDAP_BIND_PASSWORD = "svcpw"
AUTH_LDAP_UID_FIELD = "sAMAccountName"
"#,
        )
        .unwrap();
        assert_eq!(config.ldap.server.as_deref(), Some("ldap://ldap.example.com"));
        assert_eq!(config.ldap.uid_field, "sAMAccountName");
        assert_eq!(
            config.ldap.bind_password.as_ref().map(|s| s.expose_secret()),
            Some("svcpw")
        );
    }
}
