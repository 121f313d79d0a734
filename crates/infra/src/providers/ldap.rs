//! LDAP authentication.
//!
//! Two bind modes:
//!
//! - **Indirect**: bind as `AUTH_LDAP_BIND_USER`, search for
//!   `(<uid_field>=<username>)` under `AUTH_LDAP_SEARCH`, then bind as the
//!   found DN with the supplied password.
//! - **Direct**: bind as the username, formatted with
//!   `AUTH_LDAP_USERNAME_FORMAT` (`%s` placeholder) or suffixed with
//!   `@AUTH_LDAP_APPEND_DOMAIN`.
//!
//! The directory is reached through [`LdapConnector`] so tests can stand in
//! a fake; [`Ldap3Connector`] is the real client.

use std::collections::HashMap;
use std::time::Duration;

use ldap3::{LdapConn, LdapConnSettings, LdapError, Scope, SearchEntry, ldap_escape};
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info, instrument, warn};

use gatehouse_auth::{AuthType, LdapConfig};
use gatehouse_core::{SecurityResult, User, UserLookup};

use super::{
    AuthProvider, AutoRegister, Credentials, ProviderError, auto_register, log_failed,
    record_failed_login, record_login, retry_once,
};
use crate::store::SecurityStore;

/// LDAP result code for a rejected simple bind.
const INVALID_CREDENTIALS: u32 = 49;

/// A directory entry: its DN and attribute values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

impl LdapEntry {
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.attrs
            .get(attr)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// One open connection to the directory.
pub trait LdapSession {
    /// `Ok(false)` when the server rejects the credentials.
    fn bind(&mut self, dn: &str, password: &SecretString) -> Result<bool, ProviderError>;

    /// First entry matching `filter` under `base`.
    fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Option<LdapEntry>, ProviderError>;
}

pub trait LdapConnector: Send + Sync {
    fn connect(&self, config: &LdapConfig) -> Result<Box<dyn LdapSession>, ProviderError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// ldap3 client
// ─────────────────────────────────────────────────────────────────────────────

/// [`LdapConnector`] backed by the synchronous `ldap3` client.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3Connector;

fn classify(operation: &str, err: LdapError) -> ProviderError {
    match err {
        LdapError::Io { .. } | LdapError::Timeout { .. } => {
            ProviderError::Transient(format!("ldap {operation}: {err}"))
        }
        other => ProviderError::Fatal(format!("ldap {operation}: {other}")),
    }
}

struct Ldap3Session {
    conn: LdapConn,
    timeout: Duration,
}

impl LdapSession for Ldap3Session {
    fn bind(&mut self, dn: &str, password: &SecretString) -> Result<bool, ProviderError> {
        let result = self
            .conn
            .with_timeout(self.timeout)
            .simple_bind(dn, password.expose_secret())
            .map_err(|e| classify("bind", e))?;
        match result.rc {
            0 => Ok(true),
            INVALID_CREDENTIALS => Ok(false),
            rc => Err(ProviderError::Fatal(format!(
                "ldap bind: rc={rc} {}",
                result.text
            ))),
        }
    }

    fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Option<LdapEntry>, ProviderError> {
        let (entries, _) = self
            .conn
            .with_timeout(self.timeout)
            .search(base, Scope::Subtree, filter, attrs.to_vec())
            .and_then(|r| r.success())
            .map_err(|e| classify("search", e))?;
        Ok(entries.into_iter().next().map(|raw| {
            let entry = SearchEntry::construct(raw);
            LdapEntry {
                dn: entry.dn,
                attrs: entry.attrs,
            }
        }))
    }
}

impl Drop for Ldap3Session {
    fn drop(&mut self) {
        let _ = self.conn.unbind();
    }
}

impl LdapConnector for Ldap3Connector {
    fn connect(&self, config: &LdapConfig) -> Result<Box<dyn LdapSession>, ProviderError> {
        let server = config
            .server
            .as_deref()
            .ok_or_else(|| ProviderError::Fatal("AUTH_LDAP_SERVER is not set".into()))?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let settings = LdapConnSettings::new()
            .set_conn_timeout(timeout)
            .set_starttls(config.use_tls)
            .set_no_tls_verify(config.allow_self_signed);
        let conn = LdapConn::with_settings(settings, server).map_err(|e| {
            if config.use_tls {
                info!(error = %e, "LDAP could not activate TLS");
            }
            classify("connect", e)
        })?;
        Ok(Box::new(Ldap3Session { conn, timeout }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

pub struct LdapProvider {
    config: LdapConfig,
    connector: Box<dyn LdapConnector>,
    register: Option<AutoRegister>,
}

impl LdapProvider {
    pub fn new(
        config: LdapConfig,
        connector: Box<dyn LdapConnector>,
        register: Option<AutoRegister>,
    ) -> Self {
        Self {
            config,
            connector,
            register,
        }
    }

    fn attribute_names(&self) -> [&str; 4] {
        [
            self.config.uid_field.as_str(),
            self.config.firstname_field.as_str(),
            self.config.lastname_field.as_str(),
            self.config.email_field.as_str(),
        ]
    }

    fn search_filter(&self, username: &str) -> String {
        format!("({}={})", self.config.uid_field, ldap_escape(username))
    }

    /// DN used for a direct bind.
    fn bind_username(&self, username: &str) -> String {
        if !self.config.username_format.is_empty() {
            self.config.username_format.replacen("%s", username, 1)
        } else if !self.config.append_domain.is_empty() {
            format!("{username}@{}", self.config.append_domain)
        } else {
            username.to_string()
        }
    }

    /// `Ok(None)` when the directory rejects the user; the entry (possibly
    /// without attributes) otherwise.
    fn directory_login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Option<LdapEntry>, ProviderError> {
        let mut session = self.connector.connect(&self.config)?;
        let attrs = self.attribute_names();

        if !self.config.bind_user.is_empty() {
            let bind_password = self
                .config
                .bind_password
                .clone()
                .unwrap_or_else(|| SecretString::from(String::new()));
            if !session.bind(&self.config.bind_user, &bind_password)? {
                return Err(ProviderError::Fatal(
                    "ldap indirect bind rejected for AUTH_LDAP_BIND_USER".into(),
                ));
            }
            let Some(entry) =
                session.search(&self.config.search, &self.search_filter(username), &attrs)?
            else {
                warn!(%username, "LDAP object not found");
                return Ok(None);
            };
            if !session.bind(&entry.dn, password)? {
                return Ok(None);
            }
            return Ok(Some(entry));
        }

        let dn = self.bind_username(username);
        if !session.bind(&dn, password)? {
            return Ok(None);
        }
        if self.register.is_some() && !self.config.search.is_empty() {
            let entry = session
                .search(&self.config.search, &self.search_filter(username), &attrs)?
                .unwrap_or_else(|| LdapEntry {
                    dn,
                    ..LdapEntry::default()
                });
            return Ok(Some(entry));
        }
        Ok(Some(LdapEntry {
            dn,
            ..LdapEntry::default()
        }))
    }
}

impl AuthProvider for LdapProvider {
    fn auth_type(&self) -> AuthType {
        AuthType::Ldap
    }

    #[instrument(skip_all, fields(username = %credentials.identifier()))]
    fn authenticate(
        &self,
        store: &dyn SecurityStore,
        credentials: &Credentials,
    ) -> SecurityResult<Option<User>> {
        let Credentials::Password { username, password } = credentials else {
            return Ok(None);
        };
        if username.is_empty() || password.expose_secret().is_empty() {
            return Ok(None);
        }

        let existing = store.find_user(UserLookup::Username(username))?;
        if existing.as_ref().is_some_and(|u| !u.active) {
            log_failed(username, "inactive user");
            return Ok(None);
        }

        let entry = match retry_once("ldap_login", || self.directory_login(username, password)) {
            Ok(entry) => entry,
            Err(ProviderError::Transient(reason)) => {
                error!(%username, %reason, "LDAP unreachable");
                return Ok(None);
            }
            Err(err) => {
                error!(%username, error = %err, "LDAP error");
                return Err(err.into());
            }
        };

        let Some(entry) = entry else {
            log_failed(username, "ldap bind rejected");
            if let Some(user) = existing {
                record_failed_login(store, user)?;
            }
            return Ok(None);
        };

        let user = match (existing, &self.register) {
            (Some(user), _) => user,
            (None, Some(register)) => {
                let email = entry
                    .first(&self.config.email_field)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{username}@email.notfound"));
                auto_register(
                    store,
                    register,
                    username,
                    entry.first(&self.config.firstname_field).unwrap_or(username),
                    entry.first(&self.config.lastname_field).unwrap_or(username),
                    &email,
                )?
            }
            (None, None) => {
                log_failed(username, "no local user and registration disabled");
                return Ok(None);
            }
        };
        record_login(store, user).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{add_user, store_with_role};
    use std::sync::{Arc, Mutex};

    /// Directory with fixed accounts. Records every bind DN.
    #[derive(Clone, Default)]
    struct FakeDirectory {
        accounts: HashMap<String, (String, LdapEntry)>,
        binds: Arc<Mutex<Vec<String>>>,
        transient_failures: Arc<Mutex<u32>>,
    }

    impl FakeDirectory {
        fn with_account(mut self, dn: &str, password: &str, attrs: &[(&str, &str)]) -> Self {
            let entry = LdapEntry {
                dn: dn.to_string(),
                attrs: attrs
                    .iter()
                    .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                    .collect(),
            };
            self.accounts
                .insert(dn.to_string(), (password.to_string(), entry));
            self
        }
    }

    struct FakeSession(FakeDirectory);

    impl LdapSession for FakeSession {
        fn bind(&mut self, dn: &str, password: &SecretString) -> Result<bool, ProviderError> {
            self.0.binds.lock().unwrap().push(dn.to_string());
            Ok(self
                .0
                .accounts
                .get(dn)
                .is_some_and(|(pw, _)| pw == password.expose_secret()))
        }

        fn search(
            &mut self,
            _base: &str,
            filter: &str,
            _attrs: &[&str],
        ) -> Result<Option<LdapEntry>, ProviderError> {
            Ok(self
                .0
                .accounts
                .values()
                .map(|(_, e)| e)
                .find(|e| e.first("uid").is_some_and(|uid| filter == format!("(uid={uid})")))
                .cloned())
        }
    }

    impl LdapConnector for FakeDirectory {
        fn connect(&self, _: &LdapConfig) -> Result<Box<dyn LdapSession>, ProviderError> {
            let mut failures = self.transient_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ProviderError::Transient("connection refused".into()));
            }
            Ok(Box::new(FakeSession(self.clone())))
        }
    }

    fn password(username: &str, pw: &str) -> Credentials {
        Credentials::Password {
            username: username.into(),
            password: SecretString::from(pw.to_string()),
        }
    }

    fn indirect_config() -> LdapConfig {
        LdapConfig {
            server: Some("ldap://fake".into()),
            search: "ou=people,dc=example,dc=org".into(),
            bind_user: "cn=svc,dc=example,dc=org".into(),
            bind_password: Some(SecretString::from("svc-pw".to_string())),
            ..LdapConfig::default()
        }
    }

    fn directory() -> FakeDirectory {
        FakeDirectory::default()
            .with_account("cn=svc,dc=example,dc=org", "svc-pw", &[])
            .with_account(
                "uid=carol,ou=people,dc=example,dc=org",
                "pw",
                &[("uid", "carol"), ("givenName", "Carol"), ("sn", "Jones")],
            )
    }

    #[test]
    fn indirect_bind_auto_registers_with_fallback_email() {
        let (store, _) = store_with_role("Public");
        let dir = directory();
        let provider = LdapProvider::new(
            indirect_config(),
            Box::new(dir.clone()),
            Some(AutoRegister {
                role: "Public".into(),
            }),
        );

        let user = provider
            .authenticate(&store, &password("carol", "pw"))
            .unwrap()
            .unwrap();
        assert_eq!(user.first_name, "Carol");
        assert_eq!(user.last_name, "Jones");
        assert_eq!(user.email, "carol@email.notfound");
        assert!(user.has_role("Public"));
        assert_eq!(user.login_count, 1);
        assert_eq!(
            *dir.binds.lock().unwrap(),
            vec!["cn=svc,dc=example,dc=org", "uid=carol,ou=people,dc=example,dc=org"]
        );
    }

    #[test]
    fn rejected_bind_counts_failure_for_known_user() {
        let (store, role) = store_with_role("Public");
        let carol = add_user(&store, "carol", None, vec![role]);
        let provider = LdapProvider::new(indirect_config(), Box::new(directory()), None);

        assert!(provider.authenticate(&store, &password("carol", "nope")).unwrap().is_none());
        assert!(provider.authenticate(&store, &password("carol", "")).unwrap().is_none());
        assert!(provider.authenticate(&store, &password("dave", "pw")).unwrap().is_none());
        assert_eq!(store.get_user_by_id(carol.id).unwrap().unwrap().fail_login_count, 1);
    }

    #[test]
    fn direct_bind_formats_username_and_retries_once() {
        let (store, role) = store_with_role("Public");
        add_user(&store, "erin", None, vec![role]);
        let dir = FakeDirectory::default().with_account("erin@corp.example", "pw", &[]);
        *dir.transient_failures.lock().unwrap() = 1;
        let config = LdapConfig {
            server: Some("ldap://fake".into()),
            append_domain: "corp.example".into(),
            ..LdapConfig::default()
        };
        let provider = LdapProvider::new(config, Box::new(dir.clone()), None);

        let user = provider.authenticate(&store, &password("erin", "pw")).unwrap();
        assert!(user.is_some());
        assert_eq!(*dir.binds.lock().unwrap(), vec!["erin@corp.example"]);

        *dir.transient_failures.lock().unwrap() = 2;
        assert!(provider.authenticate(&store, &password("erin", "pw")).unwrap().is_none());
    }

    #[test]
    fn username_format_template() {
        let config = LdapConfig {
            username_format: "uid=%s,ou=people".into(),
            append_domain: "ignored".into(),
            ..LdapConfig::default()
        };
        let provider = LdapProvider::new(config, Box::new(FakeDirectory::default()), None);
        assert_eq!(provider.bind_username("zed"), "uid=zed,ou=people");
        assert_eq!(provider.search_filter("a*b"), "(uid=a\\2ab)");
    }
}
