//! OpenID 2.0 login.
//!
//! [`OpenIdFlow`] sends the browser to the provider and verifies the positive
//! assertion it comes back with. The return URL carries a `state` bound to
//! the session, and the provider must confirm the assertion in a direct
//! `check_authentication` request. Only the email from a confirmed, signed
//! attribute is handed on; [`OpenIdProvider`] resolves it to a local user.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tracing::{instrument, warn};

use gatehouse_auth::{AuthType, OpenIdProviderConfig};
use gatehouse_core::{SecurityError, SecurityResult, User, UserLookup};

use super::oauth::{classify, retry_once_async};
use super::{AuthProvider, Credentials, ProviderError, log_failed, record_login};
use crate::session::{OPENID_STATE_KEY, Session, random_hex};
use crate::store::SecurityStore;

const OPENID_NS: &str = "http://specs.openid.net/auth/2.0";
const IDENTIFIER_SELECT: &str = "http://specs.openid.net/auth/2.0/identifier_select";
const AX_NS: &str = "http://openid.net/srv/ax/1.0";
const SREG_NS: &str = "http://openid.net/extensions/sreg/1.1";
const AX_EMAIL_TYPE: &str = "http://axschema.org/contact/email";

// ─────────────────────────────────────────────────────────────────────────────
// Remote
// ─────────────────────────────────────────────────────────────────────────────

/// Direct verification against the OpenID provider.
#[async_trait]
pub trait OpenIdRemote: Send + Sync {
    /// Ask the provider at `endpoint` whether it issued `assertion`
    /// (the `openid.*` fields of the callback).
    async fn check_authentication(
        &self,
        endpoint: &str,
        assertion: &BTreeMap<String, String>,
    ) -> Result<bool, ProviderError>;
}

/// [`OpenIdRemote`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestOpenIdRemote {
    client: reqwest::Client,
}

impl ReqwestOpenIdRemote {
    pub fn new(timeout: Duration) -> SecurityResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SecurityError::provider(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

/// `key:value` lines, the OpenID direct-response encoding.
fn parse_key_values(body: &str) -> BTreeMap<&str, &str> {
    body.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

#[async_trait]
impl OpenIdRemote for ReqwestOpenIdRemote {
    async fn check_authentication(
        &self,
        endpoint: &str,
        assertion: &BTreeMap<String, String>,
    ) -> Result<bool, ProviderError> {
        let mut form: Vec<(&str, &str)> = assertion
            .iter()
            .filter(|(k, _)| k.as_str() != "openid.mode")
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        form.push(("openid.mode", "check_authentication"));

        let resp = self
            .client
            .post(endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| classify("openid check_authentication", e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| classify("openid check_authentication", e))?;
        if !status.is_success() {
            let msg = format!("openid check_authentication returned {status}: {body}");
            return Err(if status.is_server_error() {
                ProviderError::Transient(msg)
            } else {
                ProviderError::Fatal(msg)
            });
        }
        Ok(parse_key_values(&body).get("is_valid") == Some(&"true"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow
// ─────────────────────────────────────────────────────────────────────────────

/// Async half of the OpenID login: redirect out, verify the assertion back.
#[derive(Clone)]
pub struct OpenIdFlow {
    remote: Arc<dyn OpenIdRemote>,
    providers: Vec<OpenIdProviderConfig>,
    base_url: String,
}

impl OpenIdFlow {
    pub fn new(
        remote: Arc<dyn OpenIdRemote>,
        providers: Vec<OpenIdProviderConfig>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            providers,
            base_url: base_url.into(),
        }
    }

    pub fn providers(&self) -> &[OpenIdProviderConfig] {
        &self.providers
    }

    fn provider(&self, name: &str) -> SecurityResult<&OpenIdProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SecurityError::not_found(format!("openid provider '{name}'")))
    }

    fn return_to(&self, provider: &str, state: &str) -> SecurityResult<Url> {
        let callback = format!(
            "{}/openid-authorized/{provider}",
            self.base_url.trim_end_matches('/')
        );
        Url::parse_with_params(&callback, &[("state", state)])
            .map_err(|e| SecurityError::config(format!("openid return_to '{callback}': {e}")))
    }

    /// Where to send the browser for `provider`; stores a fresh `state` in
    /// the session and asks for the email attribute.
    pub fn redirect_url(&self, session: &mut Session, provider: &str) -> SecurityResult<String> {
        let config = self.provider(provider)?;
        let state = random_hex(16);
        let return_to = self.return_to(provider, &state)?;
        session.insert(OPENID_STATE_KEY, &state)?;

        let url = Url::parse_with_params(
            &config.url,
            &[
                ("openid.ns", OPENID_NS),
                ("openid.mode", "checkid_setup"),
                ("openid.claimed_id", IDENTIFIER_SELECT),
                ("openid.identity", IDENTIFIER_SELECT),
                ("openid.return_to", return_to.as_str()),
                ("openid.realm", self.base_url.as_str()),
                ("openid.ns.ax", AX_NS),
                ("openid.ax.mode", "fetch_request"),
                ("openid.ax.type.email", AX_EMAIL_TYPE),
                ("openid.ax.required", "email"),
            ],
        )
        .map_err(|e| SecurityError::config(format!("openid provider '{provider}' url: {e}")))?;
        Ok(url.into())
    }

    /// Verify the provider's redirect back and return the asserted email.
    ///
    /// Unknown providers are `not_found`; anything the provider did not
    /// vouch for is `AuthFailed`.
    #[instrument(skip(self, session, params))]
    pub async fn callback(
        &self,
        session: &mut Session,
        provider: &str,
        params: &BTreeMap<String, String>,
    ) -> SecurityResult<String> {
        let config = self.provider(provider)?;
        let expected: Option<String> = session.get(OPENID_STATE_KEY);
        session.remove(OPENID_STATE_KEY);
        let Some(state) = expected.filter(|s| params.get("state") == Some(s)) else {
            warn!(provider, "openid state mismatch");
            return Err(SecurityError::AuthFailed);
        };

        let field = |name: &str| params.get(name).map(String::as_str);
        if field("openid.mode") != Some("id_res") {
            warn!(provider, mode = ?field("openid.mode"), "openid assertion is not positive");
            return Err(SecurityError::AuthFailed);
        }
        let return_to = self.return_to(provider, &state)?;
        if field("openid.return_to") != Some(return_to.as_str()) {
            warn!(provider, "openid return_to mismatch");
            return Err(SecurityError::AuthFailed);
        }
        if field("openid.op_endpoint").is_some_and(|op| op != config.url) {
            warn!(provider, "openid assertion from another endpoint");
            return Err(SecurityError::AuthFailed);
        }

        let assertion: BTreeMap<String, String> = params
            .iter()
            .filter(|(k, _)| k.starts_with("openid."))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let valid = retry_once_async("openid_check_authentication", || {
            self.remote.check_authentication(&config.url, &assertion)
        })
        .await?;
        if !valid {
            warn!(provider, "openid provider rejected the assertion");
            return Err(SecurityError::AuthFailed);
        }

        signed_email(&assertion).ok_or_else(|| {
            warn!(provider, "openid assertion carries no signed email");
            SecurityError::AuthFailed
        })
    }
}

impl core::fmt::Debug for OpenIdFlow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpenIdFlow")
            .field("providers", &self.providers)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Email from an AX or SReg attribute, counted only when the namespace, the
/// attribute type and the value are all listed in `openid.signed`.
fn signed_email(assertion: &BTreeMap<String, String>) -> Option<String> {
    let signed: BTreeSet<&str> = assertion.get("openid.signed")?.split(',').collect();
    let is_signed = |key: &str| {
        key.strip_prefix("openid.")
            .is_some_and(|field| signed.contains(field))
    };
    let alias_for = |ns: &str| {
        assertion
            .iter()
            .filter(|(k, v)| v.as_str() == ns && is_signed(k.as_str()))
            .find_map(|(k, _)| k.strip_prefix("openid.ns."))
    };

    let mut fields = Vec::new();
    if let Some(ax) = alias_for(AX_NS) {
        let type_prefix = format!("openid.{ax}.type.");
        for (key, value) in assertion {
            if let Some(attr) = key.strip_prefix(&type_prefix) {
                if value == AX_EMAIL_TYPE && is_signed(key.as_str()) {
                    fields.push(format!("openid.{ax}.value.{attr}"));
                }
            }
        }
    }
    if let Some(sreg) = alias_for(SREG_NS) {
        fields.push(format!("openid.{sreg}.email"));
    }

    fields
        .iter()
        .filter(|field| is_signed(field.as_str()))
        .find_map(|field| assertion.get(field.as_str()))
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

/// OpenID login: a verified email, which must belong to an active local user.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenIdProvider;

impl AuthProvider for OpenIdProvider {
    fn auth_type(&self) -> AuthType {
        AuthType::OpenId
    }

    #[instrument(skip_all, fields(email = %credentials.identifier()))]
    fn authenticate(
        &self,
        store: &dyn SecurityStore,
        credentials: &Credentials,
    ) -> SecurityResult<Option<User>> {
        let Credentials::OpenId { email } = credentials else {
            return Ok(None);
        };
        match store.find_user(UserLookup::Email(email))? {
            Some(user) if user.active => record_login(store, user).map(Some),
            Some(_) => {
                log_failed(email, "inactive user");
                Ok(None)
            }
            None => {
                log_failed(email, "unknown email");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{add_user, store_with_role};
    use std::sync::Mutex;

    const BASE: &str = "http://localhost:8080/";

    #[derive(Default)]
    struct FakeOp {
        valid: bool,
        checked: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    }

    #[async_trait]
    impl OpenIdRemote for FakeOp {
        async fn check_authentication(
            &self,
            endpoint: &str,
            assertion: &BTreeMap<String, String>,
        ) -> Result<bool, ProviderError> {
            self.checked
                .lock()
                .unwrap()
                .push((endpoint.to_string(), assertion.clone()));
            Ok(self.valid)
        }
    }

    fn flow(op: Arc<FakeOp>) -> OpenIdFlow {
        OpenIdFlow::new(
            op,
            vec![OpenIdProviderConfig {
                name: "Yahoo".into(),
                url: "https://open.login.yahooapis.com/openid/op/auth".into(),
            }],
            BASE,
        )
    }

    /// Callback parameters as a provider would send them for `email`.
    fn assertion(flow: &OpenIdFlow, session: &mut Session, email: &str) -> BTreeMap<String, String> {
        flow.redirect_url(session, "Yahoo").unwrap();
        let state: String = session.get(OPENID_STATE_KEY).unwrap();
        let return_to = flow.return_to("Yahoo", &state).unwrap();
        [
            ("state", state.as_str()),
            ("openid.ns", OPENID_NS),
            ("openid.mode", "id_res"),
            ("openid.op_endpoint", "https://open.login.yahooapis.com/openid/op/auth"),
            ("openid.return_to", return_to.as_str()),
            ("openid.ns.ext1", AX_NS),
            ("openid.ext1.type.email", AX_EMAIL_TYPE),
            ("openid.ext1.value.email", email),
            ("openid.signed", "op_endpoint,return_to,ns.ext1,ext1.type.email,ext1.value.email"),
            ("openid.sig", "c2ln"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn resolves_by_email() {
        let (store, role) = store_with_role("Public");
        add_user(&store, "frank", None, vec![role]);
        let provider = OpenIdProvider;

        let ok = Credentials::OpenId {
            email: "frank@example.com".into(),
        };
        let user = provider.authenticate(&store, &ok).unwrap().unwrap();
        assert_eq!(user.username, "frank");
        assert_eq!(user.login_count, 1);

        let unknown = Credentials::OpenId {
            email: "ghost@example.com".into(),
        };
        assert!(provider.authenticate(&store, &unknown).unwrap().is_none());
    }

    #[test]
    fn builds_redirects_with_state() {
        let flow = flow(Arc::new(FakeOp::default()));
        let mut session = Session::new();
        let url = flow.redirect_url(&mut session, "Yahoo").unwrap();
        let state: String = session.get(OPENID_STATE_KEY).unwrap();

        let parsed = Url::parse(&url).unwrap();
        let query: BTreeMap<String, String> = parsed.query_pairs().into_owned().collect();
        assert_eq!(query["openid.mode"], "checkid_setup");
        assert_eq!(query["openid.ax.type.email"], AX_EMAIL_TYPE);
        assert_eq!(
            query["openid.return_to"],
            format!("http://localhost:8080/openid-authorized/Yahoo?state={state}")
        );

        assert!(matches!(
            flow.redirect_url(&mut session, "Nope"),
            Err(SecurityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn verified_assertion_yields_signed_email() {
        let op = Arc::new(FakeOp {
            valid: true,
            ..FakeOp::default()
        });
        let flow = flow(op.clone());
        let mut session = Session::new();
        let params = assertion(&flow, &mut session, "frank@example.com");

        let email = flow.callback(&mut session, "Yahoo", &params).await.unwrap();
        assert_eq!(email, "frank@example.com");
        assert!(!session.contains(OPENID_STATE_KEY));

        let checked = op.checked.lock().unwrap();
        assert_eq!(checked.len(), 1);
        assert_eq!(checked[0].0, "https://open.login.yahooapis.com/openid/op/auth");
        assert!(!checked[0].1.contains_key("state"));
    }

    #[tokio::test]
    async fn forged_callbacks_are_rejected() {
        let op = Arc::new(FakeOp {
            valid: true,
            ..FakeOp::default()
        });
        let flow = flow(op.clone());

        // A bare email with no login in progress.
        let mut session = Session::new();
        let bare: BTreeMap<String, String> =
            [("email".to_string(), "admin@example.com".to_string())].into();
        assert_eq!(
            flow.callback(&mut session, "Yahoo", &bare).await.unwrap_err(),
            SecurityError::AuthFailed
        );

        // Unknown provider.
        assert!(matches!(
            flow.callback(&mut session, "anything", &bare).await,
            Err(SecurityError::NotFound(_))
        ));

        // Email swapped into an unsigned field.
        let mut unsigned = assertion(&flow, &mut session, "frank@example.com");
        unsigned.insert("openid.ns.sreg".into(), SREG_NS.into());
        unsigned.insert("openid.sreg.email".into(), "admin@example.com".into());
        unsigned.remove("openid.ext1.value.email");
        assert_eq!(
            flow.callback(&mut session, "Yahoo", &unsigned).await.unwrap_err(),
            SecurityError::AuthFailed
        );

        // Assertion pointing at another endpoint.
        let mut elsewhere = assertion(&flow, &mut session, "admin@example.com");
        elsewhere.insert("openid.op_endpoint".into(), "https://evil.test/op".into());
        assert_eq!(
            flow.callback(&mut session, "Yahoo", &elsewhere).await.unwrap_err(),
            SecurityError::AuthFailed
        );

        assert_eq!(op.checked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn provider_can_refuse_the_assertion() {
        let flow = flow(Arc::new(FakeOp::default()));
        let mut session = Session::new();
        let params = assertion(&flow, &mut session, "admin@example.com");
        assert_eq!(
            flow.callback(&mut session, "Yahoo", &params).await.unwrap_err(),
            SecurityError::AuthFailed
        );
    }

    #[test]
    fn reads_direct_responses() {
        let kv = parse_key_values("ns:http://specs.openid.net/auth/2.0\nis_valid:true\n");
        assert_eq!(kv.get("is_valid"), Some(&"true"));
    }
}
