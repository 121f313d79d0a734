use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, COOKIE, LOCATION, SET_COOKIE};
use reqwest::{StatusCode, Url};
use secrecy::SecretString;
use serde_json::{Value, json};

use gatehouse_auth::{Hasher, Menu, SecurityConfig};
use gatehouse_infra::mailer::InMemoryMailer;
use gatehouse_infra::providers::{OpenIdRemote, ProviderError};
use gatehouse_infra::store::InMemorySecurityStore;
use gatehouse_infra::{InMemorySessionStore, SecurityManager, SecurityManagerBuilder};

const CONFIG: &str = r#"
SECRET_KEY = "test-secret"
AUTH_USER_REGISTRATION = true
AUTH_USER_REGISTRATION_ROLE = "Public"
"#;

const OPENID_CONFIG: &str = r#"
AUTH_TYPE = "OID"
SECRET_KEY = "test-secret"

[[OPENID_PROVIDERS]]
name = "Yahoo"
url = "https://open.login.yahooapis.com/openid/op/auth"
"#;

/// An OpenID provider that vouches for every assertion it is shown.
struct TrustingProvider;

#[async_trait]
impl OpenIdRemote for TrustingProvider {
    async fn check_authentication(
        &self,
        _: &str,
        _: &BTreeMap<String, String>,
    ) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

struct TestServer {
    base_url: String,
    mailer: Arc<InMemoryMailer>,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(CONFIG, |builder| builder).await
    }

    async fn spawn_with(
        config: &str,
        customize: impl FnOnce(SecurityManagerBuilder) -> SecurityManagerBuilder,
    ) -> Self {
        let mailer = Arc::new(InMemoryMailer::new());
        let builder = SecurityManager::builder(
            SecurityConfig::parse(config).unwrap(),
            Arc::new(InMemorySecurityStore::new()),
        )
        .hasher(Hasher::with_params(8, 1, 1).unwrap())
        .mailer(mailer.clone());
        let security = customize(builder).build().unwrap();
        security
            .create_admin("admin", "Ada", "Admin", "admin@example.com", &secret("admin-pw"))
            .unwrap();
        security.register_views(&[], &Menu::new()).unwrap();

        // Same router as prod, bound to an ephemeral port.
        let app = gatehouse_api::app::build_app(
            Arc::new(security),
            Arc::new(InMemorySessionStore::new()),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            base_url,
            mailer,
            client,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// JSON login; returns the session cookie.
    async fn login(&self, username: &str, password: &str) -> String {
        let res = self
            .client
            .post(self.url("/api/v1/security/login"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK, "login as {username}");
        session_cookie(&res)
    }

    async fn get(&self, path: &str, cookie: Option<&str>) -> reqwest::Response {
        let mut req = self.client.get(self.url(path));
        if let Some(cookie) = cookie {
            req = req.header(COOKIE, cookie);
        }
        req.send().await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

fn session_cookie(res: &reqwest::Response) -> String {
    let raw = res
        .headers()
        .get(SET_COOKIE)
        .expect("response sets a session cookie")
        .to_str()
        .unwrap();
    raw.split(';').next().unwrap().to_string()
}

async fn body(res: reqwest::Response) -> Value {
    res.json().await.unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = srv.get("/health", None).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn anonymous_api_calls_get_json_401() {
    let srv = TestServer::spawn().await;

    let res = srv.get("/users/", None).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body(res).await,
        json!({ "message": "Access is Denied", "severity": "danger" })
    );
}

#[tokio::test]
async fn anonymous_browsers_are_sent_to_login_with_a_flash() {
    let srv = TestServer::spawn().await;

    let res = srv
        .client
        .get(srv.url("/roles/"))
        .header(ACCEPT, "text/html")
        .send()
        .await
        .unwrap();
    assert!(res.status().is_redirection());
    assert_eq!(res.headers().get(LOCATION).unwrap(), "/login/");
    let cookie = session_cookie(&res);

    let page = body(srv.get("/login/", Some(&cookie)).await).await;
    assert_eq!(page["auth_type"], "DB");
    assert_eq!(page["messages"][0]["message"], "Access is Denied");
    assert_eq!(page["messages"][0]["category"], "danger");

    // Flashes are shown once.
    let page = body(srv.get("/login/", Some(&cookie)).await).await;
    assert!(page["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn failed_logins_share_one_message() {
    let srv = TestServer::spawn().await;

    for (username, password) in [("admin", "wrong"), ("nobody", "whatever"), ("", "x")] {
        let res = srv
            .client
            .post(srv.url("/api/v1/security/login"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body(res).await,
            json!({ "message": "Invalid login. Please try again.", "severity": "danger" })
        );
    }
}

#[tokio::test]
async fn form_login_redirects_home_or_back_to_login() {
    let srv = TestServer::spawn().await;

    let res = srv
        .client
        .post(srv.url("/login/"))
        .form(&[("username", "admin"), ("password", "nope")])
        .send()
        .await
        .unwrap();
    assert!(res.status().is_redirection());
    assert_eq!(res.headers().get(LOCATION).unwrap(), "/login/");
    let cookie = session_cookie(&res);
    let page = body(srv.get("/login/", Some(&cookie)).await).await;
    assert_eq!(page["messages"][0]["message"], "Invalid login. Please try again.");

    let res = srv
        .client
        .post(srv.url("/login/"))
        .form(&[("username", "admin"), ("password", "admin-pw")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers().get(LOCATION).unwrap(), "/");
    let cookie = session_cookie(&res);
    let home = body(srv.get("/", Some(&cookie)).await).await;
    assert_eq!(home["authenticated"], true);
    assert_eq!(home["username"], "admin");
}

#[tokio::test]
async fn admin_session_manages_users_and_logout_ends_it() {
    let srv = TestServer::spawn().await;
    let cookie = srv.login("admin", "admin-pw").await;

    let me = body(srv.get("/userinfo/", Some(&cookie)).await).await;
    assert_eq!(me["username"], "admin");
    assert_eq!(me["login_count"], 1);
    assert!(me.get("password_hash").is_none());

    let res = srv
        .client
        .post(srv.url("/users/"))
        .header(COOKIE, &cookie)
        .json(&json!({
            "username": "bob",
            "first_name": "Bob",
            "last_name": "Builder",
            "email": "bob@example.com",
            "roles": ["Public"],
            "password": "bob-pw",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let users = body(srv.get("/users/", Some(&cookie)).await).await;
    let names: Vec<&str> = users["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["username"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"admin"));
    assert!(names.contains(&"bob"));

    let res = srv.get("/logout/", Some(&cookie)).await;
    assert!(res.status().is_redirection());
    let res = srv.get("/userinfo/", Some(&cookie)).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn role_grants_open_views_to_other_users() {
    let srv = TestServer::spawn().await;
    let admin = srv.login("admin", "admin-pw").await;

    let res = srv
        .client
        .post(srv.url("/users/"))
        .header(COOKIE, &admin)
        .json(&json!({
            "username": "carol",
            "email": "carol@example.com",
            "roles": [],
            "password": "carol-pw",
        }))
        .send()
        .await
        .unwrap();
    let carol_id = body(res).await["id"].as_i64().unwrap();

    let carol = srv.login("carol", "carol-pw").await;
    assert_eq!(
        srv.get("/roles/", Some(&carol)).await.status(),
        StatusCode::UNAUTHORIZED
    );

    let res = srv
        .client
        .post(srv.url("/roles/"))
        .header(COOKIE, &admin)
        .json(&json!({ "name": "Auditor" }))
        .send()
        .await
        .unwrap();
    let role_id = body(res).await["id"].as_i64().unwrap();

    let res = srv
        .client
        .put(srv.url(&format!("/roles/{role_id}")))
        .header(COOKIE, &admin)
        .json(&json!({ "permissions": [["can_list", "RoleModelView"]] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = srv
        .client
        .put(srv.url(&format!("/users/{carol_id}/roles")))
        .header(COOKIE, &admin)
        .json(&json!({ "roles": ["Auditor"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    assert_eq!(srv.get("/roles/", Some(&carol)).await.status(), StatusCode::OK);
    assert_eq!(
        srv.get(&format!("/roles/{role_id}"), Some(&carol)).await.status(),
        StatusCode::UNAUTHORIZED
    );

    let explanation = body(
        srv.get(
            &format!("/permissionviews/explain?permission=can_list&view=RoleModelView&user_id={carol_id}"),
            Some(&admin),
        )
        .await,
    )
    .await;
    assert_eq!(explanation["granted"], true);
    assert_eq!(explanation["granting_roles"], json!(["Auditor"]));
}

#[tokio::test]
async fn admin_and_public_roles_cannot_be_deleted() {
    let srv = TestServer::spawn().await;
    let admin = srv.login("admin", "admin-pw").await;

    let roles = body(srv.get("/roles/", Some(&admin)).await).await;
    let admin_role = roles["roles"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["name"] == "Admin")
        .unwrap()["id"]
        .as_i64()
        .unwrap();

    let res = srv
        .client
        .delete(srv.url(&format!("/roles/{admin_role}")))
        .header(COOKIE, &admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(body(res).await["error"], "integrity");
}

#[tokio::test]
async fn registration_activates_once() {
    let srv = TestServer::spawn().await;

    let res = srv
        .client
        .post(srv.url("/register/"))
        .json(&json!({
            "username": "dora",
            "email": "dora@example.com",
            "first_name": "Dora",
            "last_name": "Explorer",
            "password": "dora-pw",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let sent = srv.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "dora@example.com");
    let link = sent[0]
        .body
        .split_whitespace()
        .find(|w| w.contains("/register/activation/"))
        .unwrap();
    let path = &link[link.find("/register/activation/").unwrap()..];

    // Same username again while pending.
    let res = srv
        .client
        .post(srv.url("/register/"))
        .json(&json!({ "username": "dora", "email": "other@example.com" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = srv.get(path, None).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body(res).await["username"], "dora");

    let res = srv.get(path, None).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(body(res).await["message"], "Registration not found.");

    let cookie = srv.login("dora", "dora-pw").await;
    let home = body(srv.get("/", Some(&cookie)).await).await;
    assert_eq!(home["username"], "dora");
}

#[tokio::test]
async fn password_reset_takes_effect_on_next_login() {
    let srv = TestServer::spawn().await;
    let admin = srv.login("admin", "admin-pw").await;

    let res = srv
        .client
        .put(srv.url("/resetmypassword/"))
        .header(COOKIE, &admin)
        .json(&json!({ "password": "fresh-pw" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = srv
        .client
        .post(srv.url("/api/v1/security/login"))
        .json(&json!({ "username": "admin", "password": "admin-pw" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    srv.login("admin", "fresh-pw").await;
}

#[tokio::test]
async fn login_and_logout_move_the_session_to_a_new_id() {
    let srv = TestServer::spawn().await;

    // A session id handed out before login.
    let res = srv
        .client
        .post(srv.url("/login/"))
        .form(&[("username", "admin"), ("password", "nope")])
        .send()
        .await
        .unwrap();
    let before = session_cookie(&res);

    let res = srv
        .client
        .post(srv.url("/login/"))
        .header(COOKIE, &before)
        .form(&[("username", "admin"), ("password", "admin-pw")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers().get(LOCATION).unwrap(), "/");
    let after = session_cookie(&res);
    assert_ne!(after, before);

    assert_eq!(srv.get("/users/", Some(&before)).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(srv.get("/users/", Some(&after)).await.status(), StatusCode::OK);

    let res = srv.get("/logout/", Some(&after)).await;
    let logged_out = session_cookie(&res);
    assert_ne!(logged_out, after);
    assert_eq!(srv.get("/users/", Some(&after)).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn openid_callback_needs_a_verified_assertion() {
    let srv = TestServer::spawn_with(OPENID_CONFIG, |builder| {
        builder.openid_remote(Arc::new(TrustingProvider))
    })
    .await;

    // A bare email is not an assertion.
    let res = srv
        .get("/openid-authorized/Yahoo?email=admin@example.com", None)
        .await;
    assert_eq!(res.headers().get(LOCATION).unwrap(), "/login/");
    let cookie = session_cookie(&res);
    assert_eq!(srv.get("/users/", Some(&cookie)).await.status(), StatusCode::UNAUTHORIZED);

    let res = srv
        .get("/openid-authorized/anything?email=admin@example.com", None)
        .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(srv.get("/login/anything", None).await.status(), StatusCode::NOT_FOUND);

    // The full round trip through the provider.
    let res = srv.get("/login/Yahoo", None).await;
    assert!(res.status().is_redirection());
    let cookie = session_cookie(&res);
    let location = Url::parse(res.headers().get(LOCATION).unwrap().to_str().unwrap()).unwrap();
    let return_to = location
        .query_pairs()
        .find(|(k, _)| k == "openid.return_to")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    let mut callback = Url::parse(&return_to).unwrap();
    callback
        .query_pairs_mut()
        .append_pair("openid.mode", "id_res")
        .append_pair("openid.return_to", &return_to)
        .append_pair("openid.ns.ext1", "http://openid.net/srv/ax/1.0")
        .append_pair("openid.ext1.type.email", "http://axschema.org/contact/email")
        .append_pair("openid.ext1.value.email", "admin@example.com")
        .append_pair("openid.signed", "return_to,ns.ext1,ext1.type.email,ext1.value.email");
    let path = format!("{}?{}", callback.path(), callback.query().unwrap());

    let res = srv.get(&path, Some(&cookie)).await;
    assert_eq!(res.headers().get(LOCATION).unwrap(), "/");
    let admin = session_cookie(&res);
    let me = body(srv.get("/userinfo/", Some(&admin)).await).await;
    assert_eq!(me["username"], "admin");

    // The same assertion cannot be replayed.
    let res = srv.get(&path, Some(&admin)).await;
    assert_eq!(res.headers().get(LOCATION).unwrap(), "/login/");
}
