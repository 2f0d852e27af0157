//! Token acquisition, JWT introspection, and ABAC scope tracking (spec
//! §4.A "Authentication model" / "ABAC detection and scope-aware refresh").
//!
//! JWTs are parsed without signature verification anywhere in this module —
//! the claims are advisory only, used to decide *when* to refresh, never to
//! authorize anything locally. The registry is the actual authority.

use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{PurgeError, Result};
use crate::models::Credential;

/// Scope requested when the registry is not ABAC (or for the one-shot
/// catalog-wide probe used to detect ABAC).
pub const GLOBAL_SCOPE: &str = "registry:catalog:* repository:*:*";

/// Tokens are refreshed this many seconds before `exp` (spec §4.A: "within
/// a 5-minute skew").
const EXPIRY_SKEW_SECONDS: i64 = 300;

/// A single `{type, name, actions[]}` entry from a token's `access[]` claim.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Decoded (but unverified) claims of interest from an access or refresh
/// token.
#[derive(Debug, Clone)]
pub struct Claims {
    pub exp: i64,
    pub access: Vec<AccessEntry>,
    pub has_aad_identity: bool,
}

/// Decodes the middle segment of a JWT without checking its signature.
/// Returns `InvalidToken` when the token isn't shaped like a JWT or `exp`
/// cannot be read (spec §4.A "JWT handling").
pub fn decode_jwt_unverified(token: &str) -> Result<Claims> {
    let mut parts = token.split('.');
    let _header = parts
        .next()
        .ok_or_else(|| PurgeError::InvalidToken("empty token".to_string()))?;
    let payload = parts
        .next()
        .ok_or_else(|| PurgeError::InvalidToken("token has no payload segment".to_string()))?;

    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| PurgeError::InvalidToken(format!("payload is not base64url: {e}")))?;

    let value: serde_json::Value = serde_json::from_slice(&decoded)
        .map_err(|e| PurgeError::InvalidToken(format!("payload is not JSON: {e}")))?;

    let exp = value
        .get("exp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| PurgeError::InvalidToken("missing or non-numeric exp claim".to_string()))?;

    let access: Vec<AccessEntry> = value
        .get("access")
        .map(|v| serde_json::from_value(v.clone()))
        .transpose()
        .map_err(|e| PurgeError::InvalidToken(format!("malformed access claim: {e}")))?
        .unwrap_or_default();

    let has_aad_identity = value.get("aad_identity").is_some();

    Ok(Claims {
        exp,
        access,
        has_aad_identity,
    })
}

/// The set of repositories/actions a decoded token's `access[]` claim
/// authorizes (spec §4.A: "compute the set of authorized scopes").
#[derive(Debug, Clone, Default)]
pub struct ScopeSet {
    entries: Vec<AccessEntry>,
}

impl ScopeSet {
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            entries: claims.access.clone(),
        }
    }

    /// True when some entry authorizes `repository:<repo>` or the
    /// wildcard `repository:*`.
    pub fn covers_repository(&self, repo: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == "repository" && (e.name == repo || e.name == "*"))
    }
}

/// Builds the scope string for a token exchange (spec §4.A). When `repos`
/// is empty, returns the catalog-wide wildcard scope; otherwise emits one
/// `repository:<repo>:pull,delete,metadata_read,metadata_write` clause per
/// repository plus `registry:catalog:*`, letting the caller batch several
/// repositories into a single refresh (spec §4.A "Scope batching").
pub fn build_scope(repos: &[String]) -> String {
    if repos.is_empty() {
        return GLOBAL_SCOPE.to_string();
    }
    let mut scope = String::from("registry:catalog:*");
    for repo in repos {
        scope.push_str(&format!(
            " repository:{repo}:pull repository:{repo}:delete repository:{repo}:metadata_read repository:{repo}:metadata_write"
        ));
    }
    scope
}

/// How the client authenticates (spec §4.A "Authentication model").
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// No credentials at all; requests are sent unauthenticated.
    Anonymous,
    /// Both username and password were supplied: plain HTTP Basic, no
    /// token dance at all.
    Basic { username: String, password: String },
    /// Only a secret was supplied: treat it as a refresh token and
    /// exchange it for short-lived access tokens.
    RefreshToken { secret: String },
}

impl AuthMode {
    pub fn from_credential(cred: Option<&Credential>) -> Self {
        match cred {
            None => AuthMode::Anonymous,
            Some(c) if !c.username.is_empty() && !c.password.is_empty() => AuthMode::Basic {
                username: c.username.clone(),
                password: c.password.clone(),
            },
            Some(c) => AuthMode::RefreshToken {
                secret: c.password.clone(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    exp: i64,
    authorized: ScopeSet,
}

/// Serializes token refresh behind a single mutex (spec §4.A "Concurrency":
/// "Token refresh is serialized by a single mutex; pending callers re-check
/// expiry after acquiring the mutex.").
pub struct Authorizer {
    http: reqwest::Client,
    token_endpoint: String,
    secret: String,
    is_abac: bool,
    state: Mutex<TokenState>,
}

impl Authorizer {
    /// `token_endpoint` is the registry's OAuth2-style token exchange URL
    /// (spec §6: "Token endpoint exchanges a refresh token for an access
    /// token given a scope string.").
    pub fn new(http: reqwest::Client, token_endpoint: String, secret: String) -> Self {
        let is_abac = decode_jwt_unverified(&secret)
            .map(|c| c.has_aad_identity)
            .unwrap_or(false);
        Self {
            http,
            token_endpoint,
            secret,
            is_abac,
            state: Mutex::new(TokenState::default()),
        }
    }

    pub fn is_abac(&self) -> bool {
        self.is_abac
    }

    /// Returns a bearer token authorized for `repo`, refreshing if the
    /// current token is near expiry or (under ABAC) doesn't cover `repo`.
    /// `repo = None` means "catalog-level operation, no specific repo".
    pub async fn token_for(&self, repo: Option<&str>) -> Result<String> {
        self.token_for_any(repo.map(|r| std::slice::from_ref(r)).unwrap_or(&[]))
            .await
    }

    /// Batch form: refreshes (if needed) a single token covering every repo
    /// in `repos` at once (spec §4.A "Scope batching", §4.G step 2).
    pub async fn token_for_any(&self, repos: &[impl AsRef<str>]) -> Result<String> {
        let mut state = self.state.lock().await;
        let now = Utc::now().timestamp();

        let needs_refresh = state.access_token.is_none()
            || state.exp - now < EXPIRY_SKEW_SECONDS
            || (self.is_abac
                && repos
                    .iter()
                    .any(|r| !state.authorized.covers_repository(r.as_ref())));

        if needs_refresh {
            let repo_names: Vec<String> = if self.is_abac {
                repos.iter().map(|r| r.as_ref().to_string()).collect()
            } else {
                Vec::new()
            };
            let scope = build_scope(&repo_names);
            let (token, claims) = self.exchange(&scope).await?;
            state.access_token = Some(token);
            state.exp = claims.exp;
            state.authorized = ScopeSet::from_claims(&claims);
        }

        Ok(state.access_token.clone().expect("just refreshed"))
    }

    async fn exchange(&self, scope: &str) -> Result<(String, Claims)> {
        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(alias = "access_token")]
            token: String,
        }

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.secret.as_str()),
                ("scope", scope),
                ("service", &self.registry_host()),
            ])
            .send()
            .await
            .map_err(|e| PurgeError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PurgeError::Transport(format!(
                "token endpoint returned HTTP {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PurgeError::Transport(format!("malformed token response: {e}")))?;

        let claims = decode_jwt_unverified(&body.token)?;
        Ok((body.token, claims))
    }

    fn registry_host(&self) -> String {
        reqwest::Url::parse(&self.token_endpoint)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jwt(payload: serde_json::Value) -> String {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("{}");
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&payload).unwrap());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn decode_jwt_reads_exp_and_access() {
        let token = make_jwt(serde_json::json!({
            "exp": 1234567890,
            "access": [{"type": "repository", "name": "foo", "actions": ["pull"]}]
        }));
        let claims = decode_jwt_unverified(&token).unwrap();
        assert_eq!(claims.exp, 1234567890);
        assert_eq!(claims.access.len(), 1);
        assert_eq!(claims.access[0].name, "foo");
        assert!(!claims.has_aad_identity);
    }

    #[test]
    fn decode_jwt_detects_aad_identity() {
        let token = make_jwt(serde_json::json!({
            "exp": 1,
            "aad_identity": {"oid": "abc"}
        }));
        let claims = decode_jwt_unverified(&token).unwrap();
        assert!(claims.has_aad_identity);
    }

    #[test]
    fn decode_jwt_fails_without_exp() {
        let token = make_jwt(serde_json::json!({"access": []}));
        let err = decode_jwt_unverified(&token).unwrap_err();
        assert!(matches!(err, PurgeError::InvalidToken(_)));
    }

    #[test]
    fn decode_jwt_fails_on_malformed_token() {
        let err = decode_jwt_unverified("not-a-jwt").unwrap_err();
        assert!(matches!(err, PurgeError::InvalidToken(_)));
    }

    #[test]
    fn scope_set_covers_exact_repo() {
        let claims = Claims {
            exp: 0,
            access: vec![AccessEntry {
                kind: "repository".to_string(),
                name: "myrepo".to_string(),
                actions: vec!["pull".to_string()],
            }],
            has_aad_identity: false,
        };
        let scopes = ScopeSet::from_claims(&claims);
        assert!(scopes.covers_repository("myrepo"));
        assert!(!scopes.covers_repository("other"));
    }

    #[test]
    fn scope_set_covers_wildcard_repo() {
        let claims = Claims {
            exp: 0,
            access: vec![AccessEntry {
                kind: "repository".to_string(),
                name: "*".to_string(),
                actions: vec![],
            }],
            has_aad_identity: false,
        };
        let scopes = ScopeSet::from_claims(&claims);
        assert!(scopes.covers_repository("anything"));
    }

    #[test]
    fn build_scope_empty_is_global() {
        assert_eq!(build_scope(&[]), GLOBAL_SCOPE);
    }

    #[test]
    fn build_scope_batches_multiple_repos() {
        let repos = vec!["a".to_string(), "b".to_string()];
        let scope = build_scope(&repos);
        assert!(scope.contains("repository:a:pull"));
        assert!(scope.contains("repository:b:delete"));
        assert!(scope.starts_with("registry:catalog:*"));
    }

    #[test]
    fn auth_mode_basic_requires_both_fields() {
        let cred = Credential {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        assert!(matches!(
            AuthMode::from_credential(Some(&cred)),
            AuthMode::Basic { .. }
        ));
    }

    #[test]
    fn auth_mode_refresh_token_when_username_missing() {
        let cred = Credential {
            username: String::new(),
            password: "some-refresh-token".to_string(),
        };
        assert!(matches!(
            AuthMode::from_credential(Some(&cred)),
            AuthMode::RefreshToken { .. }
        ));
    }

    #[test]
    fn auth_mode_anonymous_without_credentials() {
        assert!(matches!(AuthMode::from_credential(None), AuthMode::Anonymous));
    }

    #[tokio::test]
    async fn authorizer_detects_abac_from_refresh_token() {
        let secret = make_jwt(serde_json::json!({
            "exp": 9999999999i64,
            "aad_identity": {"oid": "abc"}
        }));
        let authorizer = Authorizer::new(
            reqwest::Client::new(),
            "http://localhost/oauth2/token".to_string(),
            secret,
        );
        assert!(authorizer.is_abac());
    }

    #[tokio::test]
    async fn authorizer_not_abac_for_plain_refresh_token() {
        let authorizer = Authorizer::new(
            reqwest::Client::new(),
            "http://localhost/oauth2/token".to_string(),
            "plain-opaque-refresh-token".to_string(),
        );
        assert!(!authorizer.is_abac());
    }

    #[tokio::test]
    async fn authorizer_exchanges_and_caches_token() {
        let mut server = mockito::Server::new_async().await;
        let access_token = make_jwt(serde_json::json!({
            "exp": Utc::now().timestamp() + 3600,
            "access": [{"type": "repository", "name": "*", "actions": ["pull"]}]
        }));
        let mock = server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::json!({"access_token": access_token}).to_string())
            .expect(1)
            .create_async()
            .await;

        let authorizer = Authorizer::new(
            reqwest::Client::new(),
            format!("{}/oauth2/token", server.url()),
            "refresh-secret".to_string(),
        );

        let token1 = authorizer.token_for(Some("repo")).await.unwrap();
        let token2 = authorizer.token_for(Some("repo")).await.unwrap();
        assert_eq!(token1, token2, "cached token should be reused while valid");
        mock.assert_async().await;
    }
}
